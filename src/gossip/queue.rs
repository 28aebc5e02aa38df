//! Transmit-limited broadcast queue.
//!
//! Application broadcasts (`newMessage` / `deleteMessage`) are queued
//! here and drained by the gossip layer a bounded number of times per
//! entry.  A later `deleteMessage` for the same (key, channel, id)
//! triple invalidates a pending `newMessage` so peers never pull a
//! message the recipient has already confirmed; no other pair of
//! broadcasts invalidates each other.

use std::sync::Mutex;

/// Default retransmit multiplier.
pub const RETRANSMIT_MULT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastKind {
    NewMessage,
    DeleteMessage,
}

#[derive(Debug)]
struct QueuedBroadcast {
    kind: BroadcastKind,
    pub_key_id: String,
    channel: String,
    id: String,
    msg: Vec<u8>,
    transmits: usize,
}

impl QueuedBroadcast {
    fn invalidated_by(&self, kind: BroadcastKind, pub_key_id: &str, channel: &str, id: &str) -> bool {
        kind == BroadcastKind::DeleteMessage
            && self.kind == BroadcastKind::NewMessage
            && self.pub_key_id == pub_key_id
            && self.channel == channel
            && self.id == id
    }
}

pub struct BroadcastQueue {
    retransmit_mult: usize,
    entries: Mutex<Vec<QueuedBroadcast>>,
}

/// `retransmit_mult * ceil(log10(n + 1))` transmissions per entry, the
/// scaling the membership layer uses for its own broadcasts.
fn retransmit_limit(retransmit_mult: usize, num_nodes: usize) -> usize {
    let scale = ((num_nodes + 1) as f64).log10().ceil() as usize;
    retransmit_mult * scale.max(1)
}

impl BroadcastQueue {
    pub fn new(retransmit_mult: usize) -> BroadcastQueue {
        BroadcastQueue {
            retransmit_mult,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Queue a broadcast, applying the invalidation rule first.
    pub fn queue(
        &self,
        kind: BroadcastKind,
        pub_key_id: &str,
        channel: &str,
        id: &str,
        msg: Vec<u8>,
    ) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|entry| !entry.invalidated_by(kind, pub_key_id, channel, id));
        entries.push(QueuedBroadcast {
            kind,
            pub_key_id: pub_key_id.to_string(),
            channel: channel.to_string(),
            id: id.to_string(),
            msg,
            transmits: 0,
        });
    }

    /// Drain up to `byte_limit` bytes of broadcasts (each message costs
    /// its length plus `overhead`).  Least-transmitted entries go first;
    /// entries past their retransmit limit are dropped.
    pub fn get_broadcasts(
        &self,
        overhead: usize,
        byte_limit: usize,
        num_nodes: usize,
    ) -> Vec<Vec<u8>> {
        let limit = retransmit_limit(self.retransmit_mult, num_nodes);
        let mut entries = self.entries.lock().unwrap();
        entries.sort_by_key(|entry| entry.transmits);

        let mut used = 0usize;
        let mut out = Vec::new();
        for entry in entries.iter_mut() {
            let cost = entry.msg.len() + overhead;
            if used + cost > byte_limit {
                continue;
            }
            used += cost;
            entry.transmits += 1;
            out.push(entry.msg.clone());
        }
        entries.retain(|entry| entry.transmits < limit);
        out
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(tag: &str) -> Vec<u8> {
        tag.as_bytes().to_vec()
    }

    #[test]
    fn delete_invalidates_pending_new() {
        let queue = BroadcastQueue::new(RETRANSMIT_MULT);
        queue.queue(BroadcastKind::NewMessage, "k", "c", "i", payload("new"));
        queue.queue(BroadcastKind::DeleteMessage, "k", "c", "i", payload("del"));

        let out = queue.get_broadcasts(0, 1024, 2);
        assert_eq!(out, vec![payload("del")]);
    }

    #[test]
    fn delete_keeps_new_for_other_triple() {
        let queue = BroadcastQueue::new(RETRANSMIT_MULT);
        queue.queue(BroadcastKind::NewMessage, "k", "c", "i1", payload("new"));
        queue.queue(BroadcastKind::DeleteMessage, "k", "c", "i2", payload("del"));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn new_does_not_invalidate_delete() {
        let queue = BroadcastQueue::new(RETRANSMIT_MULT);
        queue.queue(BroadcastKind::DeleteMessage, "k", "c", "i", payload("del"));
        queue.queue(BroadcastKind::NewMessage, "k", "c", "i", payload("new"));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn entries_retire_after_retransmit_limit() {
        let queue = BroadcastQueue::new(RETRANSMIT_MULT);
        queue.queue(BroadcastKind::NewMessage, "k", "c", "i", payload("new"));

        // One node: limit is RETRANSMIT_MULT * 1.
        for _ in 0..RETRANSMIT_MULT {
            assert_eq!(queue.get_broadcasts(0, 1024, 1).len(), 1);
        }
        assert!(queue.is_empty());
        assert!(queue.get_broadcasts(0, 1024, 1).is_empty());
    }

    #[test]
    fn respects_byte_limit() {
        let queue = BroadcastQueue::new(RETRANSMIT_MULT);
        queue.queue(BroadcastKind::NewMessage, "k", "c", "i1", vec![0u8; 400]);
        queue.queue(BroadcastKind::NewMessage, "k", "c", "i2", vec![0u8; 400]);
        let out = queue.get_broadcasts(10, 500, 2);
        assert_eq!(out.len(), 1);
    }
}
