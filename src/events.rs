//! Event routing between the local store and the gossip layer.
//!
//! Local mutations (create, delete) fan out to [`EventSink`]
//! implementations composed at startup; incoming gossip payloads are
//! decoded into [`GossipEvent`] and dispatched the same way.  The
//! recent-message set makes gossip delivery idempotent: an event seen
//! twice within the cache window fires its sinks exactly once.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::clog;

/// How often the recent-message set is wiped.  Coarse, but it bounds
/// memory while the queue invalidation rule and at-most-once filesystem
/// semantics cover the convergence window.
pub const CACHE_CLEAN_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A gossip payload.  The wire form is a flat JSON object tagged by
/// `type`; unknown tags fail decoding and are dropped by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GossipEvent {
    #[serde(rename = "newMessage")]
    NewMessage {
        #[serde(rename = "pubKeyID")]
        pub_key_id: String,
        channel: String,
        id: String,
        #[serde(rename = "peerAddr")]
        peer_addr: String,
        #[serde(rename = "peerPort")]
        peer_port: u16,
    },
    #[serde(rename = "deleteMessage")]
    DeleteMessage {
        #[serde(rename = "pubKeyID")]
        pub_key_id: String,
        channel: String,
        id: String,
    },
}

impl GossipEvent {
    pub fn pub_key_id(&self) -> &str {
        match self {
            GossipEvent::NewMessage { pub_key_id, .. } => pub_key_id,
            GossipEvent::DeleteMessage { pub_key_id, .. } => pub_key_id,
        }
    }

    fn kind_tag(&self) -> &'static str {
        match self {
            GossipEvent::NewMessage { .. } => "newMessage",
            GossipEvent::DeleteMessage { .. } => "deleteMessage",
        }
    }

    /// Idempotence key recorded in the recent-message set.
    pub fn cache_key(&self) -> String {
        match self {
            GossipEvent::NewMessage { channel, id, .. } => {
                format!("{}_{}_{}", self.kind_tag(), channel, id)
            }
            GossipEvent::DeleteMessage { channel, id, .. } => {
                format!("{}_{}_{}", self.kind_tag(), channel, id)
            }
        }
    }
}

#[derive(Debug)]
pub enum EventError {
    Decode(serde_json::Error),
    Sink(String),
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::Decode(error) => write!(f, "bad event payload: {error}"),
            EventError::Sink(message) => write!(f, "event sink: {message}"),
        }
    }
}

impl std::error::Error for EventError {}

impl From<serde_json::Error> for EventError {
    fn from(error: serde_json::Error) -> Self {
        EventError::Decode(error)
    }
}

/// Per-recipient set of recently handled event keys.  Shipped to joining
/// peers through the gossip push-pull exchange so a fresh node skips
/// events the cluster already processed.
#[derive(Default)]
pub struct RecentMessages {
    inner: RwLock<HashMap<String, HashSet<String>>>,
}

impl RecentMessages {
    pub fn new() -> RecentMessages {
        RecentMessages::default()
    }

    pub fn is_handled(&self, pub_key_id: &str, cache_key: &str) -> bool {
        let inner = self.inner.read().unwrap();
        inner
            .get(pub_key_id)
            .is_some_and(|keys| keys.contains(cache_key))
    }

    pub fn record(&self, pub_key_id: &str, cache_key: &str) {
        let mut inner = self.inner.write().unwrap();
        inner
            .entry(pub_key_id.to_string())
            .or_default()
            .insert(cache_key.to_string());
    }

    pub fn clear(&self) {
        self.inner.write().unwrap().clear();
    }

    /// Serialize for the push-pull user state.
    pub fn snapshot(&self) -> Vec<u8> {
        let inner = self.inner.read().unwrap();
        serde_json::to_vec(&*inner).unwrap_or_default()
    }

    /// Merge a remote snapshot; used on cluster join only.
    pub fn merge(&self, buf: &[u8]) {
        let Ok(remote) = serde_json::from_slice::<HashMap<String, HashSet<String>>>(buf) else {
            clog!(debug, "events: ignoring unparseable remote state");
            return;
        };
        let mut inner = self.inner.write().unwrap();
        for (pub_key_id, keys) in remote {
            inner.entry(pub_key_id).or_default().extend(keys);
        }
    }

    /// Wipe the set every [`CACHE_CLEAN_INTERVAL`] forever.
    pub fn spawn_cleaner(self: &Arc<Self>) {
        let recent = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CACHE_CLEAN_INTERVAL).await;
                recent.clear();
                clog!(debug, "events: recent-message cache cleared");
            }
        });
    }
}

/// Where events land.  Implementations override only the hooks they care
/// about; the router calls every sink for every event.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// A message was created on this peer (local POST succeeded).
    async fn message_created(
        &self,
        _pub_key_id: &str,
        _channel: &str,
        _id: &str,
    ) -> Result<(), EventError> {
        Ok(())
    }

    /// A message was deleted on this peer by its recipient.
    async fn message_deleted(
        &self,
        _pub_key_id: &str,
        _channel: &str,
        _id: &str,
    ) -> Result<(), EventError> {
        Ok(())
    }

    /// Another peer announced a new message.
    async fn remote_message(
        &self,
        _pub_key_id: &str,
        _channel: &str,
        _id: &str,
        _peer_addr: &str,
        _peer_port: u16,
    ) -> Result<(), EventError> {
        Ok(())
    }

    /// Another peer announced a deletion.  `from_event` is always true
    /// on this path and keeps the deletion from echoing back out.
    async fn remote_deletion(
        &self,
        _pub_key_id: &str,
        _channel: &str,
        _id: &str,
        _from_event: bool,
    ) -> Result<(), EventError> {
        Ok(())
    }
}

/// Dispatches local and remote events to the composed sinks.
pub struct EventRouter {
    recent: Arc<RecentMessages>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventRouter {
    pub fn new(recent: Arc<RecentMessages>, sinks: Vec<Arc<dyn EventSink>>) -> EventRouter {
        EventRouter { recent, sinks }
    }

    pub fn recent(&self) -> &Arc<RecentMessages> {
        &self.recent
    }

    /// Fire the local-create hooks.
    pub async fn message_created(
        &self,
        pub_key_id: &str,
        channel: &str,
        id: &str,
    ) -> Result<(), EventError> {
        for sink in &self.sinks {
            sink.message_created(pub_key_id, channel, id).await?;
        }
        Ok(())
    }

    /// Fire the local-delete hooks.
    pub async fn message_deleted(
        &self,
        pub_key_id: &str,
        channel: &str,
        id: &str,
    ) -> Result<(), EventError> {
        for sink in &self.sinks {
            sink.message_deleted(pub_key_id, channel, id).await?;
        }
        Ok(())
    }

    /// Handle one raw gossip payload: decode, de-duplicate, dispatch,
    /// record.  Sink errors are logged and swallowed; the event is still
    /// recorded so a broken payload is not reprocessed on every
    /// retransmission.
    pub async fn receive(&self, buf: &[u8]) -> Result<(), EventError> {
        let event: GossipEvent = serde_json::from_slice(buf)?;
        let cache_key = event.cache_key();
        let pub_key_id = event.pub_key_id().to_string();
        if self.recent.is_handled(&pub_key_id, &cache_key) {
            clog!(trace, "events: duplicate {cache_key} dropped");
            return Ok(());
        }
        for sink in &self.sinks {
            let result = match &event {
                GossipEvent::NewMessage {
                    pub_key_id,
                    channel,
                    id,
                    peer_addr,
                    peer_port,
                } => {
                    sink.remote_message(pub_key_id, channel, id, peer_addr, *peer_port)
                        .await
                }
                GossipEvent::DeleteMessage {
                    pub_key_id,
                    channel,
                    id,
                } => sink.remote_deletion(pub_key_id, channel, id, true).await,
            };
            if let Err(error) = result {
                clog!(warn, "events: sink failed for {cache_key}: {error}");
            }
        }
        self.recent.record(&pub_key_id, &cache_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn event_json_field_names_are_stable() {
        let event = GossipEvent::NewMessage {
            pub_key_id: "abc".to_string(),
            channel: "default".to_string(),
            id: "u1".to_string(),
            peer_addr: "10.0.0.1".to_string(),
            peer_port: 5664,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"newMessage""#));
        assert!(json.contains(r#""pubKeyID":"abc""#));
        assert!(json.contains(r#""peerAddr":"10.0.0.1""#));
        assert!(json.contains(r#""peerPort":5664"#));

        let back: GossipEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn unknown_tag_is_a_decode_error() {
        let err = serde_json::from_slice::<GossipEvent>(br#"{"type":"renameMessage"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn cache_keys_separate_kinds() {
        let new = GossipEvent::NewMessage {
            pub_key_id: "k".to_string(),
            channel: "c".to_string(),
            id: "i".to_string(),
            peer_addr: String::new(),
            peer_port: 0,
        };
        let del = GossipEvent::DeleteMessage {
            pub_key_id: "k".to_string(),
            channel: "c".to_string(),
            id: "i".to_string(),
        };
        assert_eq!(new.cache_key(), "newMessage_c_i");
        assert_eq!(del.cache_key(), "deleteMessage_c_i");
    }

    #[test]
    fn recent_set_merge_and_clear() {
        let a = RecentMessages::new();
        a.record("k1", "newMessage_c_i");

        let b = RecentMessages::new();
        b.merge(&a.snapshot());
        assert!(b.is_handled("k1", "newMessage_c_i"));
        assert!(!b.is_handled("k2", "newMessage_c_i"));

        b.clear();
        assert!(!b.is_handled("k1", "newMessage_c_i"));
    }

    struct CountingSink {
        remote_messages: AtomicUsize,
        remote_deletions: AtomicUsize,
    }

    #[async_trait]
    impl EventSink for CountingSink {
        async fn remote_message(
            &self,
            _pub_key_id: &str,
            _channel: &str,
            _id: &str,
            _peer_addr: &str,
            _peer_port: u16,
        ) -> Result<(), EventError> {
            self.remote_messages.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn remote_deletion(
            &self,
            _pub_key_id: &str,
            _channel: &str,
            _id: &str,
            _from_event: bool,
        ) -> Result<(), EventError> {
            self.remote_deletions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn duplicate_events_fire_once() {
        let sink = Arc::new(CountingSink {
            remote_messages: AtomicUsize::new(0),
            remote_deletions: AtomicUsize::new(0),
        });
        let router = EventRouter::new(Arc::new(RecentMessages::new()), vec![sink.clone()]);

        let payload = serde_json::to_vec(&GossipEvent::NewMessage {
            pub_key_id: "k".to_string(),
            channel: "c".to_string(),
            id: "i".to_string(),
            peer_addr: "127.0.0.1".to_string(),
            peer_port: 5664,
        })
        .unwrap();

        router.receive(&payload).await.unwrap();
        router.receive(&payload).await.unwrap();
        assert_eq!(sink.remote_messages.load(Ordering::SeqCst), 1);

        let delete = serde_json::to_vec(&GossipEvent::DeleteMessage {
            pub_key_id: "k".to_string(),
            channel: "c".to_string(),
            id: "i".to_string(),
        })
        .unwrap();
        router.receive(&delete).await.unwrap();
        router.receive(&delete).await.unwrap();
        assert_eq!(sink.remote_deletions.load(Ordering::SeqCst), 1);
    }

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn remote_message(
            &self,
            _pub_key_id: &str,
            _channel: &str,
            _id: &str,
            _peer_addr: &str,
            _peer_port: u16,
        ) -> Result<(), EventError> {
            Err(EventError::Sink("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn failed_sink_still_records_event() {
        let recent = Arc::new(RecentMessages::new());
        let router = EventRouter::new(recent.clone(), vec![Arc::new(FailingSink)]);
        let payload = serde_json::to_vec(&GossipEvent::NewMessage {
            pub_key_id: "k".to_string(),
            channel: "c".to_string(),
            id: "i".to_string(),
            peer_addr: String::new(),
            peer_port: 0,
        })
        .unwrap();
        router.receive(&payload).await.unwrap();
        assert!(recent.is_handled("k", "newMessage_c_i"));
    }
}
