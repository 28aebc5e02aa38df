use std::sync::{Arc, Mutex};
use std::time::Duration;

use centauri::gossip::queue::{BroadcastKind, BroadcastQueue};
use centauri::gossip::{Delegate, GossipConfig, Memberlist};

/// Delegate that queues broadcasts and collects everything notified.
struct TestDelegate {
    meta: Vec<u8>,
    queue: Arc<BroadcastQueue>,
    notified: Arc<Mutex<Vec<Vec<u8>>>>,
    state: Vec<u8>,
    merged: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl TestDelegate {
    fn new(meta: &[u8], state: &[u8]) -> TestDelegate {
        TestDelegate {
            meta: meta.to_vec(),
            queue: Arc::new(BroadcastQueue::new(3)),
            notified: Arc::new(Mutex::new(Vec::new())),
            state: state.to_vec(),
            merged: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Delegate for TestDelegate {
    fn node_meta(&self, limit: usize) -> Vec<u8> {
        self.meta[..self.meta.len().min(limit)].to_vec()
    }

    fn notify_msg(&self, msg: Vec<u8>) {
        self.notified.lock().unwrap().push(msg);
    }

    fn get_broadcasts(&self, overhead: usize, byte_limit: usize, num_nodes: usize) -> Vec<Vec<u8>> {
        self.queue.get_broadcasts(overhead, byte_limit, num_nodes)
    }

    fn local_state(&self, _join: bool) -> Vec<u8> {
        self.state.clone()
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        if join {
            self.merged.lock().unwrap().push(buf.to_vec());
        }
    }
}

fn loopback_config(name: &str) -> GossipConfig {
    let mut config = GossipConfig::loopback(name);
    config.bind_port = 0;
    config
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn two_nodes_join_and_converge() {
    let d1 = Arc::new(TestDelegate::new(b"meta-1", b"state-1"));
    let d2 = Arc::new(TestDelegate::new(b"meta-2", b"state-2"));

    let m1 = Memberlist::create(loopback_config("node-1"), d1.clone())
        .await
        .expect("create node-1");
    let m2 = Memberlist::create(loopback_config("node-2"), d2.clone())
        .await
        .expect("create node-2");

    let seed = m1.advertise_addr().to_string();
    let contacted = m2.join(&[seed]).await.expect("join");
    assert_eq!(contacted, 1);

    wait_for("membership convergence", || {
        m1.num_members() == 2 && m2.num_members() == 2
    })
    .await;

    assert!(m1.has_member("node-2"));
    assert!(m2.has_member("node-1"));

    // Metadata travels with membership.
    let members = m2.members();
    let other = members
        .iter()
        .find(|member| member.name == "node-1")
        .expect("node-1 in view");
    assert_eq!(other.meta, b"meta-1");

    // Join-time push-pull delivered both user states.
    wait_for("remote state merge", || {
        !d2.merged.lock().unwrap().is_empty() && !d1.merged.lock().unwrap().is_empty()
    })
    .await;
    assert_eq!(d2.merged.lock().unwrap()[0], b"state-1");
    assert_eq!(d1.merged.lock().unwrap()[0], b"state-2");
}

#[tokio::test(flavor = "multi_thread")]
async fn user_broadcasts_reach_other_nodes() {
    let d1 = Arc::new(TestDelegate::new(b"m1", b""));
    let d2 = Arc::new(TestDelegate::new(b"m2", b""));

    let m1 = Memberlist::create(loopback_config("bcast-1"), d1.clone())
        .await
        .expect("create bcast-1");
    let m2 = Memberlist::create(loopback_config("bcast-2"), d2.clone())
        .await
        .expect("create bcast-2");
    m2.join(&[m1.advertise_addr().to_string()])
        .await
        .expect("join");

    wait_for("membership convergence", || {
        m1.num_members() == 2 && m2.num_members() == 2
    })
    .await;

    let payload = br#"{"type":"newMessage","pubKeyID":"k","channel":"c","id":"i","peerAddr":"127.0.0.1","peerPort":5664}"#.to_vec();
    d1.queue
        .queue(BroadcastKind::NewMessage, "k", "c", "i", payload.clone());

    wait_for("broadcast delivery", || {
        d2.notified
            .lock()
            .unwrap()
            .iter()
            .any(|msg| msg == &payload)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn members_exclude_self_in_live_peers() {
    let d1 = Arc::new(TestDelegate::new(b"solo", b""));
    let m1 = Memberlist::create(loopback_config("solo-1"), d1)
        .await
        .expect("create solo");
    assert_eq!(m1.num_members(), 1);
    assert!(m1.live_peers().is_empty());
    assert!(m1.random_peer().is_none());
}
