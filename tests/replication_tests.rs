use std::path::PathBuf;
use std::time::Duration;

use centauri::cfg::PeerConfig;
use centauri::message::{self, Message, MessageKind};
use centauri::peer::Peer;
use centauri::persist::PersistError;

fn temp_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("centauri-repl-{}-{}", tag, rand::random::<u64>()))
}

fn free_port_pair() -> (u16, u16) {
    // Ephemeral-range picks; the test retries are cheap if a port is
    // taken on the runner.
    let base = 20_000 + (rand::random::<u16>() % 30_000);
    (base, base.wrapping_add(1).max(20_000))
}

fn peer_config(name: &str, seeds: Vec<String>) -> PeerConfig {
    let (gossip_port, data_port) = free_port_pair();
    PeerConfig {
        name: name.to_string(),
        data_dir: temp_dir(name).to_string_lossy().into_owned(),
        connection_mode: "local".to_string(),
        gossip_bind_port: gossip_port,
        data_bind_port: data_port,
        advertise_addr: "127.0.0.1".to_string(),
        peer_addrs: seeds,
        ..PeerConfig::default()
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..150 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn message_replicates_and_delete_propagates() {
    let config1 = peer_config("repl-p1", Vec::new());
    let seed = format!("127.0.0.1:{}", config1.gossip_bind_port);
    let config2 = peer_config("repl-p2", vec![seed]);

    let p1 = Peer::start(config1).await.expect("start p1");
    let p2 = Peer::start(config2).await.expect("start p2");

    wait_for("membership convergence", || {
        p1.members().num_members() == 2 && p2.members().num_members() == 2
    })
    .await;

    // POST lands on p1; gossip announces it; p2 pulls the ciphertext
    // over the data channel and stores it.
    let stored = message::create(
        p1.store(),
        p1.router(),
        Message {
            kind: MessageKind::Bytes,
            channel: "default".to_string(),
            id: String::new(),
            pub_key_id: "abc123".to_string(),
            data: b"deadbeef.cafe".to_vec(),
        },
    )
    .await
    .expect("create on p1");

    let id = stored.id.clone();
    wait_for("replication to p2", || {
        p2.store().get_message("abc123", "default", &id).is_ok()
    })
    .await;
    assert_eq!(
        p2.store()
            .get_message("abc123", "default", &id)
            .expect("replicated bytes"),
        b"deadbeef.cafe"
    );

    // The recipient confirms on p1; the deletion gossips to p2.
    message::delete(p1.store(), p1.router(), "abc123", "default", &id, false)
        .await
        .expect("delete on p1");

    wait_for("delete propagation to p2", || {
        matches!(
            p2.store().get_message("abc123", "default", &id),
            Err(PersistError::NotFound)
        )
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_before_new_is_a_noop() {
    let config = peer_config("repl-solo", Vec::new());
    let peer = Peer::start(config).await.expect("start solo peer");

    // A deleteMessage gossip for a message this peer never stored must
    // not error the router or leave anything behind.
    let payload =
        br#"{"type":"deleteMessage","pubKeyID":"ghost","channel":"default","id":"u9"}"#.to_vec();
    peer.router().receive(&payload).await.expect("receive delete");
    assert!(matches!(
        peer.store().get_message("ghost", "default", "u9"),
        Err(PersistError::NotFound)
    ));

    // And the event is recorded, so a replay is dropped silently.
    assert!(peer
        .router()
        .recent()
        .is_handled("ghost", "deleteMessage_default_u9"));
}
