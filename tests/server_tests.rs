use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use tokio::sync::oneshot;

use centauri::events::{EventRouter, RecentMessages};
use centauri::persist::{MessageMeta, MessageStore};
use centauri::server::{app, AppState};
use centauri::sign::SignedRequest;

fn test_key() -> RsaPrivateKey {
    RsaPrivateKey::new(&mut OsRng, 1024).expect("generate rsa key")
}

fn temp_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("centauri-srv-{}-{}", tag, rand::random::<u64>()))
}

fn test_state(tag: &str, auth_token: Option<&str>) -> AppState {
    let store = Arc::new(MessageStore::open(&temp_dir(tag), "peer0").expect("open store"));
    let router = Arc::new(EventRouter::new(Arc::new(RecentMessages::new()), Vec::new()));
    AppState {
        store,
        router,
        auth_token: auth_token.map(str::to_string),
    }
}

async fn start_server(state: AppState) -> (String, oneshot::Sender<()>) {
    let app = app(state, &[]);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind server");
    let addr = listener.local_addr().expect("server addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("http://{}", addr), shutdown_tx)
}

fn post_message(base_url: &str, pub_key_id: &str, channel: &str, envelope: &[u8]) -> String {
    let body = serde_json::json!({
        "type": "bytes",
        "channel": channel,
        "pubKeyID": pub_key_id,
        "data": STANDARD.encode(envelope),
    });
    let response = ureq::post(&format!("{}/message", base_url))
        .send_json(body)
        .expect("post message");
    let stored: serde_json::Value = response.into_json().expect("message json");
    stored["id"].as_str().expect("assigned id").to_string()
}

fn list_messages(base_url: &str, sig: &str, channel: &str) -> Vec<MessageMeta> {
    let response = ureq::request("LIST", &format!("{}/messages?channel={}", base_url, channel))
        .set("X-Signature", sig)
        .call()
        .expect("list messages");
    response.into_json().expect("meta json")
}

fn error_status(result: Result<ureq::Response, ureq::Error>) -> (u16, String) {
    match result {
        Err(ureq::Error::Status(code, response)) => {
            (code, response.into_string().unwrap_or_default())
        }
        Ok(response) => panic!("expected error, got {}", response.status()),
        Err(other) => panic!("transport error: {other}"),
    }
}

#[tokio::test]
async fn create_list_get_delete_round_trip() {
    let (base_url, shutdown_tx) = start_server(test_state("s1", None)).await;
    let key = test_key();
    let (sig, key_id) = SignedRequest::create(&key).expect("sign");

    let envelope = b"deadbeef.cafe".to_vec();
    let (listed, fetched, after_delete) = tokio::task::spawn_blocking({
        let base_url = base_url.clone();
        let key = key.clone();
        move || {
            let id = post_message(&base_url, &key_id, "default", &envelope);

            let listed = list_messages(&base_url, &sig, "default");
            assert_eq!(listed.len(), 1);
            assert_eq!(listed[0].id, id);
            assert_eq!(listed[0].channel, "default");
            assert_eq!(listed[0].pub_key_id, key_id);
            assert_eq!(listed[0].size, envelope.len() as u64);

            let url = format!("{}/message/{}/default/{}", base_url, key_id, id);
            let (sig2, _) = SignedRequest::create(&key).expect("sign");
            let response = ureq::get(&url).set("X-Signature", &sig2).call().expect("get");
            let mut fetched = Vec::new();
            use std::io::Read;
            response
                .into_reader()
                .read_to_end(&mut fetched)
                .expect("read body");

            let (sig3, _) = SignedRequest::create(&key).expect("sign");
            ureq::delete(&url).set("X-Signature", &sig3).call().expect("delete");

            let (sig4, _) = SignedRequest::create(&key).expect("sign");
            let after_delete = list_messages(&base_url, &sig4, "default");
            (listed, fetched, after_delete)
        }
    })
    .await
    .expect("round trip task");

    shutdown_tx.send(()).ok();
    assert_eq!(listed.len(), 1);
    assert_eq!(fetched, b"deadbeef.cafe");
    assert!(after_delete.is_empty());
}

#[tokio::test]
async fn get_signed_by_other_key_is_rejected() {
    let (base_url, shutdown_tx) = start_server(test_state("s3", None)).await;
    let recipient = test_key();
    let intruder = test_key();
    let (_, recipient_id) = SignedRequest::create(&recipient).expect("sign");

    let (code, body) = tokio::task::spawn_blocking({
        let base_url = base_url.clone();
        move || {
            let id = post_message(&base_url, &recipient_id, "default", b"deadbeef.cafe");
            let (intruder_sig, _) = SignedRequest::create(&intruder).expect("sign");
            let url = format!("{}/message/{}/default/{}", base_url, recipient_id, id);
            error_status(ureq::get(&url).set("X-Signature", &intruder_sig).call())
        }
    })
    .await
    .expect("mismatch task");

    shutdown_tx.send(()).ok();
    assert_eq!(code, 400);
    assert_eq!(body.trim(), "key id mismatch");
}

#[tokio::test]
async fn stale_signature_is_rejected() {
    let (base_url, shutdown_tx) = start_server(test_state("s4", None)).await;
    let key = test_key();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let (stale_sig, _) = SignedRequest::create_at(&key, now - 400).expect("sign");

    let (code, body) = tokio::task::spawn_blocking({
        let base_url = base_url.clone();
        move || {
            error_status(
                ureq::request("LIST", &format!("{}/messages", base_url))
                    .set("X-Signature", &stale_sig)
                    .call(),
            )
        }
    })
    .await
    .expect("stale task");

    shutdown_tx.send(()).ok();
    assert_eq!(code, 400);
    assert!(body.contains("timestamp is too old"), "body: {body}");
}

#[tokio::test]
async fn token_gates_cluster_but_not_inboxes() {
    let (base_url, shutdown_tx) = start_server(test_state("token", Some("sekrit"))).await;

    let results = tokio::task::spawn_blocking({
        let base_url = base_url.clone();
        move || {
            // No token at all: unauthorized.
            let no_token = error_status(
                ureq::request("LIST", &format!("{}/messages", base_url)).call(),
            );

            // Valid token but no signature: still rejected.
            let token_only = error_status(
                ureq::request("LIST", &format!("{}/messages", base_url))
                    .set("X-Token", "sekrit")
                    .call(),
            );

            // statusz needs no token.
            let health = ureq::get(&format!("{}/statusz", base_url))
                .call()
                .expect("statusz")
                .into_string()
                .expect("statusz body");

            (no_token, token_only, health)
        }
    })
    .await
    .expect("token task");

    shutdown_tx.send(()).ok();
    let (no_token, token_only, health) = results;
    assert_eq!(no_token.0, 401);
    assert_eq!(token_only.0, 400);
    assert!(token_only.1.contains("no signature header"), "body: {}", token_only.1);
    assert_eq!(health, "OK");
}

#[tokio::test]
async fn missing_message_is_404_and_unknown_inbox_lists_empty() {
    let (base_url, shutdown_tx) = start_server(test_state("missing", None)).await;
    let key = test_key();
    let (sig, key_id) = SignedRequest::create(&key).expect("sign");

    let (get_code, listed) = tokio::task::spawn_blocking({
        let base_url = base_url.clone();
        let key = key.clone();
        move || {
            let url = format!("{}/message/{}/default/no-such-id", base_url, key_id);
            let (code, _) = error_status(ureq::get(&url).set("X-Signature", &sig).call());

            let (sig2, _) = SignedRequest::create(&key).expect("sign");
            let listed = list_messages(&base_url, &sig2, "");
            (code, listed)
        }
    })
    .await
    .expect("missing task");

    shutdown_tx.send(()).ok();
    assert_eq!(get_code, 404);
    assert!(listed.is_empty());
}

#[tokio::test]
async fn channels_are_cleaned_on_create() {
    let (base_url, shutdown_tx) = start_server(test_state("clean", None)).await;
    let key = test_key();
    let (sig, key_id) = SignedRequest::create(&key).expect("sign");

    let listed = tokio::task::spawn_blocking({
        let base_url = base_url.clone();
        move || {
            post_message(&base_url, &key_id, "jobs/2026 q3", b"deadbeef.cafe");
            list_messages(&base_url, &sig, "jobs-2026-q3")
        }
    })
    .await
    .expect("clean task");

    shutdown_tx.send(()).ok();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].channel, "jobs-2026-q3");
}
