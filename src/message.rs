//! The relay message and its lifecycle operations.
//!
//! A message is `(type, channel, id, recipient key id, payload)`.  The
//! payload is an opaque envelope; peers never decrypt.  Create assigns a
//! UUID, stores locally and fires the created event (which broadcasts);
//! delete removes locally and, unless the deletion itself came from a
//! gossip event, fires the deleted event.

use crate::events::{EventError, EventRouter};
use crate::persist::{MessageMeta, MessageStore, PersistError};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// How the agent treats the decrypted payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Bytes,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub id: String,
    #[serde(rename = "pubKeyID", default)]
    pub pub_key_id: String,
    #[serde(with = "crate::b64")]
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub enum MessageError {
    MissingField(&'static str),
    NotFound,
    Persist(PersistError),
    Event(EventError),
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::MissingField(field) => write!(f, "{field} is required"),
            MessageError::NotFound => write!(f, "message not found"),
            MessageError::Persist(error) => write!(f, "persist error: {error}"),
            MessageError::Event(error) => write!(f, "event error: {error}"),
        }
    }
}

impl std::error::Error for MessageError {}

impl From<PersistError> for MessageError {
    fn from(error: PersistError) -> Self {
        match error {
            PersistError::NotFound => MessageError::NotFound,
            other => MessageError::Persist(other),
        }
    }
}

impl From<EventError> for MessageError {
    fn from(error: EventError) -> Self {
        MessageError::Event(error)
    }
}

/// Restrict a channel label to `[A-Za-z0-9-]`; anything else becomes
/// `-`.  Empty stays empty here and becomes `default` at the storage
/// boundary.
pub fn clean_channel(channel: &str) -> String {
    channel
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Create a message: validate, assign a UUID, store locally, fire the
/// created event.  Returns the stored message including its id.
pub async fn create(
    store: &MessageStore,
    router: &EventRouter,
    mut msg: Message,
) -> Result<Message, MessageError> {
    if msg.pub_key_id.is_empty() {
        return Err(MessageError::MissingField("public key id"));
    }
    if msg.data.is_empty() {
        return Err(MessageError::MissingField("data"));
    }
    msg.channel = clean_channel(&msg.channel);
    msg.id = Uuid::new_v4().to_string();
    store.store_message(&msg.pub_key_id, &msg.channel, &msg.id, &msg.data)?;
    router
        .message_created(&msg.pub_key_id, &msg.channel, &msg.id)
        .await?;
    crate::clog!(
        info,
        "message: created {}",
        crate::persist::describe(&msg.pub_key_id, &msg.channel, &msg.id)
    );
    Ok(msg)
}

/// Load a message by id.
pub fn get(
    store: &MessageStore,
    pub_key_id: &str,
    channel: &str,
    id: &str,
) -> Result<Message, MessageError> {
    let data = store.get_message(pub_key_id, channel, id)?;
    Ok(Message {
        kind: MessageKind::Bytes,
        channel: channel.to_string(),
        id: id.to_string(),
        pub_key_id: pub_key_id.to_string(),
        data,
    })
}

/// List metadata for one recipient, optionally filtered by channel.
pub fn list(
    store: &MessageStore,
    pub_key_id: &str,
    channel: &str,
) -> Result<Vec<MessageMeta>, MessageError> {
    Ok(store.list_meta(pub_key_id, channel)?)
}

/// Store a payload replicated from another peer.  No event fires; the
/// gossip that triggered the pull already made the rounds.
pub fn store_from_peer(
    store: &MessageStore,
    pub_key_id: &str,
    channel: &str,
    id: &str,
    data: &[u8],
) -> Result<(), MessageError> {
    store.store_message(pub_key_id, channel, id, data)?;
    Ok(())
}

/// Delete a message.  When `from_event` is set the deletion arrived over
/// gossip and must not broadcast again.
pub async fn delete(
    store: &MessageStore,
    router: &EventRouter,
    pub_key_id: &str,
    channel: &str,
    id: &str,
    from_event: bool,
) -> Result<(), MessageError> {
    store.delete_message(pub_key_id, channel, id)?;
    if !from_event {
        router.message_deleted(pub_key_id, channel, id).await?;
    }
    crate::clog!(
        info,
        "message: deleted {}",
        crate::persist::describe(pub_key_id, channel, id)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecentMessages;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn temp_store(tag: &str) -> MessageStore {
        let dir: PathBuf =
            std::env::temp_dir().join(format!("centauri-msg-{}-{}", tag, rand::random::<u64>()));
        MessageStore::open(&dir, "peer0").unwrap()
    }

    fn quiet_router() -> EventRouter {
        EventRouter::new(Arc::new(RecentMessages::new()), Vec::new())
    }

    #[test]
    fn cleans_channels() {
        assert_eq!(clean_channel("default"), "default");
        assert_eq!(clean_channel("a/b c!"), "a-b-c-");
        assert_eq!(clean_channel("A-Z-0-9"), "A-Z-0-9");
        assert_eq!(clean_channel(""), "");
    }

    #[test]
    fn message_json_shape() {
        let json = r#"{"type":"bytes","channel":"default","pubKeyID":"abc","data":"aGk="}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.kind, MessageKind::Bytes);
        assert_eq!(msg.pub_key_id, "abc");
        assert_eq!(msg.data, b"hi");

        let out = serde_json::to_string(&msg).unwrap();
        assert!(out.contains(r#""type":"bytes""#));
        assert!(out.contains(r#""pubKeyID":"abc""#));
    }

    #[test]
    fn rejects_unknown_type() {
        let json = r#"{"type":"carrier-pigeon","pubKeyID":"abc","data":"aGk="}"#;
        assert!(serde_json::from_str::<Message>(json).is_err());
    }

    #[tokio::test]
    async fn create_assigns_uuid_and_stores() {
        let store = temp_store("create");
        let router = quiet_router();
        let msg = create(
            &store,
            &router,
            Message {
                kind: MessageKind::Bytes,
                channel: "some channel".to_string(),
                id: String::new(),
                pub_key_id: "abc".to_string(),
                data: b"envelope".to_vec(),
            },
        )
        .await
        .unwrap();

        assert!(!msg.id.is_empty());
        assert_eq!(msg.channel, "some-channel");
        let stored = get(&store, "abc", "some-channel", &msg.id).unwrap();
        assert_eq!(stored.data, b"envelope");
    }

    #[tokio::test]
    async fn create_requires_key_and_data() {
        let store = temp_store("validate");
        let router = quiet_router();
        let base = Message {
            kind: MessageKind::Bytes,
            channel: String::new(),
            id: String::new(),
            pub_key_id: String::new(),
            data: b"x".to_vec(),
        };
        assert!(matches!(
            create(&store, &router, base.clone()).await,
            Err(MessageError::MissingField("public key id"))
        ));
        let mut no_data = base;
        no_data.pub_key_id = "abc".to_string();
        no_data.data = Vec::new();
        assert!(matches!(
            create(&store, &router, no_data).await,
            Err(MessageError::MissingField("data"))
        ));
    }

    #[tokio::test]
    async fn delete_round_trip() {
        let store = temp_store("delete");
        let router = quiet_router();
        let msg = create(
            &store,
            &router,
            Message {
                kind: MessageKind::Bytes,
                channel: "default".to_string(),
                id: String::new(),
                pub_key_id: "abc".to_string(),
                data: b"envelope".to_vec(),
            },
        )
        .await
        .unwrap();

        delete(&store, &router, "abc", "default", &msg.id, false)
            .await
            .unwrap();
        assert!(matches!(
            get(&store, "abc", "default", &msg.id),
            Err(MessageError::NotFound)
        ));
        assert!(matches!(
            delete(&store, &router, "abc", "default", &msg.id, false).await,
            Err(MessageError::NotFound)
        ));
    }
}
