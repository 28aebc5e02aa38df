//! The peer: storage, membership, events and replication policy wired
//! into one value.
//!
//! Replication is event-driven: a local create broadcasts `newMessage`
//! and other peers pull the ciphertext lazily from the originator (with
//! best-effort fallback through other members); a local delete
//! broadcasts `deleteMessage`, which every peer applies eagerly.

use crate::cfg::PeerConfig;
use crate::clog;
use crate::data::{self, ChannelConfig};
use crate::events::{EventError, EventRouter, EventSink, GossipEvent, RecentMessages};
use crate::gossip::queue::{BroadcastKind, BroadcastQueue};
use crate::gossip::{Delegate, GossipConfig, GossipError, Memberlist};
use crate::message;
use crate::persist::{MessageStore, PersistError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// How often the watcher checks for total isolation.
const PEER_WATCH_INTERVAL: Duration = Duration::from_secs(30);

/// Metadata each peer publishes through the membership layer: where its
/// data channel can be reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMeta {
    #[serde(rename = "peerAddr")]
    pub peer_addr: String,
    #[serde(rename = "peerPort")]
    pub peer_port: u16,
}

#[derive(Debug)]
pub enum PeerError {
    Config(String),
    Gossip(GossipError),
    Persist(PersistError),
    Io(std::io::Error),
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::Config(message) => write!(f, "config error: {message}"),
            PeerError::Gossip(error) => write!(f, "gossip error: {error}"),
            PeerError::Persist(error) => write!(f, "persist error: {error}"),
            PeerError::Io(error) => write!(f, "io error: {error}"),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<GossipError> for PeerError {
    fn from(error: GossipError) -> Self {
        PeerError::Gossip(error)
    }
}

impl From<PersistError> for PeerError {
    fn from(error: PersistError) -> Self {
        PeerError::Persist(error)
    }
}

impl From<std::io::Error> for PeerError {
    fn from(error: std::io::Error) -> Self {
        PeerError::Io(error)
    }
}

struct PeerDelegate {
    meta: Vec<u8>,
    queue: Arc<BroadcastQueue>,
    recent: Arc<RecentMessages>,
    notify_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Delegate for PeerDelegate {
    fn node_meta(&self, limit: usize) -> Vec<u8> {
        if self.meta.len() > limit {
            return self.meta[..limit].to_vec();
        }
        self.meta.clone()
    }

    fn notify_msg(&self, msg: Vec<u8>) {
        if msg.is_empty() {
            return;
        }
        let _ = self.notify_tx.send(msg);
    }

    fn get_broadcasts(&self, overhead: usize, byte_limit: usize, num_nodes: usize) -> Vec<Vec<u8>> {
        self.queue.get_broadcasts(overhead, byte_limit, num_nodes)
    }

    fn local_state(&self, _join: bool) -> Vec<u8> {
        self.recent.snapshot()
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        // Only merged on join: a new peer skips events the cluster has
        // already handled.
        if join {
            self.recent.merge(buf);
        }
    }
}

/// Sink that turns local mutations into gossip broadcasts.
struct GossipBroadcaster {
    queue: Arc<BroadcastQueue>,
    peer_addr: String,
    peer_port: u16,
}

#[async_trait]
impl EventSink for GossipBroadcaster {
    async fn message_created(
        &self,
        pub_key_id: &str,
        channel: &str,
        id: &str,
    ) -> Result<(), EventError> {
        let event = GossipEvent::NewMessage {
            pub_key_id: pub_key_id.to_string(),
            channel: channel.to_string(),
            id: id.to_string(),
            peer_addr: self.peer_addr.clone(),
            peer_port: self.peer_port,
        };
        let payload = serde_json::to_vec(&event)?;
        self.queue
            .queue(BroadcastKind::NewMessage, pub_key_id, channel, id, payload);
        Ok(())
    }

    async fn message_deleted(
        &self,
        pub_key_id: &str,
        channel: &str,
        id: &str,
    ) -> Result<(), EventError> {
        let event = GossipEvent::DeleteMessage {
            pub_key_id: pub_key_id.to_string(),
            channel: channel.to_string(),
            id: id.to_string(),
        };
        let payload = serde_json::to_vec(&event)?;
        self.queue.queue(
            BroadcastKind::DeleteMessage,
            pub_key_id,
            channel,
            id,
            payload,
        );
        Ok(())
    }
}

/// Sink that applies remote events to the local store, pulling
/// ciphertext over the data channel for announcements.
struct Replicator {
    store: Arc<MessageStore>,
    members: Arc<Memberlist>,
    channel_config: ChannelConfig,
    fallback_limit: usize,
}

impl Replicator {
    /// Data-channel endpoints of every other live member.
    fn candidates(&self) -> Vec<(String, u16)> {
        self.members
            .live_peers()
            .iter()
            .filter_map(|member| serde_json::from_slice::<NodeMeta>(&member.meta).ok())
            .map(|meta| (meta.peer_addr, meta.peer_port))
            .collect()
    }
}

#[async_trait]
impl EventSink for Replicator {
    async fn remote_message(
        &self,
        pub_key_id: &str,
        channel: &str,
        id: &str,
        peer_addr: &str,
        peer_port: u16,
    ) -> Result<(), EventError> {
        let data = data::request_best_effort(
            &self.channel_config,
            (peer_addr, peer_port),
            &self.candidates(),
            self.fallback_limit,
            pub_key_id,
            channel,
            id,
        )
        .await
        .map_err(|error| EventError::Sink(error.to_string()))?;
        message::store_from_peer(&self.store, pub_key_id, channel, id, &data)
            .map_err(|error| EventError::Sink(error.to_string()))?;
        clog!(
            info,
            "peer: replicated {}",
            crate::persist::describe(pub_key_id, channel, id)
        );
        Ok(())
    }

    async fn remote_deletion(
        &self,
        pub_key_id: &str,
        channel: &str,
        id: &str,
        _from_event: bool,
    ) -> Result<(), EventError> {
        match self.store.delete_message(pub_key_id, channel, id) {
            // A delete may arrive before the message does; dropping it
            // is correct, the queued newMessage was invalidated.
            Ok(()) | Err(PersistError::NotFound) => Ok(()),
            Err(error) => Err(EventError::Sink(error.to_string())),
        }
    }
}

pub struct Peer {
    config: PeerConfig,
    store: Arc<MessageStore>,
    members: Arc<Memberlist>,
    router: Arc<EventRouter>,
}

impl Peer {
    /// Construct the peer and start every background task: gossip,
    /// data-channel server, event dispatch, cache cleaner, expiry
    /// sweeper, and the isolation watcher.
    pub async fn start(mut config: PeerConfig) -> Result<Arc<Peer>, PeerError> {
        config.normalize();
        if config.name.is_empty() {
            return Err(PeerError::Config("peer name is required".to_string()));
        }
        if config.data_dir.is_empty() {
            return Err(PeerError::Config("peer data dir is required".to_string()));
        }

        let peer_key = if config.peer_key.is_empty() {
            None
        } else {
            let key = hex::decode(&config.peer_key)
                .map_err(|_| PeerError::Config("peer key is not valid hex".to_string()))?;
            if key.len() != 32 {
                return Err(PeerError::Config("peer key must be 32 bytes".to_string()));
            }
            Some(key)
        };

        let store = Arc::new(MessageStore::open(
            Path::new(&config.data_dir),
            &config.name,
        )?);

        let mut gossip_config = GossipConfig::for_mode(&config.connection_mode, &config.name);
        gossip_config.bind_port = config.gossip_bind_port;
        gossip_config.advertise_port = config.gossip_advertise_port;
        if !config.advertise_addr.is_empty() {
            gossip_config.advertise_addr = config.advertise_addr.clone();
        }
        gossip_config.secret_key = peer_key.clone();
        for cidr in &config.allowed_cidrs {
            if cidr.trim().is_empty() {
                continue;
            }
            let parsed = crate::gossip::proto::Cidr::parse(cidr)
                .map_err(|error| PeerError::Config(error.to_string()))?;
            gossip_config.allowed_cidrs.push(parsed);
        }

        let recent = Arc::new(RecentMessages::new());
        let queue = Arc::new(BroadcastQueue::new(gossip_config.retransmit_mult));
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        // The address other peers will pull data from.
        let data_addr = if config.advertise_addr.is_empty() {
            crate::gossip::local_ip().to_string()
        } else {
            config.advertise_addr.clone()
        };
        let meta = serde_json::to_vec(&NodeMeta {
            peer_addr: data_addr.clone(),
            peer_port: config.data_advertise_port,
        })
        .map_err(|error| PeerError::Config(error.to_string()))?;

        let delegate = Arc::new(PeerDelegate {
            meta,
            queue: Arc::clone(&queue),
            recent: Arc::clone(&recent),
            notify_tx,
        });

        let members = Memberlist::create(gossip_config, delegate).await?;

        if !config.peer_addrs.is_empty() {
            match members.join(&config.peer_addrs).await {
                Ok(count) => clog!(info, "peer: joined {count} seed(s)"),
                Err(error) => clog!(warn, "peer: initial join failed: {error}"),
            }
        }

        let channel_config = ChannelConfig::new(&config.name, peer_key);

        let broadcaster = Arc::new(GossipBroadcaster {
            queue: Arc::clone(&queue),
            peer_addr: data_addr,
            peer_port: config.data_advertise_port,
        });
        let replicator = Arc::new(Replicator {
            store: Arc::clone(&store),
            members: Arc::clone(&members),
            channel_config: channel_config.clone(),
            fallback_limit: config.fallback_peer_limit,
        });
        let router = Arc::new(EventRouter::new(
            Arc::clone(&recent),
            vec![broadcaster, replicator],
        ));

        // Gossip notifications land on a channel; dispatch them here so
        // the membership layer never blocks on replication pulls.
        let dispatch_router = Arc::clone(&router);
        tokio::spawn(async move {
            while let Some(payload) = notify_rx.recv().await {
                if let Err(error) = dispatch_router.receive(&payload).await {
                    clog!(warn, "peer: dropping gossip payload: {error}");
                }
            }
        });

        // Data-channel server.
        let listener =
            TcpListener::bind(("0.0.0.0", config.data_bind_port))
                .await?;
        let data_store = Arc::clone(&store);
        let data_config = channel_config.clone();
        let member_check = {
            let members = Arc::clone(&members);
            Arc::new(move |name: &str| members.has_member(name)) as Arc<dyn Fn(&str) -> bool + Send + Sync>
        };
        tokio::spawn(async move {
            data::serve(listener, data_store, data_config, member_check).await;
        });

        recent.spawn_cleaner();
        store.spawn_sweeper();

        let peer = Arc::new(Peer {
            config,
            store,
            members,
            router,
        });
        peer.spawn_peer_watcher();
        Ok(peer)
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn members(&self) -> &Arc<Memberlist> {
        &self.members
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    /// Rejoin the seeds whenever the peer finds itself alone.  Transient
    /// isolation becomes eventual recovery.
    fn spawn_peer_watcher(self: &Arc<Self>) {
        let peer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(PEER_WATCH_INTERVAL).await;
                if peer.config.peer_addrs.is_empty() {
                    continue;
                }
                if !peer.members.live_peers().is_empty() {
                    continue;
                }
                clog!(info, "peer: no live peers, rejoining seeds");
                if let Err(error) = peer.members.join(&peer.config.peer_addrs).await {
                    clog!(warn, "peer: rejoin failed: {error}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_meta_json_shape() {
        let meta = NodeMeta {
            peer_addr: "10.0.0.1".to_string(),
            peer_port: 5664,
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(json, r#"{"peerAddr":"10.0.0.1","peerPort":5664}"#);
    }

    #[tokio::test]
    async fn start_requires_name_and_data_dir() {
        let config = PeerConfig::default();
        assert!(matches!(
            Peer::start(config).await,
            Err(PeerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn start_rejects_bad_peer_key() {
        let dir = std::env::temp_dir().join(format!("centauri-peer-{}", rand::random::<u64>()));
        let config = PeerConfig {
            name: "p0".to_string(),
            data_dir: dir.to_string_lossy().into_owned(),
            peer_key: "zz".to_string(),
            ..PeerConfig::default()
        };
        assert!(matches!(
            Peer::start(config).await,
            Err(PeerError::Config(_))
        ));
    }
}
