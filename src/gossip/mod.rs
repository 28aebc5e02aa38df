//! SWIM-style cluster membership.
//!
//! Peers probe each other over UDP, spread liveness changes and
//! application broadcasts epidemically, and exchange full state over TCP
//! on join and periodically afterwards.  The embedding application talks
//! to the layer through a [`Delegate`]: node metadata, user payload
//! delivery, broadcast draining, and join-time state merge.
//!
//! Three connection profiles tune the timers: LAN (default), WAN (looser
//! timeouts), and LOOPBACK (tests).  An optional 32-byte cluster key
//! encrypts every frame; an optional CIDR allow-list restricts who may
//! speak to this node at all.

pub mod proto;
pub mod queue;

use proto::{
    cidr_allowed, decode_packet, decode_push_pull, encode_packet, encode_push_pull, Cidr,
    NodeStatus, PushNodeState, PushPull, WireMessage,
};

use crate::clog;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::oneshot;

/// Most bytes of node metadata a peer may publish.
pub const META_MAX: usize = 512;

/// Ceiling for one UDP gossip packet.
const PACKET_MAX: usize = 1400;

/// Per-message JSON overhead assumed when packing broadcasts.
const BROADCAST_OVERHEAD: usize = 32;

/// How long a dead node is remembered before it is reaped.
const DEAD_REAP_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum GossipError {
    Io(std::io::Error),
    Encode(serde_json::Error),
    Crypto(crate::crypto::CryptoError),
    Config(String),
    NoPeers,
}

impl fmt::Display for GossipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GossipError::Io(error) => write!(f, "io error: {error}"),
            GossipError::Encode(error) => write!(f, "encode error: {error}"),
            GossipError::Crypto(error) => write!(f, "crypto error: {error}"),
            GossipError::Config(message) => write!(f, "config error: {message}"),
            GossipError::NoPeers => write!(f, "no peers could be reached"),
        }
    }
}

impl std::error::Error for GossipError {}

impl From<std::io::Error> for GossipError {
    fn from(error: std::io::Error) -> Self {
        GossipError::Io(error)
    }
}

impl From<serde_json::Error> for GossipError {
    fn from(error: serde_json::Error) -> Self {
        GossipError::Encode(error)
    }
}

impl From<crate::crypto::CryptoError> for GossipError {
    fn from(error: crate::crypto::CryptoError) -> Self {
        GossipError::Crypto(error)
    }
}

/// Application hooks into the membership layer.
pub trait Delegate: Send + Sync + 'static {
    /// Metadata to publish for this node, at most `limit` bytes.
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// A user broadcast arrived.
    fn notify_msg(&self, msg: Vec<u8>);

    /// Drain pending user broadcasts for transmission.
    fn get_broadcasts(&self, overhead: usize, byte_limit: usize, num_nodes: usize)
        -> Vec<Vec<u8>>;

    /// Application state shipped during push-pull exchanges.
    fn local_state(&self, join: bool) -> Vec<u8>;

    /// Counterpart of `local_state` on the receiving side.
    fn merge_remote_state(&self, buf: &[u8], join: bool);
}

/// Connection profile and timer configuration.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub name: String,
    pub bind_addr: String,
    pub bind_port: u16,
    pub advertise_addr: String,
    pub advertise_port: u16,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub gossip_interval: Duration,
    pub gossip_nodes: usize,
    pub suspicion_mult: u32,
    pub push_pull_interval: Duration,
    pub retransmit_mult: usize,
    pub secret_key: Option<Vec<u8>>,
    pub allowed_cidrs: Vec<Cidr>,
}

impl GossipConfig {
    fn base(name: &str) -> GossipConfig {
        GossipConfig {
            name: name.to_string(),
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 5665,
            advertise_addr: String::new(),
            advertise_port: 0,
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            suspicion_mult: 4,
            push_pull_interval: Duration::from_secs(30),
            retransmit_mult: queue::RETRANSMIT_MULT,
            secret_key: None,
            allowed_cidrs: Vec::new(),
        }
    }

    /// Default profile for a local network.
    pub fn lan(name: &str) -> GossipConfig {
        GossipConfig::base(name)
    }

    /// Looser timers for peers spread across the public internet.
    pub fn wan(name: &str) -> GossipConfig {
        GossipConfig {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            gossip_interval: Duration::from_millis(500),
            gossip_nodes: 4,
            suspicion_mult: 6,
            push_pull_interval: Duration::from_secs(60),
            ..GossipConfig::base(name)
        }
    }

    /// Tight timers for single-host clusters and tests.
    pub fn loopback(name: &str) -> GossipConfig {
        GossipConfig {
            bind_addr: "127.0.0.1".to_string(),
            advertise_addr: "127.0.0.1".to_string(),
            probe_timeout: Duration::from_millis(200),
            gossip_interval: Duration::from_millis(100),
            push_pull_interval: Duration::from_secs(15),
            ..GossipConfig::base(name)
        }
    }

    /// Profile by config name: `wan`, `local`, anything else is LAN.
    pub fn for_mode(mode: &str, name: &str) -> GossipConfig {
        match mode {
            "wan" => GossipConfig::wan(name),
            "local" => GossipConfig::loopback(name),
            _ => GossipConfig::lan(name),
        }
    }
}

/// A member of the cluster as currently known.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub meta: Vec<u8>,
    pub state: NodeStatus,
}

impl Member {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

#[derive(Debug, Clone)]
struct NodeInfo {
    member: Member,
    incarnation: u64,
    state_change: Instant,
}

#[derive(Debug)]
struct MemberBroadcast {
    name: String,
    msg: WireMessage,
    transmits: usize,
}

pub struct Memberlist {
    config: GossipConfig,
    delegate: Arc<dyn Delegate>,
    nodes: Mutex<HashMap<String, NodeInfo>>,
    mqueue: Mutex<Vec<MemberBroadcast>>,
    incarnation: AtomicU64,
    seq: AtomicU32,
    acks: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    socket: UdpSocket,
    advertise: SocketAddr,
}

/// Resolve an address that may be an IP or a DNS name, with a default
/// port when none is given.
fn resolve_addr(addr: &str, default_port: u16) -> Result<SocketAddr, GossipError> {
    use std::net::ToSocketAddrs;
    let addr = addr.trim();
    let candidate = if addr.contains(':') && !addr.contains("]:") && addr.parse::<IpAddr>().is_ok()
    {
        // bare IPv6 literal
        format!("[{addr}]:{default_port}")
    } else if addr.rsplit(':').next().is_some_and(|p| p.parse::<u16>().is_ok())
        && addr.contains(':')
    {
        addr.to_string()
    } else {
        format!("{addr}:{default_port}")
    };
    candidate
        .to_socket_addrs()
        .map_err(GossipError::Io)?
        .next()
        .ok_or_else(|| GossipError::Config(format!("cannot resolve {addr}")))
}

/// Best-effort local non-loopback address, used when no advertise
/// address is configured.
pub fn local_ip() -> IpAddr {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.connect("10.255.255.255:1").map(|_| s))
        .and_then(|s| s.local_addr());
    match probe {
        Ok(addr) if !addr.ip().is_unspecified() => addr.ip(),
        _ => IpAddr::from([127, 0, 0, 1]),
    }
}

impl Memberlist {
    /// Bind the sockets, record ourselves as alive, and start the
    /// protocol loops.
    pub async fn create(
        config: GossipConfig,
        delegate: Arc<dyn Delegate>,
    ) -> Result<Arc<Memberlist>, GossipError> {
        let socket = UdpSocket::bind((config.bind_addr.as_str(), config.bind_port)).await?;
        let bound_port = socket.local_addr()?.port();
        let tcp = TcpListener::bind((config.bind_addr.as_str(), bound_port)).await?;

        let advertise_ip = if config.advertise_addr.is_empty() {
            local_ip()
        } else {
            resolve_addr(&config.advertise_addr, bound_port)?.ip()
        };
        let advertise_port = if config.advertise_port == 0 {
            bound_port
        } else {
            config.advertise_port
        };
        let advertise = SocketAddr::new(advertise_ip, advertise_port);

        let list = Arc::new(Memberlist {
            config,
            delegate,
            nodes: Mutex::new(HashMap::new()),
            mqueue: Mutex::new(Vec::new()),
            incarnation: AtomicU64::new(1),
            seq: AtomicU32::new(0),
            acks: Mutex::new(HashMap::new()),
            socket,
            advertise,
        });

        let meta = list.delegate.node_meta(META_MAX);
        {
            let mut nodes = list.nodes.lock().unwrap();
            nodes.insert(
                list.config.name.clone(),
                NodeInfo {
                    member: Member {
                        name: list.config.name.clone(),
                        addr: advertise.ip(),
                        port: advertise.port(),
                        meta,
                        state: NodeStatus::Alive,
                    },
                    incarnation: 1,
                    state_change: Instant::now(),
                },
            );
        }

        tokio::spawn(Arc::clone(&list).udp_loop());
        tokio::spawn(Arc::clone(&list).tcp_loop(tcp));
        tokio::spawn(Arc::clone(&list).probe_loop());
        tokio::spawn(Arc::clone(&list).gossip_loop());
        tokio::spawn(Arc::clone(&list).push_pull_loop());

        clog!(
            info,
            "gossip: node {} listening on {advertise}",
            list.config.name
        );
        Ok(list)
    }

    pub fn local_name(&self) -> &str {
        &self.config.name
    }

    /// The address this node tells the cluster to reach it at.
    pub fn advertise_addr(&self) -> SocketAddr {
        self.advertise
    }

    /// All known members that are not dead, including this node.
    pub fn members(&self) -> Vec<Member> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .values()
            .filter(|info| info.member.state != NodeStatus::Dead)
            .map(|info| info.member.clone())
            .collect()
    }

    /// Live members other than this node.
    pub fn live_peers(&self) -> Vec<Member> {
        self.members()
            .into_iter()
            .filter(|member| member.name != self.config.name && member.state == NodeStatus::Alive)
            .collect()
    }

    pub fn num_members(&self) -> usize {
        self.members().len()
    }

    /// Whether a node with the given name is currently in the cluster.
    pub fn has_member(&self, name: &str) -> bool {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .get(name)
            .is_some_and(|info| info.member.state != NodeStatus::Dead)
    }

    /// Join the cluster through any of the given seed addresses.
    /// Returns the number of seeds successfully contacted.
    pub async fn join(self: &Arc<Self>, addrs: &[String]) -> Result<usize, GossipError> {
        let mut contacted = 0;
        for addr in addrs {
            let target = match resolve_addr(addr, self.config.bind_port) {
                Ok(target) => target,
                Err(error) => {
                    clog!(warn, "gossip: cannot resolve seed {addr}: {error}");
                    continue;
                }
            };
            match self.push_pull_with(target, true).await {
                Ok(()) => contacted += 1,
                Err(error) => clog!(warn, "gossip: join {addr} failed: {error}"),
            }
        }
        if contacted == 0 {
            return Err(GossipError::NoPeers);
        }
        Ok(contacted)
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn secret(&self) -> Option<&[u8]> {
        self.config.secret_key.as_deref()
    }

    async fn send_packet(&self, addr: SocketAddr, msgs: &[WireMessage]) {
        match encode_packet(msgs, self.secret()) {
            Ok(buf) => {
                if let Err(error) = self.socket.send_to(&buf, addr).await {
                    clog!(debug, "gossip: send to {addr} failed: {error}");
                }
            }
            Err(error) => clog!(error, "gossip: encode failed: {error}"),
        }
    }

    /// Queue a membership broadcast; a newer broadcast about the same
    /// node replaces the queued one.
    fn queue_member_broadcast(&self, name: &str, msg: WireMessage) {
        let mut mqueue = self.mqueue.lock().unwrap();
        mqueue.retain(|entry| entry.name != name);
        mqueue.push(MemberBroadcast {
            name: name.to_string(),
            msg,
            transmits: 0,
        });
    }

    fn drain_member_broadcasts(&self, byte_limit: usize, num_nodes: usize) -> Vec<WireMessage> {
        let scale = (((num_nodes + 1) as f64).log10().ceil() as usize).max(1);
        let limit = self.config.retransmit_mult * scale;
        let mut mqueue = self.mqueue.lock().unwrap();
        mqueue.sort_by_key(|entry| entry.transmits);
        let mut used = 0usize;
        let mut out = Vec::new();
        for entry in mqueue.iter_mut() {
            // Size estimate; membership messages are small and bounded.
            let cost = 128 + entry.name.len();
            if used + cost > byte_limit {
                continue;
            }
            used += cost;
            entry.transmits += 1;
            out.push(entry.msg.clone());
        }
        mqueue.retain(|entry| entry.transmits < limit);
        out
    }

    // ---------------------------------------------------------------
    // Protocol loops
    // ---------------------------------------------------------------

    async fn udp_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65_536];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(error) => {
                    clog!(error, "gossip: udp recv failed: {error}");
                    continue;
                }
            };
            if !cidr_allowed(&self.config.allowed_cidrs, src.ip()) {
                clog!(debug, "gossip: dropping packet from disallowed {src}");
                continue;
            }
            let msgs = match decode_packet(&buf[..len], self.secret()) {
                Ok(msgs) => msgs,
                Err(error) => {
                    clog!(debug, "gossip: bad packet from {src}: {error}");
                    continue;
                }
            };
            for msg in msgs {
                self.handle_message(msg, src).await;
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, msg: WireMessage, src: SocketAddr) {
        match msg {
            WireMessage::Ping { seq, .. } => {
                let ack = WireMessage::Ack {
                    seq,
                    from: self.config.name.clone(),
                };
                self.send_packet(src, &[ack]).await;
            }
            WireMessage::Ack { seq, .. } => {
                let sender = self.acks.lock().unwrap().remove(&seq);
                if let Some(sender) = sender {
                    let _ = sender.send(());
                }
            }
            WireMessage::PingReq { seq, target, from } => {
                self.relay_probe(seq, target, from, src).await;
            }
            WireMessage::Alive {
                name,
                addr,
                port,
                meta,
                incarnation,
            } => {
                if let Ok(ip) = addr.parse::<IpAddr>() {
                    self.handle_alive(&name, ip, port, meta, incarnation, true);
                }
            }
            WireMessage::Suspect {
                name, incarnation, ..
            } => {
                self.handle_suspect(&name, incarnation);
            }
            WireMessage::Dead {
                name, incarnation, ..
            } => {
                self.handle_dead(&name, incarnation);
            }
            WireMessage::User { data } => {
                self.delegate.notify_msg(data);
            }
        }
    }

    /// Probe `target` on behalf of `origin`, relaying an ack back.
    async fn relay_probe(self: &Arc<Self>, seq: u32, target: String, origin: String, src: SocketAddr) {
        let target_addr = {
            let nodes = self.nodes.lock().unwrap();
            nodes.get(&target).map(|info| info.member.socket_addr())
        };
        let Some(target_addr) = target_addr else {
            return;
        };
        let list = Arc::clone(self);
        tokio::spawn(async move {
            let relay_seq = list.next_seq();
            let (tx, rx) = oneshot::channel();
            list.acks.lock().unwrap().insert(relay_seq, tx);
            let ping = WireMessage::Ping {
                seq: relay_seq,
                from: list.config.name.clone(),
            };
            list.send_packet(target_addr, &[ping]).await;
            let acked = tokio::time::timeout(list.config.probe_timeout, rx)
                .await
                .is_ok();
            list.acks.lock().unwrap().remove(&relay_seq);
            if acked {
                let ack = WireMessage::Ack {
                    seq,
                    from: list.config.name.clone(),
                };
                list.send_packet(src, &[ack]).await;
            } else {
                clog!(debug, "gossip: indirect probe of {target} for {origin} failed");
            }
        });
    }

    async fn probe_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.probe_interval).await;
            self.reap_dead();
            let target = {
                let nodes = self.nodes.lock().unwrap();
                let candidates: Vec<_> = nodes
                    .values()
                    .filter(|info| {
                        info.member.name != self.config.name
                            && info.member.state != NodeStatus::Dead
                    })
                    .map(|info| {
                        (
                            info.member.name.clone(),
                            info.member.socket_addr(),
                            info.incarnation,
                        )
                    })
                    .collect();
                candidates
                    .choose(&mut rand::thread_rng())
                    .cloned()
            };
            let Some((name, addr, incarnation)) = target else {
                continue;
            };
            if !self.probe_node(addr).await && !self.indirect_probe(&name).await {
                clog!(info, "gossip: node {name} failed probes, marking suspect");
                self.handle_suspect(&name, incarnation);
            }
        }
    }

    async fn probe_node(self: &Arc<Self>, addr: SocketAddr) -> bool {
        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();
        self.acks.lock().unwrap().insert(seq, tx);
        let ping = WireMessage::Ping {
            seq,
            from: self.config.name.clone(),
        };
        self.send_packet(addr, &[ping]).await;
        let acked = tokio::time::timeout(self.config.probe_timeout, rx)
            .await
            .is_ok();
        self.acks.lock().unwrap().remove(&seq);
        acked
    }

    async fn indirect_probe(self: &Arc<Self>, target: &str) -> bool {
        let relays = {
            let nodes = self.nodes.lock().unwrap();
            let mut candidates: Vec<_> = nodes
                .values()
                .filter(|info| {
                    info.member.state == NodeStatus::Alive
                        && info.member.name != self.config.name
                        && info.member.name != target
                })
                .map(|info| info.member.socket_addr())
                .collect();
            candidates.shuffle(&mut rand::thread_rng());
            candidates.truncate(3);
            candidates
        };
        if relays.is_empty() {
            return false;
        }
        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();
        self.acks.lock().unwrap().insert(seq, tx);
        let ping_req = WireMessage::PingReq {
            seq,
            target: target.to_string(),
            from: self.config.name.clone(),
        };
        for relay in relays {
            self.send_packet(relay, &[ping_req.clone()]).await;
        }
        let acked = tokio::time::timeout(self.config.probe_timeout * 2, rx)
            .await
            .is_ok();
        self.acks.lock().unwrap().remove(&seq);
        acked
    }

    async fn gossip_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.gossip_interval).await;
            let targets = {
                let nodes = self.nodes.lock().unwrap();
                let mut candidates: Vec<_> = nodes
                    .values()
                    .filter(|info| {
                        info.member.name != self.config.name
                            && info.member.state != NodeStatus::Dead
                    })
                    .map(|info| info.member.socket_addr())
                    .collect();
                candidates.shuffle(&mut rand::thread_rng());
                candidates.truncate(self.config.gossip_nodes);
                candidates
            };
            // Draining counts a transmission, so hold the queues while
            // nobody is listening.
            if targets.is_empty() {
                continue;
            }
            let num_nodes = self.num_members();
            let mut msgs = self.drain_member_broadcasts(PACKET_MAX / 2, num_nodes);
            let user = self
                .delegate
                .get_broadcasts(BROADCAST_OVERHEAD, PACKET_MAX / 2, num_nodes);
            msgs.extend(user.into_iter().map(|data| WireMessage::User { data }));
            if msgs.is_empty() {
                continue;
            }
            for target in targets {
                self.send_packet(target, &msgs).await;
            }
        }
    }

    async fn push_pull_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.push_pull_interval).await;
            let target = {
                let nodes = self.nodes.lock().unwrap();
                let candidates: Vec<_> = nodes
                    .values()
                    .filter(|info| {
                        info.member.name != self.config.name
                            && info.member.state == NodeStatus::Alive
                    })
                    .map(|info| info.member.socket_addr())
                    .collect();
                candidates.choose(&mut rand::thread_rng()).cloned()
            };
            if let Some(target) = target {
                if let Err(error) = self.push_pull_with(target, false).await {
                    clog!(debug, "gossip: push-pull with {target} failed: {error}");
                }
            }
        }
    }

    async fn tcp_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, src) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    clog!(error, "gossip: tcp accept failed: {error}");
                    continue;
                }
            };
            if !cidr_allowed(&self.config.allowed_cidrs, src.ip()) {
                clog!(debug, "gossip: dropping connection from disallowed {src}");
                continue;
            }
            let list = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(error) = list.handle_push_pull_conn(stream).await {
                    clog!(debug, "gossip: push-pull from {src} failed: {error}");
                }
            });
        }
    }

    async fn handle_push_pull_conn(self: &Arc<Self>, mut stream: TcpStream) -> Result<(), GossipError> {
        let remote = read_frame(&mut stream).await?;
        let remote = decode_push_pull(&remote, self.secret())?;
        let join = remote.join;

        let local = self.snapshot_push_pull(join);
        let buf = encode_push_pull(&local, self.secret())?;
        write_frame(&mut stream, &buf).await?;

        self.merge_push_pull(remote);
        Ok(())
    }

    async fn push_pull_with(self: &Arc<Self>, target: SocketAddr, join: bool) -> Result<(), GossipError> {
        let mut stream = TcpStream::connect(target).await?;
        let local = self.snapshot_push_pull(join);
        let buf = encode_push_pull(&local, self.secret())?;
        write_frame(&mut stream, &buf).await?;

        let remote = read_frame(&mut stream).await?;
        let remote = decode_push_pull(&remote, self.secret())?;
        self.merge_push_pull(remote);
        Ok(())
    }

    fn snapshot_push_pull(&self, join: bool) -> PushPull {
        let nodes = self.nodes.lock().unwrap();
        PushPull {
            join,
            from: self.config.name.clone(),
            nodes: nodes
                .values()
                .map(|info| PushNodeState {
                    name: info.member.name.clone(),
                    addr: info.member.addr.to_string(),
                    port: info.member.port,
                    meta: info.member.meta.clone(),
                    incarnation: info.incarnation,
                    state: info.member.state,
                })
                .collect(),
            user_state: self.delegate.local_state(join),
        }
    }

    fn merge_push_pull(self: &Arc<Self>, remote: PushPull) {
        let join = remote.join;
        for node in remote.nodes {
            let Ok(ip) = node.addr.parse::<IpAddr>() else {
                continue;
            };
            match node.state {
                NodeStatus::Alive => {
                    self.handle_alive(&node.name, ip, node.port, node.meta, node.incarnation, false)
                }
                NodeStatus::Suspect => self.handle_suspect(&node.name, node.incarnation),
                NodeStatus::Dead => self.handle_dead(&node.name, node.incarnation),
            }
        }
        if !remote.user_state.is_empty() {
            self.delegate.merge_remote_state(&remote.user_state, join);
        }
    }

    // ---------------------------------------------------------------
    // State transitions
    // ---------------------------------------------------------------

    fn refute(&self) {
        let incarnation = self.incarnation.fetch_add(1, Ordering::SeqCst) + 1;
        let meta = self.delegate.node_meta(META_MAX);
        {
            let mut nodes = self.nodes.lock().unwrap();
            if let Some(info) = nodes.get_mut(&self.config.name) {
                info.incarnation = incarnation;
                info.member.state = NodeStatus::Alive;
                info.member.meta = meta.clone();
                info.state_change = Instant::now();
            }
        }
        self.queue_member_broadcast(
            &self.config.name,
            WireMessage::Alive {
                name: self.config.name.clone(),
                addr: self.advertise.ip().to_string(),
                port: self.advertise.port(),
                meta,
                incarnation,
            },
        );
    }

    fn handle_alive(
        self: &Arc<Self>,
        name: &str,
        addr: IpAddr,
        port: u16,
        meta: Vec<u8>,
        incarnation: u64,
        rebroadcast: bool,
    ) {
        if name == self.config.name {
            if incarnation > self.incarnation.load(Ordering::SeqCst) {
                // Someone has newer claims about us than we do; reassert.
                self.incarnation.store(incarnation, Ordering::SeqCst);
                self.refute();
            }
            return;
        }
        let updated = {
            let mut nodes = self.nodes.lock().unwrap();
            match nodes.get_mut(name) {
                None => {
                    nodes.insert(
                        name.to_string(),
                        NodeInfo {
                            member: Member {
                                name: name.to_string(),
                                addr,
                                port,
                                meta: meta.clone(),
                                state: NodeStatus::Alive,
                            },
                            incarnation,
                            state_change: Instant::now(),
                        },
                    );
                    clog!(info, "gossip: node joined: {name} ({addr}:{port})");
                    true
                }
                Some(info) => {
                    if incarnation > info.incarnation
                        || (incarnation == info.incarnation
                            && info.member.state != NodeStatus::Alive)
                    {
                        if info.member.state != NodeStatus::Alive {
                            clog!(info, "gossip: node recovered: {name}");
                        }
                        info.incarnation = incarnation;
                        info.member.addr = addr;
                        info.member.port = port;
                        info.member.meta = meta.clone();
                        info.member.state = NodeStatus::Alive;
                        info.state_change = Instant::now();
                        true
                    } else {
                        false
                    }
                }
            }
        };
        if updated && rebroadcast {
            self.queue_member_broadcast(
                name,
                WireMessage::Alive {
                    name: name.to_string(),
                    addr: addr.to_string(),
                    port,
                    meta,
                    incarnation,
                },
            );
        }
    }

    fn handle_suspect(self: &Arc<Self>, name: &str, incarnation: u64) {
        if name == self.config.name {
            self.refute();
            return;
        }
        let marked = {
            let mut nodes = self.nodes.lock().unwrap();
            match nodes.get_mut(name) {
                Some(info)
                    if incarnation >= info.incarnation
                        && info.member.state == NodeStatus::Alive =>
                {
                    info.member.state = NodeStatus::Suspect;
                    info.incarnation = incarnation;
                    info.state_change = Instant::now();
                    true
                }
                _ => false,
            }
        };
        if !marked {
            return;
        }
        self.queue_member_broadcast(
            name,
            WireMessage::Suspect {
                name: name.to_string(),
                incarnation,
                from: self.config.name.clone(),
            },
        );

        // Promote to dead if the suspicion is never refuted.
        let list = Arc::clone(self);
        let name = name.to_string();
        let timeout = self.suspicion_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let still_suspect = {
                let nodes = list.nodes.lock().unwrap();
                nodes.get(&name).is_some_and(|info| {
                    info.member.state == NodeStatus::Suspect && info.incarnation <= incarnation
                })
            };
            if still_suspect {
                clog!(info, "gossip: node {name} suspicion expired, marking dead");
                list.handle_dead(&name, incarnation);
            }
        });
    }

    fn suspicion_timeout(&self) -> Duration {
        let n = self.num_members().max(1);
        let scale = ((n as f64).log10().max(1.0)).ceil() as u32;
        self.config.probe_interval * self.config.suspicion_mult * scale
    }

    fn handle_dead(self: &Arc<Self>, name: &str, incarnation: u64) {
        if name == self.config.name {
            self.refute();
            return;
        }
        let marked = {
            let mut nodes = self.nodes.lock().unwrap();
            match nodes.get_mut(name) {
                Some(info)
                    if incarnation >= info.incarnation
                        && info.member.state != NodeStatus::Dead =>
                {
                    info.member.state = NodeStatus::Dead;
                    info.incarnation = incarnation;
                    info.state_change = Instant::now();
                    true
                }
                _ => false,
            }
        };
        if !marked {
            return;
        }
        clog!(info, "gossip: node left: {name}");
        self.queue_member_broadcast(
            name,
            WireMessage::Dead {
                name: name.to_string(),
                incarnation,
                from: self.config.name.clone(),
            },
        );
    }

    fn reap_dead(&self) {
        let mut nodes = self.nodes.lock().unwrap();
        nodes.retain(|_, info| {
            info.member.state != NodeStatus::Dead
                || info.state_change.elapsed() < DEAD_REAP_AFTER
        });
    }

    /// Pick a random live peer, if any.
    pub fn random_peer(&self) -> Option<Member> {
        let peers = self.live_peers();
        peers.choose(&mut rand::thread_rng()).cloned()
    }
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, GossipError> {
    let len = stream.read_u32().await? as usize;
    if len > 16 * 1024 * 1024 {
        return Err(GossipError::Config("push-pull frame too large".to_string()));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame(stream: &mut TcpStream, buf: &[u8]) -> Result<(), GossipError> {
    stream.write_u32(buf.len() as u32).await?;
    stream.write_all(buf).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_differ() {
        let lan = GossipConfig::lan("n");
        let wan = GossipConfig::wan("n");
        let local = GossipConfig::loopback("n");
        assert!(wan.probe_timeout > lan.probe_timeout);
        assert!(local.probe_timeout < lan.probe_timeout);
        assert_eq!(local.bind_addr, "127.0.0.1");
        assert_eq!(GossipConfig::for_mode("wan", "n").probe_timeout, wan.probe_timeout);
    }

    #[test]
    fn resolves_plain_ip_with_default_port() {
        let addr = resolve_addr("127.0.0.1", 5665).unwrap();
        assert_eq!(addr, "127.0.0.1:5665".parse().unwrap());
    }

    #[test]
    fn resolves_ip_with_port() {
        let addr = resolve_addr("127.0.0.1:9000", 5665).unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse().unwrap());
    }
}
