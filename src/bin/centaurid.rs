//! Peer daemon: gossip membership, data channel, and the HTTP inbox API.

use centauri::cfg::Cfg;
use centauri::{clog, logging, peer, server};
use clap::Parser;
use uuid::Uuid;

/// Peer daemon for the centauri relay cluster.
///
/// Options come from the YAML config ($CENTAURI_CONFIG or
/// ~/.centauri/config.yaml); flags override config values when set.
#[derive(Parser, Debug)]
#[command(name = "centaurid", disable_version_flag = true)]
struct Cli {
    /// Print the version and exit.
    #[arg(value_parser = ["version"])]
    command: Option<String>,

    /// Name of this node
    #[arg(long)]
    name: Option<String>,

    /// Data directory
    #[arg(long = "data")]
    data_dir: Option<String>,

    /// Peer connection mode (lan, wan, local)
    #[arg(long)]
    mode: Option<String>,

    /// Gossip port to bind
    #[arg(long = "gossip-bind-port")]
    gossip_bind_port: Option<u16>,

    /// Gossip port to advertise
    #[arg(long = "gossip-advertise-port")]
    gossip_advertise_port: Option<u16>,

    /// Data channel port to bind
    #[arg(long = "data-bind-port")]
    data_bind_port: Option<u16>,

    /// Data channel port to advertise
    #[arg(long = "data-advertise-port")]
    data_advertise_port: Option<u16>,

    /// Address to advertise to other peers
    #[arg(long = "advertise-addr")]
    advertise_addr: Option<String>,

    /// Peer encryption key (32-byte hex). Leave blank for no encryption
    #[arg(long = "peer-key")]
    peer_key: Option<String>,

    /// Seed addresses to join, comma separated
    #[arg(long = "addrs")]
    peer_addrs: Option<String>,

    /// CIDRs allowed to gossip, comma separated. Empty for all
    #[arg(long = "cidrs")]
    allowed_cidrs: Option<String>,

    /// Auth token for the HTTP API
    #[arg(long = "server-token")]
    server_auth_token: Option<String>,

    /// HTTP API port
    #[arg(long = "server-port")]
    server_port: Option<u16>,

    /// CORS origins for the HTTP API, comma separated
    #[arg(long = "server-cors")]
    server_cors: Option<String>,

    /// Path to the TLS certificate for the HTTP API
    #[arg(long = "server-cert")]
    server_tls_cert_path: Option<String>,

    /// Path to the TLS key for the HTTP API
    #[arg(long = "server-key")]
    server_tls_key_path: Option<String>,
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
        })
        .unwrap_or_else(|| "centauri".to_string())
}

fn load_config(cli: &Cli) -> centauri::cfg::PeerConfig {
    let mut cfg = match Cfg::init() {
        Ok(cfg) => cfg,
        Err(error) => {
            clog!(error, "centaurid: failed to load config: {error}");
            std::process::exit(1);
        }
    };
    let peer = &mut cfg.peer;
    if let Some(name) = &cli.name {
        peer.name = name.clone();
    }
    if peer.name.is_empty() {
        peer.name = format!("{}-{}", hostname(), Uuid::new_v4());
    }
    if let Some(data_dir) = &cli.data_dir {
        peer.data_dir = data_dir.clone();
    }
    if peer.data_dir.is_empty() {
        peer.data_dir = ".centauri-data".to_string();
    }
    if let Some(mode) = &cli.mode {
        peer.connection_mode = mode.clone();
    }
    if let Some(port) = cli.gossip_bind_port {
        peer.gossip_bind_port = port;
    }
    if let Some(port) = cli.gossip_advertise_port {
        peer.gossip_advertise_port = port;
    }
    if let Some(port) = cli.data_bind_port {
        peer.data_bind_port = port;
    }
    if let Some(port) = cli.data_advertise_port {
        peer.data_advertise_port = port;
    }
    if let Some(addr) = &cli.advertise_addr {
        peer.advertise_addr = addr.clone();
    }
    if let Some(key) = &cli.peer_key {
        peer.peer_key = key.clone();
    }
    if let Some(addrs) = &cli.peer_addrs {
        peer.peer_addrs = split_csv(addrs);
    }
    if let Some(cidrs) = &cli.allowed_cidrs {
        peer.allowed_cidrs = split_csv(cidrs);
    }
    if let Some(token) = &cli.server_auth_token {
        peer.server_auth_token = token.clone();
    }
    if let Some(port) = cli.server_port {
        peer.server_port = port;
    }
    if let Some(cors) = &cli.server_cors {
        peer.server_cors = split_csv(cors);
    }
    if let Some(path) = &cli.server_tls_cert_path {
        peer.server_tls_cert_path = path.clone();
    }
    if let Some(path) = &cli.server_tls_key_path {
        peer.server_tls_key_path = path.clone();
    }
    cfg.peer
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    if cli.command.as_deref() == Some("version") {
        println!("version: {}", centauri::VERSION);
        return;
    }

    let config = load_config(&cli);
    clog!(info, "centaurid: starting node {}", config.name);

    let peer = match peer::Peer::start(config).await {
        Ok(peer) => peer,
        Err(error) => {
            clog!(error, "centaurid: failed to start peer: {error}");
            std::process::exit(1);
        }
    };

    let state = server::AppState {
        store: peer.store().clone(),
        router: peer.router().clone(),
        auth_token: if peer.config().server_auth_token.is_empty() {
            None
        } else {
            Some(peer.config().server_auth_token.clone())
        },
    };
    if let Err(error) = server::serve(state, peer.config()).await {
        clog!(error, "centaurid: server failed: {error}");
        std::process::exit(1);
    }
}
