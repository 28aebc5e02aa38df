//! Agent daemon: polls a home peer, decrypts into the received trees,
//! and uploads anything dropped into the outbox directories.

use centauri::agent::Agent;
use centauri::cfg::Cfg;
use centauri::{clog, logging};
use clap::Parser;
use std::sync::Arc;

/// Recipient agent for the centauri relay cluster.
///
/// Options come from the YAML config ($CENTAURI_CONFIG or
/// ~/.centauri/config.yaml); flags override config values when set.
#[derive(Parser, Debug)]
#[command(name = "centauri-agent", disable_version_flag = true)]
struct Cli {
    /// Print the version and exit.
    #[arg(value_parser = ["version"])]
    command: Option<String>,

    /// Channel to listen on
    #[arg(long)]
    channel: Option<String>,

    /// Path to the agent private key
    #[arg(long = "key")]
    private_key_path: Option<String>,

    /// Auth token for the server
    #[arg(long = "server-token")]
    server_auth_token: Option<String>,

    /// Peer addresses, comma separated
    #[arg(long = "server-addrs")]
    server_addrs: Option<String>,

    /// Data directory
    #[arg(long = "data")]
    data_dir: Option<String>,
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn load_config(cli: &Cli) -> centauri::cfg::AgentConfig {
    let mut cfg = match Cfg::init() {
        Ok(cfg) => cfg,
        Err(error) => {
            clog!(error, "centauri-agent: failed to load config: {error}");
            std::process::exit(1);
        }
    };
    let agent = &mut cfg.agent;
    if let Some(channel) = &cli.channel {
        agent.channel = channel.clone();
    }
    if let Some(path) = &cli.private_key_path {
        agent.private_key_path = path.clone();
    }
    if let Some(token) = &cli.server_auth_token {
        agent.server_auth_token = token.clone();
    }
    if let Some(addrs) = &cli.server_addrs {
        agent.server_addrs = split_csv(addrs);
    }
    if let Some(data_dir) = &cli.data_dir {
        agent.data_dir = data_dir.clone();
    }
    cfg.agent
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    if cli.command.as_deref() == Some("version") {
        println!("version: {}", centauri::VERSION);
        return;
    }

    let config = load_config(&cli);
    if config.private_key_path.is_empty() {
        clog!(error, "centauri-agent: a private key is required");
        std::process::exit(1);
    }

    let agent = match Agent::new(&config) {
        Ok(agent) => Arc::new(agent),
        Err(error) => {
            clog!(error, "centauri-agent: failed to start: {error}");
            std::process::exit(1);
        }
    };
    match agent.key_id() {
        Ok(key_id) => clog!(info, "centauri-agent: serving inbox {key_id}"),
        Err(error) => {
            clog!(error, "centauri-agent: failed to derive key id: {error}");
            std::process::exit(1);
        }
    }
    agent.run();
}
