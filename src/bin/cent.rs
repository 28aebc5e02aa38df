//! One-shot client: list, fetch, send and confirm messages from the
//! command line.

use centauri::cfg::Cfg;
use centauri::client::{self, Format};
use centauri::message::MessageKind;
use centauri::{agent::Agent, clog, logging};
use clap::{Parser, Subcommand};

/// Client for the centauri relay cluster.
///
/// Options come from the YAML config ($CENTAURI_CONFIG or
/// ~/.centauri/config.yaml); flags override config values when set.
#[derive(Parser, Debug)]
#[command(name = "cent", disable_version_flag = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to the client private key
    #[arg(long = "key", global = true)]
    private_key_path: Option<String>,

    /// Peer addresses, comma separated
    #[arg(long = "server-addrs", global = true)]
    server_addrs: Option<String>,

    /// Auth token for the server
    #[arg(long = "server-token", global = true)]
    server_auth_token: Option<String>,

    /// Channel to operate on
    #[arg(long, global = true)]
    channel: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List pending messages for this key
    List {
        /// Output format (json, text)
        #[arg(long)]
        format: Option<String>,
        /// Output path; - for stdout
        #[arg(long, default_value = "-")]
        out: String,
    },
    /// Fetch and decrypt a message; without --id, the oldest pending one
    Get {
        /// Message id to retrieve
        #[arg(long, default_value = "")]
        id: String,
        /// Output path; - for stdout, a directory to use the carried file name
        #[arg(long, default_value = "-")]
        out: String,
    },
    /// Encrypt and send a message
    Send {
        /// Public key of the recipient; a path, or - for stdin
        #[arg(long = "to-key")]
        to_key: Option<String>,
        /// Message type (bytes, file)
        #[arg(long = "type", default_value = "bytes")]
        kind: String,
        /// Filename to set for an outbound file message
        #[arg(long, default_value = "")]
        file: String,
        /// Input path; - for stdin
        #[arg(long = "in", default_value = "-")]
        input: String,
    },
    /// Confirm (delete) a message without decrypting it
    Confirm {
        /// Message id to confirm
        #[arg(long, default_value = "")]
        id: String,
    },
    /// Print the version
    Version,
}

fn load_config(cli: &Cli) -> centauri::cfg::ClientConfig {
    let mut cfg = match Cfg::init() {
        Ok(cfg) => cfg,
        Err(error) => {
            clog!(error, "cent: failed to load config: {error}");
            std::process::exit(1);
        }
    };
    let client = &mut cfg.client;
    if let Some(path) = &cli.private_key_path {
        client.private_key_path = path.clone();
    }
    if let Some(addrs) = &cli.server_addrs {
        client.server_addrs = addrs
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(token) = &cli.server_auth_token {
        client.server_auth_token = token.clone();
    }
    if let Some(channel) = &cli.channel {
        client.channel = channel.clone();
    }
    cfg.client
}

fn build_agent(config: &centauri::cfg::ClientConfig) -> Agent {
    let agent_config = centauri::cfg::AgentConfig {
        channel: config.channel.clone(),
        private_key_path: config.private_key_path.clone(),
        data_dir: String::new(),
        server_auth_token: config.server_auth_token.clone(),
        server_addrs: config.server_addrs.clone(),
    };
    match Agent::new(&agent_config) {
        Ok(agent) => agent,
        Err(error) => {
            clog!(error, "cent: {error}");
            std::process::exit(1);
        }
    }
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    if matches!(&cli.command, Command::Version) {
        println!("version: {}", centauri::VERSION);
        return;
    }

    let config = load_config(&cli);
    let agent = build_agent(&config);
    let channel = if config.channel.is_empty() {
        "default".to_string()
    } else {
        config.channel.clone()
    };

    let result = match &cli.command {
        Command::List { format, out } => {
            let format_name = format.clone().unwrap_or_else(|| config.format.clone());
            Format::parse(&format_name)
                .and_then(|format| client::list_messages(&agent, &channel, format, out))
        }
        Command::Get { id, out } => {
            client::get_message(&agent, &channel, id, out).map(|_| ())
        }
        Command::Send {
            to_key,
            kind,
            file,
            input,
        } => send(&agent, &channel, to_key.as_deref(), kind, file, input),
        Command::Confirm { id } => client::confirm_message(&agent, &channel, id),
        Command::Version => unreachable!(),
    };

    if let Err(error) = result {
        clog!(error, "cent: {error}");
        std::process::exit(1);
    }
}

fn send(
    agent: &Agent,
    channel: &str,
    to_key: Option<&str>,
    kind: &str,
    file: &str,
    input: &str,
) -> Result<(), centauri::client::ClientError> {
    let kind = match kind {
        "" | "bytes" => MessageKind::Bytes,
        "file" => MessageKind::File,
        other => {
            return Err(centauri::client::ClientError::BadArgument(format!(
                "unknown message type: {other}"
            )))
        }
    };
    let recipient = match to_key {
        Some(source) if !source.is_empty() => Some(client::load_recipient_key(agent, source)?),
        _ => None,
    };
    let id = client::send_message(agent, channel, recipient.as_deref(), kind, file, input)?;
    println!("{id}");
    Ok(())
}
