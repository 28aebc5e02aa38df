pub mod agent;
pub mod b64;
pub mod cfg;
pub mod client;
pub mod crypto;
pub mod data;
pub mod envelope;
pub mod events;
pub mod gossip;
pub mod logging;
pub mod message;
pub mod peer;
pub mod persist;
pub mod server;
pub mod sign;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
