//! Peer data channel: newline-delimited JSON over TCP.
//!
//! Gossip only announces that a message exists; the bytes themselves are
//! pulled over this channel on demand.  The server refuses requests from
//! names not in the current membership view.  When a cluster key is
//! configured every frame carries an encrypted `{"time":…}` stamp, and
//! frames older than [`MAX_SIG_AGE`] are rejected.

use crate::crypto::{frame_decrypt, frame_encrypt, CryptoError};
use crate::persist::MessageStore;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

use crate::clog;

/// Oldest acceptable frame stamp when a cluster key is configured.
pub const MAX_SIG_AGE: Duration = Duration::from_secs(60);

/// Time allowed for connect plus one request/response round trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const PEER_NOT_IN_LIST: &str = "Peer not in list";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Request,
    Response,
}

/// One data-channel frame.
#[derive(Debug, Serialize, Deserialize)]
pub struct DataMessage {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub peer_name: Option<String>,
    #[serde(rename = "peerAddr", skip_serializing_if = "Option::is_none", default)]
    pub peer_addr: Option<String>,
    #[serde(rename = "peerPort", skip_serializing_if = "Option::is_none", default)]
    pub peer_port: Option<u16>,
    #[serde(rename = "pubKeyID", skip_serializing_if = "Option::is_none", default)]
    pub pub_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<String>,
    #[serde(with = "crate::b64::opt", skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sig: Option<String>,
}

#[derive(Debug)]
pub enum DataError {
    Io(std::io::Error),
    Encode(serde_json::Error),
    Crypto(CryptoError),
    MissingSig,
    StaleSig,
    Rejected(String),
    Empty,
    NotAvailable,
    Timeout,
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataError::Io(error) => write!(f, "io error: {error}"),
            DataError::Encode(error) => write!(f, "encode error: {error}"),
            DataError::Crypto(error) => write!(f, "crypto error: {error}"),
            DataError::MissingSig => write!(f, "frame signature missing"),
            DataError::StaleSig => write!(f, "frame signature too old"),
            DataError::Rejected(message) => write!(f, "peer error: {message}"),
            DataError::Empty => write!(f, "no data message received"),
            DataError::NotAvailable => write!(f, "failed to get data from any peer"),
            DataError::Timeout => write!(f, "request timed out"),
        }
    }
}

impl std::error::Error for DataError {}

impl From<std::io::Error> for DataError {
    fn from(error: std::io::Error) -> Self {
        DataError::Io(error)
    }
}

impl From<serde_json::Error> for DataError {
    fn from(error: serde_json::Error) -> Self {
        DataError::Encode(error)
    }
}

impl From<CryptoError> for DataError {
    fn from(error: CryptoError) -> Self {
        DataError::Crypto(error)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SigStamp {
    time: i64,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Shared identity and key material for both ends of the channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub peer_name: String,
    pub peer_key: Option<Vec<u8>>,
    pub max_sig_age: Duration,
}

impl ChannelConfig {
    pub fn new(peer_name: &str, peer_key: Option<Vec<u8>>) -> ChannelConfig {
        ChannelConfig {
            peer_name: peer_name.to_string(),
            peer_key,
            max_sig_age: MAX_SIG_AGE,
        }
    }

    fn stamp(&self, msg: &mut DataMessage) -> Result<(), DataError> {
        let Some(key) = &self.peer_key else {
            return Ok(());
        };
        let stamp = serde_json::to_vec(&SigStamp { time: now_unix() })?;
        msg.sig = Some(STANDARD.encode(frame_encrypt(key, &stamp)?));
        Ok(())
    }

    fn check_stamp(&self, msg: &DataMessage) -> Result<(), DataError> {
        let Some(key) = &self.peer_key else {
            return Ok(());
        };
        let sig = msg.sig.as_deref().ok_or(DataError::MissingSig)?;
        let frame = STANDARD
            .decode(sig.as_bytes())
            .map_err(|_| DataError::MissingSig)?;
        let plain = frame_decrypt(key, &frame)?;
        let stamp: SigStamp = serde_json::from_slice(&plain)?;
        if now_unix() - stamp.time > self.max_sig_age.as_secs() as i64 {
            return Err(DataError::StaleSig);
        }
        Ok(())
    }
}

async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    config: &ChannelConfig,
    mut msg: DataMessage,
) -> Result<(), DataError> {
    config.stamp(&mut msg)?;
    let mut line = serde_json::to_vec(&msg)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_message<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
    config: &ChannelConfig,
) -> Result<Option<DataMessage>, DataError> {
    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    if read == 0 || line.trim().is_empty() {
        return Ok(None);
    }
    let msg: DataMessage = serde_json::from_str(line.trim_end())?;
    config.check_stamp(&msg)?;
    Ok(Some(msg))
}

/// Serve the data channel forever.  `is_member` answers whether a
/// claimed peer name is in the current membership view.
pub async fn serve(
    listener: TcpListener,
    store: Arc<MessageStore>,
    config: ChannelConfig,
    is_member: Arc<dyn Fn(&str) -> bool + Send + Sync>,
) {
    loop {
        let (stream, src) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                clog!(error, "data: accept failed: {error}");
                continue;
            }
        };
        let store = Arc::clone(&store);
        let config = config.clone();
        let is_member = Arc::clone(&is_member);
        tokio::spawn(async move {
            if let Err(error) = handle_connection(stream, &store, &config, &is_member).await {
                clog!(debug, "data: connection from {src} failed: {error}");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    store: &MessageStore,
    config: &ChannelConfig,
    is_member: &Arc<dyn Fn(&str) -> bool + Send + Sync>,
) -> Result<(), DataError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let Some(request) = read_message(&mut reader, config).await? else {
        return Ok(());
    };

    let known = request
        .peer_name
        .as_deref()
        .is_some_and(|name| is_member(name));
    if !known {
        clog!(debug, "data: refusing request from unknown peer");
        return respond_error(&mut write_half, config, PEER_NOT_IN_LIST).await;
    }

    match request.kind {
        FrameKind::Request => {
            let (Some(pub_key_id), Some(channel), Some(id)) = (
                request.pub_key_id.as_deref(),
                request.channel.as_deref(),
                request.id.as_deref(),
            ) else {
                return respond_error(&mut write_half, config, "missing fields").await;
            };
            match store.get_message(pub_key_id, channel, id) {
                Ok(data) => {
                    let response = DataMessage {
                        kind: FrameKind::Response,
                        peer_name: Some(config.peer_name.clone()),
                        peer_addr: None,
                        peer_port: None,
                        pub_key_id: request.pub_key_id.clone(),
                        channel: request.channel.clone(),
                        id: request.id.clone(),
                        data: Some(data),
                        error: None,
                        sig: None,
                    };
                    write_message(&mut write_half, config, response).await
                }
                Err(error) => respond_error(&mut write_half, config, &error.to_string()).await,
            }
        }
        FrameKind::Response => {
            clog!(debug, "data: unexpected response frame on server side");
            Ok(())
        }
    }
}

async fn respond_error(
    writer: &mut OwnedWriteHalf,
    config: &ChannelConfig,
    message: &str,
) -> Result<(), DataError> {
    let response = DataMessage {
        kind: FrameKind::Response,
        peer_name: Some(config.peer_name.clone()),
        peer_addr: None,
        peer_port: None,
        pub_key_id: None,
        channel: None,
        id: None,
        data: None,
        error: Some(message.to_string()),
        sig: None,
    };
    write_message(writer, config, response).await
}

/// Pull one message from a specific peer.
pub async fn request_from_peer(
    config: &ChannelConfig,
    addr: &str,
    port: u16,
    pub_key_id: &str,
    channel: &str,
    id: &str,
) -> Result<Vec<u8>, DataError> {
    let fut = request_inner(config, addr, port, pub_key_id, channel, id);
    tokio::time::timeout(REQUEST_TIMEOUT, fut)
        .await
        .map_err(|_| DataError::Timeout)?
}

async fn request_inner(
    config: &ChannelConfig,
    addr: &str,
    port: u16,
    pub_key_id: &str,
    channel: &str,
    id: &str,
) -> Result<Vec<u8>, DataError> {
    let stream = TcpStream::connect((addr, port)).await?;
    let (read_half, mut write_half) = stream.into_split();
    let request = DataMessage {
        kind: FrameKind::Request,
        peer_name: Some(config.peer_name.clone()),
        peer_addr: None,
        peer_port: None,
        pub_key_id: Some(pub_key_id.to_string()),
        channel: Some(channel.to_string()),
        id: Some(id.to_string()),
        data: None,
        error: None,
        sig: None,
    };
    write_message(&mut write_half, config, request).await?;

    let mut reader = BufReader::new(read_half);
    let response = read_message(&mut reader, config)
        .await?
        .ok_or(DataError::Empty)?;
    if let Some(error) = response.error {
        return Err(DataError::Rejected(error));
    }
    response.data.ok_or(DataError::Empty)
}

/// Pull a message, preferring the originating peer and falling back to
/// up to `fallback_limit` other candidates.  Returns the first success.
pub async fn request_best_effort(
    config: &ChannelConfig,
    origin: (&str, u16),
    candidates: &[(String, u16)],
    fallback_limit: usize,
    pub_key_id: &str,
    channel: &str,
    id: &str,
) -> Result<Vec<u8>, DataError> {
    match request_from_peer(config, origin.0, origin.1, pub_key_id, channel, id).await {
        Ok(data) => return Ok(data),
        Err(error) => {
            clog!(
                warn,
                "data: pull from originator {}:{} failed: {error}",
                origin.0,
                origin.1
            );
        }
    }
    let mut hops = 0usize;
    for (addr, port) in candidates {
        if hops >= fallback_limit {
            break;
        }
        if addr.as_str() == origin.0 && *port == origin.1 {
            continue;
        }
        hops += 1;
        clog!(info, "data: fallback hop {hops}: trying {addr}:{port}");
        match request_from_peer(config, addr, *port, pub_key_id, channel, id).await {
            Ok(data) => return Ok(data),
            Err(error) => {
                clog!(debug, "data: fallback {addr}:{port} failed: {error}");
            }
        }
    }
    Err(DataError::NotAvailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_json_shape() {
        let msg = DataMessage {
            kind: FrameKind::Request,
            peer_name: Some("peer0".to_string()),
            peer_addr: None,
            peer_port: None,
            pub_key_id: Some("abc".to_string()),
            channel: Some("default".to_string()),
            id: Some("u1".to_string()),
            data: None,
            error: None,
            sig: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"request""#));
        assert!(json.contains(r#""pubKeyID":"abc""#));
        assert!(!json.contains("peerAddr"));
        assert!(!json.contains("data"));
    }

    #[test]
    fn stamp_round_trip() {
        let key = crate::crypto::generate_aes_key().to_vec();
        let config = ChannelConfig::new("peer0", Some(key));
        let mut msg = DataMessage {
            kind: FrameKind::Request,
            peer_name: Some("peer0".to_string()),
            peer_addr: None,
            peer_port: None,
            pub_key_id: None,
            channel: None,
            id: None,
            data: None,
            error: None,
            sig: None,
        };
        config.stamp(&mut msg).unwrap();
        assert!(msg.sig.is_some());
        config.check_stamp(&msg).unwrap();
    }

    #[test]
    fn missing_stamp_rejected_when_keyed() {
        let key = crate::crypto::generate_aes_key().to_vec();
        let config = ChannelConfig::new("peer0", Some(key));
        let msg = DataMessage {
            kind: FrameKind::Request,
            peer_name: None,
            peer_addr: None,
            peer_port: None,
            pub_key_id: None,
            channel: None,
            id: None,
            data: None,
            error: None,
            sig: None,
        };
        assert!(matches!(
            config.check_stamp(&msg),
            Err(DataError::MissingSig)
        ));
    }

    #[test]
    fn stale_stamp_rejected() {
        let key = crate::crypto::generate_aes_key().to_vec();
        let config = ChannelConfig::new("peer0", Some(key.clone()));
        let stamp = serde_json::to_vec(&SigStamp {
            time: now_unix() - 120,
        })
        .unwrap();
        let msg = DataMessage {
            kind: FrameKind::Request,
            peer_name: None,
            peer_addr: None,
            peer_port: None,
            pub_key_id: None,
            channel: None,
            id: None,
            data: None,
            error: None,
            sig: Some(STANDARD.encode(frame_encrypt(&key, &stamp).unwrap())),
        };
        assert!(matches!(config.check_stamp(&msg), Err(DataError::StaleSig)));
    }

    #[test]
    fn unkeyed_config_skips_stamps() {
        let config = ChannelConfig::new("peer0", None);
        let msg = DataMessage {
            kind: FrameKind::Request,
            peer_name: None,
            peer_addr: None,
            peer_port: None,
            pub_key_id: None,
            channel: None,
            id: None,
            data: None,
            error: None,
            sig: None,
        };
        config.check_stamp(&msg).unwrap();
    }
}
