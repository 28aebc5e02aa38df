//! The recipient agent.
//!
//! Long-running client co-located with a key owner.  Polls its home peer
//! for inbox listings, pulls and decrypts ciphertext with the private
//! key, writes plaintext into the received trees and confirms deletion.
//! Outbound, a watcher turns files dropped into the outbox directories
//! into envelopes POSTed to any configured peer.
//!
//! Everything here is blocking I/O on plain threads; the loops sleep and
//! swallow per-iteration errors, retrying on the next tick.

use crate::cfg;
use crate::clog;
use crate::crypto::{self, CryptoError, OaepHash};
use crate::envelope::{self, EnvelopeError};
use crate::message::{clean_channel, Message, MessageKind};
use crate::persist::{AgentStore, MessageMeta, PersistError, StoreKind, DEFAULT_CHANNEL};
use crate::sign::{SignError, SignedRequest};
use rsa::RsaPrivateKey;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

/// Inbox poll cadence.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Parallel download workers per agent.
const INBOUND_WORKERS: usize = 10;

/// A file in the outbox must sit unmodified this long before upload.
const FILE_QUIESCENCE: Duration = Duration::from_secs(60);
const MESSAGE_QUIESCENCE: Duration = Duration::from_secs(10);

/// Key-chain reload cadence.
const CHAIN_RELOAD_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
pub enum AgentError {
    NoServers,
    NoPrivateKey,
    Http(String),
    Status(u16, String),
    Crypto(CryptoError),
    Sign(SignError),
    Envelope(EnvelopeError),
    Persist(PersistError),
    UnknownRecipient(String),
    Encode(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::NoServers => write!(f, "no server addresses configured"),
            AgentError::NoPrivateKey => write!(f, "no private key configured"),
            AgentError::Http(message) => write!(f, "http error: {message}"),
            AgentError::Status(code, body) => write!(f, "server returned {code}: {body}"),
            AgentError::Crypto(error) => write!(f, "crypto error: {error}"),
            AgentError::Sign(error) => write!(f, "sign error: {error}"),
            AgentError::Envelope(error) => write!(f, "envelope error: {error}"),
            AgentError::Persist(error) => write!(f, "persist error: {error}"),
            AgentError::UnknownRecipient(key_id) => {
                write!(f, "recipient key {key_id} is not in the local chain")
            }
            AgentError::Encode(message) => write!(f, "encode error: {message}"),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<CryptoError> for AgentError {
    fn from(error: CryptoError) -> Self {
        AgentError::Crypto(error)
    }
}

impl From<SignError> for AgentError {
    fn from(error: SignError) -> Self {
        AgentError::Sign(error)
    }
}

impl From<EnvelopeError> for AgentError {
    fn from(error: EnvelopeError) -> Self {
        AgentError::Envelope(error)
    }
}

impl From<PersistError> for AgentError {
    fn from(error: PersistError) -> Self {
        AgentError::Persist(error)
    }
}

pub struct Agent {
    private_key: Option<RsaPrivateKey>,
    oaep: OaepHash,
    servers: Vec<String>,
    current_server: AtomicUsize,
    auth_token: Option<String>,
    channel: String,
    store: AgentStore,
    chain: RwLock<HashMap<String, Vec<u8>>>,
}

impl Agent {
    /// Build an agent from its config.  Fatal on a missing private key
    /// or an unusable data directory.
    pub fn new(config: &cfg::AgentConfig) -> Result<Agent, AgentError> {
        if config.server_addrs.is_empty() {
            return Err(AgentError::NoServers);
        }
        let private_key = if config.private_key_path.is_empty() {
            None
        } else {
            Some(crypto::load_priv_key(Path::new(&config.private_key_path))?)
        };
        let data_dir = if config.data_dir.is_empty() {
            ".centauri-agent".to_string()
        } else {
            config.data_dir.clone()
        };
        let store = AgentStore::open(Path::new(&data_dir))?;
        let channel = if config.channel.is_empty() {
            DEFAULT_CHANNEL.to_string()
        } else {
            clean_channel(&config.channel)
        };
        let agent = Agent {
            private_key,
            oaep: OaepHash::default(),
            servers: config.server_addrs.clone(),
            current_server: AtomicUsize::new(0),
            auth_token: if config.server_auth_token.is_empty() {
                None
            } else {
                Some(config.server_auth_token.clone())
            },
            channel,
            store,
            chain: RwLock::new(HashMap::new()),
        };
        agent.reload_chain()?;
        Ok(agent)
    }

    pub fn store(&self) -> &AgentStore {
        &self.store
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn private_key(&self) -> Result<&RsaPrivateKey, AgentError> {
        self.private_key.as_ref().ok_or(AgentError::NoPrivateKey)
    }

    /// The key id this agent receives messages for.
    pub fn key_id(&self) -> Result<String, AgentError> {
        let pem = crypto::pub_key_pem(self.private_key()?)?;
        Ok(crypto::pub_key_id(&pem))
    }

    /// Register a recipient public key in the local chain.
    pub fn add_recipient_key(&self, pem: &[u8]) -> Result<String, AgentError> {
        let key_id = self.store.add_pub_key(pem)?;
        self.chain
            .write()
            .unwrap()
            .insert(key_id.clone(), pem.to_vec());
        Ok(key_id)
    }

    /// Any key id currently in the chain, used when the caller does not
    /// name a recipient.
    pub fn any_recipient(&self) -> Option<String> {
        self.chain.read().unwrap().keys().next().cloned()
    }

    fn server(&self) -> String {
        let index = self.current_server.load(Ordering::Relaxed) % self.servers.len();
        self.servers[index].trim_end_matches('/').to_string()
    }

    /// Rotate to the next configured server; called after a failure.
    fn rotate_server(&self) {
        if self.servers.len() > 1 {
            self.current_server.fetch_add(1, Ordering::Relaxed);
            clog!(info, "agent: rotating to server {}", self.server());
        }
    }

    fn request(&self, method: &str, url: &str, signed: bool) -> Result<ureq::Request, AgentError> {
        let mut req = ureq::request(method, url);
        if let Some(token) = &self.auth_token {
            req = req.set("X-Token", token);
        }
        if signed {
            let (sig, _) = SignedRequest::create(self.private_key()?)?;
            req = req.set("X-Signature", &sig);
        }
        Ok(req)
    }

    fn check_response(
        &self,
        result: Result<ureq::Response, ureq::Error>,
    ) -> Result<ureq::Response, AgentError> {
        match result {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(AgentError::Status(code, body))
            }
            Err(error) => {
                self.rotate_server();
                Err(AgentError::Http(error.to_string()))
            }
        }
    }

    /// LIST the inbox for this agent's key.
    pub fn list_messages(&self, channel: &str) -> Result<Vec<MessageMeta>, AgentError> {
        let url = format!("{}/messages?channel={}", self.server(), channel);
        let response = self.check_response(self.request("LIST", &url, true)?.call())?;
        let body = response
            .into_string()
            .map_err(|error| AgentError::Http(error.to_string()))?;
        serde_json::from_str(&body).map_err(|error| AgentError::Encode(error.to_string()))
    }

    /// GET the raw envelope bytes of one message.
    pub fn get_message(&self, channel: &str, id: &str) -> Result<Vec<u8>, AgentError> {
        let key_id = self.key_id()?;
        let url = format!("{}/message/{}/{}/{}", self.server(), key_id, channel, id);
        let response = self.check_response(self.request("GET", &url, true)?.call())?;
        let mut data = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut data)
            .map_err(|error| AgentError::Http(error.to_string()))?;
        Ok(data)
    }

    /// DELETE one message, confirming receipt cluster-wide.
    pub fn confirm_message(&self, channel: &str, id: &str) -> Result<(), AgentError> {
        let key_id = self.key_id()?;
        let url = format!("{}/message/{}/{}/{}", self.server(), key_id, channel, id);
        self.check_response(self.request("DELETE", &url, true)?.call())?;
        Ok(())
    }

    /// Seal and POST a message to the current peer.  The recipient
    /// public key must already be in the local chain.  Returns the id
    /// assigned by the peer.
    pub fn send_message(
        &self,
        channel: &str,
        recipient_key_id: &str,
        kind: MessageKind,
        file_name: Option<&str>,
        plaintext: &[u8],
    ) -> Result<String, AgentError> {
        let recipient_pem = self
            .chain
            .read()
            .unwrap()
            .get(recipient_key_id)
            .cloned()
            .ok_or_else(|| AgentError::UnknownRecipient(recipient_key_id.to_string()))?;
        let sealed = envelope::seal(plaintext, &recipient_pem, self.oaep, file_name)?;
        let msg = Message {
            kind,
            channel: clean_channel(channel),
            id: String::new(),
            pub_key_id: recipient_key_id.to_string(),
            data: sealed.into_bytes(),
        };
        let body =
            serde_json::to_value(&msg).map_err(|error| AgentError::Encode(error.to_string()))?;
        let url = format!("{}/message", self.server());
        let response = self.check_response(self.request("POST", &url, false)?.send_json(body))?;
        let stored: Message = response
            .into_json()
            .map_err(|error| AgentError::Http(error.to_string()))?;
        clog!(
            info,
            "agent: sent {} to {}",
            crate::logging::msg_id(&stored.id),
            crate::logging::key_id(recipient_key_id)
        );
        Ok(stored.id)
    }

    /// Decrypt an envelope with this agent's private key.
    pub fn decrypt_envelope(&self, text: &str) -> Result<envelope::Opened, AgentError> {
        Ok(envelope::open(text, self.private_key()?, self.oaep)?)
    }

    /// Pull, decrypt, store, confirm one inbox entry.
    fn process_message(&self, meta: &MessageMeta) -> Result<(), AgentError> {
        let raw = self.get_message(&meta.channel, &meta.id)?;
        let text = String::from_utf8(raw)
            .map_err(|_| AgentError::Encode("envelope is not utf-8".to_string()))?;
        let opened = envelope::open(&text, self.private_key()?, self.oaep)?;
        let (name, kind) = match &opened.file_name {
            Some(name) => (name.clone(), StoreKind::File),
            None => (meta.id.clone(), StoreKind::Bytes),
        };
        let path = self
            .store
            .store_received(&meta.channel, &name, kind, &opened.data)?;
        clog!(
            info,
            "agent: received {} -> {}",
            crate::logging::msg_id(&meta.id),
            path.display()
        );
        self.confirm_message(&meta.channel, &meta.id)?;
        Ok(())
    }

    /// Reload the public-key chain from disk, creating outbox
    /// directories for new keys and dropping those of removed keys.
    fn reload_chain(&self) -> Result<(), AgentError> {
        let fresh = self.store.load_pub_key_chain()?;
        let stale: Vec<String> = {
            let current = self.chain.read().unwrap();
            current
                .keys()
                .filter(|key_id| !fresh.contains_key(*key_id))
                .cloned()
                .collect()
        };
        for key_id in fresh.keys() {
            self.store.ensure_outgoing_dirs(key_id)?;
        }
        for key_id in &stale {
            self.store.remove_outgoing_dirs(key_id)?;
        }
        let count = fresh.len();
        *self.chain.write().unwrap() = fresh;
        clog!(debug, "agent: public key chain loaded, {count} key(s)");
        Ok(())
    }

    /// Run the agent daemon forever: key-chain loader, outbox watcher
    /// and workers, and the inbound polling loop.
    pub fn run(self: Arc<Self>) -> ! {
        self.spawn_chain_loader();
        self.spawn_outgoing();
        self.poll_loop()
    }

    fn spawn_chain_loader(self: &Arc<Self>) {
        let agent = Arc::clone(self);
        std::thread::spawn(move || loop {
            std::thread::sleep(CHAIN_RELOAD_INTERVAL);
            if let Err(error) = agent.reload_chain() {
                clog!(error, "agent: chain reload failed: {error}");
            }
        });
    }

    fn spawn_outgoing(self: &Arc<Self>) {
        let pending_files: Arc<Mutex<Vec<PathBuf>>> = Arc::new(Mutex::new(Vec::new()));
        let pending_messages: Arc<Mutex<Vec<PathBuf>>> = Arc::new(Mutex::new(Vec::new()));

        // Watcher: glob the outbox trees and append new entries.
        {
            let agent = Arc::clone(self);
            let pending_files = Arc::clone(&pending_files);
            let pending_messages = Arc::clone(&pending_messages);
            std::thread::spawn(move || loop {
                match agent.store.outgoing_files() {
                    Ok(found) => merge_pending(&pending_files, found),
                    Err(error) => clog!(error, "agent: outbox scan failed: {error}"),
                }
                match agent.store.outgoing_messages() {
                    Ok(found) => merge_pending(&pending_messages, found),
                    Err(error) => clog!(error, "agent: outbox scan failed: {error}"),
                }
                std::thread::sleep(POLL_INTERVAL);
            });
        }

        // File worker: 60-second quiescence, file payloads.
        {
            let agent = Arc::clone(self);
            let pending = Arc::clone(&pending_files);
            std::thread::spawn(move || loop {
                agent.drain_pending(&pending, FILE_QUIESCENCE, MessageKind::File);
                std::thread::sleep(POLL_INTERVAL);
            });
        }

        // Message worker: 10-second quiescence, bytes payloads.
        {
            let agent = Arc::clone(self);
            let pending = Arc::clone(&pending_messages);
            std::thread::spawn(move || loop {
                agent.drain_pending(&pending, MESSAGE_QUIESCENCE, MessageKind::Bytes);
                std::thread::sleep(Duration::from_secs(1));
            });
        }
    }

    /// Upload every pending entry whose mtime is at least `quiescence`
    /// old.  Upload failures leave the entry pending for the next pass.
    fn drain_pending(&self, pending: &Mutex<Vec<PathBuf>>, quiescence: Duration, kind: MessageKind) {
        let snapshot: Vec<PathBuf> = pending.lock().unwrap().clone();
        for path in snapshot {
            let quiet = std::fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                .is_some_and(|age| age >= quiescence);
            if !quiet {
                continue;
            }
            match self.upload_outgoing(&path, kind) {
                Ok(()) => {
                    pending.lock().unwrap().retain(|entry| entry != &path);
                }
                Err(error) => {
                    clog!(error, "agent: upload of {} failed: {error}", path.display());
                }
            }
        }
    }

    /// `<outbox>/<recipientKeyId>/<fileName>`: the parent directory
    /// names the recipient, the file name names the payload.
    fn upload_outgoing(&self, path: &Path, kind: MessageKind) -> Result<(), AgentError> {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let recipient = path
            .parent()
            .and_then(|dir| dir.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let data = std::fs::read(path).map_err(PersistError::from)?;
        let named = match kind {
            MessageKind::File => Some(file_name.as_str()),
            MessageKind::Bytes => None,
        };
        self.send_message(&self.channel, &recipient, kind, named, &data)?;
        std::fs::remove_file(path).map_err(PersistError::from)?;
        Ok(())
    }

    /// Inbound loop: list, fan out to workers, sleep, repeat.
    fn poll_loop(self: Arc<Self>) -> ! {
        let (job_tx, job_rx) = mpsc::channel::<MessageMeta>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (done_tx, done_rx) = mpsc::channel::<()>();

        for _ in 0..INBOUND_WORKERS {
            let agent = Arc::clone(&self);
            let job_rx = Arc::clone(&job_rx);
            let done_tx = done_tx.clone();
            std::thread::spawn(move || loop {
                let job = {
                    let guard = job_rx.lock().unwrap();
                    guard.recv()
                };
                let Ok(meta) = job else {
                    return;
                };
                if let Err(error) = agent.process_message(&meta) {
                    clog!(error, "agent: message {} failed: {error}", meta.id);
                }
                let _ = done_tx.send(());
            });
        }

        loop {
            let metas = match self.list_messages(&self.channel) {
                Ok(metas) => metas,
                Err(error) => {
                    clog!(error, "agent: list failed: {error}");
                    std::thread::sleep(POLL_INTERVAL);
                    continue;
                }
            };
            if metas.is_empty() {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
            clog!(info, "agent: {} pending message(s)", metas.len());
            let count = metas.len();
            for meta in metas {
                let _ = job_tx.send(meta);
            }
            for _ in 0..count {
                let _ = done_rx.recv();
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

fn merge_pending(pending: &Mutex<Vec<PathBuf>>, found: Vec<PathBuf>) {
    let mut pending = pending.lock().unwrap();
    let known: HashSet<PathBuf> = pending.iter().cloned().collect();
    for path in found {
        if !known.contains(&path) {
            pending.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_pending_deduplicates() {
        let pending = Mutex::new(vec![PathBuf::from("/a")]);
        merge_pending(
            &pending,
            vec![PathBuf::from("/a"), PathBuf::from("/b")],
        );
        assert_eq!(
            *pending.lock().unwrap(),
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
    }

    #[test]
    fn new_requires_servers() {
        let config = cfg::AgentConfig::default();
        assert!(matches!(Agent::new(&config), Err(AgentError::NoServers)));
    }
}
