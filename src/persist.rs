//! Filesystem persistence.
//!
//! Peer side, messages live at
//! `<root>/<peerName>/messages/<recipientKeyId>/<channel>/<messageId>`;
//! the file name is the message id and the mtime is the meta timestamp.
//! Agent side, decrypted payloads land under
//! `<root>/received/{messages,files}/<channel>/` and the outbox trees
//! under `<root>/outgoing/{messages,files}/<recipientKeyId>/`, with the
//! public-key chain in `<root>/pubkeys/`.
//!
//! Writes are atomic (write to a temp name, then rename) and deletions
//! prune empty channel and key directories up to, but never including,
//! the messages root.

use crate::logging;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Channel used when the caller supplies none.
pub const DEFAULT_CHANNEL: &str = "default";

/// Messages older than this are removed by the expiry sweeper.
pub const EXPIRY_AGE: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// How often the expiry sweeper wakes.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
pub enum PersistError {
    Io(std::io::Error),
    NotFound,
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistError::Io(error) => write!(f, "io error: {error}"),
            PersistError::NotFound => write!(f, "message not found"),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<std::io::Error> for PersistError {
    fn from(error: std::io::Error) -> Self {
        PersistError::Io(error)
    }
}

/// Listing entry for one stored message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMeta {
    pub id: String,
    pub channel: String,
    #[serde(rename = "pubKeyID")]
    pub pub_key_id: String,
    pub size: u64,
    pub created_at: u64,
}

fn normalize_channel(channel: &str) -> &str {
    if channel.is_empty() {
        DEFAULT_CHANNEL
    } else {
        channel
    }
}

fn mtime_unix(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Write `data` to `path` atomically: temp file in the same directory,
/// then rename over the final name.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), PersistError> {
    let parent = path.parent().ok_or(PersistError::NotFound)?;
    fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    fs::write(&tmp, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o644));
    }
    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(error) => {
            let _ = fs::remove_file(&tmp);
            Err(error.into())
        }
    }
}

/// Per-peer message store.
pub struct MessageStore {
    messages_dir: PathBuf,
}

impl MessageStore {
    /// Open (and create) the store for a named peer under `root`.
    pub fn open(root: &Path, node_name: &str) -> Result<MessageStore, PersistError> {
        let messages_dir = root.join(node_name).join("messages");
        fs::create_dir_all(&messages_dir)?;
        Ok(MessageStore { messages_dir })
    }

    pub fn messages_dir(&self) -> &Path {
        &self.messages_dir
    }

    fn message_path(&self, key_id: &str, channel: &str, id: &str) -> PathBuf {
        self.messages_dir
            .join(key_id)
            .join(normalize_channel(channel))
            .join(id)
    }

    /// Store one message blob.  Concurrent writers to the same id are
    /// last-writer-wins, which is acceptable because ids are UUIDs.
    pub fn store_message(
        &self,
        key_id: &str,
        channel: &str,
        id: &str,
        data: &[u8],
    ) -> Result<(), PersistError> {
        let path = self.message_path(key_id, channel, id);
        write_atomic(&path, data)
    }

    /// List metadata for one recipient, optionally filtered by channel.
    /// An empty channel selects all channels; an unknown recipient yields
    /// an empty list, not an error.
    pub fn list_meta(&self, key_id: &str, channel: &str) -> Result<Vec<MessageMeta>, PersistError> {
        let key_dir = self.messages_dir.join(key_id);
        let mut out = Vec::new();
        if !key_dir.is_dir() {
            return Ok(out);
        }
        for channel_entry in fs::read_dir(&key_dir)? {
            let channel_entry = channel_entry?;
            if !channel_entry.file_type()?.is_dir() {
                continue;
            }
            let channel_name = channel_entry.file_name().to_string_lossy().into_owned();
            if !channel.is_empty() && channel_name != channel {
                continue;
            }
            for file_entry in fs::read_dir(channel_entry.path())? {
                let file_entry = file_entry?;
                let meta = file_entry.metadata()?;
                if !meta.is_file() {
                    continue;
                }
                out.push(MessageMeta {
                    id: file_entry.file_name().to_string_lossy().into_owned(),
                    channel: channel_name.clone(),
                    pub_key_id: key_id.to_string(),
                    size: meta.len(),
                    created_at: mtime_unix(&meta),
                });
            }
        }
        Ok(out)
    }

    /// Read one message blob.
    pub fn get_message(
        &self,
        key_id: &str,
        channel: &str,
        id: &str,
    ) -> Result<Vec<u8>, PersistError> {
        let path = self.message_path(key_id, channel, id);
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(PersistError::NotFound)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Remove one message and prune empty ancestor directories up to (but
    /// not including) the messages root.
    pub fn delete_message(
        &self,
        key_id: &str,
        channel: &str,
        id: &str,
    ) -> Result<(), PersistError> {
        let path = self.message_path(key_id, channel, id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistError::NotFound)
            }
            Err(error) => return Err(error.into()),
        }
        if let Some(channel_dir) = path.parent() {
            self.remove_dir_if_empty(channel_dir)?;
        }
        Ok(())
    }

    fn remove_dir_if_empty(&self, dir: &Path) -> Result<(), PersistError> {
        if dir == self.messages_dir || !dir.starts_with(&self.messages_dir) {
            return Ok(());
        }
        match fs::read_dir(dir) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    return Ok(());
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error.into()),
        }
        fs::remove_dir(dir)?;
        if let Some(parent) = dir.parent() {
            self.remove_dir_if_empty(parent)?;
        }
        Ok(())
    }

    /// Delete every stored message older than `older_than`.  Expiry is
    /// local: no events fire, no gossip is emitted.  Returns the number
    /// of messages removed.
    pub fn sweep_expired(&self, older_than: Duration) -> Result<usize, PersistError> {
        let now = SystemTime::now();
        let mut expired = Vec::new();
        for key_entry in fs::read_dir(&self.messages_dir)? {
            let key_entry = key_entry?;
            if !key_entry.file_type()?.is_dir() {
                continue;
            }
            let key_id = key_entry.file_name().to_string_lossy().into_owned();
            for channel_entry in fs::read_dir(key_entry.path())? {
                let channel_entry = channel_entry?;
                if !channel_entry.file_type()?.is_dir() {
                    continue;
                }
                let channel = channel_entry.file_name().to_string_lossy().into_owned();
                for file_entry in fs::read_dir(channel_entry.path())? {
                    let file_entry = file_entry?;
                    let meta = file_entry.metadata()?;
                    if !meta.is_file() {
                        continue;
                    }
                    let age = meta
                        .modified()
                        .ok()
                        .and_then(|t| now.duration_since(t).ok())
                        .unwrap_or_default();
                    if age > older_than {
                        let id = file_entry.file_name().to_string_lossy().into_owned();
                        expired.push((key_id.clone(), channel.clone(), id));
                    }
                }
            }
        }
        let count = expired.len();
        for (key_id, channel, id) in expired {
            match self.delete_message(&key_id, &channel, &id) {
                Ok(()) | Err(PersistError::NotFound) => {}
                Err(error) => return Err(error),
            }
        }
        Ok(count)
    }

    /// Run the expiry sweeper forever on a background thread.
    pub fn spawn_sweeper(self: &std::sync::Arc<Self>) {
        let store = std::sync::Arc::clone(self);
        std::thread::spawn(move || loop {
            std::thread::sleep(SWEEP_INTERVAL);
            match store.sweep_expired(EXPIRY_AGE) {
                Ok(0) => {}
                Ok(n) => crate::clog!(info, "persist: expired {n} message(s)"),
                Err(error) => crate::clog!(error, "persist: sweep failed: {error}"),
            }
        });
    }
}

/// What kind of payload an agent-side file holds; decides which received
/// tree it is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Bytes,
    File,
}

/// Agent-side store: received payloads, the outbox, and the public-key
/// chain.
pub struct AgentStore {
    root: PathBuf,
}

impl AgentStore {
    pub fn open(root: &Path) -> Result<AgentStore, PersistError> {
        let store = AgentStore {
            root: root.to_path_buf(),
        };
        fs::create_dir_all(store.received_dir(StoreKind::Bytes))?;
        fs::create_dir_all(store.received_dir(StoreKind::File))?;
        fs::create_dir_all(store.outgoing_dir(StoreKind::Bytes))?;
        fs::create_dir_all(store.outgoing_dir(StoreKind::File))?;
        fs::create_dir_all(store.pubkeys_dir())?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn received_dir(&self, kind: StoreKind) -> PathBuf {
        match kind {
            StoreKind::Bytes => self.root.join("received").join("messages"),
            StoreKind::File => self.root.join("received").join("files"),
        }
    }

    fn outgoing_dir(&self, kind: StoreKind) -> PathBuf {
        match kind {
            StoreKind::Bytes => self.root.join("outgoing").join("messages"),
            StoreKind::File => self.root.join("outgoing").join("files"),
        }
    }

    pub fn pubkeys_dir(&self) -> PathBuf {
        self.root.join("pubkeys")
    }

    /// Write a decrypted payload into the received tree.  On a name
    /// collision the new file gets a random UUID suffix instead of
    /// clobbering the existing one.
    pub fn store_received(
        &self,
        channel: &str,
        name: &str,
        kind: StoreKind,
        data: &[u8],
    ) -> Result<PathBuf, PersistError> {
        let dir = self.received_dir(kind).join(normalize_channel(channel));
        fs::create_dir_all(&dir)?;
        let mut path = dir.join(name);
        if path.exists() {
            path = dir.join(format!("{}_{}", name, Uuid::new_v4()));
        }
        write_atomic(&path, data)?;
        Ok(path)
    }

    fn outgoing_entries(&self, kind: StoreKind) -> Result<Vec<PathBuf>, PersistError> {
        let base = self.outgoing_dir(kind);
        let mut out = Vec::new();
        if !base.is_dir() {
            return Ok(out);
        }
        for key_entry in fs::read_dir(&base)? {
            let key_entry = key_entry?;
            if !key_entry.file_type()?.is_dir() {
                continue;
            }
            for file_entry in fs::read_dir(key_entry.path())? {
                let file_entry = file_entry?;
                if file_entry.file_type()?.is_file() {
                    out.push(file_entry.path());
                }
            }
        }
        Ok(out)
    }

    /// All pending outbox message files, one per `<keyId>/<name>`.
    pub fn outgoing_messages(&self) -> Result<Vec<PathBuf>, PersistError> {
        self.outgoing_entries(StoreKind::Bytes)
    }

    /// All pending outbox files.
    pub fn outgoing_files(&self) -> Result<Vec<PathBuf>, PersistError> {
        self.outgoing_entries(StoreKind::File)
    }

    /// Make sure both outbox trees have a directory for `key_id`.
    pub fn ensure_outgoing_dirs(&self, key_id: &str) -> Result<(), PersistError> {
        fs::create_dir_all(self.outgoing_dir(StoreKind::Bytes).join(key_id))?;
        fs::create_dir_all(self.outgoing_dir(StoreKind::File).join(key_id))?;
        Ok(())
    }

    /// Drop the outbox directories of a key no longer in the chain.
    pub fn remove_outgoing_dirs(&self, key_id: &str) -> Result<(), PersistError> {
        for kind in [StoreKind::Bytes, StoreKind::File] {
            let dir = self.outgoing_dir(kind).join(key_id);
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    /// Read the public-key chain: every file under `pubkeys/`, keyed by
    /// file name (which is the key id).
    pub fn load_pub_key_chain(&self) -> Result<HashMap<String, Vec<u8>>, PersistError> {
        let mut chain = HashMap::new();
        let dir = self.pubkeys_dir();
        if !dir.is_dir() {
            return Ok(chain);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let key_id = entry.file_name().to_string_lossy().into_owned();
            chain.insert(key_id, fs::read(entry.path())?);
        }
        Ok(chain)
    }

    /// Add a PEM public key to the chain, named by its key id.  Returns
    /// the key id.
    pub fn add_pub_key(&self, pem: &[u8]) -> Result<String, PersistError> {
        let key_id = crate::crypto::pub_key_id(pem);
        write_atomic(&self.pubkeys_dir().join(&key_id), pem)?;
        self.ensure_outgoing_dirs(&key_id)?;
        Ok(key_id)
    }
}

/// Log helper shared by store call sites.
pub fn describe(key_id: &str, channel: &str, id: &str) -> String {
    format!(
        "{}/{}/{}",
        logging::key_id(key_id),
        normalize_channel(channel),
        logging::msg_id(id)
    )
}
