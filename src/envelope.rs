//! Envelope codec: `hex(RSA-OAEP(recipient-pub, header)) "." hex(AES-GCM
//! ciphertext)`, where the header is `{"k":"<hex key>","n":"<hex nonce>"}`.
//!
//! Relays only ever see the envelope string; the AES key never leaves the
//! header, and the header can only be opened by the recipient private
//! key.  An optional `file:<name>|` prefix inside the plaintext marks
//! file transfers; its absence means a bytes message.

use crate::crypto::{
    aes_gcm_decrypt, aes_gcm_encrypt, generate_aes_key, rsa_oaep_decrypt, rsa_oaep_encrypt,
    CryptoError, OaepHash,
};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest prefix scanned for the `file:<name>|` marker.
const MAX_FILE_HEADER_LEN: usize = 4096;

const FILE_PREFIX: &[u8] = b"file:";

#[derive(Debug, Serialize, Deserialize)]
struct EnvelopeHeader {
    k: String,
    n: String,
}

#[derive(Debug)]
pub enum EnvelopeError {
    Malformed(&'static str),
    Hex(hex::FromHexError),
    Header(serde_json::Error),
    Crypto(CryptoError),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeError::Malformed(message) => write!(f, "malformed envelope: {message}"),
            EnvelopeError::Hex(error) => write!(f, "hex error: {error}"),
            EnvelopeError::Header(error) => write!(f, "header error: {error}"),
            EnvelopeError::Crypto(error) => write!(f, "crypto error: {error}"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl From<hex::FromHexError> for EnvelopeError {
    fn from(error: hex::FromHexError) -> Self {
        EnvelopeError::Hex(error)
    }
}

impl From<serde_json::Error> for EnvelopeError {
    fn from(error: serde_json::Error) -> Self {
        EnvelopeError::Header(error)
    }
}

impl From<CryptoError> for EnvelopeError {
    fn from(error: CryptoError) -> Self {
        EnvelopeError::Crypto(error)
    }
}

/// A decrypted envelope: the payload bytes plus the file name carried in
/// the plaintext prefix, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    pub data: Vec<u8>,
    pub file_name: Option<String>,
}

/// Encrypt `plaintext` for the holder of `recipient_pub_pem`.
///
/// When `file_name` is given the plaintext is prefixed with
/// `file:<name>|` before encryption; the name must not contain `|`.
pub fn seal(
    plaintext: &[u8],
    recipient_pub_pem: &[u8],
    hash: OaepHash,
    file_name: Option<&str>,
) -> Result<String, EnvelopeError> {
    let body = match file_name {
        Some(name) => {
            if name.contains('|') {
                return Err(EnvelopeError::Malformed("file name contains '|'"));
            }
            let mut prefixed = Vec::with_capacity(plaintext.len() + name.len() + 6);
            prefixed.extend_from_slice(FILE_PREFIX);
            prefixed.extend_from_slice(name.as_bytes());
            prefixed.push(b'|');
            prefixed.extend_from_slice(plaintext);
            prefixed
        }
        None => plaintext.to_vec(),
    };

    let key = generate_aes_key();
    let (ciphertext, nonce) = aes_gcm_encrypt(&key, &body)?;
    let header = EnvelopeHeader {
        k: hex::encode(key),
        n: hex::encode(nonce),
    };
    let header_bytes = serde_json::to_vec(&header)?;
    let wrapped = rsa_oaep_encrypt(recipient_pub_pem, &header_bytes, hash)?;
    Ok(format!("{}.{}", hex::encode(wrapped), hex::encode(ciphertext)))
}

/// Decrypt an envelope with the recipient private key and strip the
/// optional file prefix.
pub fn open(
    envelope: &str,
    private_key: &RsaPrivateKey,
    hash: OaepHash,
) -> Result<Opened, EnvelopeError> {
    let (header_hex, body_hex) = envelope
        .split_once('.')
        .ok_or(EnvelopeError::Malformed("missing separator"))?;
    if body_hex.contains('.') {
        return Err(EnvelopeError::Malformed("multiple separators"));
    }

    let wrapped = hex::decode(header_hex)?;
    let header_bytes = rsa_oaep_decrypt(private_key, &wrapped, hash)?;
    let header: EnvelopeHeader = serde_json::from_slice(&header_bytes)?;
    let key = hex::decode(&header.k)?;
    let nonce = hex::decode(&header.n)?;

    let ciphertext = hex::decode(body_hex)?;
    let plaintext = aes_gcm_decrypt(&key, &ciphertext, &nonce)?;
    Ok(strip_file_prefix(plaintext))
}

/// Split `file:<name>|rest` out of a plaintext.  Plaintexts without the
/// marker (or with no `|` within the scan window) pass through untouched.
pub fn strip_file_prefix(plaintext: Vec<u8>) -> Opened {
    if !plaintext.starts_with(FILE_PREFIX) {
        return Opened {
            data: plaintext,
            file_name: None,
        };
    }
    let scan_end = plaintext.len().min(MAX_FILE_HEADER_LEN);
    for i in FILE_PREFIX.len()..scan_end {
        if plaintext[i] == b'|' {
            let name = String::from_utf8_lossy(&plaintext[FILE_PREFIX.len()..i]).into_owned();
            if name.is_empty() {
                break;
            }
            return Opened {
                data: plaintext[i + 1..].to_vec(),
                file_name: Some(name),
            };
        }
    }
    Opened {
        data: plaintext,
        file_name: None,
    }
}
