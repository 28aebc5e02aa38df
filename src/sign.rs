//! Signed-request authentication for inbox operations.
//!
//! Every mutating agent call carries an `X-Signature` header: base64 of a
//! JSON document holding the requester's PEM public key, a signed
//! `{"timestamp":<unix secs>}` payload, and the PKCS#1 v1.5 signature
//! over that payload.  Verification proves possession of the private key
//! matching the claimed public key and bounds replay to a 300-second
//! window; the derived key id is the requester's identity.

use crate::crypto::{pub_key_id, rsa_sign, rsa_verify, CryptoError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum age of a signed timestamp, in seconds.
pub const REPLAY_WINDOW_SECS: i64 = 300;

#[derive(Debug, Serialize, Deserialize)]
pub struct SignedRequest {
    #[serde(with = "crate::b64")]
    pub public_key: Vec<u8>,
    #[serde(with = "crate::b64")]
    pub data: Vec<u8>,
    #[serde(with = "crate::b64")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SignedData {
    timestamp: i64,
}

#[derive(Debug)]
pub enum SignError {
    MissingHeader,
    Encoding(String),
    BadSignature,
    StaleTimestamp,
    Crypto(CryptoError),
}

impl fmt::Display for SignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignError::MissingHeader => write!(f, "no signature header"),
            SignError::Encoding(message) => write!(f, "signature encoding: {message}"),
            SignError::BadSignature => write!(f, "invalid signature"),
            SignError::StaleTimestamp => write!(f, "timestamp is too old"),
            SignError::Crypto(error) => write!(f, "crypto error: {error}"),
        }
    }
}

impl std::error::Error for SignError {}

impl From<CryptoError> for SignError {
    fn from(error: CryptoError) -> Self {
        SignError::Crypto(error)
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl SignedRequest {
    /// Build a signed request for the current time and encode it as the
    /// `X-Signature` header value.  Returns the header value and the
    /// requester's key id.
    pub fn create(private_key: &RsaPrivateKey) -> Result<(String, String), SignError> {
        Self::create_at(private_key, now_unix())
    }

    /// Build a signed request for an explicit timestamp.
    pub fn create_at(
        private_key: &RsaPrivateKey,
        timestamp: i64,
    ) -> Result<(String, String), SignError> {
        let data = serde_json::to_vec(&SignedData { timestamp })
            .map_err(|e| SignError::Encoding(e.to_string()))?;
        let signature = rsa_sign(private_key, &data)?;
        let public_key = crate::crypto::pub_key_pem(private_key)?;
        let key_id = pub_key_id(&public_key);
        let request = SignedRequest {
            public_key,
            data,
            signature,
        };
        let json = serde_json::to_vec(&request).map_err(|e| SignError::Encoding(e.to_string()))?;
        Ok((STANDARD.encode(json), key_id))
    }

    /// Verify the signature and the replay window.
    pub fn verify(&self) -> Result<(), SignError> {
        self.verify_at(now_unix())
    }

    fn verify_at(&self, now: i64) -> Result<(), SignError> {
        rsa_verify(&self.public_key, &self.data, &self.signature)
            .map_err(|_| SignError::BadSignature)?;
        let signed: SignedData = serde_json::from_slice(&self.data)
            .map_err(|e| SignError::Encoding(e.to_string()))?;
        if signed.timestamp < now - REPLAY_WINDOW_SECS {
            return Err(SignError::StaleTimestamp);
        }
        Ok(())
    }

    /// The key id derived from the embedded public key.
    pub fn key_id(&self) -> String {
        pub_key_id(&self.public_key)
    }
}

/// Decode and verify an `X-Signature` header value, returning the
/// requester's key id.
pub fn verify_header(header: &str) -> Result<String, SignError> {
    verify_header_at(header, now_unix())
}

fn verify_header_at(header: &str, now: i64) -> Result<String, SignError> {
    if header.is_empty() {
        return Err(SignError::MissingHeader);
    }
    let decoded = STANDARD
        .decode(header.as_bytes())
        .map_err(|e| SignError::Encoding(e.to_string()))?;
    let request: SignedRequest =
        serde_json::from_slice(&decoded).map_err(|e| SignError::Encoding(e.to_string()))?;
    request.verify_at(now)?;
    Ok(request.key_id())
}
