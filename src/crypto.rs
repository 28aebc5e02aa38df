//! Cryptographic primitives for the relay.
//!
//! Identity is an RSA keypair: the private key stays with the agent, the
//! PEM-encoded public key travels inside signed requests and its SHA-256
//! digest is the key id used everywhere a recipient is named.  Payload
//! protection is hybrid: a fresh AES-256-GCM content key per message,
//! wrapped with RSA-OAEP against the recipient public key.
//!
//! OAEP uses SHA-1 by default for interoperability with deployed clients;
//! the hash is a parameter so a cluster can move to SHA-256 without a new
//! wire format.  Request signatures always use PKCS#1 v1.5 over SHA-256.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;

pub const AES_KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;

#[derive(Debug)]
pub enum CryptoError {
    InvalidKey(String),
    InvalidLength(&'static str),
    Rsa(rsa::Error),
    InvalidAuth,
    Signature,
    Io(std::io::Error),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::InvalidKey(message) => write!(f, "invalid key: {message}"),
            CryptoError::InvalidLength(message) => write!(f, "invalid length: {message}"),
            CryptoError::Rsa(error) => write!(f, "rsa error: {error}"),
            CryptoError::InvalidAuth => write!(f, "authentication failed"),
            CryptoError::Signature => write!(f, "invalid signature"),
            CryptoError::Io(error) => write!(f, "io error: {error}"),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<rsa::Error> for CryptoError {
    fn from(error: rsa::Error) -> Self {
        CryptoError::Rsa(error)
    }
}

impl From<std::io::Error> for CryptoError {
    fn from(error: std::io::Error) -> Self {
        CryptoError::Io(error)
    }
}

/// Hash function used for RSA-OAEP key wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OaepHash {
    #[default]
    Sha1,
    Sha256,
}

impl OaepHash {
    fn padding(self) -> Oaep {
        match self {
            OaepHash::Sha1 => Oaep::new::<sha1::Sha1>(),
            OaepHash::Sha256 => Oaep::new::<Sha256>(),
        }
    }
}

/// Derive the canonical key id: lowercase hex SHA-256 of the PEM-encoded
/// public key bytes.  Identical PEM bytes always yield the same id.
pub fn pub_key_id(pem_bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(pem_bytes))
}

/// Parse a PEM-encoded PKIX (`PUBLIC KEY`) public key.
pub fn bytes_to_pub_key(pem_bytes: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    let pem = std::str::from_utf8(pem_bytes)
        .map_err(|_| CryptoError::InvalidKey("public key is not utf-8".to_string()))?;
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| CryptoError::InvalidKey(format!("public key: {e}")))
}

/// Parse a PEM-encoded PKCS#1 (`RSA PRIVATE KEY`) private key.
pub fn bytes_to_priv_key(pem_bytes: &[u8]) -> Result<RsaPrivateKey, CryptoError> {
    let pem = std::str::from_utf8(pem_bytes)
        .map_err(|_| CryptoError::InvalidKey("private key is not utf-8".to_string()))?;
    RsaPrivateKey::from_pkcs1_pem(pem)
        .map_err(|e| CryptoError::InvalidKey(format!("private key: {e}")))
}

/// Load a private key from a PEM file on disk.
pub fn load_priv_key(path: &Path) -> Result<RsaPrivateKey, CryptoError> {
    let bytes = fs::read(path)?;
    bytes_to_priv_key(&bytes)
}

/// PEM-encode the public half of a private key as PKIX (`PUBLIC KEY`).
/// This is the byte form the key id is derived from.
pub fn pub_key_pem(private_key: &RsaPrivateKey) -> Result<Vec<u8>, CryptoError> {
    let pem = private_key
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::InvalidKey(format!("encode public key: {e}")))?;
    Ok(pem.into_bytes())
}

/// Generate a fresh 32-byte AES key from the OS entropy source.
pub fn generate_aes_key() -> [u8; AES_KEY_SIZE] {
    let mut key = [0u8; AES_KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// AES-256-GCM encrypt with a fresh random 12-byte nonce.
/// Returns `(ciphertext, nonce)`.
pub fn aes_gcm_encrypt(key: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    if key.len() != AES_KEY_SIZE {
        return Err(CryptoError::InvalidLength("aes key must be 32 bytes"));
    }
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::InvalidAuth)?;
    Ok((ciphertext, nonce_bytes.to_vec()))
}

/// AES-256-GCM decrypt.  Fails with `InvalidAuth` if the tag does not
/// verify.
pub fn aes_gcm_decrypt(key: &[u8], ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != AES_KEY_SIZE {
        return Err(CryptoError::InvalidLength("aes key must be 32 bytes"));
    }
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidLength("nonce must be 12 bytes"));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::InvalidAuth)
}

/// RSA-OAEP encrypt against a PEM-encoded public key.
pub fn rsa_oaep_encrypt(
    pub_key_pem: &[u8],
    data: &[u8],
    hash: OaepHash,
) -> Result<Vec<u8>, CryptoError> {
    let key = bytes_to_pub_key(pub_key_pem)?;
    Ok(key.encrypt(&mut OsRng, hash.padding(), data)?)
}

/// RSA-OAEP decrypt with a private key.
pub fn rsa_oaep_decrypt(
    private_key: &RsaPrivateKey,
    ciphertext: &[u8],
    hash: OaepHash,
) -> Result<Vec<u8>, CryptoError> {
    Ok(private_key.decrypt(hash.padding(), ciphertext)?)
}

/// Sign a message: PKCS#1 v1.5 over the SHA-256 digest of `msg`.
pub fn rsa_sign(private_key: &RsaPrivateKey, msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let digest = Sha256::digest(msg);
    Ok(private_key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)?)
}

/// Verify a PKCS#1 v1.5 / SHA-256 signature against a PEM public key.
pub fn rsa_verify(pub_key_pem: &[u8], msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
    let key = bytes_to_pub_key(pub_key_pem)?;
    let digest = Sha256::digest(msg);
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, sig)
        .map_err(|_| CryptoError::Signature)
}

/// Encrypt a frame with the shared cluster key.  Output is
/// `nonce || ciphertext`; the nonce is fresh per frame.
pub fn frame_encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (ciphertext, nonce) = aes_gcm_encrypt(key, plaintext)?;
    let mut out = nonce;
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a `nonce || ciphertext` frame produced by [`frame_encrypt`].
pub fn frame_decrypt(key: &[u8], frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if frame.len() <= NONCE_SIZE {
        return Err(CryptoError::InvalidLength("frame too short"));
    }
    let (nonce, ciphertext) = frame.split_at(NONCE_SIZE);
    aes_gcm_decrypt(key, ciphertext, nonce)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_matches_published_sha256_vectors() {
        assert_eq!(
            pub_key_id(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            pub_key_id(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn key_id_is_stable() {
        let pem = b"-----BEGIN PUBLIC KEY-----\nnot a real key\n-----END PUBLIC KEY-----\n";
        assert_eq!(pub_key_id(pem), pub_key_id(pem));
        assert_eq!(pub_key_id(pem).len(), 64);
    }

    #[test]
    fn aes_gcm_round_trip() {
        let key = generate_aes_key();
        let (ciphertext, nonce) = aes_gcm_encrypt(&key, b"attack at dawn").unwrap();
        assert_eq!(nonce.len(), NONCE_SIZE);
        let plaintext = aes_gcm_decrypt(&key, &ciphertext, &nonce).unwrap();
        assert_eq!(plaintext, b"attack at dawn");
    }

    #[test]
    fn aes_gcm_rejects_tampered_ciphertext() {
        let key = generate_aes_key();
        let (mut ciphertext, nonce) = aes_gcm_encrypt(&key, b"payload").unwrap();
        ciphertext[0] ^= 0xff;
        assert!(matches!(
            aes_gcm_decrypt(&key, &ciphertext, &nonce),
            Err(CryptoError::InvalidAuth)
        ));
    }

    #[test]
    fn aes_gcm_nonces_are_fresh() {
        let key = generate_aes_key();
        let (_, n1) = aes_gcm_encrypt(&key, b"x").unwrap();
        let (_, n2) = aes_gcm_encrypt(&key, b"x").unwrap();
        assert_ne!(n1, n2);
    }

    #[test]
    fn oaep_round_trip_both_hashes() {
        let private_key = test_keys::generate();
        let pem = pub_key_pem(&private_key).unwrap();
        for hash in [OaepHash::Sha1, OaepHash::Sha256] {
            let wrapped = rsa_oaep_encrypt(&pem, b"content key", hash).unwrap();
            let opened = rsa_oaep_decrypt(&private_key, &wrapped, hash).unwrap();
            assert_eq!(opened, b"content key");
        }
    }

    #[test]
    fn signs_and_verifies() {
        let private_key = test_keys::generate();
        let pem = pub_key_pem(&private_key).unwrap();
        let sig = rsa_sign(&private_key, b"hello").unwrap();
        rsa_verify(&pem, b"hello", &sig).unwrap();
        assert!(rsa_verify(&pem, b"hello?", &sig).is_err());
    }

    #[test]
    fn rejects_signature_from_other_key() {
        let signer = test_keys::generate();
        let other = test_keys::generate();
        let other_pem = pub_key_pem(&other).unwrap();
        let sig = rsa_sign(&signer, b"hello").unwrap();
        assert!(rsa_verify(&other_pem, b"hello", &sig).is_err());
    }

    #[test]
    fn frame_round_trip() {
        let key = generate_aes_key();
        let frame = frame_encrypt(&key, b"{\"time\":12345}").unwrap();
        let plaintext = frame_decrypt(&key, &frame).unwrap();
        assert_eq!(plaintext, b"{\"time\":12345}");
    }

    #[test]
    fn frame_rejects_wrong_key() {
        let key = generate_aes_key();
        let other = generate_aes_key();
        let frame = frame_encrypt(&key, b"data").unwrap();
        assert!(frame_decrypt(&other, &frame).is_err());
    }

    #[test]
    fn pem_parse_round_trip() {
        let private_key = test_keys::generate();
        let pem = pub_key_pem(&private_key).unwrap();
        let parsed = bytes_to_pub_key(&pem).unwrap();
        assert_eq!(parsed, private_key.to_public_key());
    }
}
