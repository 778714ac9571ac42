//! Join token derivation and validation
//!
//! Tokens are derived rather than stored: an HMAC-SHA256 over the cluster
//! id and the index of the current join window, keyed by a rotating
//! [`TokenSecret`]. Every node bootstrapped inside one window receives the
//! same token, and the token stops validating once the window rolls over
//! or the secret rotates.

use std::time::Duration;

use aws_lc_rs::constant_time::verify_slices_are_equal;
use aws_lc_rs::hmac;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Alphabet of kubeadm bootstrap tokens
const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_ID_LEN: usize = 6;
const TOKEN_SECRET_LEN: usize = 16;

/// Token errors
#[derive(Debug, Error)]
pub enum TokenError {
    /// Token string is not `[a-z0-9]{6}.[a-z0-9]{16}`
    #[error("malformed join token")]
    Malformed,

    /// Random generation failed
    #[error("random generation failed")]
    Random,
}

impl From<TokenError> for crate::Error {
    fn from(err: TokenError) -> Self {
        crate::Error::bootstrap("token", err.to_string())
    }
}

/// Key material all join tokens are derived from
#[derive(Clone)]
pub struct TokenSecret(Zeroizing<Vec<u8>>);

impl TokenSecret {
    /// Generate a fresh random secret
    pub fn generate() -> Result<Self, TokenError> {
        let mut raw = Zeroizing::new(vec![0u8; 32]);
        aws_lc_rs::rand::fill(&mut raw).map_err(|_| TokenError::Random)?;
        Ok(Self(raw))
    }

    /// Use existing key material
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(Zeroizing::new(bytes.to_vec()))
    }

    fn tag(&self, purpose: &[u8], cluster_id: Uuid, window: u64) -> hmac::Tag {
        let key = hmac::Key::new(hmac::HMAC_SHA256, &self.0);
        let mut ctx = hmac::Context::with_key(&key);
        ctx.update(purpose);
        ctx.update(cluster_id.as_bytes());
        ctx.update(&window.to_be_bytes());
        ctx.sign()
    }
}

impl std::fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenSecret(<redacted>)")
    }
}

/// Fixed-length windows tokens are valid in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinWindow {
    length: Duration,
}

impl JoinWindow {
    /// Windows of `length` (at least one second)
    pub fn new(length: Duration) -> Self {
        Self {
            length: length.max(Duration::from_secs(1)),
        }
    }

    /// Index of the window containing `at`
    pub fn index_at(&self, at: DateTime<Utc>) -> u64 {
        let secs = at.timestamp().max(0) as u64;
        secs / self.length.as_secs().max(1)
    }

    /// Index of the current window
    pub fn current(&self) -> u64 {
        self.index_at(Utc::now())
    }
}

fn encode(bytes: &[u8], len: usize) -> String {
    bytes
        .iter()
        .take(len)
        .map(|b| TOKEN_ALPHABET[(*b as usize) % TOKEN_ALPHABET.len()] as char)
        .collect()
}

/// Cluster join token in kubeadm form (`abcdef.0123456789abcdef`)
#[derive(Clone)]
pub struct JoinToken {
    id: String,
    secret: Zeroizing<String>,
}

impl JoinToken {
    /// Derive the token of `cluster_id` for join window `window`
    pub fn derive(secret: &TokenSecret, cluster_id: Uuid, window: u64) -> Self {
        let tag = secret.tag(b"join-token", cluster_id, window);
        let bytes = tag.as_ref();
        Self {
            id: encode(bytes, TOKEN_ID_LEN),
            secret: Zeroizing::new(encode(&bytes[TOKEN_ID_LEN..], TOKEN_SECRET_LEN)),
        }
    }

    /// Parse a token string
    pub fn parse(token: &str) -> Result<Self, TokenError> {
        let (id, secret) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let valid = |s: &str, len: usize| {
            s.len() == len && s.bytes().all(|b| TOKEN_ALPHABET.contains(&b))
        };
        if !valid(id, TOKEN_ID_LEN) || !valid(secret, TOKEN_SECRET_LEN) {
            return Err(TokenError::Malformed);
        }
        Ok(Self {
            id: id.to_string(),
            secret: Zeroizing::new(secret.to_string()),
        })
    }

    /// Public token id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Full token; only for writing into a payload or a remote command
    pub fn expose(&self) -> Zeroizing<String> {
        Zeroizing::new(format!("{}.{}", self.id, self.secret.as_str()))
    }

    /// Returns true if `self` is the token of `cluster_id` in `window`
    pub fn verify(&self, secret: &TokenSecret, cluster_id: Uuid, window: u64) -> bool {
        let expected = Self::derive(secret, cluster_id, window);
        verify_slices_are_equal(
            expected.expose().as_bytes(),
            self.expose().as_bytes(),
        )
        .is_ok()
    }
}

impl std::fmt::Debug for JoinToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinToken")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Key that lets additional control nodes download the shared certificates
#[derive(Clone)]
pub struct CertificateKey(Zeroizing<String>);

impl CertificateKey {
    /// Derive the key of `cluster_id` for join window `window`
    pub fn derive(secret: &TokenSecret, cluster_id: Uuid, window: u64) -> Self {
        let tag = secret.tag(b"certificate-key", cluster_id, window);
        let hex: String = tag.as_ref().iter().map(|b| format!("{:02x}", b)).collect();
        Self(Zeroizing::new(hex))
    }

    /// Hex string (64 characters)
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for CertificateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CertificateKey(<redacted>)")
    }
}
