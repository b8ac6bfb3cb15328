//! Shared-secret authentication for connector handshakes.
//!
//! The connector proves possession of its pre-provisioned secret with
//! `HMAC-SHA256(secret, nonce || identity || timestamp)`. The bridge looks the
//! secret up through a [`SecretProvider`] and recomputes the proof. The raw
//! secret never crosses the wire.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Minimum accepted secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// A shared secret. `Debug` never prints the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Arc<[u8]>);

impl Secret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(bytes.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({} bytes)", self.0.len())
    }
}

/// Capability the authenticator uses to resolve an identity's secret.
pub trait SecretProvider: Send + Sync {
    fn lookup_secret(&self, identity: &str) -> Option<Secret>;
}

/// In-memory secret table built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
    secrets: HashMap<String, Secret>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identity: impl Into<String>, secret: Secret) {
        self.secrets.insert(identity.into(), secret);
    }

    pub fn with(mut self, identity: impl Into<String>, secret: Secret) -> Self {
        self.insert(identity, secret);
        self
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl SecretProvider for StaticSecrets {
    fn lookup_secret(&self, identity: &str) -> Option<Secret> {
        self.secrets.get(identity).cloned()
    }
}

fn keyed_mac(secret: &Secret, nonce: &[u8], identity: &str, timestamp: u64) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(nonce);
    mac.update(identity.as_bytes());
    mac.update(&timestamp.to_be_bytes());
    mac
}

/// Compute the handshake proof.
pub fn compute_proof(secret: &Secret, nonce: &[u8], identity: &str, timestamp: u64) -> [u8; 32] {
    let digest = keyed_mac(secret, nonce, identity, timestamp)
        .finalize()
        .into_bytes();
    let mut proof = [0u8; 32];
    proof.copy_from_slice(&digest);
    proof
}

/// Verify a handshake proof in constant time.
pub fn verify_proof(
    secret: &Secret,
    nonce: &[u8],
    identity: &str,
    timestamp: u64,
    proof: &[u8],
) -> bool {
    keyed_mac(secret, nonce, identity, timestamp)
        .verify_slice(proof)
        .is_ok()
}

/// Log- and metric-safe correlation key: hex SHA-256 of the identity.
pub fn customer_hash(identity: &str) -> String {
    hex::encode(Sha256::digest(identity.as_bytes()))
}

/// Identity format: alphanumeric, dash, underscore, dot, 1-255 chars.
pub fn is_valid_identity(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 255
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}
