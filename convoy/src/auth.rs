//! Agent credential verification
//!
//! The provisioning component binds each identity to a bearer credential
//! before any session exists. The control plane only stores the SHA-256
//! digest of that credential and compares digests in constant time.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Reason given to every failed verification, so a peer cannot probe which
/// identities exist.
pub const INVALID_CREDENTIAL: &str = "invalid credential";

/// Verifies HELLO credentials.
pub trait Authenticator: Send + Sync {
    /// `Err` carries the reason sent back in HELLO_ACK.
    fn verify(&self, identity: &str, credential: &str) -> Result<(), String>;
}

/// Lowercase hex SHA-256 of a credential.
pub fn credential_digest(credential: &str) -> String {
    let digest = Sha256::digest(credential.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Identity → credential digest table, usually loaded from configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticTokenAuthenticator {
    digests: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    pub fn new(digests: HashMap<String, String>) -> Self {
        Self {
            digests: digests
                .into_iter()
                .map(|(id, d)| (id, d.to_ascii_lowercase()))
                .collect(),
        }
    }

    /// Bind an identity to a credential digest.
    pub fn insert_digest(&mut self, identity: impl Into<String>, sha256_hex: impl Into<String>) {
        self.digests
            .insert(identity.into(), sha256_hex.into().to_ascii_lowercase());
    }

    /// Bind an identity to a plaintext credential (hashed on insert).
    pub fn insert_plaintext(&mut self, identity: impl Into<String>, credential: &str) {
        self.digests
            .insert(identity.into(), credential_digest(credential));
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn verify(&self, identity: &str, credential: &str) -> Result<(), String> {
        if identity.is_empty() || credential.is_empty() {
            return Err(INVALID_CREDENTIAL.to_string());
        }
        let presented = credential_digest(credential);
        match self.digests.get(identity) {
            Some(expected) if bool::from(expected.as_bytes().ct_eq(presented.as_bytes())) => Ok(()),
            _ => Err(INVALID_CREDENTIAL.to_string()),
        }
    }
}
