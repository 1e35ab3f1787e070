//! Identifiers shared across crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable, opaque key identifying a user. Produced by the identity
/// gateway on first successful authentication; the core never destroys
/// one once minted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserKey(pub String);

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A client-chosen string distinguishing one of a user's devices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(pub String);

/// Opaque bearer token minted by `hostKey`, required on every subsequent
/// request. At least 128 bits of entropy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(pub String);

impl SessionKey {
    /// Mint a fresh, cryptographically random session key.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut bytes);
        SessionKey(hex::encode(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_session_keys_are_unique_and_long_enough() {
        let a = SessionKey::generate();
        let b = SessionKey::generate();
        assert_ne!(a, b);
        assert!(a.0.len() >= 32);
    }
}
