//! Secret generation, hash locks and reveal verification
//!
//! The secret is the 32-byte preimage an initiator keeps until it redeems the
//! destination leg. The hash lock is its SHA-256 digest and is what both HTLC
//! legs commit to on-chain.

use crate::error::{SwapError, SwapResult};

use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of secrets and hash locks in bytes
pub const SECRET_LEN: usize = 32;

/// HTLC preimage. Redacted in debug output and wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret([u8; SECRET_LEN]);

impl Secret {
    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a secret from an arbitrary slice, rejecting anything but 32 bytes
    pub fn from_slice(bytes: &[u8]) -> SwapResult<Self> {
        let array: [u8; SECRET_LEN] = bytes
            .try_into()
            .map_err(|_| SwapError::InvalidSecretLength(bytes.len()))?;
        Ok(Self(array))
    }

    pub fn from_hex(value: &str) -> SwapResult<Self> {
        let bytes = hex::decode(value.trim_start_matches("0x"))
            .map_err(|e| SwapError::Validation(format!("Invalid secret hex: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Secret::from_hex(&value).map_err(de::Error::custom)
    }
}

/// SHA-256 commitment to a secret, published on both chains
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashLock([u8; SECRET_LEN]);

impl HashLock {
    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(value: &str) -> SwapResult<Self> {
        let bytes = hex::decode(value.trim_start_matches("0x"))
            .map_err(|e| SwapError::Validation(format!("Invalid hash lock hex: {}", e)))?;
        let array: [u8; SECRET_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SwapError::Validation(format!("Hash lock must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for HashLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for HashLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashLock({})", self.to_hex())
    }
}

impl Serialize for HashLock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for HashLock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        HashLock::from_hex(&value).map_err(de::Error::custom)
    }
}

/// Generate a cryptographically secure random secret
pub fn generate_secret() -> Secret {
    let mut bytes = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    Secret(bytes)
}

/// Compute the hash lock for a secret
pub fn hash(secret: &Secret) -> HashLock {
    HashLock(sha256(secret.as_bytes()))
}

/// Check that a revealed secret opens the given hash lock
pub fn verify_reveal(secret: &Secret, hash_lock: &HashLock) -> bool {
    hash(secret) == *hash_lock
}

pub(crate) fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
