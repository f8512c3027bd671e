use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ErgError;

/// Account balance. IEEE-754 binary64; all protocol comparisons are
/// ε-tolerant (see [`crate::constants`]) and serialization uses the raw
/// little-endian bit pattern so replicas observe bit-identical values.
pub type Amount = f64;

/// Unix timestamp (seconds, UTC).
pub type Timestamp = u64;

/// Per-account transaction counter (replay protection).
pub type Nonce = u64;

// ── PublicKey ────────────────────────────────────────────────────────────────

/// 32-byte account identifier; for signed operations this is the Ed25519
/// public key. Hex-encoded (64 chars) at all textual boundaries.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ErgError> {
        let bytes = hex::decode(s).map_err(|e| ErgError::InvalidAddress(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(ErgError::InvalidAddress(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}…)", &self.to_hex()[..8])
    }
}

// ── Signature ────────────────────────────────────────────────────────────────

/// Detached Ed25519 signature (64 bytes).
///
/// Serde stores it hex-encoded: serde's derive does not cover 64-byte
/// arrays, and hex keeps the consensus persistence file greppable.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))?;
        Ok(Self(arr))
    }
}

impl Signature {
    /// All-zero placeholder used before a record is signed.
    pub fn empty() -> Self {
        Self([0u8; 64])
    }

    pub fn from_bytes(b: [u8; 64]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// True if the leading 16 bytes are all zero. Used as a cheap
    /// short-circuit for uninitialised signature fields.
    pub fn has_zero_prefix(&self) -> bool {
        self.0[..16].iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}…)", &hex::encode(&self.0[..8]))
    }
}

// ── StateHash ────────────────────────────────────────────────────────────────

/// 32-byte SHA-256 commitment (state hash, proposal hash, proof hash).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateHash(pub [u8; 32]);

impl StateHash {
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ErgError> {
        let bytes = hex::decode(s).map_err(|e| ErgError::InvalidAddress(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(ErgError::InvalidAddress(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateHash({}…)", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pubkey_hex_round_trip() {
        let pk = PublicKey::from_bytes([0xAB; 32]);
        let hex = pk.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(PublicKey::from_hex(&hex).unwrap(), pk);
    }

    #[test]
    fn pubkey_hex_rejects_wrong_length() {
        assert!(PublicKey::from_hex("abcd").is_err());
        assert!(PublicKey::from_hex("zz").is_err());
    }

    #[test]
    fn signature_serde_round_trip() {
        let sig = Signature::from_bytes([0x42; 64]);
        let json = serde_json::to_string(&sig).unwrap();
        assert_eq!(json, format!("\"{}\"", "42".repeat(64)));
        let back: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sig);
    }

    #[test]
    fn signature_zero_prefix() {
        assert!(Signature::empty().has_zero_prefix());
        let mut sig = [0u8; 64];
        sig[3] = 1;
        assert!(!Signature::from_bytes(sig).has_zero_prefix());
        let mut sig = [0u8; 64];
        sig[20] = 1;
        // Only the first 16 bytes matter for the short-circuit.
        assert!(Signature::from_bytes(sig).has_zero_prefix());
    }
}
