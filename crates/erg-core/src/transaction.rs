use serde::{Deserialize, Serialize};

use crate::constants::{SIGNING_MESSAGE_LEN, TX_RECORD_LEN};
use crate::error::ErgError;
use crate::types::{Amount, Nonce, PublicKey, Signature, Timestamp};

/// A signed transfer. The signature covers [`Transaction::signing_bytes`]
/// (88 bytes in canonical order); the full wire/log record is the signing
/// message followed by the 64-byte signature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub from: PublicKey,
    pub to: PublicKey,
    pub amount: Amount,
    pub nonce: Nonce,
    pub timestamp: Timestamp,
    pub signature: Signature,
}

impl Transaction {
    /// Build an unsigned transfer. The signature starts zeroed and must be
    /// filled by the keypair before submission.
    pub fn new(
        from: PublicKey,
        to: PublicKey,
        amount: Amount,
        nonce: Nonce,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            from,
            to,
            amount,
            nonce,
            timestamp,
            signature: Signature::empty(),
        }
    }

    /// Canonical signing message:
    /// from(32) ‖ to(32) ‖ amount(8, raw bits LE) ‖ nonce(8 LE) ‖ timestamp(8 LE).
    pub fn signing_bytes(&self) -> [u8; SIGNING_MESSAGE_LEN] {
        let mut buf = [0u8; SIGNING_MESSAGE_LEN];
        buf[..32].copy_from_slice(&self.from.0);
        buf[32..64].copy_from_slice(&self.to.0);
        buf[64..72].copy_from_slice(&self.amount.to_bits().to_le_bytes());
        buf[72..80].copy_from_slice(&self.nonce.to_le_bytes());
        buf[80..88].copy_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    /// Full packed record: signing message + signature.
    pub fn to_bytes(&self) -> [u8; TX_RECORD_LEN] {
        let mut buf = [0u8; TX_RECORD_LEN];
        buf[..SIGNING_MESSAGE_LEN].copy_from_slice(&self.signing_bytes());
        buf[SIGNING_MESSAGE_LEN..].copy_from_slice(&self.signature.0);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, ErgError> {
        if buf.len() < TX_RECORD_LEN {
            return Err(ErgError::Serialization(format!(
                "transaction record too short: {} bytes",
                buf.len()
            )));
        }
        let mut from = [0u8; 32];
        from.copy_from_slice(&buf[..32]);
        let mut to = [0u8; 32];
        to.copy_from_slice(&buf[32..64]);
        let mut amount = [0u8; 8];
        amount.copy_from_slice(&buf[64..72]);
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&buf[72..80]);
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&buf[80..88]);
        let mut sig = [0u8; 64];
        sig.copy_from_slice(&buf[88..152]);
        Ok(Self {
            from: PublicKey::from_bytes(from),
            to: PublicKey::from_bytes(to),
            amount: f64::from_bits(u64::from_le_bytes(amount)),
            nonce: u64::from_le_bytes(nonce),
            timestamp: u64::from_le_bytes(timestamp),
            signature: Signature::from_bytes(sig),
        })
    }
}
