use serde::{Deserialize, Serialize};

use crate::constants::ACCOUNT_RECORD_LEN;
use crate::error::ErgError;
use crate::types::{Amount, Nonce, PublicKey};

/// An account: the unit of ledger state. Accounts are created at genesis, on
/// explicit registration, or on first receipt of funds, and never destroyed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub public_key: PublicKey,
    pub balance: Amount,
    pub nonce: Nonce,
}

impl Account {
    pub fn new(public_key: PublicKey, balance: Amount) -> Self {
        Self {
            public_key,
            balance,
            nonce: 0,
        }
    }

    /// Packed snapshot record: pubkey(32) ‖ balance(8, raw bits LE) ‖ nonce(8 LE).
    pub fn to_record(&self) -> [u8; ACCOUNT_RECORD_LEN] {
        let mut buf = [0u8; ACCOUNT_RECORD_LEN];
        buf[..32].copy_from_slice(&self.public_key.0);
        buf[32..40].copy_from_slice(&self.balance.to_bits().to_le_bytes());
        buf[40..48].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    pub fn from_record(buf: &[u8]) -> Result<Self, ErgError> {
        if buf.len() < ACCOUNT_RECORD_LEN {
            return Err(ErgError::Serialization(format!(
                "account record too short: {} bytes",
                buf.len()
            )));
        }
        let mut pk = [0u8; 32];
        pk.copy_from_slice(&buf[..32]);
        let mut bits = [0u8; 8];
        bits.copy_from_slice(&buf[32..40]);
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&buf[40..48]);
        Ok(Self {
            public_key: PublicKey::from_bytes(pk),
            balance: f64::from_bits(u64::from_le_bytes(bits)),
            nonce: u64::from_le_bytes(nonce),
        })
    }
}
