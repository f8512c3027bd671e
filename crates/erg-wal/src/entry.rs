use erg_core::{Amount, ErgError, PublicKey, Timestamp, Transaction};

/// Log entry kinds. The discriminants are the on-disk `kind` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum WalEntryKind {
    Transaction = 1,
    Checkpoint = 2,
    Genesis = 3,
    SyncMarker = 4,
}

impl WalEntryKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Transaction),
            2 => Some(Self::Checkpoint),
            3 => Some(Self::Genesis),
            4 => Some(Self::SyncMarker),
            _ => None,
        }
    }
}

/// A checksum-verified entry read back from the log.
#[derive(Clone, Debug)]
pub struct WalEntry {
    pub kind: WalEntryKind,
    pub timestamp: Timestamp,
    pub sequence: u64,
    pub payload: Vec<u8>,
}

impl WalEntry {
    /// Genesis payload: founder(32) ‖ supply(8, raw bits LE).
    pub fn decode_genesis(&self) -> Result<(PublicKey, Amount), ErgError> {
        if self.payload.len() < 40 {
            return Err(ErgError::Serialization(
                "genesis payload truncated".into(),
            ));
        }
        let mut pk = [0u8; 32];
        pk.copy_from_slice(&self.payload[..32]);
        let supply = f64::from_bits(u64::from_le_bytes(
            self.payload[32..40].try_into().unwrap(),
        ));
        Ok((PublicKey::from_bytes(pk), supply))
    }

    pub fn decode_transaction(&self) -> Result<Transaction, ErgError> {
        Transaction::from_bytes(&self.payload)
    }
}
