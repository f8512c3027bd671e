//! Packed little-endian snapshot codec.
//!
//! The layout is a protocol contract shared by the checkpoint file, the
//! full-state wire message, and the bootstrap path:
//!
//! ```text
//! header  magic(4) format_version(4) state_version(8) timestamp(8)
//!         account_count(4) total_supply(8, raw bits)
//!         state_hash(32) prev_hash(32)
//! records account_count × (pubkey(32) balance(8, raw bits) nonce(8))
//! ```

use std::path::Path;

use erg_core::{
    Account, ErgError, StateHash, ACCOUNT_RECORD_LEN, SNAPSHOT_FORMAT_VERSION, SNAPSHOT_HEADER_LEN,
    SNAPSHOT_MAGIC,
};

use crate::engine::State;

impl State {
    pub fn to_snapshot_bytes(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(SNAPSHOT_HEADER_LEN + self.account_count() * ACCOUNT_RECORD_LEN);
        buf.extend_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
        buf.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.version().to_le_bytes());
        buf.extend_from_slice(&self.timestamp().to_le_bytes());
        buf.extend_from_slice(&(self.account_count() as u32).to_le_bytes());
        buf.extend_from_slice(&self.total_supply().to_bits().to_le_bytes());
        buf.extend_from_slice(self.state_hash().as_bytes());
        buf.extend_from_slice(self.prev_hash().as_bytes());
        for acc in self.accounts() {
            buf.extend_from_slice(&acc.to_record());
        }
        buf
    }

    /// Decode a snapshot and verify its integrity: magic, format version,
    /// record count, and that the recomputed state hash bit-matches the
    /// stored one. A hash mismatch signals corruption or an attack and is
    /// unconditionally fatal to the load.
    pub fn from_snapshot_bytes(buf: &[u8]) -> Result<Self, ErgError> {
        if buf.len() < SNAPSHOT_HEADER_LEN {
            return Err(ErgError::Serialization(format!(
                "snapshot too short: {} bytes",
                buf.len()
            )));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != SNAPSHOT_MAGIC {
            return Err(ErgError::Serialization(format!(
                "bad snapshot magic {magic:#010x}"
            )));
        }
        let format = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if format != SNAPSHOT_FORMAT_VERSION {
            return Err(ErgError::Serialization(format!(
                "unsupported snapshot format {format}"
            )));
        }
        let version = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let timestamp = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let count = u32::from_le_bytes(buf[24..28].try_into().unwrap()) as usize;
        let total_supply = f64::from_bits(u64::from_le_bytes(buf[28..36].try_into().unwrap()));
        let mut state_hash = [0u8; 32];
        state_hash.copy_from_slice(&buf[36..68]);
        let mut prev_hash = [0u8; 32];
        prev_hash.copy_from_slice(&buf[68..100]);

        let need = SNAPSHOT_HEADER_LEN + count * ACCOUNT_RECORD_LEN;
        if buf.len() < need {
            return Err(ErgError::Serialization(format!(
                "snapshot truncated: need {need} bytes, have {}",
                buf.len()
            )));
        }

        let mut accounts = Vec::with_capacity(count);
        for i in 0..count {
            let off = SNAPSHOT_HEADER_LEN + i * ACCOUNT_RECORD_LEN;
            accounts.push(Account::from_record(&buf[off..off + ACCOUNT_RECORD_LEN])?);
        }

        let state = State::from_parts(
            version,
            timestamp,
            accounts,
            total_supply,
            StateHash::from_bytes(state_hash),
            StateHash::from_bytes(prev_hash),
        );

        if state.compute_hash() != state.state_hash() {
            return Err(ErgError::ChainMismatch);
        }
        Ok(state)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ErgError> {
        std::fs::write(path, self.to_snapshot_bytes())?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ErgError> {
        let bytes = std::fs::read(path)?;
        Self::from_snapshot_bytes(&bytes)
    }
}
