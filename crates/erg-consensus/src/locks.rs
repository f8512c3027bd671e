use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use erg_core::{Amount, ErgError, PublicKey, Timestamp, CROSS_SHARD_LOCK_EXPIRY_SECS};

/// A cross-shard transfer lock. Held from phase 1 until phase-2 commit or
/// expiry; while a sender holds an unexpired lock, no shard may apply
/// another transfer from them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrossShardLock {
    pub sender: PublicKey,
    pub source_shard: u8,
    pub dest_shard: u8,
    pub amount: Amount,
    pub sequence: u64,
    pub expires_at: Timestamp,
    pub committed: bool,
}

/// The lock table. Owned by the consensus subsystem; shard executors and
/// the node consult it around the two-phase protocol.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CrossShardLockTable {
    locks: Vec<CrossShardLock>,
}

impl CrossShardLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `sender` holds any unexpired, uncommitted lock.
    pub fn has_active(&self, sender: &PublicKey, now: Timestamp) -> bool {
        self.locks
            .iter()
            .any(|l| l.sender == *sender && !l.committed && now < l.expires_at)
    }

    /// Acquire a lock for a cross-shard transfer. A sender with an unexpired
    /// lock cannot take a second one — that is the double-spend guard.
    pub fn acquire(
        &mut self,
        sender: PublicKey,
        source_shard: u8,
        dest_shard: u8,
        amount: Amount,
        sequence: u64,
        now: Timestamp,
    ) -> Result<(), ErgError> {
        if self.has_active(&sender, now) {
            return Err(ErgError::LockHeld);
        }
        self.locks.push(CrossShardLock {
            sender,
            source_shard,
            dest_shard,
            amount,
            sequence,
            expires_at: now + CROSS_SHARD_LOCK_EXPIRY_SECS,
            committed: false,
        });
        Ok(())
    }

    /// Release on phase-2 commit.
    pub fn commit(&mut self, sender: &PublicKey, sequence: u64) {
        if let Some(pos) = self
            .locks
            .iter()
            .position(|l| l.sender == *sender && l.sequence == sequence)
        {
            let lock = self.locks.remove(pos);
            info!(
                sender = %lock.sender,
                sequence,
                "cross-shard lock released on commit"
            );
        }
    }

    /// Drop a lock whose phase 1 never applied (or was already
    /// compensated), without recording a commit.
    pub fn release(&mut self, sender: &PublicKey, sequence: u64) {
        self.locks
            .retain(|l| !(l.sender == *sender && l.sequence == sequence));
    }

    /// Drain expired, uncommitted locks. Each returned lock's phase 1 must
    /// be rolled back by the caller.
    pub fn expire(&mut self, now: Timestamp) -> Vec<CrossShardLock> {
        let mut expired = Vec::new();
        self.locks.retain(|l| {
            if !l.committed && now >= l.expires_at {
                warn!(sender = %l.sender, sequence = l.sequence, "cross-shard lock expired");
                expired.push(l.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
