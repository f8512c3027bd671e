//! Cross-shard execution coordination.
//!
//! Routes transfers through the sharded ledger under the consensus-owned
//! lock table: phase 1 runs only after the sender's lock is acquired, a
//! commit releases the lock, and a transfer whose phase 2 is still
//! outstanding when its lock expires has phase 1 rolled back.

use std::collections::HashMap;

use tracing::{info, warn};

use erg_consensus::CrossShardLockTable;
use erg_core::{Amount, ErgError, PublicKey, Timestamp, Transaction};
use erg_shard::{shard_for, CrossShardPending, ShardedLedger};

/// The node's sharded execution mode. Holds the 16-shard ledger plus the
/// phase-1 compensation records of in-flight transfers, keyed by
/// (sender, lock sequence) so an expired lock maps back to its rollback.
pub struct ShardedExecutor {
    ledger: ShardedLedger,
    pending: HashMap<(PublicKey, u64), CrossShardPending>,
    next_sequence: u64,
}

impl ShardedExecutor {
    pub fn new(network_supply: Amount, now: Timestamp) -> Self {
        Self {
            ledger: ShardedLedger::new(network_supply, now),
            pending: HashMap::new(),
            next_sequence: 1,
        }
    }

    pub fn ledger(&self) -> &ShardedLedger {
        &self.ledger
    }

    pub fn create_account(&mut self, key: PublicKey, balance: Amount) -> Result<(), ErgError> {
        self.ledger.create_account(key, balance)
    }

    pub fn balance(&self, key: &PublicKey) -> Option<Amount> {
        self.ledger.balance(key)
    }

    /// Execute an intra-shard transfer (no lock involved).
    pub fn execute(&mut self, tx: &Transaction, now: Timestamp) -> Result<(), ErgError> {
        self.ledger.execute(tx, now)
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn verify_conservation(&self) -> Result<(), ErgError> {
        self.ledger.verify_conservation()
    }

    // ── Two-phase transfers under the lock table ─────────────────────────────

    /// Run both phases of a cross-shard transfer. The sender's lock is
    /// acquired before phase 1 and released on commit. If phase 2 fails,
    /// the transfer is escalated: phase 1 stays applied, the lock stays
    /// held, and [`Self::expire`] compensates once the lock lapses.
    pub fn submit_cross(
        &mut self,
        tx: &Transaction,
        locks: &mut CrossShardLockTable,
        now: Timestamp,
    ) -> Result<(), ErgError> {
        let sequence = self.begin_cross(tx, locks, now)?;
        self.complete_cross(&tx.from, sequence, locks, now)
    }

    /// Phase 1 only: acquire the sender's lock and debit the source shard,
    /// leaving the transfer in flight. Used when the destination shard
    /// settles asynchronously (e.g. shards mapped onto separate replicas);
    /// [`Self::complete_cross`] finishes it, expiry undoes it. Returns the
    /// lock sequence.
    pub fn begin_cross(
        &mut self,
        tx: &Transaction,
        locks: &mut CrossShardLockTable,
        now: Timestamp,
    ) -> Result<u64, ErgError> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        locks.acquire(
            tx.from,
            shard_for(&tx.from),
            shard_for(&tx.to),
            tx.amount,
            sequence,
            now,
        )?;
        let pending = match self.ledger.begin_cross(tx, now) {
            Ok(p) => p,
            Err(e) => {
                // Phase 1 never applied; the lock must not linger.
                locks.release(&tx.from, sequence);
                return Err(e);
            }
        };
        self.pending.insert((tx.from, sequence), pending);
        Ok(sequence)
    }

    /// Phase 2 for an in-flight transfer: credit the destination shard and
    /// release the lock. On failure the transfer stays escalated and the
    /// lock keeps guarding the sender until expiry rolls phase 1 back.
    pub fn complete_cross(
        &mut self,
        sender: &PublicKey,
        sequence: u64,
        locks: &mut CrossShardLockTable,
        now: Timestamp,
    ) -> Result<(), ErgError> {
        let pending = self
            .pending
            .remove(&(*sender, sequence))
            .ok_or(ErgError::UnknownCrossShardTransfer)?;

        if let Err(e) = self.ledger.commit_cross(&pending, now) {
            warn!(
                sender = %sender,
                sequence,
                error = %e,
                "cross-shard phase 2 failed; escalated to lock expiry"
            );
            self.pending.insert((*sender, sequence), pending);
            return Err(e);
        }
        locks.commit(sender, sequence);
        Ok(())
    }

    /// Roll back phase 1 of every transfer whose lock has expired without a
    /// commit. Returns how many transfers were compensated.
    pub fn expire(&mut self, locks: &mut CrossShardLockTable, now: Timestamp) -> usize {
        let mut rolled_back = 0;
        for lock in locks.expire(now) {
            match self.pending.remove(&(lock.sender, lock.sequence)) {
                Some(pending) => {
                    self.ledger.abort_cross(&pending, now);
                    rolled_back += 1;
                }
                None => warn!(
                    sender = %lock.sender,
                    sequence = lock.sequence,
                    "expired lock had no pending transfer to roll back"
                ),
            }
        }
        if rolled_back > 0 {
            info!(rolled_back, "expired cross-shard transfers compensated");
        }
        rolled_back
    }
}
