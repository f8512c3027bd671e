//! erg-shard
//!
//! Wallet-partitioned execution: the account space is split into 16 shards
//! by the top four bits of the public key's first byte, each shard holding
//! an independent state engine with its own supply ledger.
//!
//! An intra-shard transfer executes entirely inside the owning shard. A
//! cross-shard transfer is two-phase: phase 1 debits the sender and moves
//! supply out of the source shard, phase 2 credits the receiver and moves
//! supply into the destination. If phase 2 cannot complete, phase 1 is
//! compensated bit-for-bit. The network-level invariant is
//! Σ shard supplies == network supply.

use tracing::{debug, info};

use erg_core::{
    Amount, ErgError, PublicKey, Timestamp, Transaction, EPS_CONSERVATION, NUM_SHARDS,
};
use erg_crypto::verify_transaction;
use erg_state::State;

/// Shard owning `key`: the top 4 bits of the first pubkey byte.
pub fn shard_for(key: &PublicKey) -> u8 {
    key.0[0] >> 4
}

/// One shard: an independent state engine plus metrics.
pub struct Shard {
    pub id: u8,
    pub state: State,
    pub tx_count: u64,
}

/// Snapshot of a sender taken before phase 1, used to compensate if phase 2
/// aborts. Balances are restored from the captured bits, not re-credited.
#[derive(Debug, Clone)]
pub struct CrossShardPending {
    pub sender: PublicKey,
    pub receiver: PublicKey,
    pub amount: Amount,
    pub source_shard: u8,
    pub dest_shard: u8,
    prior_balance: Amount,
    prior_nonce: u64,
    prior_supply: Amount,
}

pub struct ShardedLedger {
    shards: Vec<Shard>,
    network_supply: Amount,
}

impl ShardedLedger {
    /// Initialise all 16 shards empty; `network_supply` is the invariant
    /// ceiling that bootstrap allocations must sum to.
    pub fn new(network_supply: Amount, now: Timestamp) -> Self {
        let shards = (0..NUM_SHARDS as u8)
            .map(|id| Shard {
                id,
                state: State::new(now),
                tx_count: 0,
            })
            .collect();
        Self {
            shards,
            network_supply,
        }
    }

    pub fn network_supply(&self) -> Amount {
        self.network_supply
    }

    pub fn shard(&self, id: u8) -> &Shard {
        &self.shards[id as usize]
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    fn shard_mut(&mut self, id: u8) -> &mut Shard {
        &mut self.shards[id as usize]
    }

    /// Bootstrap an account with an initial allocation in its home shard.
    pub fn create_account(&mut self, key: PublicKey, balance: Amount) -> Result<(), ErgError> {
        let id = shard_for(&key);
        let now = self.shards[id as usize].state.timestamp();
        let shard = self.shard_mut(id);
        shard.state.bootstrap_account(key, balance)?;
        shard.state.commit_transition(now);
        debug!(shard = id, key = %key, balance, "account created");
        Ok(())
    }

    pub fn balance(&self, key: &PublicKey) -> Option<Amount> {
        self.shard(shard_for(key))
            .state
            .account(key)
            .map(|a| a.balance)
    }

    // ── Intra-shard path ─────────────────────────────────────────────────────

    /// Execute a transfer whose endpoints share a shard.
    pub fn execute(&mut self, tx: &Transaction, now: Timestamp) -> Result<(), ErgError> {
        let from_shard = shard_for(&tx.from);
        let to_shard = shard_for(&tx.to);
        if from_shard != to_shard {
            return Err(ErgError::CrossShard {
                from: from_shard,
                to: to_shard,
            });
        }
        let shard = self.shard_mut(from_shard);
        shard.state.execute(tx, now)?;
        shard.tx_count += 1;
        Ok(())
    }

    // ── Cross-shard path ─────────────────────────────────────────────────────

    /// Phase 1: validate the transfer and debit the sender, moving the
    /// amount out of the source shard's supply. Returns the compensation
    /// record needed if phase 2 fails.
    pub fn begin_cross(
        &mut self,
        tx: &Transaction,
        now: Timestamp,
    ) -> Result<CrossShardPending, ErgError> {
        let source_shard = shard_for(&tx.from);
        let dest_shard = shard_for(&tx.to);
        if source_shard == dest_shard {
            return Err(ErgError::NotCrossShard);
        }

        verify_transaction(tx)?;
        if !tx.amount.is_finite() || tx.amount <= 0.0 {
            return Err(ErgError::InvalidAmount);
        }

        let state = &self.shards[source_shard as usize].state;
        let sender = state
            .account(&tx.from)
            .ok_or_else(|| ErgError::AccountNotFound(tx.from.to_hex()))?;
        if tx.nonce != sender.nonce {
            return Err(ErgError::InvalidSignature);
        }
        if sender.balance < tx.amount {
            return Err(ErgError::InsufficientFunds {
                need: tx.amount,
                have: sender.balance,
            });
        }

        let pending = CrossShardPending {
            sender: tx.from,
            receiver: tx.to,
            amount: tx.amount,
            source_shard,
            dest_shard,
            prior_balance: sender.balance,
            prior_nonce: sender.nonce,
            prior_supply: state.total_supply(),
        };

        let shard = self.shard_mut(source_shard);
        let new_balance = pending.prior_balance - tx.amount;
        shard
            .state
            .apply_change(tx.from, new_balance, pending.prior_nonce + 1)?;
        let new_supply = pending.prior_supply - tx.amount;
        shard.state.set_total_supply(new_supply);
        shard.state.commit_transition(now);
        shard.tx_count += 1;

        debug!(
            amount = tx.amount,
            source = source_shard,
            dest = dest_shard,
            "cross-shard phase 1: debited source shard"
        );
        Ok(pending)
    }

    /// Phase 2: credit the receiver in the destination shard and move the
    /// amount into its supply.
    pub fn commit_cross(
        &mut self,
        pending: &CrossShardPending,
        now: Timestamp,
    ) -> Result<(), ErgError> {
        let shard = self.shard_mut(pending.dest_shard);
        let prior = shard
            .state
            .account(&pending.receiver)
            .map(|a| (a.balance, a.nonce))
            .unwrap_or((0.0, 0));
        shard
            .state
            .apply_change(pending.receiver, prior.0 + pending.amount, prior.1)?;
        let new_supply = shard.state.total_supply() + pending.amount;
        shard.state.set_total_supply(new_supply);
        shard.state.commit_transition(now);
        shard.tx_count += 1;

        info!(
            amount = pending.amount,
            source = pending.source_shard,
            dest = pending.dest_shard,
            "cross-shard transfer committed"
        );
        Ok(())
    }

    /// Compensate a failed phase 2: restore the sender's balance, nonce, and
    /// the source shard's supply from the captured bits.
    pub fn abort_cross(&mut self, pending: &CrossShardPending, now: Timestamp) {
        let shard = self.shard_mut(pending.source_shard);
        // apply_change cannot fail here: the sender account already exists.
        let _ = shard.state.apply_change(
            pending.sender,
            pending.prior_balance,
            pending.prior_nonce,
        );
        shard.state.set_total_supply(pending.prior_supply);
        shard.state.commit_transition(now);
        info!(
            amount = pending.amount,
            source = pending.source_shard,
            "cross-shard transfer rolled back"
        );
    }

    /// Run both phases, compensating automatically if the commit fails.
    pub fn execute_cross(&mut self, tx: &Transaction, now: Timestamp) -> Result<(), ErgError> {
        let pending = self.begin_cross(tx, now)?;
        match self.commit_cross(&pending, now) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort_cross(&pending, now);
                Err(e)
            }
        }
    }

    // ── Conservation ─────────────────────────────────────────────────────────

    /// Σ shard supplies must equal the network supply.
    pub fn verify_conservation(&self) -> Result<(), ErgError> {
        let total: f64 = self.shards.iter().map(|s| s.state.total_supply()).sum();
        if (total - self.network_supply).abs() > EPS_CONSERVATION {
            return Err(ErgError::ConservationViolated {
                expected: self.network_supply,
                actual: total,
            });
        }
        Ok(())
    }
}
