use std::collections::HashMap;

use sha2::{Digest, Sha256};
use tracing::warn;

use erg_core::{
    Account, Amount, ErgError, Nonce, PublicKey, StateHash, Timestamp, Transaction,
    EPS_CONSERVATION, EPS_TRANSFER, MAX_ACCOUNTS,
};
use erg_crypto::verify_transaction;

/// The full ledger state.
///
/// Exactly one writer mutates a `State` at a time (the node wraps it in a
/// writer lock); every mutation either completes atomically or leaves the
/// state bit-for-bit unchanged. The account set keeps insertion order — that
/// order is part of the hash contract, so it must never be re-sorted.
#[derive(Clone, Debug)]
pub struct State {
    version: u64,
    timestamp: Timestamp,
    accounts: Vec<Account>,
    index: HashMap<PublicKey, usize>,
    total_supply: Amount,
    state_hash: StateHash,
    prev_hash: StateHash,
}

impl State {
    /// An empty, pre-genesis state. Version 0 marks "never transitioned";
    /// genesis is the transition to version 1.
    pub fn new(now: Timestamp) -> Self {
        let mut state = Self {
            version: 0,
            timestamp: now,
            accounts: Vec::new(),
            index: HashMap::new(),
            total_supply: 0.0,
            state_hash: StateHash::zero(),
            prev_hash: StateHash::zero(),
        };
        state.state_hash = state.compute_hash();
        state
    }

    /// Create the genesis state: one founder account holding the entire
    /// supply. This is the only operation that creates value from nothing.
    pub fn genesis(founder: PublicKey, supply: Amount, now: Timestamp) -> Result<Self, ErgError> {
        if !supply.is_finite() || supply <= 0.0 {
            return Err(ErgError::InvalidAmount);
        }
        let mut state = Self::new(now);
        state.bootstrap_account(founder, supply)?;
        state.version = 1;
        state.state_hash = state.compute_hash();
        Ok(state)
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn total_supply(&self) -> Amount {
        self.total_supply
    }

    pub fn state_hash(&self) -> StateHash {
        self.state_hash
    }

    pub fn prev_hash(&self) -> StateHash {
        self.prev_hash
    }

    pub fn account(&self, key: &PublicKey) -> Option<&Account> {
        self.index.get(key).map(|&i| &self.accounts[i])
    }

    /// All accounts in insertion order.
    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.index.contains_key(key)
    }

    // ── Account creation ─────────────────────────────────────────────────────

    /// Register a new zero-balance account.
    ///
    /// Funding at creation is only legal through the genesis path
    /// ([`State::genesis`] / [`State::bootstrap_account`]); every other
    /// account starts at zero and is funded by transfer, so registration
    /// cannot disturb conservation.
    pub fn create_account(&mut self, key: PublicKey) -> Result<(), ErgError> {
        if self.contains(&key) {
            return Err(ErgError::AccountExists(key.to_hex()));
        }
        self.insert_account(Account::new(key, 0.0))?;
        Ok(())
    }

    /// Genesis-context creation: credits an initial balance and raises
    /// `total_supply` to match. Used by [`State::genesis`] and by sharded
    /// ledger bootstrap; never reachable from the transfer path.
    pub fn bootstrap_account(&mut self, key: PublicKey, balance: Amount) -> Result<(), ErgError> {
        if !balance.is_finite() || balance < 0.0 {
            return Err(ErgError::InvalidAmount);
        }
        if self.contains(&key) {
            return Err(ErgError::AccountExists(key.to_hex()));
        }
        self.insert_account(Account::new(key, balance))?;
        if balance > 0.0 {
            self.total_supply += balance;
        }
        Ok(())
    }

    fn insert_account(&mut self, account: Account) -> Result<usize, ErgError> {
        if self.accounts.len() >= MAX_ACCOUNTS {
            return Err(ErgError::CapacityExceeded { max: MAX_ACCOUNTS });
        }
        let idx = self.accounts.len();
        self.index.insert(account.public_key, idx);
        self.accounts.push(account);
        Ok(idx)
    }

    // ── Transfer execution ───────────────────────────────────────────────────

    /// Validate and apply a signed transfer.
    ///
    /// On any failure the state is left exactly as it was (the one benign
    /// exception: a receiver account auto-created at zero balance survives a
    /// later pair-sum failure, which cannot disturb conservation).
    pub fn execute(&mut self, tx: &Transaction, now: Timestamp) -> Result<(), ErgError> {
        verify_transaction(tx)?;

        let sender_idx = *self
            .index
            .get(&tx.from)
            .ok_or_else(|| ErgError::AccountNotFound(tx.from.to_hex()))?;

        // Nonce mismatch is reported as an authentication failure: a replayed
        // or out-of-order transaction is indistinguishable from a forgery.
        if tx.nonce != self.accounts[sender_idx].nonce {
            return Err(ErgError::InvalidSignature);
        }

        if !tx.amount.is_finite() || tx.amount <= 0.0 {
            return Err(ErgError::InvalidAmount);
        }

        if self.accounts[sender_idx].balance < tx.amount {
            return Err(ErgError::InsufficientFunds {
                need: tx.amount,
                have: self.accounts[sender_idx].balance,
            });
        }

        let receiver_idx = match self.index.get(&tx.to) {
            Some(&i) => i,
            None => self.insert_account(Account::new(tx.to, 0.0))?,
        };

        if sender_idx == receiver_idx {
            // Self-transfer: balance untouched, nonce still consumed.
            self.accounts[sender_idx].nonce += 1;
        } else {
            let old_sender = self.accounts[sender_idx].clone();
            let old_receiver = self.accounts[receiver_idx].clone();
            let before_sum = old_sender.balance + old_receiver.balance;

            self.accounts[sender_idx].balance -= tx.amount;
            self.accounts[receiver_idx].balance += tx.amount;
            self.accounts[sender_idx].nonce += 1;

            let after_sum =
                self.accounts[sender_idx].balance + self.accounts[receiver_idx].balance;
            if (before_sum - after_sum).abs() > EPS_TRANSFER {
                // Bit-for-bit rollback of the pair.
                self.accounts[sender_idx] = old_sender;
                self.accounts[receiver_idx] = old_receiver;
                warn!(
                    amount = tx.amount,
                    drift = (before_sum - after_sum).abs(),
                    "transfer pair sum drifted, rolled back"
                );
                return Err(ErgError::ConservationViolated {
                    expected: before_sum,
                    actual: after_sum,
                });
            }
        }

        self.commit_transition(now);
        Ok(())
    }

    /// Recompute Σ balances and compare against the recorded supply.
    pub fn verify_conservation(&self) -> Result<(), ErgError> {
        let actual: f64 = self.accounts.iter().map(|a| a.balance).sum();
        if (actual - self.total_supply).abs() > EPS_CONSERVATION {
            return Err(ErgError::ConservationViolated {
                expected: self.total_supply,
                actual,
            });
        }
        Ok(())
    }

    // ── Validated-mutation primitives ────────────────────────────────────────
    //
    // These bypass transfer validation. They exist for the two paths that
    // have already proven a transition valid by other means: delta
    // application (erg-sync, after its five checks) and cross-shard
    // settlement (erg-shard, inside the two-phase protocol). Callers must
    // finish with `commit_transition`.

    /// Set an account's balance and nonce directly, creating the account if
    /// absent. Does not touch `total_supply` or the hash.
    pub fn apply_change(
        &mut self,
        key: PublicKey,
        new_balance: Amount,
        new_nonce: Nonce,
    ) -> Result<(), ErgError> {
        let idx = match self.index.get(&key) {
            Some(&i) => i,
            None => self.insert_account(Account::new(key, 0.0))?,
        };
        self.accounts[idx].balance = new_balance;
        self.accounts[idx].nonce = new_nonce;
        Ok(())
    }

    /// Overwrite the recorded total supply (cross-shard settlement moves
    /// supply between shard-local states).
    pub fn set_total_supply(&mut self, supply: Amount) {
        self.total_supply = supply;
    }

    /// Seal the current mutation as one transition: advance the hash chain
    /// and version, stamp the timestamp, recompute the state hash.
    pub fn commit_transition(&mut self, now: Timestamp) {
        self.timestamp = now;
        self.prev_hash = self.state_hash;
        self.version += 1;
        self.state_hash = self.compute_hash();
    }

    // ── Hashing ──────────────────────────────────────────────────────────────

    /// SHA-256 over (version ‖ timestamp ‖ account count ‖ total supply ‖
    /// prev hash ‖ each account's (pubkey ‖ balance ‖ nonce) in insertion
    /// order). Integers little-endian, balances as raw f64 bits.
    pub fn compute_hash(&self) -> StateHash {
        let mut h = Sha256::new();
        h.update(self.version.to_le_bytes());
        h.update(self.timestamp.to_le_bytes());
        h.update((self.accounts.len() as u32).to_le_bytes());
        h.update(self.total_supply.to_bits().to_le_bytes());
        h.update(self.prev_hash.as_bytes());
        for acc in &self.accounts {
            h.update(acc.public_key.as_bytes());
            h.update(acc.balance.to_bits().to_le_bytes());
            h.update(acc.nonce.to_le_bytes());
        }
        StateHash::from_bytes(h.finalize().into())
    }

    /// Restore a state decoded from a snapshot. Internal to the codec.
    pub(crate) fn from_parts(
        version: u64,
        timestamp: Timestamp,
        accounts: Vec<Account>,
        total_supply: Amount,
        state_hash: StateHash,
        prev_hash: StateHash,
    ) -> Self {
        let index = accounts
            .iter()
            .enumerate()
            .map(|(i, a)| (a.public_key, i))
            .collect();
        Self {
            version,
            timestamp,
            accounts,
            index,
            total_supply,
            state_hash,
            prev_hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use erg_crypto::Keypair;

    const NOW: Timestamp = 1_000_000;

    fn transfer(kp: &Keypair, to: PublicKey, amount: f64, nonce: u64) -> Transaction {
        let mut tx = Transaction::new(kp.public(), to, amount, nonce, NOW);
        kp.sign_transaction(&mut tx).unwrap();
        tx
    }

    #[test]
    fn genesis_holds_full_supply() {
        let founder = Keypair::generate();
        let state = State::genesis(founder.public(), 1000.0, NOW).unwrap();
        assert_eq!(state.account(&founder.public()).unwrap().balance, 1000.0);
        assert_eq!(state.total_supply(), 1000.0);
        state.verify_conservation().unwrap();
    }

    #[test]
    fn genesis_rejects_nonpositive_supply() {
        let founder = Keypair::generate();
        assert!(State::genesis(founder.public(), 0.0, NOW).is_err());
        assert!(State::genesis(founder.public(), -5.0, NOW).is_err());
        assert!(State::genesis(founder.public(), f64::NAN, NOW).is_err());
    }

    #[test]
    fn happy_path_transfer() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let mut state = State::genesis(a.public(), 1000.0, NOW).unwrap();

        state
            .execute(&transfer(&a, b.public(), 100.0, 0), NOW + 1)
            .unwrap();

        assert_eq!(state.account(&a.public()).unwrap().balance, 900.0);
        assert_eq!(state.account(&b.public()).unwrap().balance, 100.0);
        assert_eq!(state.account(&a.public()).unwrap().nonce, 1);
        assert_eq!(state.total_supply(), 1000.0);
        state.verify_conservation().unwrap();
    }

    #[test]
    fn insufficient_funds_leaves_state_unchanged() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let mut state = State::genesis(a.public(), 100.0, NOW).unwrap();
        state.create_account(b.public()).unwrap();
        let hash_before = state.state_hash();

        let err = state
            .execute(&transfer(&a, b.public(), 200.0, 0), NOW + 1)
            .unwrap_err();
        assert!(matches!(err, ErgError::InsufficientFunds { .. }));

        assert_eq!(state.account(&a.public()).unwrap().balance, 100.0);
        assert_eq!(state.account(&a.public()).unwrap().nonce, 0);
        assert_eq!(state.total_supply(), 100.0);
        assert_eq!(state.state_hash(), hash_before);
    }

    #[test]
    fn replayed_transaction_rejected() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let mut state = State::genesis(a.public(), 1000.0, NOW).unwrap();

        let tx = transfer(&a, b.public(), 100.0, 0);
        state.execute(&tx, NOW + 1).unwrap();
        let hash = state.state_hash();

        // Same bytes again: the sender's nonce has moved on.
        let err = state.execute(&tx, NOW + 2).unwrap_err();
        assert!(matches!(err, ErgError::InvalidSignature));
        assert_eq!(state.state_hash(), hash);
    }

    #[test]
    fn tampered_amount_rejected() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let mut state = State::genesis(a.public(), 1000.0, NOW).unwrap();

        let mut tx = transfer(&a, b.public(), 100.0, 0);
        tx.amount = 900.0;
        let err = state.execute(&tx, NOW + 1).unwrap_err();
        assert!(matches!(err, ErgError::InvalidSignature));
        assert_eq!(state.account(&a.public()).unwrap().balance, 1000.0);
    }

    #[test]
    fn zero_amount_rejected() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let mut state = State::genesis(a.public(), 1000.0, NOW).unwrap();
        let err = state
            .execute(&transfer(&a, b.public(), 0.0, 0), NOW + 1)
            .unwrap_err();
        assert!(matches!(err, ErgError::InvalidAmount));
    }

    #[test]
    fn self_transfer_consumes_nonce_only() {
        let a = Keypair::generate();
        let mut state = State::genesis(a.public(), 1000.0, NOW).unwrap();
        state
            .execute(&transfer(&a, a.public(), 50.0, 0), NOW + 1)
            .unwrap();
        let acc = state.account(&a.public()).unwrap();
        assert_eq!(acc.balance, 1000.0);
        assert_eq!(acc.nonce, 1);
        state.verify_conservation().unwrap();
    }

    #[test]
    fn hash_chain_links_transitions() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let mut state = State::genesis(a.public(), 1000.0, NOW).unwrap();
        let genesis_hash = state.state_hash();

        state
            .execute(&transfer(&a, b.public(), 10.0, 0), NOW + 1)
            .unwrap();
        assert_eq!(state.prev_hash(), genesis_hash);

        let h1 = state.state_hash();
        state
            .execute(&transfer(&a, b.public(), 10.0, 1), NOW + 2)
            .unwrap();
        assert_eq!(state.prev_hash(), h1);
        assert_ne!(state.state_hash(), h1);
    }

    #[test]
    fn identical_histories_hash_identically() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let txs: Vec<Transaction> = (0..5)
            .map(|i| transfer(&a, b.public(), 10.0 + i as f64, i))
            .collect();

        let mut s1 = State::genesis(a.public(), 1000.0, NOW).unwrap();
        let mut s2 = State::genesis(a.public(), 1000.0, NOW).unwrap();
        for (i, tx) in txs.iter().enumerate() {
            let ts = NOW + 1 + i as u64;
            s1.execute(tx, ts).unwrap();
            s2.execute(tx, ts).unwrap();
        }
        assert_eq!(s1.state_hash(), s2.state_hash());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let mut state = State::genesis(a.public(), 1000.0, NOW).unwrap();
        state.create_account(b.public()).unwrap();
        assert!(matches!(
            state.create_account(b.public()),
            Err(ErgError::AccountExists(_))
        ));
    }

    #[test]
    fn conservation_survives_random_workload() {
        // 100 accounts, 1_000_000 total supply, 1000 random-ish transfers.
        let keys: Vec<Keypair> = (0..100).map(|_| Keypair::generate()).collect();
        let mut state = State::genesis(keys[0].public(), 1_000_000.0, NOW).unwrap();
        for k in &keys[1..] {
            state.create_account(k.public()).unwrap();
        }

        // Deterministic pseudo-random walk (no RNG so the test is stable).
        let mut x: u64 = 0x9E37_79B9;
        let mut next = || {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x
        };

        let mut applied = 0u32;
        for step in 0..1000u64 {
            let si = (next() % 100) as usize;
            let ri = (next() % 100) as usize;
            let sender = &keys[si];
            let Some(acc) = state.account(&sender.public()).cloned() else {
                continue;
            };
            if acc.balance <= 1.0 {
                continue;
            }
            let cap = (acc.balance / 2.0).min(100.0);
            let amount = 1.0 + (next() % 1000) as f64 / 1000.0 * (cap - 1.0).max(0.0);
            let tx = transfer(sender, keys[ri].public(), amount, acc.nonce);
            if state.execute(&tx, NOW + step).is_ok() {
                applied += 1;
            }
        }

        assert!(applied > 0, "workload applied no transfers");
        let total: f64 = state.accounts().iter().map(|a| a.balance).sum();
        assert!(
            (total - 1_000_000.0).abs() < 1e-9,
            "conservation drifted: {total}"
        );
        state.verify_conservation().unwrap();
    }
}
