use tracing::warn;

use erg_core::{
    Amount, ErgError, Nonce, PublicKey, StateHash, Timestamp, DELTA_CHANGE_LEN, DELTA_HEADER_LEN,
    EPS_CONSERVATION, MAX_DELTA_CHANGES,
};
use erg_state::State;

/// One account's change between two states.
#[derive(Clone, Debug, PartialEq)]
pub struct AccountChange {
    pub pubkey: PublicKey,
    pub old_balance: Amount,
    pub new_balance: Amount,
    pub old_nonce: Nonce,
    pub new_nonce: Nonce,
}

/// A compact record of one state transition, chained by hash. Applying a
/// delta at a receiver reproduces the sender's state bit-for-bit or fails
/// without touching anything.
#[derive(Clone, Debug, PartialEq)]
pub struct StateDelta {
    pub prev_hash: StateHash,
    pub new_hash: StateHash,
    pub prev_timestamp: Timestamp,
    pub new_timestamp: Timestamp,
    /// Claimed post-transition supply, re-verified on application.
    pub total_supply: Amount,
    pub changes: Vec<AccountChange>,
}

impl StateDelta {
    /// Collect every account that differs between `before` and `after`.
    pub fn compute(before: &State, after: &State) -> Self {
        let mut changes = Vec::new();
        for acc in after.accounts() {
            let old = before.account(&acc.public_key);
            let (old_balance, old_nonce) = old.map_or((0.0, 0), |a| (a.balance, a.nonce));
            let changed = match old {
                None => true,
                Some(a) => a.balance != acc.balance || a.nonce != acc.nonce,
            };
            if changed && changes.len() < MAX_DELTA_CHANGES {
                changes.push(AccountChange {
                    pubkey: acc.public_key,
                    old_balance,
                    new_balance: acc.balance,
                    old_nonce,
                    new_nonce: acc.nonce,
                });
            }
        }
        Self {
            prev_hash: before.state_hash(),
            new_hash: after.state_hash(),
            prev_timestamp: before.timestamp(),
            new_timestamp: after.timestamp(),
            total_supply: after.total_supply(),
            changes,
        }
    }

    /// Internal consistency: no duplicate accounts, no negative balances,
    /// non-negative supply.
    pub fn verify(&self) -> Result<(), ErgError> {
        for (i, a) in self.changes.iter().enumerate() {
            for b in &self.changes[i + 1..] {
                if a.pubkey == b.pubkey {
                    return Err(ErgError::Serialization(format!(
                        "duplicate account in delta: {}",
                        a.pubkey
                    )));
                }
            }
        }
        if self.changes.iter().any(|c| c.new_balance < 0.0) {
            return Err(ErgError::InvalidAmount);
        }
        if self.total_supply < 0.0 {
            return Err(ErgError::InvalidAmount);
        }
        Ok(())
    }

    /// Apply this delta to `state`.
    ///
    /// Checks, in order: (1) the delta chains from the current state hash;
    /// (2) simulated application conserves the claimed supply; (3) supply is
    /// unchanged across the transition; (4) after application the recomputed
    /// state hash bit-matches `new_hash`; (5) the final state passes the
    /// conservation check. Any failure leaves `state` untouched.
    pub fn apply(&self, state: &mut State) -> Result<(), ErgError> {
        if state.state_hash() != self.prev_hash {
            warn!("delta does not chain from current state");
            return Err(ErgError::ChainMismatch);
        }
        self.verify()?;

        // Simulate: net effect of the changes against the current balances.
        let current_sum: f64 = state.accounts().iter().map(|a| a.balance).sum();
        let mut effect = 0.0;
        for ch in &self.changes {
            let current = state.account(&ch.pubkey).map_or(0.0, |a| a.balance);
            effect += ch.new_balance - current;
        }
        let new_sum = current_sum + effect;
        if (new_sum - self.total_supply).abs() > EPS_CONSERVATION {
            warn!(
                claimed = self.total_supply,
                simulated = new_sum,
                "delta fails conservation simulation"
            );
            return Err(ErgError::ConservationViolated {
                expected: self.total_supply,
                actual: new_sum,
            });
        }

        // Supply must be invariant across every non-genesis transition.
        if state.total_supply() > 0.0
            && (self.total_supply - state.total_supply()).abs() > EPS_CONSERVATION
        {
            return Err(ErgError::ConservationViolated {
                expected: state.total_supply(),
                actual: self.total_supply,
            });
        }

        // Apply to a scratch copy so failure cannot leave partial writes.
        let mut next = state.clone();
        for ch in &self.changes {
            next.apply_change(ch.pubkey, ch.new_balance, ch.new_nonce)?;
        }
        next.commit_transition(self.new_timestamp);

        if next.state_hash() != self.new_hash {
            warn!(
                expected = %self.new_hash,
                got = %next.state_hash(),
                "state hash mismatch after delta application"
            );
            return Err(ErgError::ChainMismatch);
        }
        next.verify_conservation()?;

        *state = next;
        Ok(())
    }

    /// True if `pubkey` appears in this delta.
    pub fn affects(&self, pubkey: &PublicKey) -> bool {
        self.changes.iter().any(|c| c.pubkey == *pubkey)
    }

    /// Restrict to the given accounts (light clients tracking a few keys).
    /// The filtered delta keeps the full chain hashes, so it can prove
    /// relevance but no longer applies cleanly.
    pub fn filter(&self, keys: &[PublicKey]) -> Self {
        Self {
            prev_hash: self.prev_hash,
            new_hash: self.new_hash,
            prev_timestamp: self.prev_timestamp,
            new_timestamp: self.new_timestamp,
            total_supply: self.total_supply,
            changes: self
                .changes
                .iter()
                .filter(|c| keys.contains(&c.pubkey))
                .cloned()
                .collect(),
        }
    }

    // ── Packed codec ─────────────────────────────────────────────────────────

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(DELTA_HEADER_LEN + self.changes.len() * DELTA_CHANGE_LEN);
        buf.extend_from_slice(self.prev_hash.as_bytes());
        buf.extend_from_slice(self.new_hash.as_bytes());
        buf.extend_from_slice(&self.prev_timestamp.to_le_bytes());
        buf.extend_from_slice(&self.new_timestamp.to_le_bytes());
        buf.extend_from_slice(&(self.changes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.total_supply.to_bits().to_le_bytes());
        for ch in &self.changes {
            buf.extend_from_slice(ch.pubkey.as_bytes());
            buf.extend_from_slice(&ch.old_balance.to_bits().to_le_bytes());
            buf.extend_from_slice(&ch.new_balance.to_bits().to_le_bytes());
            buf.extend_from_slice(&ch.old_nonce.to_le_bytes());
            buf.extend_from_slice(&ch.new_nonce.to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, ErgError> {
        if buf.len() < DELTA_HEADER_LEN {
            return Err(ErgError::Serialization(format!(
                "delta too short: {} bytes",
                buf.len()
            )));
        }
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&buf[..32]);
        let mut new = [0u8; 32];
        new.copy_from_slice(&buf[32..64]);
        let prev_timestamp = u64::from_le_bytes(buf[64..72].try_into().unwrap());
        let new_timestamp = u64::from_le_bytes(buf[72..80].try_into().unwrap());
        let count = u32::from_le_bytes(buf[80..84].try_into().unwrap()) as usize;
        let total_supply = f64::from_bits(u64::from_le_bytes(buf[84..92].try_into().unwrap()));

        if count > MAX_DELTA_CHANGES {
            return Err(ErgError::Serialization(format!(
                "delta claims {count} changes (max {MAX_DELTA_CHANGES})"
            )));
        }
        let need = DELTA_HEADER_LEN + count * DELTA_CHANGE_LEN;
        if buf.len() < need {
            return Err(ErgError::Serialization(format!(
                "delta truncated: need {need} bytes, have {}",
                buf.len()
            )));
        }

        let mut changes = Vec::with_capacity(count);
        for i in 0..count {
            let off = DELTA_HEADER_LEN + i * DELTA_CHANGE_LEN;
            let rec = &buf[off..off + DELTA_CHANGE_LEN];
            let mut pk = [0u8; 32];
            pk.copy_from_slice(&rec[..32]);
            changes.push(AccountChange {
                pubkey: PublicKey::from_bytes(pk),
                old_balance: f64::from_bits(u64::from_le_bytes(rec[32..40].try_into().unwrap())),
                new_balance: f64::from_bits(u64::from_le_bytes(rec[40..48].try_into().unwrap())),
                old_nonce: u64::from_le_bytes(rec[48..56].try_into().unwrap()),
                new_nonce: u64::from_le_bytes(rec[56..64].try_into().unwrap()),
            });
        }

        Ok(Self {
            prev_hash: StateHash::from_bytes(prev),
            new_hash: StateHash::from_bytes(new),
            prev_timestamp,
            new_timestamp,
            total_supply,
            changes,
        })
    }
}
