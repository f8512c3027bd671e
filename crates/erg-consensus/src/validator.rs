use serde::{Deserialize, Serialize};

use erg_core::{ErgError, PublicKey, Timestamp, MAX_VALIDATORS};

/// One registered validator. Registration happens out-of-band (operator
/// action); the `active` flag determines quorum membership.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Validator {
    pub pubkey: PublicKey,
    pub name: String,
    pub joined_at: Timestamp,
    pub last_seen: Timestamp,
    pub proposals_made: u64,
    pub validations_made: u64,
    /// Participation score in [0, 1]; informational, not quorum-weighted.
    pub reputation: f64,
    pub active: bool,
}

/// The validator registry. Registration order is stable and drives
/// round-robin leader selection, so it must be identical on every replica.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
}

impl ValidatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        pubkey: PublicKey,
        name: impl Into<String>,
        now: Timestamp,
    ) -> Result<(), ErgError> {
        if self.validators.len() >= MAX_VALIDATORS {
            return Err(ErgError::ValidatorSetFull {
                max: MAX_VALIDATORS,
            });
        }
        if self.validators.iter().any(|v| v.pubkey == pubkey) {
            return Err(ErgError::ValidatorExists(pubkey.to_hex()));
        }
        self.validators.push(Validator {
            pubkey,
            name: name.into(),
            joined_at: now,
            last_seen: now,
            proposals_made: 0,
            validations_made: 0,
            reputation: 1.0,
            active: true,
        });
        Ok(())
    }

    /// Deactivate without removal: history and counters are retained.
    pub fn deactivate(&mut self, pubkey: &PublicKey) -> Result<(), ErgError> {
        let v = self
            .validators
            .iter_mut()
            .find(|v| v.pubkey == *pubkey)
            .ok_or_else(|| ErgError::NotValidator(pubkey.to_hex()))?;
        v.active = false;
        Ok(())
    }

    pub fn get(&self, pubkey: &PublicKey) -> Option<&Validator> {
        self.validators.iter().find(|v| v.pubkey == *pubkey)
    }

    pub fn is_active(&self, pubkey: &PublicKey) -> bool {
        self.get(pubkey).is_some_and(|v| v.active)
    }

    pub fn active_count(&self) -> usize {
        self.validators.iter().filter(|v| v.active).count()
    }

    pub fn total_count(&self) -> usize {
        self.validators.len()
    }

    pub fn all(&self) -> &[Validator] {
        &self.validators
    }

    /// Quorum threshold: ceil(2/3 · active).
    pub fn quorum(&self) -> usize {
        let active = self.active_count();
        // ceil(2n/3) = (2n + 2) / 3
        (2 * active + 2) / 3
    }

    /// Round-robin leader: the (`leader_index` mod active)'th active
    /// validator in registration order.
    pub fn leader(&self, leader_index: u64) -> Option<&Validator> {
        let active = self.active_count();
        if active == 0 {
            return None;
        }
        let target = (leader_index % active as u64) as usize;
        self.validators.iter().filter(|v| v.active).nth(target)
    }

    // ── Participation bookkeeping ────────────────────────────────────────────

    pub fn record_proposal(&mut self, pubkey: &PublicKey, now: Timestamp) {
        if let Some(v) = self.validators.iter_mut().find(|v| v.pubkey == *pubkey) {
            v.proposals_made += 1;
            v.last_seen = now;
            v.reputation = (v.reputation + 0.01).min(1.0);
        }
    }

    pub fn record_validation(&mut self, pubkey: &PublicKey, now: Timestamp) {
        if let Some(v) = self.validators.iter_mut().find(|v| v.pubkey == *pubkey) {
            v.validations_made += 1;
            v.last_seen = now;
            v.reputation = (v.reputation + 0.01).min(1.0);
        }
    }

    /// Penalise a leader whose round timed out.
    pub fn record_missed_round(&mut self, pubkey: &PublicKey) {
        if let Some(v) = self.validators.iter_mut().find(|v| v.pubkey == *pubkey) {
            v.reputation = (v.reputation - 0.1).max(0.0);
        }
    }
}
