use ed25519_dalek::{Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use erg_core::{Amount, PublicKey, Signature, StateHash, Timestamp};
use erg_crypto::Keypair;

/// A state-transition proposal — the consensus unit. Binds the previous and
/// proposed state hashes to a zero balance-change sum under the proposer's
/// signature.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Proposal {
    pub sequence_num: u64,
    pub round: u64,
    pub prev_state_hash: StateHash,
    pub new_state_hash: StateHash,
    /// Must equal the committed state's supply — conservation.
    pub total_supply: Amount,
    /// Signed sum of per-account balance changes; zero for a valid proposal.
    pub delta_sum: f64,
    pub timestamp: Timestamp,
    pub proposer: PublicKey,
    pub signature: Signature,
    pub num_transactions: u32,
}

impl Proposal {
    /// SHA-256 over the canonical field order (everything but the
    /// signature). This is what the proposer signs and what votes reference.
    pub fn hash(&self) -> StateHash {
        let mut h = Sha256::new();
        h.update(self.sequence_num.to_le_bytes());
        h.update(self.round.to_le_bytes());
        h.update(self.prev_state_hash.as_bytes());
        h.update(self.new_state_hash.as_bytes());
        h.update(self.total_supply.to_bits().to_le_bytes());
        h.update(self.delta_sum.to_bits().to_le_bytes());
        h.update(self.timestamp.to_le_bytes());
        h.update(self.proposer.as_bytes());
        h.update(self.num_transactions.to_le_bytes());
        StateHash::from_bytes(h.finalize().into())
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        self.signature = keypair.sign(self.hash().as_bytes());
    }

    pub fn verify_signature(&self) -> bool {
        if self.signature.has_zero_prefix() {
            return false;
        }
        let Ok(key) = VerifyingKey::from_bytes(self.proposer.as_bytes()) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(self.signature.as_bytes());
        key.verify(self.hash().as_bytes(), &sig).is_ok()
    }
}
