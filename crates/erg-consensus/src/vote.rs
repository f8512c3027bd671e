use ed25519_dalek::{Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use erg_core::{PublicKey, Signature, StateHash, Timestamp};
use erg_crypto::Keypair;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteChoice {
    Approve,
    Reject,
    Abstain,
}

/// A validator's signed vote on a proposal. The signature covers the
/// proposal hash; duplicate votes from one validator are dropped at the
/// tally, so only the multiset of (validator, vote) matters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vote {
    pub sequence_num: u64,
    pub round: u64,
    pub proposal_hash: StateHash,
    pub validator: PublicKey,
    pub signature: Signature,
    pub choice: VoteChoice,
    pub timestamp: Timestamp,
    /// Optional short explanation, meaningful on Reject.
    pub reason: Option<String>,
}

impl Vote {
    pub fn new_signed(
        keypair: &Keypair,
        sequence_num: u64,
        round: u64,
        proposal_hash: StateHash,
        choice: VoteChoice,
        now: Timestamp,
        reason: Option<String>,
    ) -> Self {
        Self {
            sequence_num,
            round,
            proposal_hash,
            validator: keypair.public(),
            signature: keypair.sign(proposal_hash.as_bytes()),
            choice,
            timestamp: now,
            reason,
        }
    }

    pub fn verify_signature(&self) -> bool {
        if self.signature.has_zero_prefix() {
            return false;
        }
        let Ok(key) = VerifyingKey::from_bytes(self.validator.as_bytes()) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(self.signature.as_bytes());
        key.verify(self.proposal_hash.as_bytes(), &sig).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_vote_verifies() {
        let kp = Keypair::generate();
        let vote = Vote::new_signed(
            &kp,
            1,
            0,
            StateHash::from_bytes([9; 32]),
            VoteChoice::Approve,
            500,
            None,
        );
        assert!(vote.verify_signature());
    }

    #[test]
    fn vote_from_wrong_key_fails() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let mut vote = Vote::new_signed(
            &kp,
            1,
            0,
            StateHash::from_bytes([9; 32]),
            VoteChoice::Reject,
            500,
            Some("supply mismatch".into()),
        );
        vote.validator = other.public();
        assert!(!vote.verify_signature());
    }
}
