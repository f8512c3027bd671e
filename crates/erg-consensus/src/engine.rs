use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use erg_core::{
    ErgError, PublicKey, Signature, Timestamp, EPS_TRANSFER, MIN_VALIDATORS_FOR_QUORUM,
    ROUND_TIMEOUT_SECS,
};
use erg_crypto::Keypair;
use erg_state::State;

use crate::locks::CrossShardLockTable;
use crate::proposal::Proposal;
use crate::validator::ValidatorSet;
use crate::vote::{Vote, VoteChoice};

/// Consensus phases for one height.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Waiting for the next round to start.
    Idle,
    /// Leader has proposed and auto-approved.
    PrePrepare,
    /// At least one non-leader vote received.
    Prepare,
    /// Quorum of approvals reached; stragglers may still vote.
    Commit,
    /// Height advanced; transient before the reset to Idle.
    Finalized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuorumStatus {
    Pending,
    Approved,
    Rejected,
}

/// The Proof-of-Conservation consensus engine. Exclusively owns the
/// validator set, the current proposal, and the vote tally. It also holds
/// the cross-shard lock table on behalf of shard executors, which drive
/// acquire/commit/expiry through [`Self::locks_mut`]; the phase machine
/// itself never consults the locks.
#[derive(Serialize, Deserialize)]
pub struct PocConsensus {
    validators: ValidatorSet,
    height: u64,
    round: u64,
    phase: Phase,
    proposal: Option<Proposal>,
    votes: Vec<Vote>,
    leader_index: u64,
    round_start: Timestamp,
    last_finalized: Timestamp,
    locks: CrossShardLockTable,
}

impl PocConsensus {
    pub fn new(now: Timestamp) -> Self {
        Self {
            validators: ValidatorSet::new(),
            height: 0,
            round: 0,
            phase: Phase::Idle,
            proposal: None,
            votes: Vec::new(),
            leader_index: 0,
            round_start: now,
            last_finalized: now,
            locks: CrossShardLockTable::new(),
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    /// Direct access for bootstrap wiring; during operation prefer
    /// [`Self::register_validator`] / [`Self::deactivate_validator`], which
    /// enforce the change window.
    pub fn validators_mut(&mut self) -> &mut ValidatorSet {
        &mut self.validators
    }

    /// Register a validator. The set may only change between finalized
    /// heights, never while a proposal is being voted on.
    pub fn register_validator(
        &mut self,
        pubkey: PublicKey,
        name: impl Into<String>,
        now: Timestamp,
    ) -> Result<(), ErgError> {
        if self.proposal.is_some() {
            return Err(ErgError::ValidatorChangeDuringRound);
        }
        self.validators.register(pubkey, name, now)
    }

    pub fn deactivate_validator(&mut self, pubkey: &PublicKey) -> Result<(), ErgError> {
        if self.proposal.is_some() {
            return Err(ErgError::ValidatorChangeDuringRound);
        }
        self.validators.deactivate(pubkey)
    }

    pub fn current_proposal(&self) -> Option<&Proposal> {
        self.proposal.as_ref()
    }

    pub fn votes(&self) -> &[Vote] {
        &self.votes
    }

    pub fn current_leader(&self) -> Option<PublicKey> {
        self.validators.leader(self.leader_index).map(|v| v.pubkey)
    }

    pub fn locks(&self) -> &CrossShardLockTable {
        &self.locks
    }

    pub fn locks_mut(&mut self) -> &mut CrossShardLockTable {
        &mut self.locks
    }

    fn require_operational(&self) -> Result<(), ErgError> {
        let active = self.validators.active_count();
        if active < MIN_VALIDATORS_FOR_QUORUM {
            return Err(ErgError::InsufficientValidators {
                need: MIN_VALIDATORS_FOR_QUORUM,
                have: active,
            });
        }
        Ok(())
    }

    // ── Proposing ────────────────────────────────────────────────────────────

    /// Verify the conservation predicate over a (before, after) pair:
    /// supply unchanged, both states internally conserved, no negative
    /// balances after, and the signed sum of balance changes zero.
    fn verify_conservation_pair(before: &State, after: &State) -> Result<f64, ErgError> {
        if (before.total_supply() - after.total_supply()).abs() > EPS_TRANSFER {
            return Err(ErgError::ConservationViolated {
                expected: before.total_supply(),
                actual: after.total_supply(),
            });
        }
        before.verify_conservation()?;
        after.verify_conservation()?;

        let mut delta_sum = 0.0;
        for acc in after.accounts() {
            if acc.balance < 0.0 {
                return Err(ErgError::InvalidAmount);
            }
            let old = before.account(&acc.public_key).map_or(0.0, |a| a.balance);
            delta_sum += acc.balance - old;
        }
        if delta_sum.abs() > EPS_TRANSFER {
            return Err(ErgError::ConservationViolated {
                expected: 0.0,
                actual: delta_sum,
            });
        }
        Ok(delta_sum)
    }

    /// Build, sign, and adopt a proposal for the transition `before → after`.
    /// Caller must be the current leader. The proposer's approve vote is
    /// recorded immediately.
    pub fn propose_transition(
        &mut self,
        before: &State,
        after: &State,
        keypair: &Keypair,
        now: Timestamp,
    ) -> Result<Proposal, ErgError> {
        self.require_operational()?;

        let leader = self.current_leader().ok_or(ErgError::NotLeader)?;
        if leader != keypair.public() {
            return Err(ErgError::NotLeader);
        }

        let delta_sum = Self::verify_conservation_pair(before, after)?;

        let mut proposal = Proposal {
            sequence_num: self.height + 1,
            round: self.round,
            prev_state_hash: before.state_hash(),
            new_state_hash: after.state_hash(),
            total_supply: after.total_supply(),
            delta_sum,
            timestamp: now,
            proposer: keypair.public(),
            signature: Signature::empty(),
            num_transactions: after.version().saturating_sub(before.version()) as u32,
        };
        proposal.sign(keypair);

        let auto_vote = Vote::new_signed(
            keypair,
            proposal.sequence_num,
            proposal.round,
            proposal.hash(),
            VoteChoice::Approve,
            now,
            None,
        );

        self.proposal = Some(proposal.clone());
        self.votes.clear();
        self.votes.push(auto_vote);
        self.phase = Phase::PrePrepare;
        self.round_start = now;
        self.validators.record_proposal(&keypair.public(), now);

        info!(
            sequence = proposal.sequence_num,
            round = proposal.round,
            txs = proposal.num_transactions,
            "proposed state transition"
        );
        Ok(proposal)
    }

    /// Validate an incoming proposal against the locally committed state.
    pub fn validate_proposal(
        &self,
        proposal: &Proposal,
        current_state: &State,
    ) -> Result<(), ErgError> {
        if !self.validators.is_active(&proposal.proposer) {
            return Err(ErgError::NotValidator(proposal.proposer.to_hex()));
        }
        if proposal.sequence_num != self.height + 1 {
            return Err(ErgError::StaleProposal {
                expected: self.height + 1,
                got: proposal.sequence_num,
            });
        }
        if proposal.prev_state_hash != current_state.state_hash() {
            return Err(ErgError::ChainMismatch);
        }
        if (proposal.total_supply - current_state.total_supply()).abs() > EPS_TRANSFER {
            return Err(ErgError::ConservationViolated {
                expected: current_state.total_supply(),
                actual: proposal.total_supply,
            });
        }
        if proposal.delta_sum.abs() > EPS_TRANSFER {
            return Err(ErgError::ConservationViolated {
                expected: 0.0,
                actual: proposal.delta_sum,
            });
        }
        if !proposal.verify_signature() {
            return Err(ErgError::InvalidSignature);
        }
        Ok(())
    }

    /// Adopt a proposal received from the current leader (after
    /// [`Self::validate_proposal`] has accepted it).
    pub fn accept_proposal(&mut self, proposal: Proposal, now: Timestamp) {
        self.proposal = Some(proposal);
        self.votes.clear();
        self.phase = Phase::PrePrepare;
        self.round_start = now;
    }

    // ── Voting ───────────────────────────────────────────────────────────────

    /// Record a vote. Non-validators are rejected; duplicate votes from the
    /// same validator are silently dropped (the first vote stands).
    pub fn submit_vote(&mut self, vote: Vote, now: Timestamp) -> Result<QuorumStatus, ErgError> {
        if !self.validators.is_active(&vote.validator) {
            return Err(ErgError::NotValidator(vote.validator.to_hex()));
        }
        let proposal = self.proposal.as_ref().ok_or(ErgError::NoActiveProposal)?;
        if vote.sequence_num != proposal.sequence_num || vote.proposal_hash != proposal.hash() {
            return Err(ErgError::StaleProposal {
                expected: proposal.sequence_num,
                got: vote.sequence_num,
            });
        }
        if !vote.verify_signature() {
            return Err(ErgError::InvalidSignature);
        }

        if self.votes.iter().any(|v| v.validator == vote.validator) {
            return Ok(self.check_quorum());
        }

        let from_leader = Some(vote.validator) == self.current_leader();
        self.validators.record_validation(&vote.validator, now);
        self.votes.push(vote);

        if self.phase == Phase::PrePrepare && !from_leader {
            self.phase = Phase::Prepare;
        }

        let status = self.check_quorum();
        if status == QuorumStatus::Approved && self.phase != Phase::Commit {
            self.phase = Phase::Commit;
            info!(height = self.height + 1, "quorum reached, commit assured");
        }
        Ok(status)
    }

    /// Evaluate the tally: approved once approvals reach the quorum,
    /// rejected once rejections exceed what approvals could still overcome.
    pub fn check_quorum(&self) -> QuorumStatus {
        let active = self.validators.active_count();
        if active < MIN_VALIDATORS_FOR_QUORUM {
            return QuorumStatus::Pending;
        }
        let required = self.validators.quorum();

        let approvals = self
            .votes
            .iter()
            .filter(|v| v.choice == VoteChoice::Approve)
            .count();
        let rejections = self
            .votes
            .iter()
            .filter(|v| v.choice == VoteChoice::Reject)
            .count();

        if approvals >= required {
            QuorumStatus::Approved
        } else if rejections > active - required {
            QuorumStatus::Rejected
        } else {
            QuorumStatus::Pending
        }
    }

    // ── Finalization and rounds ──────────────────────────────────────────────

    /// Commit the approved proposal: advance the height, rotate the leader,
    /// clear the round state. Returns the new height.
    pub fn finalize(&mut self, now: Timestamp) -> Result<u64, ErgError> {
        if self.check_quorum() != QuorumStatus::Approved {
            return Err(ErgError::QuorumNotReached);
        }
        let proposal = self.proposal.take().ok_or(ErgError::NoActiveProposal)?;

        self.phase = Phase::Finalized;
        self.height = proposal.sequence_num;
        self.leader_index += 1;
        self.round = 0;
        self.votes.clear();
        self.last_finalized = now;
        self.round_start = now;
        self.phase = Phase::Idle;

        info!(height = self.height, "state transition finalized");
        Ok(self.height)
    }

    /// Advance the round after a rejection or timeout: same height, next
    /// leader (the previous one is suspected Byzantine or offline).
    pub fn advance_round(&mut self, now: Timestamp) {
        if let Some(leader) = self.current_leader() {
            self.validators.record_missed_round(&leader);
        }
        self.round += 1;
        self.leader_index += 1;
        self.proposal = None;
        self.votes.clear();
        self.phase = Phase::Idle;
        self.round_start = now;
        warn!(height = self.height, round = self.round, "round advanced");
    }

    /// True when an in-flight round has outlived the timeout.
    pub fn round_expired(&self, now: Timestamp) -> bool {
        self.proposal.is_some() && now.saturating_sub(self.round_start) >= ROUND_TIMEOUT_SECS
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ErgError> {
        let bytes =
            bincode::serialize(self).map_err(|e| ErgError::Serialization(e.to_string()))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ErgError> {
        let bytes = std::fs::read(path)?;
        bincode::deserialize(&bytes).map_err(|e| ErgError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use erg_core::Transaction;

    const NOW: Timestamp = 1_000_000;

    struct Net {
        consensus: PocConsensus,
        keypairs: Vec<Keypair>,
    }

    /// A consensus instance with `n` registered validator keypairs.
    fn network(n: usize) -> Net {
        let mut consensus = PocConsensus::new(NOW);
        let keypairs: Vec<Keypair> = (0..n).map(|_| Keypair::generate()).collect();
        for (i, kp) in keypairs.iter().enumerate() {
            consensus
                .validators_mut()
                .register(kp.public(), format!("validator-{i}"), NOW)
                .unwrap();
        }
        Net {
            consensus,
            keypairs,
        }
    }

    /// One genesis-plus-transfer transition pair.
    fn transition(founder: &Keypair) -> (State, State) {
        let receiver = Keypair::generate();
        let before = State::genesis(founder.public(), 1000.0, NOW).unwrap();
        let mut after = before.clone();
        let mut tx = Transaction::new(founder.public(), receiver.public(), 100.0, 0, NOW + 1);
        founder.sign_transaction(&mut tx).unwrap();
        after.execute(&tx, NOW + 1).unwrap();
        (before, after)
    }

    #[test]
    fn refuses_below_min_validators() {
        let mut net = network(2);
        let leader = &net.keypairs[0];
        let (before, after) = transition(leader);
        assert!(matches!(
            net.consensus
                .propose_transition(&before, &after, leader, NOW + 2),
            Err(ErgError::InsufficientValidators { .. })
        ));
    }

    #[test]
    fn non_leader_cannot_propose() {
        let mut net = network(3);
        let not_leader = &net.keypairs[1];
        let (before, after) = transition(not_leader);
        assert!(matches!(
            net.consensus
                .propose_transition(&before, &after, not_leader, NOW + 2),
            Err(ErgError::NotLeader)
        ));
    }

    #[test]
    fn quorum_at_four_validators_needs_three() {
        let mut net = network(4);
        assert_eq!(net.consensus.validators().quorum(), 3);

        let leader = &net.keypairs[0];
        let (before, after) = transition(leader);
        let proposal = net
            .consensus
            .propose_transition(&before, &after, leader, NOW + 2)
            .unwrap();

        // Leader auto-approved: one vote so far.
        assert_eq!(net.consensus.check_quorum(), QuorumStatus::Pending);

        let v2 = Vote::new_signed(
            &net.keypairs[1],
            proposal.sequence_num,
            proposal.round,
            proposal.hash(),
            VoteChoice::Approve,
            NOW + 3,
            None,
        );
        assert_eq!(
            net.consensus.submit_vote(v2, NOW + 3).unwrap(),
            QuorumStatus::Pending
        );

        let v3 = Vote::new_signed(
            &net.keypairs[2],
            proposal.sequence_num,
            proposal.round,
            proposal.hash(),
            VoteChoice::Approve,
            NOW + 4,
            None,
        );
        assert_eq!(
            net.consensus.submit_vote(v3, NOW + 4).unwrap(),
            QuorumStatus::Approved
        );
        assert_eq!(net.consensus.phase(), Phase::Commit);
    }

    #[test]
    fn full_cycle_finalizes_and_rotates_leader() {
        let mut net = network(3);
        let leader = net.consensus.current_leader().unwrap();
        assert_eq!(leader, net.keypairs[0].public());

        let (before, after) = transition(&net.keypairs[0]);
        let proposal = net
            .consensus
            .propose_transition(&before, &after, &net.keypairs[0], NOW + 2)
            .unwrap();

        let v2 = Vote::new_signed(
            &net.keypairs[1],
            proposal.sequence_num,
            proposal.round,
            proposal.hash(),
            VoteChoice::Approve,
            NOW + 3,
            None,
        );
        net.consensus.submit_vote(v2, NOW + 3).unwrap();

        let height = net.consensus.finalize(NOW + 4).unwrap();
        assert_eq!(height, 1);
        assert_eq!(net.consensus.phase(), Phase::Idle);
        assert_eq!(
            net.consensus.current_leader().unwrap(),
            net.keypairs[1].public()
        );
        assert!(net.consensus.current_proposal().is_none());
    }

    #[test]
    fn follower_adopts_validated_proposal() {
        let mut net = network(3);
        // A follower sharing the same validator registry.
        let mut follower = PocConsensus::new(NOW);
        for (i, kp) in net.keypairs.iter().enumerate() {
            follower
                .validators_mut()
                .register(kp.public(), format!("validator-{i}"), NOW)
                .unwrap();
        }

        let (before, after) = transition(&net.keypairs[0]);
        let proposal = net
            .consensus
            .propose_transition(&before, &after, &net.keypairs[0], NOW + 2)
            .unwrap();

        follower.validate_proposal(&proposal, &before).unwrap();
        follower.accept_proposal(proposal.clone(), NOW + 2);

        let v = Vote::new_signed(
            &net.keypairs[1],
            proposal.sequence_num,
            proposal.round,
            proposal.hash(),
            VoteChoice::Approve,
            NOW + 3,
            None,
        );
        // No leader auto-vote on the follower: one approval is still pending.
        assert_eq!(
            follower.submit_vote(v, NOW + 3).unwrap(),
            QuorumStatus::Pending
        );
        assert_eq!(follower.phase(), Phase::Prepare);
    }

    #[test]
    fn finalize_without_quorum_fails() {
        let mut net = network(3);
        let (before, after) = transition(&net.keypairs[0]);
        net.consensus
            .propose_transition(&before, &after, &net.keypairs[0], NOW + 2)
            .unwrap();
        assert!(matches!(
            net.consensus.finalize(NOW + 3),
            Err(ErgError::QuorumNotReached)
        ));
    }

    #[test]
    fn duplicate_votes_silently_dropped() {
        let mut net = network(4);
        let (before, after) = transition(&net.keypairs[0]);
        let proposal = net
            .consensus
            .propose_transition(&before, &after, &net.keypairs[0], NOW + 2)
            .unwrap();

        for _ in 0..5 {
            let v = Vote::new_signed(
                &net.keypairs[1],
                proposal.sequence_num,
                proposal.round,
                proposal.hash(),
                VoteChoice::Approve,
                NOW + 3,
                None,
            );
            net.consensus.submit_vote(v, NOW + 3).unwrap();
        }
        // Leader + one distinct validator, despite five submissions.
        assert_eq!(net.consensus.votes().len(), 2);
        assert_eq!(net.consensus.check_quorum(), QuorumStatus::Pending);
    }

    #[test]
    fn vote_from_unknown_key_rejected() {
        let mut net = network(3);
        let (before, after) = transition(&net.keypairs[0]);
        let proposal = net
            .consensus
            .propose_transition(&before, &after, &net.keypairs[0], NOW + 2)
            .unwrap();

        let stranger = Keypair::generate();
        let v = Vote::new_signed(
            &stranger,
            proposal.sequence_num,
            proposal.round,
            proposal.hash(),
            VoteChoice::Approve,
            NOW + 3,
            None,
        );
        assert!(matches!(
            net.consensus.submit_vote(v, NOW + 3),
            Err(ErgError::NotValidator(_))
        ));
    }

    #[test]
    fn rejection_quorum_detected() {
        let mut net = network(4);
        let (before, after) = transition(&net.keypairs[0]);
        let proposal = net
            .consensus
            .propose_transition(&before, &after, &net.keypairs[0], NOW + 2)
            .unwrap();

        // required = 3; rejected once rejections > 4 - 3 = 1.
        for i in 1..3 {
            let v = Vote::new_signed(
                &net.keypairs[i],
                proposal.sequence_num,
                proposal.round,
                proposal.hash(),
                VoteChoice::Reject,
                NOW + 3,
                Some("delta sum nonzero".into()),
            );
            net.consensus.submit_vote(v, NOW + 3).unwrap();
        }
        assert_eq!(net.consensus.check_quorum(), QuorumStatus::Rejected);
    }

    #[test]
    fn validate_proposal_enforces_chain_and_supply() {
        let mut net = network(3);
        let (before, after) = transition(&net.keypairs[0]);
        let proposal = net
            .consensus
            .propose_transition(&before, &after, &net.keypairs[0], NOW + 2)
            .unwrap();

        // A fresh follower at the same state accepts it.
        net.consensus.validate_proposal(&proposal, &before).unwrap();

        // Wrong prev hash → chain mismatch.
        assert!(matches!(
            net.consensus.validate_proposal(&proposal, &after),
            Err(ErgError::ChainMismatch)
        ));

        // Tampered supply → conservation (signature checked later).
        let mut bad = proposal.clone();
        bad.total_supply += 10.0;
        assert!(matches!(
            net.consensus.validate_proposal(&bad, &before),
            Err(ErgError::ConservationViolated { .. })
        ));

        // Tampered delta_sum → conservation.
        let mut bad = proposal.clone();
        bad.delta_sum = 1e-6;
        assert!(matches!(
            net.consensus.validate_proposal(&bad, &before),
            Err(ErgError::ConservationViolated { .. })
        ));

        // Re-signed by a non-validator → rejected.
        let stranger = Keypair::generate();
        let mut bad = proposal.clone();
        bad.proposer = stranger.public();
        bad.sign(&stranger);
        assert!(matches!(
            net.consensus.validate_proposal(&bad, &before),
            Err(ErgError::NotValidator(_))
        ));

        // Wrong sequence → stale.
        let mut bad = proposal;
        bad.sequence_num = 7;
        bad.sign(&net.keypairs[0]);
        assert!(matches!(
            net.consensus.validate_proposal(&bad, &before),
            Err(ErgError::StaleProposal { .. })
        ));
    }

    #[test]
    fn validator_changes_blocked_mid_round() {
        let mut net = network(3);
        let (before, after) = transition(&net.keypairs[0]);
        net.consensus
            .propose_transition(&before, &after, &net.keypairs[0], NOW + 2)
            .unwrap();

        let newcomer = Keypair::generate();
        assert!(matches!(
            net.consensus
                .register_validator(newcomer.public(), "late", NOW + 3),
            Err(ErgError::ValidatorChangeDuringRound)
        ));
        let existing = net.keypairs[2].public();
        assert!(matches!(
            net.consensus.deactivate_validator(&existing),
            Err(ErgError::ValidatorChangeDuringRound)
        ));

        // After the round resolves, changes are allowed again.
        net.consensus.advance_round(NOW + 10);
        net.consensus
            .register_validator(newcomer.public(), "late", NOW + 11)
            .unwrap();
    }

    #[test]
    fn round_timeout_rotates_leader_without_height_change() {
        let mut net = network(3);
        let (before, after) = transition(&net.keypairs[0]);
        net.consensus
            .propose_transition(&before, &after, &net.keypairs[0], NOW + 2)
            .unwrap();

        assert!(!net.consensus.round_expired(NOW + 2));
        assert!(net.consensus.round_expired(NOW + 2 + ROUND_TIMEOUT_SECS));

        let height_before = net.consensus.height();
        net.consensus.advance_round(NOW + 2 + ROUND_TIMEOUT_SECS);
        assert_eq!(net.consensus.height(), height_before);
        assert_eq!(net.consensus.round(), 1);
        assert_eq!(
            net.consensus.current_leader().unwrap(),
            net.keypairs[1].public()
        );
        assert!(net.consensus.current_proposal().is_none());
    }

    #[test]
    fn save_load_round_trip() {
        let mut net = network(3);
        let (before, after) = transition(&net.keypairs[0]);
        net.consensus
            .propose_transition(&before, &after, &net.keypairs[0], NOW + 2)
            .unwrap();

        let path = std::env::temp_dir().join("erg_consensus_test.dat");
        net.consensus.save(&path).unwrap();
        let restored = PocConsensus::load(&path).unwrap();
        assert_eq!(restored.height(), net.consensus.height());
        assert_eq!(restored.phase(), net.consensus.phase());
        assert_eq!(restored.votes().len(), net.consensus.votes().len());
        assert_eq!(
            restored.current_proposal().unwrap().hash(),
            net.consensus.current_proposal().unwrap().hash()
        );
        let _ = std::fs::remove_file(&path);
    }
}
