//! erg-consensus
//!
//! Proof-of-Conservation BFT: a leader-rotated, quorum-voted state
//! transition protocol whose validity predicate is the conservation law.
//! Byzantine validators can delay progress, but a proposal whose balance
//! changes do not sum to zero can never gather a two-thirds quorum of
//! honest validators — the check is syntactic and cheap.

pub mod engine;
pub mod locks;
pub mod proposal;
pub mod validator;
pub mod vote;

pub use engine::{Phase, PocConsensus, QuorumStatus};
pub use locks::{CrossShardLock, CrossShardLockTable};
pub use proposal::Proposal;
pub use validator::{Validator, ValidatorSet};
pub use vote::{Vote, VoteChoice};
