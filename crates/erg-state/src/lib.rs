//! erg-state
//!
//! The state engine: the account set, atomic transfer execution, the
//! conservation invariant, and the deterministic SHA-256 state hash chain.
//! Also home to the packed snapshot codec, balance proofs, and batch
//! execution helpers.

pub mod batch;
pub mod engine;
pub mod proof;
pub mod serialize;

pub use batch::{analyze_batch, execute_batch, BatchOutcome};
pub use engine::State;
pub use proof::BalanceProof;
