//! erg-sync
//!
//! Replicated-state synchronization. Deltas are the normal path: a compact
//! record of per-account changes between two adjacent states, re-checked for
//! conservation at the receiver before anything mutates. Signed full
//! snapshots are the bootstrap path, accepted only from trusted validators.

pub mod delta;
pub mod snapshot;

pub use delta::{AccountChange, StateDelta};
pub use snapshot::{accept_snapshot, SignedSnapshotHeader, TrustList};
