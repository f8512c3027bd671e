//! erg-node
//!
//! The full-node runtime. Owns the replicated state behind a single writer
//! lock, the WAL, and the consensus engine, and drives the TCP peer
//! protocol: handshake, state/delta sync, transaction relay, rate limiting.
//!
//! Transfer pipeline (the durability contract):
//!   lock → WAL append + fsync → execute → unlock → gossip delta.
//!
//! With sharding enabled, cross-shard transfers additionally run under the
//! consensus-owned lock table; the consensus timer rolls back phase 1 of
//! any transfer whose lock expires before phase 2 commits.

pub mod node;
pub mod shard_exec;

pub use node::{unix_now, Node, NodeConfig, CONSENSUS_FILE};
pub use shard_exec::ShardedExecutor;
