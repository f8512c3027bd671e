//! Protocol constants. The ε tolerances, byte layouts, and limits here are
//! part of the wire/persistence contract; changing them is a network fork.

/// Per-transfer tolerance for balance-pair and delta-sum checks.
pub const EPS_TRANSFER: f64 = 1e-12;

/// Aggregate tolerance for Σ balances vs total supply.
pub const EPS_CONSERVATION: f64 = 1e-9;

/// Maximum accounts per state.
pub const MAX_ACCOUNTS: usize = 10_000;

// ── Transaction encoding ─────────────────────────────────────────────────────

/// Canonical signing message: from(32) ‖ to(32) ‖ amount(8) ‖ nonce(8) ‖ timestamp(8).
pub const SIGNING_MESSAGE_LEN: usize = 88;

/// Full transaction record: signing message + signature(64).
pub const TX_RECORD_LEN: usize = 152;

/// Snapshot account record: pubkey(32) ‖ balance(8) ‖ nonce(8).
pub const ACCOUNT_RECORD_LEN: usize = 48;

// ── State snapshot files ─────────────────────────────────────────────────────

/// "PHYS"
pub const SNAPSHOT_MAGIC: u32 = 0x5048_5953;
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;
/// magic(4) version(4) state_version(8) timestamp(8) count(4) supply(8) hash(32) prev(32).
pub const SNAPSHOT_HEADER_LEN: usize = 100;

// ── Write-ahead log ──────────────────────────────────────────────────────────

/// "WALP"
pub const WAL_MAGIC: u32 = 0x5741_4C50;
pub const WAL_FORMAT_VERSION: u32 = 2;
/// magic(4) version(4) created_at(8) entry_count(8) last_state_hash(32) flags(4).
pub const WAL_HEADER_LEN: usize = 60;
/// kind(4) timestamp(8) sequence(8) payload_size(4) checksum(32).
pub const WAL_ENTRY_HEADER_LEN: usize = 56;

// ── Peer wire protocol ───────────────────────────────────────────────────────

/// "PCSC"
pub const WIRE_MAGIC: u32 = 0x5043_5343;
/// magic(4) type(1) length(4) checksum(4).
pub const WIRE_HEADER_LEN: usize = 13;
pub const MAX_WIRE_PAYLOAD: usize = 4 * 1024 * 1024;

/// Per-peer limits; violations accumulate towards a ban.
pub const MAX_MSGS_PER_MINUTE: u32 = 100;
pub const MAX_TXS_PER_MINUTE: u32 = 50;
pub const MAX_VIOLATIONS: u32 = 5;
pub const BAN_SECS: u64 = 3600;

// ── Sharding ─────────────────────────────────────────────────────────────────

pub const NUM_SHARDS: usize = 16;
pub const CROSS_SHARD_LOCK_EXPIRY_SECS: u64 = 300;

// ── Consensus ────────────────────────────────────────────────────────────────

pub const MAX_VALIDATORS: usize = 100;
pub const MIN_VALIDATORS_FOR_QUORUM: usize = 3;
pub const ROUND_TIMEOUT_SECS: u64 = 5;

// ── State sync ───────────────────────────────────────────────────────────────

pub const MAX_DELTA_CHANGES: usize = 1000;
/// prev(32) new(32) prev_ts(8) new_ts(8) num_changes(4) supply(8).
pub const DELTA_HEADER_LEN: usize = 92;
/// pubkey(32) old_balance(8) new_balance(8) old_nonce(8) new_nonce(8).
pub const DELTA_CHANGE_LEN: usize = 64;
/// Signed snapshot prefix: state_hash(32) ‖ version(8) ‖ timestamp(8).
pub const SNAPSHOT_SIGN_PREFIX_LEN: usize = 48;

// ── Proofs ───────────────────────────────────────────────────────────────────

/// state_hash(32) pubkey(32) balance(8) nonce(8) timestamp(8) proof_hash(32).
pub const PROOF_RECORD_LEN: usize = 120;

// ── Crypto ───────────────────────────────────────────────────────────────────

/// Batches at or above this size are verified across cores.
pub const PAR_VERIFY_MIN: usize = 64;
