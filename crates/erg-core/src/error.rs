use thiserror::Error;

#[derive(Debug, Error)]
pub enum ErgError {
    // ── Transfer errors ──────────────────────────────────────────────────────
    #[error("insufficient funds: need {need}, have {have}")]
    InsufficientFunds { need: f64, have: f64 },

    #[error("invalid signature")]
    InvalidSignature,

    #[error("amount must be a positive finite number")]
    InvalidAmount,

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("account already exists: {0}")]
    AccountExists(String),

    #[error("account capacity exceeded (max {max})")]
    CapacityExceeded { max: usize },

    #[error("conservation violated: total supply {expected}, measured {actual}")]
    ConservationViolated { expected: f64, actual: f64 },

    // ── Consensus errors ─────────────────────────────────────────────────────
    #[error("not enough active validators: need {need}, have {have}")]
    InsufficientValidators { need: usize, have: usize },

    #[error("proposer is not the current leader")]
    NotLeader,

    #[error("not an active validator: {0}")]
    NotValidator(String),

    #[error("validator registry full (max {max})")]
    ValidatorSetFull { max: usize },

    #[error("validator already registered: {0}")]
    ValidatorExists(String),

    #[error("proposal sequence mismatch: expected {expected}, got {got}")]
    StaleProposal { expected: u64, got: u64 },

    #[error("no proposal is active")]
    NoActiveProposal,

    #[error("quorum not reached")]
    QuorumNotReached,

    #[error("validator set may only change between finalized heights")]
    ValidatorChangeDuringRound,

    #[error("sender already holds an unexpired cross-shard lock")]
    LockHeld,

    #[error("checkpoint refused while a consensus round is in flight")]
    CheckpointDuringRound,

    // ── Sharding errors ──────────────────────────────────────────────────────
    #[error("transfer crosses shard boundary (source {from:#x}, destination {to:#x})")]
    CrossShard { from: u8, to: u8 },

    #[error("transfer does not cross a shard boundary")]
    NotCrossShard,

    #[error("no pending cross-shard transfer for this lock")]
    UnknownCrossShardTransfer,

    #[error("sharded execution is not enabled on this node")]
    ShardingDisabled,

    // ── Sync errors ──────────────────────────────────────────────────────────
    #[error("state hash chain mismatch")]
    ChainMismatch,

    #[error("snapshot not signed by a trusted validator")]
    UntrustedSnapshot,

    #[error("snapshot version {got} is not newer than current {current}")]
    StaleSnapshot { current: u64, got: u64 },

    // ── Durability errors ────────────────────────────────────────────────────
    #[error("corrupt log entry at sequence {sequence}")]
    CorruptEntry { sequence: u64 },

    #[error("ledger already initialised")]
    AlreadyInitialised,

    // ── Encoding / crypto / IO ───────────────────────────────────────────────
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ── Wire errors ──────────────────────────────────────────────────────────
    #[error("malformed wire message: {0}")]
    MalformedMessage(String),

    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),
}
