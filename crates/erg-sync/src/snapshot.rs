use ed25519_dalek::{Verifier, VerifyingKey};
use tracing::{info, warn};

use erg_core::{
    ErgError, PublicKey, Signature, StateHash, Timestamp, EPS_CONSERVATION,
    SNAPSHOT_SIGN_PREFIX_LEN,
};
use erg_crypto::Keypair;
use erg_state::State;

/// Header accompanying a full-state snapshot on the wire. The signature
/// covers the 48-byte prefix (state_hash ‖ version ‖ timestamp) and must
/// come from a validator on the receiver's trust list.
#[derive(Clone, Debug, PartialEq)]
pub struct SignedSnapshotHeader {
    pub state_hash: StateHash,
    pub version: u64,
    pub timestamp: Timestamp,
    pub validator: PublicKey,
    pub signature: Signature,
}

impl SignedSnapshotHeader {
    /// Sign the given state with a validator key.
    pub fn sign(state: &State, keypair: &Keypair) -> Self {
        let mut header = Self {
            state_hash: state.state_hash(),
            version: state.version(),
            timestamp: state.timestamp(),
            validator: keypair.public(),
            signature: Signature::empty(),
        };
        header.signature = keypair.sign(&header.prefix_bytes());
        header
    }

    fn prefix_bytes(&self) -> [u8; SNAPSHOT_SIGN_PREFIX_LEN] {
        let mut buf = [0u8; SNAPSHOT_SIGN_PREFIX_LEN];
        buf[..32].copy_from_slice(self.state_hash.as_bytes());
        buf[32..40].copy_from_slice(&self.version.to_le_bytes());
        buf[40..48].copy_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    pub fn verify_signature(&self) -> bool {
        if self.signature.has_zero_prefix() {
            return false;
        }
        let Ok(key) = VerifyingKey::from_bytes(self.validator.as_bytes()) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(self.signature.as_bytes());
        key.verify(&self.prefix_bytes(), &sig).is_ok()
    }

    // ── Wire codec: prefix ‖ validator ‖ signature = 144 bytes ──────────────

    pub fn to_bytes(&self) -> [u8; 144] {
        let mut buf = [0u8; 144];
        buf[..48].copy_from_slice(&self.prefix_bytes());
        buf[48..80].copy_from_slice(self.validator.as_bytes());
        buf[80..144].copy_from_slice(self.signature.as_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, ErgError> {
        if buf.len() < 144 {
            return Err(ErgError::Serialization(format!(
                "snapshot header too short: {} bytes",
                buf.len()
            )));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&buf[..32]);
        let mut validator = [0u8; 32];
        validator.copy_from_slice(&buf[48..80]);
        let mut sig = [0u8; 64];
        sig.copy_from_slice(&buf[80..144]);
        Ok(Self {
            state_hash: StateHash::from_bytes(hash),
            version: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            timestamp: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            validator: PublicKey::from_bytes(validator),
            signature: Signature::from_bytes(sig),
        })
    }
}

/// The local list of validator keys whose signed snapshots are accepted.
#[derive(Clone, Debug, Default)]
pub struct TrustList {
    keys: Vec<PublicKey>,
}

impl TrustList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: PublicKey) {
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
    }

    pub fn is_trusted(&self, key: &PublicKey) -> bool {
        self.keys.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

/// Decide whether a full state received from a peer replaces the current
/// one. Checks: trusted signature over the snapshot (mandatory whenever the
/// trust list is non-empty), conservation, strictly newer version, and an
/// unchanged total supply (unless the current state is still pre-genesis).
pub fn accept_snapshot(
    current: &State,
    candidate: State,
    header: Option<&SignedSnapshotHeader>,
    trust: &TrustList,
) -> Result<State, ErgError> {
    if !trust.is_empty() {
        let header = header.ok_or(ErgError::UntrustedSnapshot)?;
        if !trust.is_trusted(&header.validator) {
            warn!(validator = %header.validator, "snapshot signer not in trust list");
            return Err(ErgError::UntrustedSnapshot);
        }
        if !header.verify_signature() {
            return Err(ErgError::InvalidSignature);
        }
        if header.state_hash != candidate.state_hash() {
            return Err(ErgError::ChainMismatch);
        }
    }

    candidate.verify_conservation()?;

    if candidate.version() <= current.version() {
        return Err(ErgError::StaleSnapshot {
            current: current.version(),
            got: candidate.version(),
        });
    }

    if current.total_supply() > 0.0
        && (candidate.total_supply() - current.total_supply()).abs() > EPS_CONSERVATION
    {
        return Err(ErgError::ConservationViolated {
            expected: current.total_supply(),
            actual: candidate.total_supply(),
        });
    }

    info!(
        from_version = current.version(),
        to_version = candidate.version(),
        "accepting state snapshot"
    );
    Ok(candidate)
}
