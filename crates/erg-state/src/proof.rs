//! Balance proofs: flat commitments binding (wallet, balance, nonce) to a
//! specific state hash. Anyone holding the same state can re-derive and check
//! the commitment; there is no Merkle structure, by design.

use std::path::Path;

use sha2::{Digest, Sha256};

use erg_core::{Amount, ErgError, Nonce, PublicKey, StateHash, Timestamp, PROOF_RECORD_LEN};

use crate::engine::State;

#[derive(Clone, Debug, PartialEq)]
pub struct BalanceProof {
    pub state_hash: StateHash,
    pub wallet: PublicKey,
    pub balance: Amount,
    pub nonce: Nonce,
    pub timestamp: Timestamp,
    pub proof_hash: StateHash,
}

impl BalanceProof {
    /// Generate a proof for `wallet` against the current state.
    pub fn generate(state: &State, wallet: &PublicKey, now: Timestamp) -> Result<Self, ErgError> {
        let account = state
            .account(wallet)
            .ok_or_else(|| ErgError::AccountNotFound(wallet.to_hex()))?;

        let mut proof = Self {
            state_hash: state.state_hash(),
            wallet: *wallet,
            balance: account.balance,
            nonce: account.nonce,
            timestamp: now,
            proof_hash: StateHash::zero(),
        };
        proof.proof_hash = proof.compute_hash();
        Ok(proof)
    }

    /// Verify this proof against a state: the state hash must match, the
    /// account's balance and nonce must equal the committed values, and the
    /// proof hash must re-derive.
    pub fn verify(&self, state: &State) -> Result<(), ErgError> {
        if state.state_hash() != self.state_hash {
            return Err(ErgError::ChainMismatch);
        }
        let account = state
            .account(&self.wallet)
            .ok_or_else(|| ErgError::AccountNotFound(self.wallet.to_hex()))?;
        if account.balance != self.balance || account.nonce != self.nonce {
            return Err(ErgError::InvalidSignature);
        }
        if self.compute_hash() != self.proof_hash {
            return Err(ErgError::InvalidSignature);
        }
        Ok(())
    }

    /// H(state_hash ‖ pubkey ‖ balance ‖ nonce ‖ timestamp).
    fn compute_hash(&self) -> StateHash {
        let mut h = Sha256::new();
        h.update(self.state_hash.as_bytes());
        h.update(self.wallet.as_bytes());
        h.update(self.balance.to_bits().to_le_bytes());
        h.update(self.nonce.to_le_bytes());
        h.update(self.timestamp.to_le_bytes());
        StateHash::from_bytes(h.finalize().into())
    }

    pub fn to_bytes(&self) -> [u8; PROOF_RECORD_LEN] {
        let mut buf = [0u8; PROOF_RECORD_LEN];
        buf[..32].copy_from_slice(self.state_hash.as_bytes());
        buf[32..64].copy_from_slice(self.wallet.as_bytes());
        buf[64..72].copy_from_slice(&self.balance.to_bits().to_le_bytes());
        buf[72..80].copy_from_slice(&self.nonce.to_le_bytes());
        buf[80..88].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[88..120].copy_from_slice(self.proof_hash.as_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, ErgError> {
        if buf.len() < PROOF_RECORD_LEN {
            return Err(ErgError::Serialization(format!(
                "proof record too short: {} bytes",
                buf.len()
            )));
        }
        let mut state_hash = [0u8; 32];
        state_hash.copy_from_slice(&buf[..32]);
        let mut wallet = [0u8; 32];
        wallet.copy_from_slice(&buf[32..64]);
        let mut proof_hash = [0u8; 32];
        proof_hash.copy_from_slice(&buf[88..120]);
        Ok(Self {
            state_hash: StateHash::from_bytes(state_hash),
            wallet: PublicKey::from_bytes(wallet),
            balance: f64::from_bits(u64::from_le_bytes(buf[64..72].try_into().unwrap())),
            nonce: u64::from_le_bytes(buf[72..80].try_into().unwrap()),
            timestamp: u64::from_le_bytes(buf[80..88].try_into().unwrap()),
            proof_hash: StateHash::from_bytes(proof_hash),
        })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ErgError> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ErgError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}
