use ed25519_dalek::{Verifier, VerifyingKey};
use rayon::prelude::*;

use erg_core::{ErgError, Transaction, PAR_VERIFY_MIN};

/// Verify a transaction's Ed25519 signature against its `from` key.
///
/// A signature whose first 16 bytes are all zero is rejected without hitting
/// the curve math; it marks an uninitialised field, never a valid signature.
pub fn verify_transaction(tx: &Transaction) -> Result<(), ErgError> {
    if tx.signature.has_zero_prefix() {
        return Err(ErgError::InvalidSignature);
    }
    let key = VerifyingKey::from_bytes(tx.from.as_bytes())
        .map_err(|_| ErgError::InvalidSignature)?;
    let sig = ed25519_dalek::Signature::from_bytes(tx.signature.as_bytes());
    key.verify(&tx.signing_bytes(), &sig)
        .map_err(|_| ErgError::InvalidSignature)
}

/// Verify a batch of transactions, returning one flag per input in order.
///
/// Batches of [`PAR_VERIFY_MIN`] or more are spread across cores; the result
/// is identical either way.
pub fn batch_verify(txs: &[Transaction]) -> Vec<bool> {
    if txs.len() >= PAR_VERIFY_MIN {
        txs.par_iter()
            .map(|tx| verify_transaction(tx).is_ok())
            .collect()
    } else {
        txs.iter()
            .map(|tx| verify_transaction(tx).is_ok())
            .collect()
    }
}
