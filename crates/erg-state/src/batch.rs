//! Batch execution helpers.
//!
//! A batch is an ordered list of transactions applied under one writer-lock
//! acquisition. `analyze_batch` predicts per-transaction outcomes without
//! mutating anything (per-sender nonce sequencing and cumulative spend);
//! `execute_batch` applies in order, tolerating individual failures.

use std::collections::HashMap;

use erg_core::{ErgError, PublicKey, Timestamp, Transaction};

use crate::engine::State;

#[derive(Debug)]
pub struct BatchOutcome {
    /// Per-transaction result, parallel to the input order.
    pub results: Vec<Result<(), ErgError>>,
    pub successful: u32,
    pub failed: u32,
}

impl BatchOutcome {
    fn from_results(results: Vec<Result<(), ErgError>>) -> Self {
        let successful = results.iter().filter(|r| r.is_ok()).count() as u32;
        let failed = results.len() as u32 - successful;
        Self {
            results,
            successful,
            failed,
        }
    }
}

/// Predict the outcome of each transaction in the batch without executing.
///
/// Transactions from the same sender are nonce-dependent: each accepted
/// transaction advances the expected nonce and reduces the spendable balance
/// for the ones after it.
pub fn analyze_batch(state: &State, txs: &[Transaction]) -> BatchOutcome {
    let mut expected: HashMap<PublicKey, (u64, f64)> = HashMap::new();
    let mut results = Vec::with_capacity(txs.len());

    for tx in txs {
        let result = (|| {
            let account = state
                .account(&tx.from)
                .ok_or_else(|| ErgError::AccountNotFound(tx.from.to_hex()))?;
            let (nonce, spendable) = *expected
                .entry(tx.from)
                .or_insert((account.nonce, account.balance));

            if tx.nonce != nonce {
                return Err(ErgError::InvalidSignature);
            }
            if !tx.amount.is_finite() || tx.amount <= 0.0 {
                return Err(ErgError::InvalidAmount);
            }
            if spendable < tx.amount {
                return Err(ErgError::InsufficientFunds {
                    need: tx.amount,
                    have: spendable,
                });
            }
            // Self-transfers consume the nonce but not the balance.
            let spent = if tx.to == tx.from { 0.0 } else { tx.amount };
            expected.insert(tx.from, (nonce + 1, spendable - spent));
            Ok(())
        })();
        results.push(result);
    }

    BatchOutcome::from_results(results)
}

/// Apply the batch in order. Failed transactions are recorded and skipped;
/// the survivors commit exactly as individual `execute` calls would.
pub fn execute_batch(state: &mut State, txs: &[Transaction], now: Timestamp) -> BatchOutcome {
    let results = txs.iter().map(|tx| state.execute(tx, now)).collect();
    BatchOutcome::from_results(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use erg_crypto::Keypair;

    const NOW: u64 = 1_000_000;

    fn transfer(kp: &Keypair, to: PublicKey, amount: f64, nonce: u64) -> Transaction {
        let mut tx = Transaction::new(kp.public(), to, amount, nonce, NOW);
        kp.sign_transaction(&mut tx).unwrap();
        tx
    }

    #[test]
    fn sequential_nonces_from_one_sender() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let state = State::genesis(a.public(), 100.0, NOW).unwrap();

        let txs = vec![
            transfer(&a, b.public(), 10.0, 0),
            transfer(&a, b.public(), 10.0, 1),
            transfer(&a, b.public(), 10.0, 1), // stale nonce
        ];
        let outcome = analyze_batch(&state, &txs);
        assert!(outcome.results[0].is_ok());
        assert!(outcome.results[1].is_ok());
        assert!(matches!(
            outcome.results[2],
            Err(ErgError::InvalidSignature)
        ));
        assert_eq!(outcome.successful, 2);
        assert_eq!(outcome.failed, 1);
    }

    #[test]
    fn cumulative_spend_tracked() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let state = State::genesis(a.public(), 100.0, NOW).unwrap();

        let txs = vec![
            transfer(&a, b.public(), 80.0, 0),
            transfer(&a, b.public(), 80.0, 1), // only 20 left after the first
        ];
        let outcome = analyze_batch(&state, &txs);
        assert!(outcome.results[0].is_ok());
        assert!(matches!(
            outcome.results[1],
            Err(ErgError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn execute_matches_analysis_and_preserves_conservation() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let mut state = State::genesis(a.public(), 100.0, NOW).unwrap();

        let txs = vec![
            transfer(&a, b.public(), 30.0, 0),
            transfer(&a, b.public(), 200.0, 1), // fails, nonce 1 preserved
            transfer(&a, b.public(), 30.0, 1),
        ];
        let predicted = analyze_batch(&state, &txs);
        let outcome = execute_batch(&mut state, &txs, NOW + 1);

        for (p, o) in predicted.results.iter().zip(&outcome.results) {
            assert_eq!(p.is_ok(), o.is_ok());
        }
        assert_eq!(outcome.successful, 2);
        assert_eq!(state.account(&a.public()).unwrap().balance, 40.0);
        state.verify_conservation().unwrap();
    }
}
