//! Cross-shard transfers under the consensus lock table: the escalation
//! path used when phase 2 cannot complete immediately. A sender holding an
//! unexpired lock is barred from further transfers; expiry triggers the
//! phase-1 rollback.

use erg_consensus::CrossShardLockTable;
use erg_core::{PublicKey, Transaction, CROSS_SHARD_LOCK_EXPIRY_SECS};
use erg_crypto::Keypair;
use erg_shard::{shard_for, ShardedLedger};

const NOW: u64 = 1_000_000;

fn keypair_in_shard(shard: u8) -> Keypair {
    loop {
        let kp = Keypair::generate();
        if shard_for(&kp.public()) == shard {
            return kp;
        }
    }
}

fn transfer(kp: &Keypair, to: PublicKey, amount: f64, nonce: u64) -> Transaction {
    let mut tx = Transaction::new(kp.public(), to, amount, nonce, NOW);
    kp.sign_transaction(&mut tx).unwrap();
    tx
}

#[test]
fn locked_sender_cannot_start_a_second_transfer() {
    let p = keypair_in_shard(0);
    let q = keypair_in_shard(5);
    let r = keypair_in_shard(9);

    let mut ledger = ShardedLedger::new(1000.0, NOW);
    ledger.create_account(p.public(), 1000.0).unwrap();

    let mut locks = CrossShardLockTable::new();

    // Phase 1 under lock.
    let tx = transfer(&p, q.public(), 300.0, 0);
    locks
        .acquire(tx.from, shard_for(&tx.from), shard_for(&tx.to), tx.amount, 1, NOW)
        .unwrap();
    let pending = ledger.begin_cross(&tx, NOW).unwrap();

    // While the lock is live, the same sender may not start another
    // cross-shard transfer.
    let second = transfer(&p, r.public(), 100.0, 1);
    assert!(locks
        .acquire(
            second.from,
            shard_for(&second.from),
            shard_for(&second.to),
            second.amount,
            2,
            NOW + 1
        )
        .is_err());

    // Phase 2 commits; the lock is released and the funds have moved.
    ledger.commit_cross(&pending, NOW + 2).unwrap();
    locks.commit(&tx.from, 1);

    assert_eq!(ledger.balance(&p.public()), Some(700.0));
    assert_eq!(ledger.balance(&q.public()), Some(300.0));
    assert!(!locks.has_active(&p.public(), NOW + 3));
    ledger.verify_conservation().unwrap();
}

#[test]
fn expired_lock_rolls_back_phase_one() {
    let p = keypair_in_shard(2);
    let q = keypair_in_shard(7);

    let mut ledger = ShardedLedger::new(500.0, NOW);
    ledger.create_account(p.public(), 500.0).unwrap();

    let mut locks = CrossShardLockTable::new();
    let tx = transfer(&p, q.public(), 200.0, 0);
    locks
        .acquire(tx.from, shard_for(&tx.from), shard_for(&tx.to), tx.amount, 1, NOW)
        .unwrap();
    let pending = ledger.begin_cross(&tx, NOW).unwrap();
    assert_eq!(ledger.balance(&p.public()), Some(300.0));

    // Phase 2 never happens; the lock expires after five minutes.
    let later = NOW + CROSS_SHARD_LOCK_EXPIRY_SECS;
    let expired = locks.expire(later);
    assert_eq!(expired.len(), 1);

    // Each expired lock's phase 1 is compensated.
    ledger.abort_cross(&pending, later);
    assert_eq!(ledger.balance(&p.public()), Some(500.0));
    assert_eq!(ledger.balance(&q.public()), None);
    ledger.verify_conservation().unwrap();

    // The sender is free again.
    assert!(locks
        .acquire(tx.from, shard_for(&tx.from), shard_for(&tx.to), tx.amount, 2, later)
        .is_ok());
}
