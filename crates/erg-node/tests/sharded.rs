//! Sharded execution through the node: cross-shard transfers run under the
//! consensus-owned lock table, and the consensus timer compensates phase 1
//! of any transfer whose lock expires before phase 2 commits.

use std::path::PathBuf;

use erg_core::{ErgError, PublicKey, Transaction, CROSS_SHARD_LOCK_EXPIRY_SECS};
use erg_crypto::Keypair;
use erg_node::{unix_now, Node, NodeConfig};
use erg_shard::shard_for;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("erg_sharded_test_{name}"));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn config(dir: &PathBuf) -> NodeConfig {
    NodeConfig {
        port: 0,
        connect: Vec::new(),
        data_dir: dir.clone(),
        trusted_validators: Vec::new(),
    }
}

fn keypair_in_shard(shard: u8) -> Keypair {
    loop {
        let kp = Keypair::generate();
        if shard_for(&kp.public()) == shard {
            return kp;
        }
    }
}

fn transfer(kp: &Keypair, to: PublicKey, amount: f64, nonce: u64) -> Transaction {
    let mut tx = Transaction::new(kp.public(), to, amount, nonce, 1_000_000);
    kp.sign_transaction(&mut tx).unwrap();
    tx
}

#[tokio::test]
async fn cross_shard_transfer_through_node() {
    let dir = temp_dir("transfer");
    let node = Node::open(config(&dir), None).unwrap();
    node.enable_sharding(1000.0).await.unwrap();

    let p = keypair_in_shard(0);
    let q = keypair_in_shard(5);
    node.create_shard_account(p.public(), 1000.0).await.unwrap();

    node.submit_cross_shard(&transfer(&p, q.public(), 300.0, 0))
        .await
        .unwrap();

    assert_eq!(node.shard_balance(&p.public()).await, Some(700.0));
    assert_eq!(node.shard_balance(&q.public()).await, Some(300.0));
    node.verify_shard_conservation().await.unwrap();

    // The lock was released on commit: the sender may go again at once.
    node.submit_cross_shard(&transfer(&p, q.public(), 100.0, 1))
        .await
        .unwrap();
    assert_eq!(node.shard_balance(&q.public()).await, Some(400.0));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn expired_lock_triggers_rollback_via_consensus_tick() {
    let dir = temp_dir("expiry");
    let node = Node::open(config(&dir), None).unwrap();
    node.enable_sharding(500.0).await.unwrap();

    let p = keypair_in_shard(2);
    let q = keypair_in_shard(9);
    node.create_shard_account(p.public(), 500.0).await.unwrap();

    // Phase 1 only: the transfer stays in flight under the sender's lock.
    node.begin_cross_shard(&transfer(&p, q.public(), 200.0, 0))
        .await
        .unwrap();
    assert_eq!(node.shard_balance(&p.public()).await, Some(300.0));

    // While the lock is held, a second transfer from the sender is barred.
    let err = node
        .begin_cross_shard(&transfer(&p, q.public(), 50.0, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, ErgError::LockHeld));

    // The timer finds the expired lock and compensates phase 1.
    node.consensus_tick(unix_now() + CROSS_SHARD_LOCK_EXPIRY_SECS + 1)
        .await;
    assert_eq!(node.shard_balance(&p.public()).await, Some(500.0));
    assert_eq!(node.shard_balance(&q.public()).await, None);
    node.verify_shard_conservation().await.unwrap();

    // The sender is free again after the rollback.
    node.submit_cross_shard(&transfer(&p, q.public(), 50.0, 0))
        .await
        .unwrap();
    assert_eq!(node.shard_balance(&q.public()).await, Some(50.0));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn deferred_transfer_completed_explicitly() {
    let dir = temp_dir("deferred");
    let node = Node::open(config(&dir), None).unwrap();
    node.enable_sharding(500.0).await.unwrap();

    let p = keypair_in_shard(1);
    let q = keypair_in_shard(6);
    node.create_shard_account(p.public(), 500.0).await.unwrap();

    let sequence = node
        .begin_cross_shard(&transfer(&p, q.public(), 120.0, 0))
        .await
        .unwrap();
    node.complete_cross_shard(&p.public(), sequence)
        .await
        .unwrap();

    assert_eq!(node.shard_balance(&p.public()).await, Some(380.0));
    assert_eq!(node.shard_balance(&q.public()).await, Some(120.0));
    node.verify_shard_conservation().await.unwrap();

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn sharded_calls_refused_until_enabled() {
    let dir = temp_dir("disabled");
    let node = Node::open(config(&dir), None).unwrap();

    let p = keypair_in_shard(0);
    let q = keypair_in_shard(7);
    assert!(matches!(
        node.submit_cross_shard(&transfer(&p, q.public(), 1.0, 0)).await,
        Err(ErgError::ShardingDisabled)
    ));
    assert!(matches!(
        node.create_shard_account(p.public(), 1.0).await,
        Err(ErgError::ShardingDisabled)
    ));

    let _ = std::fs::remove_dir_all(&dir);
}
