use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use erg_consensus::{Phase, PocConsensus};
use erg_core::{Amount, ErgError, PublicKey, Timestamp, Transaction};
use erg_crypto::Keypair;
use erg_p2p::{
    read_message, write_message, MessageType, PeerInfo, PeerVerdict, VersionPayload, WireMessage,
};
use erg_state::State;
use erg_sync::{accept_snapshot, AccountChange, SignedSnapshotHeader, StateDelta, TrustList};
use erg_wal::Wal;

use crate::shard_exec::ShardedExecutor;

pub const CONSENSUS_FILE: &str = "consensus.dat";

pub fn unix_now() -> Timestamp {
    chrono::Utc::now().timestamp().max(0) as Timestamp
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub port: u16,
    /// Peers to dial at startup, "host:port".
    pub connect: Vec<String>,
    pub data_dir: PathBuf,
    /// Validator keys whose signed snapshots are accepted.
    pub trusted_validators: Vec<PublicKey>,
}

/// The node. All shared pieces live behind tokio locks; the state is only
/// ever mutated while the writer lock and the WAL lock are both held.
pub struct Node {
    config: NodeConfig,
    state: RwLock<State>,
    wal: Mutex<Wal>,
    consensus: Mutex<PocConsensus>,
    trust: TrustList,
    /// Present when this node is itself a validator.
    keypair: Option<Keypair>,
    peers: Mutex<HashMap<SocketAddr, PeerInfo>>,
    /// Encoded frames fanned out to every connected peer's writer task.
    gossip: broadcast::Sender<Vec<u8>>,
    /// Sharded execution mode; None until [`Node::enable_sharding`].
    sharded: Mutex<Option<ShardedExecutor>>,
}

impl Node {
    /// Open the data directory: recover state from the WAL, reload any
    /// persisted consensus state, seed the trust list.
    pub fn open(config: NodeConfig, keypair: Option<Keypair>) -> Result<Arc<Self>, ErgError> {
        let now = unix_now();
        let mut wal = Wal::open(&config.data_dir, now)?;
        let report = wal.recover(now)?;
        info!(
            version = report.state.version(),
            accounts = report.state.account_count(),
            replayed = report.replayed,
            "node state recovered"
        );

        let consensus_path = config.data_dir.join(CONSENSUS_FILE);
        let consensus = if consensus_path.exists() {
            PocConsensus::load(&consensus_path)?
        } else {
            PocConsensus::new(now)
        };

        let mut trust = TrustList::new();
        for key in &config.trusted_validators {
            trust.add(*key);
        }

        let (gossip, _) = broadcast::channel(256);
        Ok(Arc::new(Self {
            config,
            state: RwLock::new(report.state),
            wal: Mutex::new(wal),
            consensus: Mutex::new(consensus),
            trust,
            keypair,
            peers: Mutex::new(HashMap::new()),
            gossip,
            sharded: Mutex::new(None),
        }))
    }

    pub fn local_pubkey(&self) -> PublicKey {
        self.keypair
            .as_ref()
            .map(|k| k.public())
            .unwrap_or(PublicKey::from_bytes([0u8; 32]))
    }

    pub async fn state_snapshot(&self) -> Vec<u8> {
        self.state.read().await.to_snapshot_bytes()
    }

    pub async fn state_hash_hex(&self) -> String {
        self.state.read().await.state_hash().to_hex()
    }

    pub async fn balance(&self, key: &PublicKey) -> Option<Amount> {
        self.state.read().await.account(key).map(|a| a.balance)
    }

    // ── State-changing entry points ──────────────────────────────────────────

    /// Write the genesis event: WAL first, then the in-memory state.
    pub async fn init_genesis(&self, founder: PublicKey, supply: Amount) -> Result<(), ErgError> {
        let now = unix_now();
        let mut wal = self.wal.lock().await;
        let mut state = self.state.write().await;
        if wal.is_initialised() || state.account_count() > 0 {
            return Err(ErgError::AlreadyInitialised);
        }
        let genesis = State::genesis(founder, supply, now)?;
        wal.append_genesis(&founder, supply, now)?;
        *state = genesis;
        info!(founder = %founder, supply, "genesis written");
        Ok(())
    }

    /// Apply one signed transfer through the durable pipeline and return the
    /// delta describing the transition (already gossiped to peers).
    pub async fn submit_transaction(&self, tx: &Transaction) -> Result<StateDelta, ErgError> {
        let now = unix_now();
        let mut wal = self.wal.lock().await;
        let mut state = self.state.write().await;

        let prev_hash = state.state_hash();
        let prev_timestamp = state.timestamp();
        let old_sender = state.account(&tx.from).cloned();
        let old_receiver = state.account(&tx.to).cloned();

        // The WAL entry must be durable before the state moves; a replayed
        // entry that later fails execution is tolerated by recovery.
        wal.append_transaction(tx, now)?;
        state.execute(tx, now)?;

        let mut changes = Vec::with_capacity(2);
        let sender = state
            .account(&tx.from)
            .ok_or_else(|| ErgError::AccountNotFound(tx.from.to_hex()))?;
        changes.push(AccountChange {
            pubkey: tx.from,
            old_balance: old_sender.as_ref().map_or(0.0, |a| a.balance),
            new_balance: sender.balance,
            old_nonce: old_sender.as_ref().map_or(0, |a| a.nonce),
            new_nonce: sender.nonce,
        });
        if tx.to != tx.from {
            let receiver = state
                .account(&tx.to)
                .ok_or_else(|| ErgError::AccountNotFound(tx.to.to_hex()))?;
            changes.push(AccountChange {
                pubkey: tx.to,
                old_balance: old_receiver.as_ref().map_or(0.0, |a| a.balance),
                new_balance: receiver.balance,
                old_nonce: old_receiver.as_ref().map_or(0, |a| a.nonce),
                new_nonce: receiver.nonce,
            });
        }

        let delta = StateDelta {
            prev_hash,
            new_hash: state.state_hash(),
            prev_timestamp,
            new_timestamp: state.timestamp(),
            total_supply: state.total_supply(),
            changes,
        };
        drop(state);
        drop(wal);

        self.broadcast(WireMessage::new(MessageType::Delta, delta.to_bytes()));
        Ok(delta)
    }

    /// Snapshot the state to the checkpoint file. Refused while a consensus
    /// round is in flight: checkpoints happen between finalized heights.
    pub async fn checkpoint(&self) -> Result<u64, ErgError> {
        let consensus = self.consensus.lock().await;
        if consensus.phase() != Phase::Idle {
            return Err(ErgError::CheckpointDuringRound);
        }
        drop(consensus);

        let mut wal = self.wal.lock().await;
        let state = self.state.read().await;
        wal.checkpoint(&state, unix_now())
    }

    pub async fn verify_conservation(&self) -> Result<(), ErgError> {
        self.state.read().await.verify_conservation()
    }

    // ── Sharded execution ────────────────────────────────────────────────────

    /// Switch on the 16-shard execution mode with the given network supply.
    pub async fn enable_sharding(&self, network_supply: Amount) -> Result<(), ErgError> {
        let mut sharded = self.sharded.lock().await;
        if sharded.is_some() {
            return Err(ErgError::AlreadyInitialised);
        }
        *sharded = Some(ShardedExecutor::new(network_supply, unix_now()));
        info!(network_supply, "sharded execution enabled");
        Ok(())
    }

    /// Bootstrap an account with an allocation in its home shard.
    pub async fn create_shard_account(
        &self,
        key: PublicKey,
        balance: Amount,
    ) -> Result<(), ErgError> {
        let mut sharded = self.sharded.lock().await;
        let exec = sharded.as_mut().ok_or(ErgError::ShardingDisabled)?;
        exec.create_account(key, balance)
    }

    pub async fn shard_balance(&self, key: &PublicKey) -> Option<Amount> {
        self.sharded
            .lock()
            .await
            .as_ref()
            .and_then(|exec| exec.balance(key))
    }

    /// Run a cross-shard transfer through both phases, holding the sender's
    /// consensus lock across them.
    pub async fn submit_cross_shard(&self, tx: &Transaction) -> Result<(), ErgError> {
        let mut consensus = self.consensus.lock().await;
        let mut sharded = self.sharded.lock().await;
        let exec = sharded.as_mut().ok_or(ErgError::ShardingDisabled)?;
        exec.submit_cross(tx, consensus.locks_mut(), unix_now())
    }

    /// Phase 1 only: debit under lock, leave the transfer in flight.
    /// Returns the lock sequence used to complete (or expire) it.
    pub async fn begin_cross_shard(&self, tx: &Transaction) -> Result<u64, ErgError> {
        let mut consensus = self.consensus.lock().await;
        let mut sharded = self.sharded.lock().await;
        let exec = sharded.as_mut().ok_or(ErgError::ShardingDisabled)?;
        exec.begin_cross(tx, consensus.locks_mut(), unix_now())
    }

    /// Settle an in-flight transfer's phase 2 and release its lock.
    pub async fn complete_cross_shard(
        &self,
        sender: &PublicKey,
        sequence: u64,
    ) -> Result<(), ErgError> {
        let mut consensus = self.consensus.lock().await;
        let mut sharded = self.sharded.lock().await;
        let exec = sharded.as_mut().ok_or(ErgError::ShardingDisabled)?;
        exec.complete_cross(sender, sequence, consensus.locks_mut(), unix_now())
    }

    pub async fn verify_shard_conservation(&self) -> Result<(), ErgError> {
        let sharded = self.sharded.lock().await;
        let exec = sharded.as_ref().ok_or(ErgError::ShardingDisabled)?;
        exec.verify_conservation()
    }

    fn broadcast(&self, msg: WireMessage) {
        // Send fails only when no peer is subscribed; that is fine.
        let _ = self.gossip.send(msg.encode());
    }

    // ── Runtime ──────────────────────────────────────────────────────────────

    /// Run the node: TCP listener, outbound dials, consensus timer. Never
    /// returns unless the listener dies.
    pub async fn run(self: Arc<Self>) -> Result<(), ErgError> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        info!(port = self.config.port, "node listening");

        // Consensus round timer.
        let timer_node = Arc::clone(&self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                timer_node.consensus_tick(unix_now()).await;
            }
        });

        // Outbound dials.
        for addr in self.config.connect.clone() {
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                match TcpStream::connect(&addr).await {
                    Ok(stream) => {
                        let peer_addr = stream.peer_addr().ok();
                        info!(peer = %addr, "connected to peer");
                        if let Some(peer_addr) = peer_addr {
                            node.handle_connection(stream, peer_addr, true).await;
                        }
                    }
                    Err(e) => warn!(peer = %addr, error = %e, "dial failed"),
                }
            });
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            debug!(peer = %addr, "inbound connection");
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                node.handle_connection(stream, addr, false).await;
            });
        }
    }

    /// Advance timed-out rounds and compensate expired cross-shard locks.
    pub async fn consensus_tick(&self, now: Timestamp) {
        let mut consensus = self.consensus.lock().await;
        {
            let mut sharded = self.sharded.lock().await;
            if let Some(exec) = sharded.as_mut() {
                let rolled_back = exec.expire(consensus.locks_mut(), now);
                if rolled_back > 0 {
                    warn!(rolled_back, "rolled back phase 1 of expired cross-shard transfers");
                }
            }
        }
        if consensus.round_expired(now) {
            consensus.advance_round(now);
            let path = self.config.data_dir.join(CONSENSUS_FILE);
            if let Err(e) = consensus.save(&path) {
                warn!(error = %e, "failed to persist consensus state");
            }
        }
    }

    // ── Peer protocol ────────────────────────────────────────────────────────

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr, outbound: bool) {
        let (mut reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));

        self.peers.lock().await.insert(addr, PeerInfo::new(unix_now()));

        // Fan the gossip stream out to this peer.
        let mut gossip_rx = self.gossip.subscribe();
        let gossip_writer = Arc::clone(&writer);
        let gossip_task = tokio::spawn(async move {
            while let Ok(frame) = gossip_rx.recv().await {
                let mut w = gossip_writer.lock().await;
                if tokio::io::AsyncWriteExt::write_all(&mut *w, &frame).await.is_err() {
                    break;
                }
            }
        });

        // An outbound connection introduces itself first.
        if outbound {
            let version = VersionPayload {
                version: self.state.read().await.version(),
                node_pubkey: self.local_pubkey(),
            };
            let msg = WireMessage::new(MessageType::Version, version.to_bytes().to_vec());
            if self.send_to(&writer, &msg).await.is_err() {
                self.drop_peer(&addr).await;
                gossip_task.abort();
                return;
            }
        }

        // Snapshot header seen from this peer, held until the state arrives.
        let mut pending_header: Option<SignedSnapshotHeader> = None;

        loop {
            let msg = match read_message(&mut reader).await {
                Ok(m) => m,
                Err(ErgError::UnknownMessageType(kind)) => {
                    warn!(peer = %addr, kind, "unknown message type");
                    let mut peers = self.peers.lock().await;
                    if let Some(peer) = peers.get_mut(&addr) {
                        peer.register_violation(unix_now(), true);
                        if peer.banned {
                            break;
                        }
                    }
                    continue;
                }
                Err(ErgError::MalformedMessage(reason)) => {
                    warn!(peer = %addr, reason = %reason, "malformed message, dropping peer");
                    break;
                }
                Err(_) => break, // disconnect
            };

            let verdict = {
                let mut peers = self.peers.lock().await;
                peers
                    .get_mut(&addr)
                    .map(|p| p.record_message(msg.kind, unix_now()))
                    .unwrap_or(PeerVerdict::Banned)
            };
            match verdict {
                PeerVerdict::Allow => {}
                PeerVerdict::Throttled => continue,
                PeerVerdict::Banned => break,
            }

            if self
                .dispatch(&addr, &writer, msg, &mut pending_header)
                .await
                .is_err()
            {
                break;
            }
        }

        gossip_task.abort();
        self.drop_peer(&addr).await;
        debug!(peer = %addr, "connection closed");
    }

    async fn dispatch(
        &self,
        addr: &SocketAddr,
        writer: &Arc<Mutex<OwnedWriteHalf>>,
        msg: WireMessage,
        pending_header: &mut Option<SignedSnapshotHeader>,
    ) -> Result<(), ErgError> {
        match msg.kind {
            MessageType::Version => {
                let payload = VersionPayload::from_bytes(&msg.payload)?;
                {
                    let mut peers = self.peers.lock().await;
                    if let Some(peer) = peers.get_mut(addr) {
                        peer.node_pubkey = Some(payload.node_pubkey);
                        peer.is_validator = self.trust.is_trusted(&payload.node_pubkey);
                        if peer.is_validator {
                            info!(peer = %addr, "peer is a trusted validator");
                        }
                    }
                }
                self.send_to(writer, &WireMessage::new(MessageType::Verack, Vec::new()))
                    .await?;
                // Opportunistic sync right after the handshake.
                self.send_to(writer, &WireMessage::new(MessageType::GetState, Vec::new()))
                    .await?;
            }

            MessageType::Verack => {
                {
                    let mut peers = self.peers.lock().await;
                    if let Some(peer) = peers.get_mut(addr) {
                        peer.handshaked = true;
                    }
                }
                // Handshake complete: ask the peer for its state so a fresh
                // node bootstraps from whoever it dialed.
                self.send_to(writer, &WireMessage::new(MessageType::GetState, Vec::new()))
                    .await?;
            }

            MessageType::GetState => {
                let snapshot = self.state_snapshot().await;
                if let Some(keypair) = &self.keypair {
                    let state = self.state.read().await;
                    let header = SignedSnapshotHeader::sign(&state, keypair);
                    drop(state);
                    self.send_to(
                        writer,
                        &WireMessage::new(
                            MessageType::SignedStateHeader,
                            header.to_bytes().to_vec(),
                        ),
                    )
                    .await?;
                }
                self.send_to(writer, &WireMessage::new(MessageType::State, snapshot))
                    .await?;
            }

            MessageType::SignedStateHeader => {
                *pending_header = Some(SignedSnapshotHeader::from_bytes(&msg.payload)?);
            }

            MessageType::State => {
                let candidate = State::from_snapshot_bytes(&msg.payload)?;
                let mut state = self.state.write().await;
                match accept_snapshot(&state, candidate, pending_header.as_ref(), &self.trust) {
                    Ok(next) => {
                        info!(peer = %addr, version = next.version(), "state synced from peer");
                        *state = next;
                    }
                    Err(e) => {
                        warn!(peer = %addr, error = %e, "snapshot rejected");
                        let mut peers = self.peers.lock().await;
                        if let Some(peer) = peers.get_mut(addr) {
                            peer.register_violation(unix_now(), false);
                        }
                    }
                }
                *pending_header = None;
            }

            MessageType::Tx => {
                let tx = Transaction::from_bytes(&msg.payload)?;
                match self.submit_transaction(&tx).await {
                    Ok(_) => {
                        debug!(peer = %addr, amount = tx.amount, "transaction accepted");
                        // Relay the raw transaction as well as the delta.
                        self.broadcast(WireMessage::new(MessageType::Tx, msg.payload));
                    }
                    Err(e) => debug!(peer = %addr, error = %e, "transaction rejected"),
                }
            }

            MessageType::Delta => {
                let delta = StateDelta::from_bytes(&msg.payload)?;
                let mut state = self.state.write().await;
                match delta.apply(&mut state) {
                    Ok(()) => {
                        info!(peer = %addr, version = state.version(), "delta applied")
                    }
                    Err(e) => debug!(peer = %addr, error = %e, "delta not applicable"),
                }
            }

            MessageType::Ping => {
                self.send_to(writer, &WireMessage::new(MessageType::Pong, msg.payload))
                    .await?;
            }

            MessageType::Pong => {
                let mut peers = self.peers.lock().await;
                if let Some(peer) = peers.get_mut(addr) {
                    peer.last_seen = unix_now();
                }
            }
        }
        Ok(())
    }

    async fn send_to(
        &self,
        writer: &Arc<Mutex<OwnedWriteHalf>>,
        msg: &WireMessage,
    ) -> Result<(), ErgError> {
        let mut w = writer.lock().await;
        write_message(&mut *w, msg).await
    }

    async fn drop_peer(&self, addr: &SocketAddr) {
        self.peers.lock().await.remove(addr);
    }
}
