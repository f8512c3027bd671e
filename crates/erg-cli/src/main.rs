//! erg — command-line front-end for the conservation-checked ledger.
//!
//! Usage:
//!   erg init <supply>                  create the genesis ledger
//!   erg wallet create                  generate a keypair
//!   erg balance <addr>                 show an account balance
//!   erg send <to> <amount>             sign and apply a transfer
//!   erg state                          summarise the current state
//!   erg verify                         run the conservation check
//!   erg prove <addr>                   write a balance proof
//!   erg verify-proof <file>            check a balance proof
//!   erg delta <file1> <file2>          diff two state snapshot files
//!   erg node --port N [--connect ..]   run a full node
//!
//! Every invocation recovers the state from the data directory's WAL;
//! mutating verbs append to the WAL before applying. Exit code is zero on
//! success and non-zero on any error path.

mod wallet;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use erg_core::{PublicKey, Transaction};
use erg_node::{unix_now, Node, NodeConfig};
use erg_state::{BalanceProof, State};
use erg_sync::StateDelta;
use erg_wal::Wal;

use wallet::{create_wallet, load_wallet};

#[derive(Parser, Debug)]
#[command(name = "erg", version, about = "erg — an energy-conserving ledger")]
struct Args {
    /// Data directory (WAL, checkpoint, wallet).
    #[arg(long, global = true, default_value = "~/.erg")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the genesis ledger, crediting the full supply to the local wallet.
    Init {
        /// Total supply to mint at genesis.
        supply: f64,
    },

    /// Wallet operations.
    Wallet {
        #[command(subcommand)]
        command: WalletCommand,
    },

    /// Show an account's balance.
    Balance {
        /// Account address (64 hex chars).
        addr: String,
    },

    /// Sign a transfer with the local wallet and apply it.
    Send {
        /// Recipient address (64 hex chars).
        to: String,
        /// Amount to transfer.
        amount: f64,
    },

    /// Summarise the current ledger state.
    State,

    /// Verify the conservation invariant.
    Verify,

    /// Generate a balance proof for an account.
    Prove {
        /// Account address (64 hex chars).
        addr: String,
        /// Output file.
        #[arg(long, default_value = "balance.proof")]
        out: PathBuf,
    },

    /// Verify a balance proof file against the current state.
    VerifyProof {
        /// Proof file written by `erg prove`.
        file: PathBuf,
    },

    /// Compute and print the delta between two state snapshot files.
    Delta {
        file1: PathBuf,
        file2: PathBuf,
    },

    /// Run a full node.
    Node {
        /// TCP listen port.
        #[arg(long)]
        port: u16,
        /// Peers to dial, host:port. May be repeated.
        #[arg(long)]
        connect: Vec<String>,
        /// Trusted validator keys (hex) for snapshot acceptance.
        #[arg(long)]
        trust: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum WalletCommand {
    /// Generate a new keypair and save it to the data directory.
    Create,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,erg=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let data_dir = expand_tilde(&args.data_dir);

    match args.command {
        Command::Init { supply } => cmd_init(&data_dir, supply),
        Command::Wallet { command } => match command {
            WalletCommand::Create => cmd_wallet_create(&data_dir),
        },
        Command::Balance { addr } => cmd_balance(&data_dir, &addr),
        Command::Send { to, amount } => cmd_send(&data_dir, &to, amount),
        Command::State => cmd_state(&data_dir),
        Command::Verify => cmd_verify(&data_dir),
        Command::Prove { addr, out } => cmd_prove(&data_dir, &addr, &out),
        Command::VerifyProof { file } => cmd_verify_proof(&data_dir, &file),
        Command::Delta { file1, file2 } => cmd_delta(&file1, &file2),
        Command::Node {
            port,
            connect,
            trust,
        } => cmd_node(&data_dir, port, connect, trust).await,
    }
}

// ── Ledger helpers ────────────────────────────────────────────────────────────

/// Open the WAL and rebuild the current state from it.
fn open_ledger(data_dir: &Path) -> anyhow::Result<(Wal, State)> {
    let now = unix_now();
    let mut wal = Wal::open(data_dir, now).context("opening write-ahead log")?;
    let report = wal.recover(now).context("recovering state from WAL")?;
    Ok((wal, report.state))
}

fn parse_addr(addr: &str) -> anyhow::Result<PublicKey> {
    PublicKey::from_hex(addr).with_context(|| format!("invalid address `{addr}`"))
}

// ── Commands ──────────────────────────────────────────────────────────────────

fn cmd_init(data_dir: &Path, supply: f64) -> anyhow::Result<()> {
    let (mut wal, state) = open_ledger(data_dir)?;
    if wal.is_initialised() || state.account_count() > 0 {
        bail!("ledger already initialised in {}", data_dir.display());
    }

    let keypair = match load_wallet(data_dir) {
        Ok(kp) => kp,
        Err(_) => {
            println!("No wallet found; creating one.");
            create_wallet(data_dir)?
        }
    };

    let now = unix_now();
    wal.append_genesis(&keypair.public(), supply, now)?;
    let genesis = State::genesis(keypair.public(), supply, now)?;
    wal.checkpoint(&genesis, now)?;

    println!("Genesis created.");
    println!("Founder:      {}", keypair.public());
    println!("Total supply: {supply}");
    println!("State hash:   {}", genesis.state_hash());
    Ok(())
}

fn cmd_wallet_create(data_dir: &Path) -> anyhow::Result<()> {
    let keypair = create_wallet(data_dir)?;
    println!("Address: {}", keypair.public());
    println!("Keyfile: {}", wallet::wallet_path(data_dir).display());
    Ok(())
}

fn cmd_balance(data_dir: &Path, addr: &str) -> anyhow::Result<()> {
    let key = parse_addr(addr)?;
    let (_wal, state) = open_ledger(data_dir)?;
    let account = state
        .account(&key)
        .with_context(|| format!("account not found: {addr}"))?;
    println!("Account: {}", key);
    println!("Balance: {:.8}", account.balance);
    println!("Nonce:   {}", account.nonce);
    Ok(())
}

fn cmd_send(data_dir: &Path, to: &str, amount: f64) -> anyhow::Result<()> {
    let to_key = parse_addr(to)?;
    let keypair = load_wallet(data_dir)?;
    let (mut wal, mut state) = open_ledger(data_dir)?;

    let nonce = state.account(&keypair.public()).map_or(0, |a| a.nonce);
    let now = unix_now();
    let mut tx = Transaction::new(keypair.public(), to_key, amount, nonce, now);
    keypair
        .sign_transaction(&mut tx)
        .context("signing transaction")?;

    wal.append_transaction(&tx, now)?;
    state.execute(&tx, now).context("executing transfer")?;

    println!("Sent {amount} to {to_key}");
    println!(
        "Sender balance:   {:.8}",
        state.account(&keypair.public()).map_or(0.0, |a| a.balance)
    );
    println!("State hash:       {}", state.state_hash());
    Ok(())
}

fn cmd_state(data_dir: &Path) -> anyhow::Result<()> {
    let (wal, state) = open_ledger(data_dir)?;
    println!("Version:      {}", state.version());
    println!("Accounts:     {}", state.account_count());
    println!("Total supply: {:.8}", state.total_supply());
    println!("State hash:   {}", state.state_hash());
    println!("Prev hash:    {}", state.prev_hash());
    println!("WAL entries:  {}", wal.entry_count());
    Ok(())
}

fn cmd_verify(data_dir: &Path) -> anyhow::Result<()> {
    let (_wal, state) = open_ledger(data_dir)?;
    state
        .verify_conservation()
        .context("conservation check failed")?;
    let total: f64 = state.accounts().iter().map(|a| a.balance).sum();
    println!("Conservation OK: Σ balances = {:.8}", total);
    Ok(())
}

fn cmd_prove(data_dir: &Path, addr: &str, out: &Path) -> anyhow::Result<()> {
    let key = parse_addr(addr)?;
    let (_wal, state) = open_ledger(data_dir)?;
    let proof = BalanceProof::generate(&state, &key, unix_now())?;
    proof.save(out)?;
    println!("Proof written to {}", out.display());
    println!("State hash: {}", proof.state_hash);
    println!("Balance:    {:.8}", proof.balance);
    Ok(())
}

fn cmd_verify_proof(data_dir: &Path, file: &Path) -> anyhow::Result<()> {
    let (_wal, state) = open_ledger(data_dir)?;
    let proof = BalanceProof::load(file)
        .with_context(|| format!("reading proof from {}", file.display()))?;
    proof
        .verify(&state)
        .context("proof does not verify against the current state")?;
    println!("Proof OK");
    println!("Wallet:  {}", proof.wallet);
    println!("Balance: {:.8}", proof.balance);
    Ok(())
}

fn cmd_delta(file1: &Path, file2: &Path) -> anyhow::Result<()> {
    let before = State::load(file1)
        .with_context(|| format!("loading snapshot {}", file1.display()))?;
    let after = State::load(file2)
        .with_context(|| format!("loading snapshot {}", file2.display()))?;

    let delta = StateDelta::compute(&before, &after);
    println!("From:    {}", delta.prev_hash);
    println!("To:      {}", delta.new_hash);
    println!("Supply:  {:.8}", delta.total_supply);
    println!("Changes: {}", delta.changes.len());
    for (i, ch) in delta.changes.iter().enumerate() {
        println!(
            "  [{i}] {}: {:.8} -> {:.8} (nonce {} -> {})",
            ch.pubkey, ch.old_balance, ch.new_balance, ch.old_nonce, ch.new_nonce
        );
    }
    println!("Encoded size: {} bytes", delta.to_bytes().len());
    Ok(())
}

async fn cmd_node(
    data_dir: &Path,
    port: u16,
    connect: Vec<String>,
    trust: Vec<String>,
) -> anyhow::Result<()> {
    let trusted_validators = trust
        .iter()
        .map(|t| parse_addr(t))
        .collect::<anyhow::Result<Vec<_>>>()?;

    // A local wallet makes this node a validator identity; optional.
    let keypair = load_wallet(data_dir).ok();

    let node = Node::open(
        NodeConfig {
            port,
            connect,
            data_dir: data_dir.to_path_buf(),
            trusted_validators,
        },
        keypair,
    )?;
    node.run().await.context("node terminated")?;
    Ok(())
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
