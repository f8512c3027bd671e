//! Wallet keyfile handling: a JSON file holding the hex-encoded Ed25519
//! seed and its derived address.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use erg_crypto::Keypair;

pub const WALLET_FILE: &str = "wallet.json";

#[derive(Serialize, Deserialize)]
struct WalletFile {
    public_key: String,
    secret_key: String,
}

pub fn wallet_path(data_dir: &Path) -> PathBuf {
    data_dir.join(WALLET_FILE)
}

/// Generate a keypair and write the keyfile. Refuses to overwrite.
pub fn create_wallet(data_dir: &Path) -> anyhow::Result<Keypair> {
    let path = wallet_path(data_dir);
    if path.exists() {
        bail!("wallet already exists at {}", path.display());
    }
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let keypair = Keypair::generate();
    let record = WalletFile {
        public_key: keypair.public().to_hex(),
        secret_key: hex::encode(keypair.secret_bytes()),
    };
    let json = serde_json::to_string_pretty(&record)?;
    std::fs::write(&path, json)
        .with_context(|| format!("writing keyfile {}", path.display()))?;
    Ok(keypair)
}

/// Load the keypair from the keyfile, verifying the recorded address.
pub fn load_wallet(data_dir: &Path) -> anyhow::Result<Keypair> {
    let path = wallet_path(data_dir);
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("reading keyfile {}", path.display()))?;
    let record: WalletFile = serde_json::from_str(&json).context("parsing keyfile")?;

    // Wipe the intermediate copy of the seed once the keypair is built.
    let secret = Zeroizing::new(hex::decode(&record.secret_key).context("decoding secret key")?);
    if secret.len() != 32 {
        bail!("secret key must be 32 bytes");
    }
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&secret);
    let keypair = Keypair::from_secret_bytes(&seed);
    seed.fill(0);

    if keypair.public().to_hex() != record.public_key {
        bail!("keyfile public key does not match its secret key");
    }
    Ok(keypair)
}
