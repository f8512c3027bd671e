use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;

use erg_core::{ErgError, PublicKey, Signature, Transaction};

/// An Ed25519 keypair with its derived 32-byte public identity.
///
/// The signing key is zeroized on drop (dalek's `zeroize` feature).
pub struct Keypair {
    public: PublicKey,
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let public = PublicKey::from_bytes(signing.verifying_key().to_bytes());
        Self { public, signing }
    }

    /// Restore a keypair from the 32-byte secret seed (e.g. a wallet file).
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(secret);
        let public = PublicKey::from_bytes(signing.verifying_key().to_bytes());
        Self { public, signing }
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// The 32-byte secret seed, for wallet persistence. Handle with care.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Sign arbitrary bytes with this keypair.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from_bytes(self.signing.sign(message).to_bytes())
    }

    /// Sign a transaction in place.
    ///
    /// Refuses to sign when this keypair's public key does not match
    /// `tx.from`: a producer must never be able to authorise a transfer out
    /// of an account it does not hold the key for.
    pub fn sign_transaction(&self, tx: &mut Transaction) -> Result<(), ErgError> {
        if tx.from != self.public {
            return Err(ErgError::Crypto(format!(
                "signer {} does not match sender {}",
                self.public, tx.from
            )));
        }
        tx.signature = self.sign(&tx.signing_bytes());
        Ok(())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair {{ public: {:?} }}", self.public)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::verify_transaction;

    #[test]
    fn sign_and_verify_transfer() {
        let kp = Keypair::generate();
        let to = Keypair::generate();
        let mut tx = Transaction::new(kp.public(), to.public(), 10.0, 0, 1_000);
        kp.sign_transaction(&mut tx).unwrap();
        assert!(verify_transaction(&tx).is_ok());
    }

    #[test]
    fn refuses_to_impersonate() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let mut tx = Transaction::new(other.public(), kp.public(), 10.0, 0, 1_000);
        assert!(matches!(
            kp.sign_transaction(&mut tx),
            Err(ErgError::Crypto(_))
        ));
    }

    #[test]
    fn secret_round_trip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_bytes(&kp.secret_bytes());
        assert_eq!(restored.public(), kp.public());
    }
}
