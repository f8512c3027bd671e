pub mod account;
pub mod constants;
pub mod error;
pub mod transaction;
pub mod types;

pub use account::Account;
pub use constants::*;
pub use error::ErgError;
pub use transaction::Transaction;
pub use types::{Amount, Nonce, PublicKey, Signature, StateHash, Timestamp};
