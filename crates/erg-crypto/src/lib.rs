pub mod hash;
pub mod keypair;
pub mod verify;

pub use hash::sha256;
pub use keypair::Keypair;
pub use verify::{batch_verify, verify_transaction};
