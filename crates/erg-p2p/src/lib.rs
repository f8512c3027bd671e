//! erg-p2p
//!
//! The peer wire protocol: fixed-header framing over TCP, the message type
//! registry, and per-peer bookkeeping (handshake, rate limits, bans).
//! Policy decisions live here; the node wires them to live sockets.

pub mod codec;
pub mod message;
pub mod peer;

pub use codec::{read_message, write_message};
pub use message::{MessageType, VersionPayload, WireMessage};
pub use peer::{PeerInfo, PeerVerdict};
