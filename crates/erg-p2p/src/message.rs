use erg_core::{ErgError, PublicKey, MAX_WIRE_PAYLOAD, WIRE_HEADER_LEN, WIRE_MAGIC};

/// Wire message types. The discriminants are the on-wire `type` byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Version = 0x01,
    Verack = 0x02,
    GetState = 0x03,
    State = 0x04,
    Tx = 0x05,
    Delta = 0x06,
    Ping = 0x07,
    Pong = 0x08,
    SignedStateHeader = 0x0B,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Version),
            0x02 => Some(Self::Verack),
            0x03 => Some(Self::GetState),
            0x04 => Some(Self::State),
            0x05 => Some(Self::Tx),
            0x06 => Some(Self::Delta),
            0x07 => Some(Self::Ping),
            0x08 => Some(Self::Pong),
            0x0B => Some(Self::SignedStateHeader),
            _ => None,
        }
    }
}

/// Rolling frame checksum: `sum = (sum + byte) * 31` over the payload,
/// truncated to 4 LE bytes. Catches framing slips, not adversaries — the
/// payloads that matter are signed at a higher layer.
pub fn frame_checksum(data: &[u8]) -> [u8; 4] {
    let mut sum: u32 = 0;
    for b in data {
        sum = sum.wrapping_add(*b as u32).wrapping_mul(31);
    }
    sum.to_le_bytes()
}

/// One framed message: header (magic, type, length, checksum) + payload.
#[derive(Clone, Debug, PartialEq)]
pub struct WireMessage {
    pub kind: MessageType,
    pub payload: Vec<u8>,
}

impl WireMessage {
    pub fn new(kind: MessageType, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(WIRE_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&WIRE_MAGIC.to_le_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&frame_checksum(&self.payload));
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a full frame from a buffer (sync counterpart of the async
    /// codec, used by tests and by peers that batch-read).
    pub fn decode(buf: &[u8]) -> Result<Self, ErgError> {
        if buf.len() < WIRE_HEADER_LEN {
            return Err(ErgError::MalformedMessage("header truncated".into()));
        }
        let magic = u32::from_le_bytes(buf[..4].try_into().unwrap());
        if magic != WIRE_MAGIC {
            return Err(ErgError::MalformedMessage(format!(
                "bad magic {magic:#010x}"
            )));
        }
        let kind_raw = buf[4];
        let length = u32::from_le_bytes(buf[5..9].try_into().unwrap()) as usize;
        if length > MAX_WIRE_PAYLOAD {
            return Err(ErgError::MalformedMessage(format!(
                "payload of {length} bytes exceeds cap"
            )));
        }
        if buf.len() < WIRE_HEADER_LEN + length {
            return Err(ErgError::MalformedMessage("payload truncated".into()));
        }
        let checksum: [u8; 4] = buf[9..13].try_into().unwrap();
        let payload = buf[WIRE_HEADER_LEN..WIRE_HEADER_LEN + length].to_vec();
        if frame_checksum(&payload) != checksum {
            return Err(ErgError::MalformedMessage("checksum mismatch".into()));
        }
        let kind =
            MessageType::from_u8(kind_raw).ok_or(ErgError::UnknownMessageType(kind_raw))?;
        Ok(Self { kind, payload })
    }
}

/// Version handshake payload: the sender's state version and node pubkey,
/// so the receiver can mark the peer as validator-or-not.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionPayload {
    pub version: u64,
    pub node_pubkey: PublicKey,
}

impl VersionPayload {
    pub fn to_bytes(&self) -> [u8; 40] {
        let mut buf = [0u8; 40];
        buf[..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..].copy_from_slice(self.node_pubkey.as_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, ErgError> {
        if buf.len() < 40 {
            return Err(ErgError::MalformedMessage(
                "version payload truncated".into(),
            ));
        }
        let mut pk = [0u8; 32];
        pk.copy_from_slice(&buf[8..40]);
        Ok(Self {
            version: u64::from_le_bytes(buf[..8].try_into().unwrap()),
            node_pubkey: PublicKey::from_bytes(pk),
        })
    }
}
