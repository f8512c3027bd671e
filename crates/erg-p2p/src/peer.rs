use tracing::warn;

use erg_core::{
    PublicKey, Timestamp, BAN_SECS, MAX_MSGS_PER_MINUTE, MAX_TXS_PER_MINUTE, MAX_VIOLATIONS,
};

use crate::message::MessageType;

/// What to do with a peer's message after policy checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerVerdict {
    Allow,
    /// Over a rate limit; drop the message, count a violation.
    Throttled,
    /// The peer is banned; drop silently.
    Banned,
}

/// Per-peer connection state and abuse accounting.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub node_pubkey: Option<PublicKey>,
    pub is_validator: bool,
    pub handshaked: bool,
    pub last_seen: Timestamp,
    pub violations: u32,
    pub banned: bool,
    /// None while unbanned; Some(0) is a permanent ban.
    pub ban_until: Option<Timestamp>,
    window_start: Timestamp,
    msg_count: u32,
    tx_count: u32,
}

impl PeerInfo {
    pub fn new(now: Timestamp) -> Self {
        Self {
            node_pubkey: None,
            is_validator: false,
            handshaked: false,
            last_seen: now,
            violations: 0,
            banned: false,
            ban_until: None,
            window_start: now,
            msg_count: 0,
            tx_count: 0,
        }
    }

    /// Run the per-message policy: ban expiry, the rolling one-minute
    /// message and transaction limits, and violation escalation.
    pub fn record_message(&mut self, kind: MessageType, now: Timestamp) -> PeerVerdict {
        if self.banned {
            match self.ban_until {
                Some(until) if until > 0 && now >= until => {
                    self.banned = false;
                    self.ban_until = None;
                    self.violations = 0;
                }
                _ => return PeerVerdict::Banned,
            }
        }

        if now >= self.window_start + 60 {
            self.window_start = now;
            self.msg_count = 0;
            self.tx_count = 0;
        }

        self.msg_count += 1;
        if self.msg_count > MAX_MSGS_PER_MINUTE {
            self.register_violation(now, false);
            return PeerVerdict::Throttled;
        }

        if kind == MessageType::Tx {
            self.tx_count += 1;
            if self.tx_count > MAX_TXS_PER_MINUTE {
                self.register_violation(now, false);
                return PeerVerdict::Throttled;
            }
        }

        self.last_seen = now;
        PeerVerdict::Allow
    }

    /// Count a protocol violation. Unknown message types escalate straight
    /// to a permanent ban once the threshold is hit.
    pub fn register_violation(&mut self, now: Timestamp, permanent: bool) {
        self.violations += 1;
        if self.violations >= MAX_VIOLATIONS {
            self.ban(now, permanent);
        }
    }

    pub fn ban(&mut self, now: Timestamp, permanent: bool) {
        self.banned = true;
        self.ban_until = if permanent { Some(0) } else { Some(now + BAN_SECS) };
        warn!(
            permanent,
            violations = self.violations,
            "peer banned"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: Timestamp = 1_000_000;

    #[test]
    fn message_rate_limit_throttles() {
        let mut peer = PeerInfo::new(NOW);
        for _ in 0..MAX_MSGS_PER_MINUTE {
            assert_eq!(peer.record_message(MessageType::Ping, NOW), PeerVerdict::Allow);
        }
        assert_eq!(
            peer.record_message(MessageType::Ping, NOW),
            PeerVerdict::Throttled
        );
        assert_eq!(peer.violations, 1);
    }

    #[test]
    fn window_resets_after_a_minute() {
        let mut peer = PeerInfo::new(NOW);
        for _ in 0..MAX_MSGS_PER_MINUTE {
            peer.record_message(MessageType::Ping, NOW);
        }
        assert_eq!(
            peer.record_message(MessageType::Ping, NOW + 60),
            PeerVerdict::Allow
        );
    }

    #[test]
    fn tx_limit_is_tighter() {
        let mut peer = PeerInfo::new(NOW);
        for _ in 0..MAX_TXS_PER_MINUTE {
            assert_eq!(peer.record_message(MessageType::Tx, NOW), PeerVerdict::Allow);
        }
        assert_eq!(
            peer.record_message(MessageType::Tx, NOW),
            PeerVerdict::Throttled
        );
    }

    #[test]
    fn five_violations_ban_for_an_hour() {
        let mut peer = PeerInfo::new(NOW);
        for _ in 0..MAX_VIOLATIONS {
            peer.register_violation(NOW, false);
        }
        assert!(peer.banned);
        assert_eq!(
            peer.record_message(MessageType::Ping, NOW + 1),
            PeerVerdict::Banned
        );
        // Ban expires after an hour.
        assert_eq!(
            peer.record_message(MessageType::Ping, NOW + BAN_SECS + 1),
            PeerVerdict::Allow
        );
    }

    #[test]
    fn permanent_ban_never_expires() {
        let mut peer = PeerInfo::new(NOW);
        peer.ban(NOW, true);
        assert_eq!(
            peer.record_message(MessageType::Ping, NOW + BAN_SECS * 1000),
            PeerVerdict::Banned
        );
    }
}
