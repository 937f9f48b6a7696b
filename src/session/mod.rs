//! Session state and bookkeeping.
//!
//! A session is the bounded context between two callsigns. It is pure
//! state: buffers, counters, timestamps. All mutation happens from the one
//! task driving the transfer; backends keep their own per-session transport
//! handles keyed by the session id.

pub mod engine;
pub mod timing;

use crate::types::{Callsign, SessionState};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::info;

pub use engine::{Inbound, SessionEngine, SessionError};

/// Connection context with one remote station.
#[derive(Debug)]
pub struct Session {
    /// Derived from the remote callsign, e.g. `N0CALL-7`.
    pub id: String,
    pub remote: Callsign,
    pub state: SessionState,
    /// Expected packet count for the transfer in progress.
    pub total_packets: u16,
    /// seq -> payload for everything we have transmitted this transfer.
    pub sent_packets: BTreeMap<u16, Vec<u8>>,
    /// seq -> payload for everything received this transfer.
    pub received_packets: BTreeMap<u16, Vec<u8>>,
    /// Sequence numbers the peer has acknowledged.
    pub acked_packets: BTreeSet<u16>,
    pub last_activity: Instant,
    /// A DATA_REQUEST that arrived during the connect handshake, treated as
    /// an implicit ACK and held for processing once CONNECTED.
    pub pending_request: Option<Vec<u8>>,
    /// Message type of the inbound transfer being accumulated, for routing
    /// the reassembled body.
    pub inbound_kind: Option<crate::types::MessageType>,
    /// Message type of the outbound transfer in `sent_packets`, so
    /// recovered packets go back out under their original type.
    pub outbound_kind: Option<crate::types::MessageType>,
}

impl Session {
    pub fn new(remote: Callsign) -> Self {
        Self {
            id: remote.session_id(),
            remote,
            state: SessionState::Idle,
            total_packets: 0,
            sent_packets: BTreeMap::new(),
            received_packets: BTreeMap::new(),
            acked_packets: BTreeSet::new(),
            last_activity: Instant::now(),
            pending_request: None,
            inbound_kind: None,
            outbound_kind: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Clear transfer buffers for a fresh outbound or inbound message.
    pub fn reset_transfer(&mut self) {
        self.total_packets = 0;
        self.sent_packets.clear();
        self.received_packets.clear();
        self.acked_packets.clear();
        self.inbound_kind = None;
        self.outbound_kind = None;
    }

    /// Receiver side: sequence numbers not yet present.
    pub fn missing_received(&self) -> Vec<u16> {
        (1..=self.total_packets)
            .filter(|seq| !self.received_packets.contains_key(seq))
            .collect()
    }

    /// Sender side: sequence numbers sent but never acknowledged.
    pub fn missing_acks(&self) -> Vec<u16> {
        (1..=self.total_packets)
            .filter(|seq| !self.acked_packets.contains(seq))
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            SessionState::Connected | SessionState::Sending | SessionState::Receiving
        )
    }
}

/// One-slot session registry.
///
/// A station talks to exactly one peer at a time; a new incoming CONNECT
/// while a session exists evicts the stale one first. The inactivity sweep
/// backs up the per-wait timeouts in case a transfer loop wedges.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    current: Option<Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Session> {
        self.current.as_mut()
    }

    /// Install a new session, cleaning up any stale one.
    pub fn install(&mut self, session: Session) -> &mut Session {
        if let Some(stale) = self.current.take() {
            info!(target: "hamstr::session", "Cleaning up stale session {}", stale.id);
        }
        self.current.insert(session)
    }

    pub fn take(&mut self) -> Option<Session> {
        self.current.take()
    }

    /// Drop the session and log, marking it disconnected.
    pub fn remove(&mut self) {
        if let Some(mut session) = self.current.take() {
            session.state = SessionState::Disconnected;
            info!(target: "hamstr::session", "Disconnected session: {}", session.id);
        }
    }

    /// Evict the session if idle beyond `timeout`. Returns true on eviction.
    pub fn sweep(&mut self, timeout: Duration) -> bool {
        let expired = self
            .current
            .as_ref()
            .map(|s| s.idle_for() > timeout)
            .unwrap_or(false);
        if expired {
            info!(target: "hamstr::session", "Connection timeout, evicting idle session");
            self.remove();
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("TEST-1".parse().unwrap())
    }

    #[test]
    fn missing_sets() {
        let mut s = session();
        s.total_packets = 5;
        s.received_packets.insert(1, vec![]);
        s.received_packets.insert(3, vec![]);
        s.received_packets.insert(5, vec![]);
        assert_eq!(s.missing_received(), vec![2, 4]);

        s.acked_packets.insert(2);
        assert_eq!(s.missing_acks(), vec![1, 3, 4, 5]);
    }

    #[test]
    fn registry_single_slot() {
        let mut reg = SessionRegistry::new();
        reg.install(session());
        let other = Session::new("TEST-2".parse().unwrap());
        reg.install(other);
        assert_eq!(reg.current().unwrap().id, "TEST-2");
        reg.remove();
        assert!(reg.current().is_none());
    }

    #[test]
    fn sweep_honors_timeout() {
        let mut reg = SessionRegistry::new();
        reg.install(session());
        assert!(!reg.sweep(Duration::from_secs(60)));
        reg.current_mut().unwrap().last_activity = Instant::now() - Duration::from_secs(61);
        assert!(reg.sweep(Duration::from_secs(60)));
        assert!(reg.current().is_none());
    }
}
