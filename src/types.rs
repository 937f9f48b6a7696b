//! Core protocol types: callsigns, message vocabulary, session states.
//!
//! The on-air vocabulary is a closed set of small integers. Everything the
//! session layer routes is tagged with one of these values; payload content
//! is opaque bytes all the way up to the dispatcher boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as Unix epoch seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// =============================================================================
// CALLSIGN
// =============================================================================

/// Maximum callsign length in an AX.25 address field (padded with spaces).
pub const MAX_CALL_LEN: usize = 6;

/// Maximum SSID value (4-bit field in the AX.25 address byte).
pub const MAX_SSID: u8 = 15;

/// An amateur radio station identifier: up to six characters of A-Z / 0-9
/// plus a secondary station id 0..=15.
///
/// Displayed as `CALL` when the SSID is zero and `CALL-N` otherwise, which
/// is also the string form accepted by [`FromStr`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Callsign {
    pub call: String,
    pub ssid: u8,
}

impl Callsign {
    pub fn new(call: &str, ssid: u8) -> Result<Self, CallsignError> {
        let call = call.trim().to_ascii_uppercase();
        if call.is_empty() || call.len() > MAX_CALL_LEN {
            return Err(CallsignError::BadLength(call.len()));
        }
        if !call.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()) {
            return Err(CallsignError::BadCharacter(call));
        }
        if ssid > MAX_SSID {
            return Err(CallsignError::BadSsid(ssid));
        }
        Ok(Self { call, ssid })
    }

    /// Session id derived from this callsign, e.g. `N0CALL-7`.
    pub fn session_id(&self) -> String {
        format!("{}-{}", self.call, self.ssid)
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.call)
        } else {
            write!(f, "{}-{}", self.call, self.ssid)
        }
    }
}

impl FromStr for Callsign {
    type Err = CallsignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((call, ssid)) => {
                let ssid: u8 = ssid
                    .trim()
                    .parse()
                    .map_err(|_| CallsignError::BadSsid(u8::MAX))?;
                Callsign::new(call, ssid)
            }
            None => Callsign::new(s, 0),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CallsignError {
    #[error("callsign must be 1..=6 characters, got {0}")]
    BadLength(usize),

    #[error("callsign contains invalid characters: {0}")]
    BadCharacter(String),

    #[error("ssid out of range 0..=15: {0}")]
    BadSsid(u8),
}

// =============================================================================
// MESSAGE VOCABULARY
// =============================================================================

/// On-air message types, encoded as a small decimal integer in every packet
/// header.
///
/// The session engine interprets only the control subset (Ack through
/// PktMissing). Values past the core set (Note, Zap*) are carried for the
/// application collaborators and routed by integer without interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    DataRequest = 1,
    Response = 2,
    Ack = 3,
    Connect = 4,
    ConnectAck = 5,
    Disconnect = 6,
    KeepAlive = 7,
    ConnectionExpired = 8,
    Notification = 9,
    Ready = 10,
    Done = 11,
    DoneAck = 12,
    Retry = 13,
    PktMissing = 14,
    Note = 15,
    ZapRequest = 16,
    ZapResponse = 17,
}

impl MessageType {
    pub fn wire_value(self) -> u8 {
        self as u8
    }

    /// True for types that travel as bare control packets, without sequence
    /// numbers or a checksum.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            MessageType::Ack
                | MessageType::Connect
                | MessageType::ConnectAck
                | MessageType::Disconnect
                | MessageType::KeepAlive
                | MessageType::Ready
                | MessageType::Done
                | MessageType::DoneAck
                | MessageType::Retry
                | MessageType::PktMissing
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            1 => MessageType::DataRequest,
            2 => MessageType::Response,
            3 => MessageType::Ack,
            4 => MessageType::Connect,
            5 => MessageType::ConnectAck,
            6 => MessageType::Disconnect,
            7 => MessageType::KeepAlive,
            8 => MessageType::ConnectionExpired,
            9 => MessageType::Notification,
            10 => MessageType::Ready,
            11 => MessageType::Done,
            12 => MessageType::DoneAck,
            13 => MessageType::Retry,
            14 => MessageType::PktMissing,
            15 => MessageType::Note,
            16 => MessageType::ZapRequest,
            17 => MessageType::ZapResponse,
            other => return Err(other),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::DataRequest => "DATA_REQUEST",
            MessageType::Response => "RESPONSE",
            MessageType::Ack => "ACK",
            MessageType::Connect => "CONNECT",
            MessageType::ConnectAck => "CONNECT_ACK",
            MessageType::Disconnect => "DISCONNECT",
            MessageType::KeepAlive => "KEEP_ALIVE",
            MessageType::ConnectionExpired => "CONNECTION_EXPIRED",
            MessageType::Notification => "NOTIFICATION",
            MessageType::Ready => "READY",
            MessageType::Done => "DONE",
            MessageType::DoneAck => "DONE_ACK",
            MessageType::Retry => "RETRY",
            MessageType::PktMissing => "PKT_MISSING",
            MessageType::Note => "NOTE",
            MessageType::ZapRequest => "ZAP_REQUEST",
            MessageType::ZapResponse => "ZAP_RESPONSE",
        };
        f.write_str(name)
    }
}

// =============================================================================
// SESSION STATE MACHINE
// =============================================================================

/// Per-session connection state.
///
/// ```text
/// State Transitions:
///
/// ┌──────┐  send CONNECT   ┌────────────┐  CONNECT_ACK + ACK  ┌───────────┐
/// │ Idle │────────────────►│ Connecting │────────────────────►│ Connected │
/// └──────┘                 └────────────┘                     └─────┬─────┘
///                                                                  │
///                       transfer in progress                       │
///              ┌──────────┐            ┌───────────┐               │
///              │ Sending  │◄──────────►│ Receiving │◄──────────────┤
///              └──────────┘            └───────────┘               │
///                                                                  │
///                          send/recv DISCONNECT                    ▼
/// ┌──────────────┐  ACK / timeout   ┌───────────────┐      ┌───────────────┐
/// │ Disconnected │◄─────────────────│ Disconnecting │◄─────│  (any above)  │
/// └──────────────┘                  └───────────────┘      └───────────────┘
///
/// Any state drops to Disconnected on connection_timeout inactivity.
/// Error is terminal until the backend is re-initialized.
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Sending,
    Receiving,
    Disconnecting,
    Disconnected,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callsign_roundtrip() {
        let c: Callsign = "N0CALL-7".parse().unwrap();
        assert_eq!(c.call, "N0CALL");
        assert_eq!(c.ssid, 7);
        assert_eq!(c.to_string(), "N0CALL-7");

        let plain: Callsign = "test1".parse().unwrap();
        assert_eq!(plain.call, "TEST1");
        assert_eq!(plain.ssid, 0);
        assert_eq!(plain.to_string(), "TEST1");
    }

    #[test]
    fn callsign_rejects_garbage() {
        assert!("TOOLONGCALL".parse::<Callsign>().is_err());
        assert!("AB_CD".parse::<Callsign>().is_err());
        assert!("TEST-16".parse::<Callsign>().is_err());
        assert!("".parse::<Callsign>().is_err());
    }

    #[test]
    fn message_type_wire_values() {
        assert_eq!(MessageType::DataRequest.wire_value(), 1);
        assert_eq!(MessageType::PktMissing.wire_value(), 14);
        assert_eq!(MessageType::try_from(10).unwrap(), MessageType::Ready);
        assert!(MessageType::try_from(0).is_err());
        assert!(MessageType::try_from(18).is_err());
    }

    #[test]
    fn control_classification() {
        assert!(MessageType::Ack.is_control());
        assert!(MessageType::PktMissing.is_control());
        assert!(!MessageType::Response.is_control());
        assert!(!MessageType::DataRequest.is_control());
        assert!(!MessageType::Note.is_control());
    }
}
