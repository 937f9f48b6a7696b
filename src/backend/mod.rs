//! Transport backends.
//!
//! One physical link per process, selected by configuration: AX.25 packet
//! through a KISS TNC, a VARA HF modem, or a mesh link. Each backend moves
//! raw byte buffers; reliability above the transport's own guarantees is
//! the session engine's business, and only the packet backend needs it.
//!
//! Dispatch is a plain enum. The uniform data-plane surface lives here;
//! the packet variant's control handshake (CONNECT / CONNECT_ACK) is
//! driven by the session engine, which owns the timing rules it needs.

pub mod packet;
pub mod ptt;
pub mod reticulum;
pub mod vara;

use crate::config::{Role, StationConfig};
use crate::mesh::MeshError;
use crate::session::Session;
use crate::types::{Callsign, SessionState};
use crate::wire::WireError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use packet::PacketBackend;
pub use reticulum::ReticulumBackend;
pub use vara::VaraBackend;

// =============================================================================
// SELECTION & STATUS
// =============================================================================

/// Backend selection, one string per role in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Packet,
    Vara,
    Reticulum,
    Fldigi,
}

impl BackendKind {
    /// Transports with their own reliability run the direct protocol;
    /// bare packet needs the per-packet ACK engine.
    pub fn is_reliable_transport(self) -> bool {
        !matches!(self, BackendKind::Packet)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::Packet => "packet",
            BackendKind::Vara => "vara",
            BackendKind::Reticulum => "reticulum",
            BackendKind::Fldigi => "fldigi",
        };
        f.write_str(s)
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "packet" => Ok(BackendKind::Packet),
            "vara" => Ok(BackendKind::Vara),
            "reticulum" => Ok(BackendKind::Reticulum),
            "fldigi" => Ok(BackendKind::Fldigi),
            other => Err(format!(
                "invalid backend type '{other}', valid: packet, vara, reticulum, fldigi"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendStatus::Disconnected => "disconnected",
            BackendStatus::Connecting => "connecting",
            BackendStatus::Connected => "connected",
            BackendStatus::Error => "error",
        };
        f.write_str(s)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error("backend is not connected")]
    NotConnected,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("connect timeout to {0}")]
    ConnectTimeout(String),

    #[error("payload of {len} bytes exceeds the {max} byte frame limit")]
    Oversize { len: usize, max: usize },

    #[error("modem error: {0}")]
    Modem(String),

    #[error("modem transmit stalled")]
    ModemStall,

    #[error("configuration error: {0}")]
    Config(String),
}

// =============================================================================
// DISPATCH
// =============================================================================

/// The station's one physical link.
pub enum RadioBackend {
    Packet(PacketBackend),
    Vara(VaraBackend),
    Reticulum(ReticulumBackend),
}

impl RadioBackend {
    pub fn kind(&self) -> BackendKind {
        match self {
            RadioBackend::Packet(_) => BackendKind::Packet,
            RadioBackend::Vara(_) => BackendKind::Vara,
            RadioBackend::Reticulum(_) => BackendKind::Reticulum,
        }
    }

    pub fn status(&self) -> BackendStatus {
        match self {
            RadioBackend::Packet(b) => b.status,
            RadioBackend::Vara(b) => b.status,
            RadioBackend::Reticulum(b) => b.status,
        }
    }

    /// The packet variant, for the session engine. Calling a packet-only
    /// path on a direct transport is a wiring bug, reported as config
    /// error rather than a panic.
    pub fn as_packet_mut(&mut self) -> Result<&mut PacketBackend, BackendError> {
        match self {
            RadioBackend::Packet(b) => Ok(b),
            other => Err(BackendError::Config(format!(
                "operation requires the packet backend, active backend is {}",
                other.kind()
            ))),
        }
    }

    /// Establish the transport for a direct backend (VARA, mesh). The
    /// packet variant only opens its TNC here; its control handshake runs
    /// in the session engine.
    pub async fn connect(&mut self, remote: Option<&Callsign>) -> Result<Session, BackendError> {
        match self {
            RadioBackend::Packet(b) => {
                b.start().await?;
                let remote = remote.ok_or_else(|| {
                    BackendError::Config("packet connect requires a remote callsign".into())
                })?;
                let mut session = Session::new(remote.clone());
                session.state = SessionState::Connecting;
                Ok(session)
            }
            RadioBackend::Vara(b) => b.connect(remote).await,
            RadioBackend::Reticulum(b) => b.connect(remote).await,
        }
    }

    /// Deliver one complete application buffer.
    pub async fn send_data(&mut self, session: &mut Session, data: &[u8]) -> Result<(), BackendError> {
        match self {
            RadioBackend::Packet(b) => b.send_frame(&session.remote, data).await,
            RadioBackend::Vara(b) => b.send_data(session, data).await,
            RadioBackend::Reticulum(b) => b.send_data(session, data).await,
        }
    }

    /// Return exactly one application buffer, or None on idle timeout.
    pub async fn receive_data(
        &mut self,
        session: &mut Session,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, BackendError> {
        match self {
            RadioBackend::Packet(b) => Ok(b
                .receive_from(timeout)
                .await?
                .map(|(_, payload)| payload)),
            RadioBackend::Vara(b) => b.receive_data(session, timeout).await,
            RadioBackend::Reticulum(b) => b.receive_data(session, timeout).await,
        }
    }

    /// Release the transport. Idempotent on every variant.
    pub async fn disconnect(&mut self, session: &mut Session) -> Result<(), BackendError> {
        match self {
            RadioBackend::Packet(b) => {
                session.state = SessionState::Disconnected;
                b.stop();
                Ok(())
            }
            RadioBackend::Vara(b) => b.disconnect(session).await,
            RadioBackend::Reticulum(b) => b.disconnect(session).await,
        }
    }

    pub async fn is_connected(&self, session: &Session) -> bool {
        match self {
            RadioBackend::Packet(b) => session.is_connected() && b.is_started(),
            RadioBackend::Vara(b) => b.is_connected(session).await,
            RadioBackend::Reticulum(b) => b.is_connected(session),
        }
    }

    pub async fn shutdown(&mut self) {
        match self {
            RadioBackend::Packet(b) => b.stop(),
            RadioBackend::Vara(b) => b.shutdown().await,
            RadioBackend::Reticulum(b) => b.shutdown().await,
        }
    }
}

// =============================================================================
// FACTORY
// =============================================================================

/// Build the configured backend for this station.
///
/// Servers bring their transport up immediately (listen sockets, mesh
/// destination); clients defer whatever can wait until the first connect.
pub async fn create_backend(cfg: &StationConfig) -> Result<RadioBackend, BackendError> {
    let is_server = cfg.role == Role::Server;
    match cfg.backend {
        BackendKind::Packet => {
            let mut backend = PacketBackend::new(
                cfg.callsign.clone(),
                cfg.tnc.clone(),
                cfg.protocol.max_packet_size,
            );
            if is_server {
                backend.start().await?;
            }
            Ok(RadioBackend::Packet(backend))
        }
        BackendKind::Vara => {
            let mut backend = VaraBackend::new(cfg.callsign.clone(), cfg.vara.clone(), is_server);
            if is_server {
                backend.initialize().await?;
            }
            Ok(RadioBackend::Vara(backend))
        }
        BackendKind::Reticulum => Ok(RadioBackend::Reticulum(
            ReticulumBackend::new(cfg.mesh.clone(), is_server).await?,
        )),
        BackendKind::Fldigi => Err(BackendError::Config(
            "fldigi backend is not configured on this build; use packet, vara or reticulum".into(),
        )),
    }
}
