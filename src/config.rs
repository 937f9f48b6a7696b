//! Station and protocol configuration.
//!
//! Everything timing-related in the session layer derives from two knobs:
//! `connection_stabilization_delay` scales the settle pauses around
//! transmit/receive turnarounds, and `baud_rate` drives the estimated
//! on-air time per frame. The rest of the options bound retries and waits.
//!
//! Configuration is a plain serde struct: load from a JSON file, override
//! from the command line, or construct in code with `..Default::default()`.

use crate::backend::BackendKind;
use crate::types::Callsign;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// PROTOCOL TIMING / RETRY OPTIONS
// =============================================================================

/// Session-layer tuning options.
///
/// Defaults are sized for 1200 baud AFSK packet. Faster links can shrink
/// the timeouts; the relationships between them should be preserved
/// (ack_timeout well under connection_timeout, ready_timeout above
/// ack_timeout).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Attempts per packet (and per CONNECT) before giving up.
    pub send_retries: u32,
    /// Seconds to wait for a per-packet ACK. Doubled for the first packet
    /// of a transfer, which rides on a fresh turnaround.
    pub ack_timeout: u64,
    /// Largest application payload accepted by the packet backend in one
    /// frame. The session engine reserves 15 bytes of this for the data
    /// packet header and checksum.
    pub max_packet_size: usize,
    /// Seconds of inactivity after which a session is torn down.
    pub connection_timeout: u64,
    /// Seconds between keep-alive probes on an otherwise idle session.
    pub keep_alive_interval: u64,
    /// Seconds to wait for CONNECT_ACK on each connection attempt.
    pub connection_attempt_timeout: u64,
    /// Fixed per-frame send delay added to the estimated on-air time.
    pub packet_send_delay: f64,
    /// Seconds to wait for the ACK of a DISCONNECT.
    pub disconnect_timeout: u64,
    /// Seconds the sender lingers after DONE for a PKT_MISSING request.
    pub missing_packets_timeout: u64,
    /// Modem rate used to estimate transmission time (bits/sec).
    pub baud_rate: u32,
    /// Receiver: seconds without any packet before recovery or disconnect.
    pub no_packet_timeout: u64,
    /// Seconds to wait for the peer's READY during role turnaround.
    pub ready_timeout: u64,
    /// Fraction of packets that must already be present before the
    /// receiver proactively requests the missing ones instead of
    /// treating silence as a disconnect.
    pub missing_packets_threshold: f64,
    /// Base settle pause (seconds) around turnarounds; several places use
    /// small multiples of this.
    pub connection_stabilization_delay: f64,
    /// PTT lead time before data leaves the radio.
    pub ptt_tx_delay: f64,
    /// Tail delay after data packets.
    pub ptt_rx_delay: f64,
    /// Short tail after ACK frames.
    pub ptt_tail: f64,
    /// Longer spacing after connection control frames.
    pub ptt_ack_spacing: f64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            send_retries: 3,
            ack_timeout: 10,
            max_packet_size: 230,
            connection_timeout: 120,
            keep_alive_interval: 30,
            connection_attempt_timeout: 30,
            packet_send_delay: 0.5,
            disconnect_timeout: 10,
            missing_packets_timeout: 30,
            baud_rate: 1200,
            no_packet_timeout: 30,
            ready_timeout: 60,
            missing_packets_threshold: 0.8,
            connection_stabilization_delay: 1.0,
            ptt_tx_delay: 0.25,
            ptt_rx_delay: 0.25,
            ptt_tail: 0.1,
            ptt_ack_spacing: 0.5,
        }
    }
}

impl ProtocolConfig {
    pub fn ack_timeout_dur(&self) -> Duration {
        Duration::from_secs(self.ack_timeout)
    }

    pub fn stabilization_delay(&self) -> Duration {
        Duration::from_secs_f64(self.connection_stabilization_delay)
    }

    /// Payload bytes available per data packet after header + checksum.
    pub fn max_payload(&self) -> usize {
        self.max_packet_size.saturating_sub(15)
    }
}

// =============================================================================
// TRANSPORT ENDPOINTS
// =============================================================================

/// Where the KISS TNC lives: a network socket or a serial port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TncEndpoint {
    Tcp { host: String, port: u16 },
    Serial { path: String, baud: u32 },
}

impl Default for TncEndpoint {
    fn default() -> Self {
        TncEndpoint::Tcp {
            host: "127.0.0.1".into(),
            port: 8001,
        }
    }
}

/// Serial PTT keying for radios that need it (VARA HF).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PttConfig {
    pub port: String,
    pub baud: u32,
    /// "rts", "dtr" or "both"
    pub method: String,
    /// Seconds to hold PTT before the modem keys up.
    pub pre_delay: f64,
    /// Seconds to hold PTT after the modem stops.
    pub post_delay: f64,
}

impl Default for PttConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baud: 38400,
            method: "both".into(),
            pre_delay: 0.1,
            post_delay: 0.1,
        }
    }
}

/// VARA HF modem endpoints and behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaraConfig {
    pub host: String,
    pub command_port: u16,
    pub data_port: u16,
    /// Bandwidth in Hz, passed through to the `BW` command (500, 2300, ...).
    pub bandwidth: u32,
    /// `CHAT ON` keeps the modem out of winlink-specific behavior.
    pub chat_mode: bool,
    /// Seconds to wait for the modem to report CONNECTED.
    pub connect_timeout: u64,
    /// Optional hardware PTT; absent means VOX or VARA FM keying.
    pub ptt: Option<PttConfig>,
}

impl Default for VaraConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            command_port: 8300,
            data_port: 8301,
            bandwidth: 2300,
            chat_mode: true,
            connect_timeout: 90,
            ptt: None,
        }
    }
}

/// Mesh backend settings.
///
/// The server needs only an identity path; it derives and announces its
/// destination. The client needs the server's published destination hash
/// and public key, plus the address of a reachable mesh entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Persistent identity file. Created with mode 0600 on first use.
    pub identity_path: PathBuf,
    /// Seconds between destination announcements (server).
    pub announce_interval: u64,
    /// TCP address the server listens on for mesh links.
    pub listen_addr: String,
    /// Published server destination hash (16 bytes hex), client side.
    pub server_hash: Option<String>,
    /// Published server public key (32 bytes hex), client side.
    pub server_pubkey: Option<String>,
    /// Mesh entry point the client dials.
    pub server_addr: Option<String>,
    /// Seconds to wait for the link to become active.
    pub link_timeout: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            identity_path: PathBuf::from("data/mesh_identity"),
            announce_interval: 21600,
            listen_addr: "0.0.0.0:4965".into(),
            server_hash: None,
            server_pubkey: None,
            server_addr: None,
            link_timeout: 60,
        }
    }
}

// =============================================================================
// STATION
// =============================================================================

/// Which side of the bridge this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

/// Everything one station needs to get on the air.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    pub role: Role,
    pub backend: BackendKind,
    /// Our own callsign.
    pub callsign: Callsign,
    /// The server station a client connects to. Unused on the server side.
    pub remote: Option<Callsign>,
    #[serde(default)]
    pub tnc: TncEndpoint,
    #[serde(default)]
    pub vara: VaraConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

impl StationConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        serde_json::from_str(&data).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self).expect("config serializes");
        std::fs::write(path, data).map_err(|e| ConfigError::Read(path.to_path_buf(), e))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("cannot parse config {0}: {1}")]
    Parse(PathBuf, serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let cfg = ProtocolConfig::default();
        assert!(cfg.ack_timeout < cfg.connection_timeout);
        assert!(cfg.ready_timeout >= cfg.ack_timeout);
        assert_eq!(cfg.max_payload(), cfg.max_packet_size - 15);
        assert!(cfg.missing_packets_threshold > 0.0 && cfg.missing_packets_threshold <= 1.0);
    }

    #[test]
    fn station_config_json_roundtrip() {
        let cfg = StationConfig {
            role: Role::Client,
            backend: BackendKind::Packet,
            callsign: "N0CALL-1".parse().unwrap(),
            remote: Some("N0CALL-2".parse().unwrap()),
            tnc: TncEndpoint::default(),
            vara: VaraConfig::default(),
            mesh: MeshConfig::default(),
            protocol: ProtocolConfig::default(),
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: StationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.callsign.session_id(), "N0CALL-1");
        assert_eq!(back.backend, BackendKind::Packet);
    }
}
