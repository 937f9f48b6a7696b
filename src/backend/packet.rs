//! Packet radio backend: AX.25 UI frames through a KISS TNC.
//!
//! The TNC is an external box reached over TCP or a serial line. This
//! backend moves exactly one frame per call and never segments; splitting a
//! message across frames belongs to the session engine above it.

use super::{BackendError, BackendStatus};
use crate::config::TncEndpoint;
use crate::types::Callsign;
use crate::wire::ax25::{build_ui_frame, parse_ui_frame};
use crate::wire::kiss::{kiss_unwrap, kiss_wrap, FrameScanner};
use std::io::Read;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Receive poll slice; bounded waits are built from these.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// One open path to the TNC.
///
/// Serial ports block, so a dedicated reader thread drains the port into a
/// channel and writes go through the cloned handle; the TCP path reads
/// directly with timeouts.
enum TncStream {
    Tcp(TcpStream),
    Serial {
        writer: Box<dyn serialport::SerialPort>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    },
}

// `dyn SerialPort` only exposes mutating operations (`io::Read`/`io::Write`
// take `&mut self`), so a shared `&TncStream` can never be used to touch the
// port; Rust's own aliasing rules already serialize the `&mut` access paths.
unsafe impl Sync for TncStream {}

impl TncStream {
    async fn open(endpoint: &TncEndpoint) -> Result<Self, BackendError> {
        match endpoint {
            TncEndpoint::Tcp { host, port } => {
                let addr = format!("{host}:{port}");
                let stream = tokio::time::timeout(
                    Duration::from_secs(5),
                    TcpStream::connect(&addr),
                )
                .await
                .map_err(|_| BackendError::ConnectTimeout(addr.clone()))?
                .map_err(BackendError::Io)?;
                info!(target: "hamstr::tnc", "Connected to TNC at {addr}");
                Ok(TncStream::Tcp(stream))
            }
            TncEndpoint::Serial { path, baud } => {
                let writer = serialport::new(path, *baud)
                    .timeout(Duration::from_millis(100))
                    .open()
                    .map_err(BackendError::Serial)?;
                let mut reader = writer.try_clone().map_err(BackendError::Serial)?;
                let (tx, rx) = mpsc::unbounded_channel();
                std::thread::Builder::new()
                    .name("tnc-serial-reader".into())
                    .spawn(move || {
                        let mut buf = [0u8; 1024];
                        loop {
                            match reader.read(&mut buf) {
                                Ok(0) => continue,
                                Ok(n) => {
                                    if tx.send(buf[..n].to_vec()).is_err() {
                                        break;
                                    }
                                }
                                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                                Err(_) => break,
                            }
                        }
                    })
                    .map_err(BackendError::Io)?;
                info!(target: "hamstr::tnc", "Connected to serial TNC at {path}:{baud}");
                Ok(TncStream::Serial { writer, rx })
            }
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), BackendError> {
        match self {
            TncStream::Tcp(stream) => stream.write_all(bytes).await.map_err(BackendError::Io),
            TncStream::Serial { writer, .. } => {
                use std::io::Write;
                writer.write_all(bytes).map_err(BackendError::Io)?;
                writer.flush().map_err(BackendError::Io)
            }
        }
    }

    /// Read one chunk of raw bytes, or None on timeout.
    async fn read_chunk(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, BackendError> {
        match self {
            TncStream::Tcp(stream) => {
                let mut buf = [0u8; 1024];
                match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
                    Err(_) => Ok(None),
                    Ok(Ok(0)) => Err(BackendError::ConnectionClosed),
                    Ok(Ok(n)) => Ok(Some(buf[..n].to_vec())),
                    Ok(Err(e)) => Err(BackendError::Io(e)),
                }
            }
            TncStream::Serial { rx, .. } => match tokio::time::timeout(timeout, rx.recv()).await {
                Err(_) => Ok(None),
                Ok(Some(chunk)) => Ok(Some(chunk)),
                Ok(None) => Err(BackendError::ConnectionClosed),
            },
        }
    }
}

pub struct PacketBackend {
    callsign: Callsign,
    endpoint: TncEndpoint,
    max_frame_payload: usize,
    stream: Option<TncStream>,
    scanner: FrameScanner,
    pub(crate) status: BackendStatus,
}

impl PacketBackend {
    pub fn new(callsign: Callsign, endpoint: TncEndpoint, max_frame_payload: usize) -> Self {
        Self {
            callsign,
            endpoint,
            max_frame_payload,
            stream: None,
            scanner: FrameScanner::new(),
            status: BackendStatus::Disconnected,
        }
    }

    pub fn callsign(&self) -> &Callsign {
        &self.callsign
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_some()
    }

    /// Open the TNC connection. Refused connections are transport-fatal:
    /// the backend latches Error until `start` succeeds again.
    pub async fn start(&mut self) -> Result<(), BackendError> {
        if self.stream.is_some() {
            return Ok(());
        }
        self.set_status(BackendStatus::Connecting);
        match TncStream::open(&self.endpoint).await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.scanner = FrameScanner::new();
                self.set_status(BackendStatus::Connected);
                Ok(())
            }
            Err(e) => {
                error!(target: "hamstr::tnc", "TNC connection failed: {e}");
                self.set_status(BackendStatus::Error);
                Err(e)
            }
        }
    }

    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            debug!(target: "hamstr::tnc", "TNC connection closed");
        }
        self.set_status(BackendStatus::Disconnected);
    }

    /// Send one frame's worth of payload to `dest`. Payloads past the frame
    /// limit are refused; callers segment above this layer.
    pub async fn send_frame(&mut self, dest: &Callsign, payload: &[u8]) -> Result<(), BackendError> {
        if payload.len() > self.max_frame_payload {
            return Err(BackendError::Oversize {
                len: payload.len(),
                max: self.max_frame_payload,
            });
        }
        let source = self.callsign.clone();
        let stream = self.stream.as_mut().ok_or(BackendError::NotConnected)?;
        let frame = kiss_wrap(&build_ui_frame(&source, dest, payload));
        stream.write_all(&frame).await
    }

    /// Receive the next frame addressed to us, as `(source, payload)`.
    ///
    /// Waits up to `timeout`, polling in 0.1 s slices. Frames that fail to
    /// unwrap or parse are logged and skipped; the wait keeps going until a
    /// good frame or the deadline.
    pub async fn receive_from(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<(Callsign, Vec<u8>)>, BackendError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = self.scanner.next_frame() {
                match decode_frame(&frame) {
                    Ok(decoded) => return Ok(Some(decoded)),
                    Err(e) => {
                        warn!(target: "hamstr::packet", "Dropping undecodable frame: {e}");
                        continue;
                    }
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let slice = POLL_SLICE.min(deadline - now);
            let stream = self.stream.as_mut().ok_or(BackendError::NotConnected)?;
            match stream.read_chunk(slice).await {
                Ok(Some(chunk)) => self.scanner.push(&chunk),
                Ok(None) => {}
                Err(e) => {
                    self.set_status(BackendStatus::Error);
                    return Err(e);
                }
            }
        }
    }

    fn set_status(&mut self, status: BackendStatus) {
        if self.status != status {
            info!(target: "hamstr::tnc", "Packet backend status: {} -> {}", self.status, status);
            self.status = status;
        }
    }
}

fn decode_frame(kiss_frame: &[u8]) -> Result<(Callsign, Vec<u8>), BackendError> {
    let ax25 = kiss_unwrap(kiss_frame).map_err(BackendError::Wire)?;
    let ui = parse_ui_frame(&ax25).map_err(BackendError::Wire)?;
    Ok((ui.source, ui.payload))
}
