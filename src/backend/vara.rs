//! VARA HF modem backend.
//!
//! VARA exposes two TCP sockets on the local machine: a command socket
//! speaking `\r`-terminated text, and a data socket carrying the payload
//! stream. The modem is reliable on its own (ARQ inside), so this backend
//! carries whole application buffers and the dispatcher runs the direct
//! protocol over it.
//!
//! A dedicated reader task owns the command socket's read half and folds
//! the modem's asynchronous notifications (CONNECTED, DISCONNECTED, PTT
//! ON/OFF, BUFFER n) into shared state. PTT edges drive the optional serial
//! keying line from that task, so keying tracks the modem even while the
//! session task is deep in a send.

use super::ptt::PttController;
use super::{BackendError, BackendStatus};
use crate::config::VaraConfig;
use crate::session::Session;
use crate::types::{Callsign, SessionState};
use crate::wire::ax25::{build_ui_frame, parse_ui_frame};
use crate::wire::kiss::{kiss_unwrap, kiss_wrap, FrameScanner};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// No buffer-level movement for this long while transmitting means the
/// modem has stalled and the send is abandoned.
const TX_STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Absolute ceiling on one transmission, stalled or not.
const TX_SAFETY_LIMIT: Duration = Duration::from_secs(300);

/// Startup grace before an idle modem counts as transmission-complete;
/// short frames can drain before the first BUFFER report arrives.
const TX_START_GRACE: Duration = Duration::from_secs(2);

/// Notification lines kept for waiters; older lines age out.
const MONITOR_LINE_CAP: usize = 128;

#[derive(Debug, Default)]
struct MonitorState {
    lines: VecDeque<String>,
    transmitting: bool,
    buffer_level: u32,
    last_buffer_change: Option<Instant>,
    disconnected: bool,
    alive: bool,
}

struct Monitor {
    state: Mutex<MonitorState>,
    notify: Notify,
}

impl Monitor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MonitorState {
                alive: true,
                ..MonitorState::default()
            }),
            notify: Notify::new(),
        })
    }

    /// Wait for a notification line matching `pred`, draining everything up
    /// to and including the match. Returns None on timeout or reader death.
    async fn wait_for_line(
        &self,
        pred: impl Fn(&str) -> bool,
        timeout: Duration,
    ) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                while let Some(line) = state.lines.pop_front() {
                    if pred(&line) {
                        return Some(line);
                    }
                }
                if !state.alive {
                    return None;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = tokio::time::timeout(
                (deadline - now).min(Duration::from_millis(100)),
                self.notify.notified(),
            )
            .await;
        }
    }
}

/// Command-socket reader: splits the byte stream on `\r`, updates shared
/// state, and keys the radio on PTT edges.
async fn run_monitor(mut reader: OwnedReadHalf, monitor: Arc<Monitor>, mut ptt: Option<PttController>) {
    let mut pending = String::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                warn!(target: "hamstr::tnc", "VARA command socket closed by modem");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                error!(target: "hamstr::tnc", "VARA command socket read error: {e}");
                break;
            }
        };
        pending.push_str(&String::from_utf8_lossy(&buf[..n]));
        while let Some(pos) = pending.find('\r') {
            let line = pending[..pos].trim().to_string();
            pending.drain(..=pos);
            if line.is_empty() {
                continue;
            }
            debug!(target: "hamstr::tnc", "VARA: {line}");
            let mut state = monitor.state.lock().await;
            if let Some(level) = line.strip_prefix("BUFFER ") {
                if let Ok(level) = level.trim().parse::<u32>() {
                    if level != state.buffer_level {
                        state.buffer_level = level;
                        state.last_buffer_change = Some(Instant::now());
                    }
                }
            } else if line == "PTT ON" {
                state.transmitting = true;
                info!(target: "hamstr::control", "PTT ON");
                if let Some(ptt) = ptt.as_mut() {
                    ptt.key().await;
                }
            } else if line == "PTT OFF" {
                state.transmitting = false;
                state.buffer_level = 0;
                state.last_buffer_change = Some(Instant::now());
                info!(target: "hamstr::control", "PTT OFF");
                if let Some(ptt) = ptt.as_mut() {
                    ptt.unkey_async().await;
                }
            } else if line.starts_with("DISCONNECTED") {
                state.disconnected = true;
            }
            state.lines.push_back(line);
            while state.lines.len() > MONITOR_LINE_CAP {
                state.lines.pop_front();
            }
            drop(state);
            monitor.notify.notify_waiters();
        }
    }
    let mut state = monitor.state.lock().await;
    state.alive = false;
    drop(state);
    monitor.notify.notify_waiters();
}

pub struct VaraBackend {
    is_server: bool,
    callsign: Callsign,
    cfg: VaraConfig,
    monitor: Option<Arc<Monitor>>,
    command: Option<OwnedWriteHalf>,
    data: Option<TcpStream>,
    scanner: FrameScanner,
    json_buf: Vec<u8>,
    pub(crate) status: BackendStatus,
}

impl VaraBackend {
    pub fn new(callsign: Callsign, cfg: VaraConfig, is_server: bool) -> Self {
        Self {
            is_server,
            callsign,
            cfg,
            monitor: None,
            command: None,
            data: None,
            scanner: FrameScanner::new(),
            json_buf: Vec::new(),
            status: BackendStatus::Disconnected,
        }
    }

    fn monitor_alive(&self) -> bool {
        self.monitor.is_some() && self.command.is_some()
    }

    /// Bring up the command channel and configure the modem. Server side
    /// also turns the listener on. Safe to call again after a monitor
    /// death; it rebuilds from scratch.
    pub async fn initialize(&mut self) -> Result<(), BackendError> {
        self.command = None;
        self.monitor = None;

        let addr = format!("{}:{}", self.cfg.host, self.cfg.command_port);
        let mut last_err = None;
        let mut stream = None;
        for attempt in 0..3 {
            match TcpStream::connect(&addr).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    warn!(target: "hamstr::tnc", "VARA command connect attempt {} failed: {e}", attempt + 1);
                    last_err = Some(e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
        let stream = stream.ok_or_else(|| {
            self.status = BackendStatus::Error;
            BackendError::Io(last_err.expect("error recorded on failure"))
        })?;

        let (read_half, write_half) = stream.into_split();
        let monitor = Monitor::new();
        let ptt = match &self.cfg.ptt {
            Some(ptt_cfg) => match PttController::open(ptt_cfg) {
                Ok(ptt) => Some(ptt),
                Err(e) => {
                    warn!(target: "hamstr::tnc", "PTT initialization failed, running without: {e}");
                    None
                }
            },
            None => {
                debug!(target: "hamstr::tnc", "PTT disabled, VOX or VARA FM keying assumed");
                None
            }
        };
        tokio::spawn(run_monitor(read_half, monitor.clone(), ptt));
        self.command = Some(write_half);
        self.monitor = Some(monitor);

        // The modem refuses configuration while cleaning up a previous
        // session; retry the bandwidth command politely until it accepts.
        let bw = format!("BW{}", self.cfg.bandwidth);
        let mut configured = false;
        for attempt in 0..5 {
            if self.command_ok(&bw).await? {
                configured = true;
                break;
            }
            warn!(target: "hamstr::tnc", "VARA busy, waiting for idle state (attempt {})", attempt + 1);
            sleep(Duration::from_secs(2)).await;
        }
        if !configured {
            warn!(target: "hamstr::tnc", "Failed to set bandwidth after retries, proceeding anyway");
        }

        let mycall = format!("MYCALL {}-{}", self.callsign.call, self.callsign.ssid);
        if !self.command_ok(&mycall).await? {
            self.status = BackendStatus::Error;
            return Err(BackendError::Modem("MYCALL rejected".into()));
        }
        let chat = format!("CHAT {}", if self.cfg.chat_mode { "ON" } else { "OFF" });
        if !self.command_ok(&chat).await? {
            warn!(target: "hamstr::tnc", "Failed to set VARA chat mode");
        }
        if self.is_server {
            if !self.command_ok("LISTEN ON").await? {
                self.status = BackendStatus::Error;
                return Err(BackendError::Modem("LISTEN ON rejected".into()));
            }
            info!(target: "hamstr::tnc", "VARA listening for connections");
        }
        Ok(())
    }

    async fn send_command(&mut self, command: &str) -> Result<(), BackendError> {
        let writer = self.command.as_mut().ok_or(BackendError::NotConnected)?;
        debug!(target: "hamstr::tnc", "VARA command: {command}");
        writer
            .write_all(format!("{command}\r").as_bytes())
            .await
            .map_err(BackendError::Io)
    }

    /// Send a command and wait for the modem's OK / WRONG verdict.
    async fn command_ok(&mut self, command: &str) -> Result<bool, BackendError> {
        self.send_command(command).await?;
        let monitor = self.monitor.as_ref().ok_or(BackendError::NotConnected)?.clone();
        let verdict = monitor
            .wait_for_line(
                |l| l == "OK" || l.starts_with("WRONG"),
                Duration::from_secs(5),
            )
            .await;
        Ok(matches!(verdict.as_deref(), Some("OK")))
    }

    async fn open_data_socket(&mut self) -> Result<(), BackendError> {
        let addr = format!("{}:{}", self.cfg.host, self.cfg.data_port);
        let stream = tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(&addr))
            .await
            .map_err(|_| BackendError::ConnectTimeout(addr.clone()))?
            .map_err(BackendError::Io)?;
        self.data = Some(stream);
        self.scanner = FrameScanner::new();
        self.json_buf.clear();
        Ok(())
    }

    /// Client: drive the modem through CONNECT and open the data path.
    /// Server: wait for an incoming CONNECTED notification.
    pub async fn connect(&mut self, remote: Option<&Callsign>) -> Result<Session, BackendError> {
        if !self.monitor_alive() {
            warn!(target: "hamstr::tnc", "VARA backend in bad state, re-initializing");
            self.initialize().await?;
        }
        self.set_status(BackendStatus::Connecting);

        let remote = if self.is_server {
            info!(target: "hamstr::tnc", "Server waiting for incoming VARA connection");
            let monitor = self.monitor.as_ref().expect("initialized above").clone();
            // Effectively unbounded: the caller decides when to give up by
            // dropping the future.
            let line = monitor
                .wait_for_line(|l| l.starts_with("CONNECTED"), Duration::from_secs(86_400 * 365))
                .await
                .ok_or_else(|| {
                    self.status = BackendStatus::Error;
                    BackendError::Modem("monitor died while waiting for connection".into())
                })?;
            info!(target: "hamstr::tnc", "Connection detected: {line}");
            let ours = self.callsign.session_id();
            line.split_whitespace()
                .skip(1)
                .find(|tok| *tok != ours && !tok.eq_ignore_ascii_case(&self.callsign.call))
                .and_then(|tok| tok.parse().ok())
                .unwrap_or_else(|| Callsign::new("UNKNWN", 0).expect("static callsign"))
        } else {
            let remote = remote.ok_or_else(|| {
                BackendError::Config("client connect requires a remote callsign".into())
            })?;
            let connect_cmd = format!(
                "CONNECT {}-{} {}-{}",
                self.callsign.call, self.callsign.ssid, remote.call, remote.ssid
            );
            self.send_command(&connect_cmd).await?;
            let monitor = self.monitor.as_ref().expect("checked above").clone();
            let connected = monitor
                .wait_for_line(
                    |l| l.starts_with("CONNECTED"),
                    Duration::from_secs(self.cfg.connect_timeout),
                )
                .await;
            if connected.is_none() {
                self.set_status(BackendStatus::Error);
                return Err(BackendError::Modem(format!(
                    "failed to connect to {remote}"
                )));
            }
            remote.clone()
        };

        self.open_data_socket().await?;
        self.set_status(BackendStatus::Connected);
        let mut session = Session::new(remote);
        session.state = SessionState::Connected;
        info!(target: "hamstr::session", "CONNECTED to {}", session.remote);
        Ok(session)
    }

    /// Write one application buffer and block until the modem has put it
    /// on the air (PTT dropped and transmit buffer drained).
    pub async fn send_data(&mut self, session: &mut Session, data: &[u8]) -> Result<(), BackendError> {
        let frame = kiss_wrap(&build_ui_frame(&self.callsign, &session.remote, data));
        let stream = self.data.as_mut().ok_or(BackendError::NotConnected)?;
        info!(target: "hamstr::control", "Sending via VARA ({} bytes)", data.len());
        stream.write_all(&frame).await.map_err(BackendError::Io)?;
        session.touch();

        if let Some(monitor) = self.monitor.clone() {
            self.wait_tx_complete(&monitor).await?;
        }
        Ok(())
    }

    async fn wait_tx_complete(&mut self, monitor: &Monitor) -> Result<(), BackendError> {
        let start = Instant::now();
        let mut seen_tx = false;
        loop {
            {
                let state = monitor.state.lock().await;
                if state.disconnected {
                    return Err(BackendError::ConnectionClosed);
                }
                if state.transmitting {
                    seen_tx = true;
                }
                let settled = !state.transmitting && state.buffer_level == 0;
                if settled && (seen_tx || start.elapsed() >= TX_START_GRACE) {
                    debug!(target: "hamstr::tnc", "VARA transmission complete (PTT OFF, buffer 0)");
                    return Ok(());
                }
                if let Some(change) = state.last_buffer_change {
                    if seen_tx && change.elapsed() > TX_STALL_TIMEOUT {
                        warn!(target: "hamstr::tnc", "VARA TX stalled, no buffer movement for {}s", TX_STALL_TIMEOUT.as_secs());
                        return Err(BackendError::ModemStall);
                    }
                }
                if start.elapsed() > TX_SAFETY_LIMIT {
                    warn!(target: "hamstr::tnc", "VARA TX timed out at the safety limit");
                    return Err(BackendError::ModemStall);
                }
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Accumulate frames until the payload stream parses as one JSON value.
    ///
    /// The modem may split one logical message across many frames; the
    /// boundary is semantic, not framed, so completion is "the accumulator
    /// is valid JSON". Idle timeout counts from the last byte received.
    pub async fn receive_data(
        &mut self,
        session: &mut Session,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, BackendError> {
        let mut last_byte = Instant::now();
        loop {
            if last_byte.elapsed() >= timeout {
                return Ok(None);
            }
            while let Some(frame) = self.scanner.next_frame() {
                let Ok(ax25) = kiss_unwrap(&frame) else {
                    warn!(target: "hamstr::packet", "Dropping malformed KISS frame from VARA");
                    continue;
                };
                let Ok(ui) = parse_ui_frame(&ax25) else {
                    warn!(target: "hamstr::packet", "Dropping malformed AX.25 frame from VARA");
                    continue;
                };
                self.json_buf.extend_from_slice(&ui.payload);
                if serde_json::from_slice::<serde_json::Value>(&self.json_buf).is_ok() {
                    let complete = std::mem::take(&mut self.json_buf);
                    info!(target: "hamstr::packet", "Received complete message ({} bytes)", complete.len());
                    session.touch();
                    return Ok(Some(complete));
                }
            }
            let stream = self.data.as_mut().ok_or(BackendError::NotConnected)?;
            let mut buf = [0u8; 1024];
            match tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf)).await {
                Err(_) => {
                    if let Some(monitor) = &self.monitor {
                        if monitor.state.lock().await.disconnected {
                            return Err(BackendError::ConnectionClosed);
                        }
                    }
                }
                Ok(Ok(0)) => return Err(BackendError::ConnectionClosed),
                Ok(Ok(n)) => {
                    last_byte = Instant::now();
                    self.scanner.push(&buf[..n]);
                }
                Ok(Err(e)) => return Err(BackendError::Io(e)),
            }
        }
    }

    /// Tear down the session path. Server keeps the command channel and
    /// re-arms the listener for the next caller; client drops everything.
    pub async fn disconnect(&mut self, session: &mut Session) -> Result<(), BackendError> {
        session.state = SessionState::Disconnected;
        self.data = None;
        self.json_buf.clear();

        if self.is_server {
            if self.command.is_some() {
                info!(target: "hamstr::tnc", "Sending DISCONNECT to VARA modem");
                if let Err(e) = self.send_command("DISCONNECT").await {
                    warn!(target: "hamstr::tnc", "Failed to send DISCONNECT command: {e}");
                }
                // Give the modem a moment to settle before re-arming.
                sleep(Duration::from_millis(1500)).await;
                if let Err(e) = self.send_command("LISTEN ON").await {
                    warn!(target: "hamstr::tnc", "Failed to restart VARA listener: {e}");
                }
            }
        } else {
            if self.command.is_some() {
                let _ = self.send_command("DISCONNECT").await;
            }
            self.command = None;
            self.monitor = None;
        }
        self.set_status(BackendStatus::Disconnected);
        info!(target: "hamstr::session", "DISCONNECTED");
        Ok(())
    }

    pub async fn is_connected(&self, session: &Session) -> bool {
        if !session.is_connected() || self.data.is_none() {
            return false;
        }
        match &self.monitor {
            Some(monitor) => {
                let state = monitor.state.lock().await;
                state.alive && !state.disconnected
            }
            None => false,
        }
    }

    pub async fn shutdown(&mut self) {
        if self.is_server && self.command.is_some() {
            let _ = self.send_command("LISTEN OFF").await;
        }
        self.command = None;
        self.monitor = None;
        self.data = None;
        self.set_status(BackendStatus::Disconnected);
    }

    fn set_status(&mut self, status: BackendStatus) {
        if self.status != status {
            info!(target: "hamstr::tnc", "VARA backend status: {} -> {}", self.status, status);
            self.status = status;
        }
    }
}
