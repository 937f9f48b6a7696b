//! Packetized transfer engine.
//!
//! Drives reliable, ordered message exchange over the unsegmented packet
//! backend: split outbound messages into CRC-guarded packets with per-packet
//! ACK, reassemble inbound packets, and recover missing ones through the
//! PKT_MISSING / READY turnaround. Only the packet protocol path uses this;
//! transports that are reliable on their own skip straight to the
//! dispatcher.
//!
//! The engine owns no backend and no session. Both are explicit parameters
//! on every operation, so the ownership graph stays a tree: the station owns
//! the backend and the session, the engine is pure behavior plus config.

use crate::backend::packet::PacketBackend;
use crate::backend::BackendError;
use crate::config::ProtocolConfig;
use crate::session::{timing, Session};
use crate::types::{Callsign, MessageType, SessionState};
use crate::wire::packet::{encode_control, encode_data, parse_packet, Packet};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Receive poll slice inside bounded waits.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// AX.25 header (16) plus KISS delimiters and command byte: the fixed
/// per-frame overhead on top of the session packet, used when estimating
/// on-air time.
const FRAME_OVERHEAD: usize = 19;

/// CONNECT_ACK is re-sent this many times while waiting for the final ACK.
const CONNECT_ACK_RESENDS: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("timeout waiting for {0}")]
    Timeout(&'static str),

    #[error("peer disconnected")]
    Disconnected,

    #[error("transfer failed: {0}")]
    TransferFailed(String),
}

/// One parsed message off the air.
#[derive(Debug)]
pub struct Inbound {
    pub from: Callsign,
    pub packet: Packet,
}

impl Inbound {
    pub fn ty(&self) -> MessageType {
        self.packet.message_type()
    }
}

pub struct SessionEngine {
    cfg: ProtocolConfig,
}

impl SessionEngine {
    pub fn new(cfg: ProtocolConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.cfg
    }

    fn stab(&self) -> Duration {
        self.cfg.stabilization_delay()
    }

    // =========================================================================
    // FRAME-LEVEL SEND / RECEIVE
    // =========================================================================

    /// Encode and transmit one packet, then sleep out its estimated on-air
    /// time plus the per-type tail so the half-duplex channel is clear
    /// before the next action.
    pub async fn send_single_packet(
        &self,
        backend: &mut PacketBackend,
        session: &mut Session,
        seq: u16,
        total: u16,
        content: &[u8],
        ty: MessageType,
    ) -> Result<(), SessionError> {
        let payload = if ty.is_control() {
            encode_control(ty, content)
        } else {
            encode_data(ty, seq, total, content)
        };
        backend.send_frame(&session.remote, &payload).await?;
        if ty.is_control() {
            info!(target: "hamstr::control", "Sending control: Type={ty}");
        } else {
            info!(target: "hamstr::packet", "Sending packet: Type={ty}, Seq={seq}/{total}");
        }
        sleep(timing::send_pause(
            &self.cfg,
            payload.len() + FRAME_OVERHEAD,
            ty,
        ))
        .await;
        Ok(())
    }

    /// Wait up to `timeout` for the next parseable message.
    ///
    /// Transient garbage never surfaces: frames that fail CRC or do not
    /// parse are answered with a RETRY control (when a session exists) and
    /// the wait continues.
    pub async fn receive_message(
        &self,
        backend: &mut PacketBackend,
        mut session: Option<&mut Session>,
        timeout: Duration,
    ) -> Result<Option<Inbound>, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let slice = POLL_SLICE.min(deadline - now);
            let Some((from, payload)) = backend.receive_from(slice).await? else {
                continue;
            };
            match parse_packet(&payload) {
                Ok(packet) => {
                    if let Some(session) = session.as_deref_mut() {
                        session.touch();
                    }
                    match &packet {
                        Packet::Control { ty, content } => {
                            info!(
                                target: "hamstr::control",
                                "Received control: Type={ty}, Content={}",
                                String::from_utf8_lossy(content)
                            );
                        }
                        Packet::Data { ty, seq, total, .. } => {
                            info!(
                                target: "hamstr::packet",
                                "Received packet: Type={ty}, Seq={seq}/{total}"
                            );
                        }
                    }
                    return Ok(Some(Inbound { from, packet }));
                }
                Err(e) => {
                    warn!(target: "hamstr::packet", "Dropping bad packet from {from}: {e}");
                    if let Some(session) = session.as_deref_mut() {
                        self.request_retry(backend, session).await;
                    }
                }
            }
        }
    }

    async fn request_retry(&self, backend: &mut PacketBackend, session: &mut Session) {
        if let Err(e) = self
            .send_single_packet(backend, session, 0, 0, b"RETRY", MessageType::Retry)
            .await
        {
            error!(target: "hamstr::system", "Failed to send RETRY: {e}");
        } else {
            info!(target: "hamstr::system", "Sent RETRY request to {}", session.remote);
        }
    }

    // =========================================================================
    // CONTROL MESSAGES
    // =========================================================================

    /// Send a control message with the standard retry ladder.
    pub async fn send_control(
        &self,
        backend: &mut PacketBackend,
        session: &mut Session,
        ty: MessageType,
        content: &[u8],
    ) -> Result<(), SessionError> {
        // READY sits on a turnaround boundary and gets settle pauses on
        // both sides.
        if ty == MessageType::Ready {
            sleep(self.stab()).await;
        }
        let mut last_err = None;
        for attempt in 0..self.cfg.send_retries {
            match self
                .send_single_packet(backend, session, 0, 0, content, ty)
                .await
            {
                Ok(()) => {
                    if ty == MessageType::Ready {
                        sleep(self.stab()).await;
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        target: "hamstr::control",
                        "Failed to send {ty}, attempt {} of {}: {e}",
                        attempt + 1,
                        self.cfg.send_retries
                    );
                    last_err = Some(e);
                    if attempt + 1 < self.cfg.send_retries {
                        sleep(self.cfg.ack_timeout_dur() / 2).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(SessionError::Timeout("control send")))
    }

    pub async fn send_ack(
        &self,
        backend: &mut PacketBackend,
        session: &mut Session,
        seq: Option<u16>,
    ) -> Result<(), SessionError> {
        let content = match seq {
            Some(n) => format!("ACK|{n:04}"),
            None => "ACK".to_string(),
        };
        self.send_single_packet(backend, session, 0, 0, content.as_bytes(), MessageType::Ack)
            .await
    }

    pub async fn send_ready(
        &self,
        backend: &mut PacketBackend,
        session: &mut Session,
    ) -> Result<(), SessionError> {
        self.send_control(backend, session, MessageType::Ready, b"READY")
            .await
    }

    pub async fn send_done(
        &self,
        backend: &mut PacketBackend,
        session: &mut Session,
    ) -> Result<(), SessionError> {
        self.send_control(backend, session, MessageType::Done, b"DONE")
            .await
    }

    /// Wait for an ACK. When `expected_seq` is given, an ACK carrying a
    /// different sequence number keeps the wait going; a bare ACK counts
    /// for any packet.
    pub async fn wait_for_ack(
        &self,
        backend: &mut PacketBackend,
        session: &mut Session,
        expected_seq: Option<u16>,
        timeout: Duration,
    ) -> Result<bool, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let Some(inbound) = self
                .receive_message(backend, Some(session), (deadline - now).min(Duration::from_millis(500)))
                .await?
            else {
                continue;
            };
            match inbound.ty() {
                MessageType::Ack => {
                    let content = inbound.packet.content();
                    let acked_seq = parse_ack_seq(content);
                    match (expected_seq, acked_seq) {
                        (Some(want), Some(got)) if want != got => {
                            debug!(target: "hamstr::control", "ACK for seq {got}, still waiting for {want}");
                        }
                        _ => return Ok(true),
                    }
                }
                MessageType::Disconnect => {
                    info!(target: "hamstr::control", "Received DISCONNECT while waiting for ACK");
                    self.acknowledge_disconnect(backend, session).await;
                    return Err(SessionError::Disconnected);
                }
                other => {
                    debug!(target: "hamstr::control", "Ignoring {other} while waiting for ACK");
                }
            }
        }
    }

    /// Wait for one specific control type. DISCONNECT aborts the wait.
    pub async fn wait_for_specific(
        &self,
        backend: &mut PacketBackend,
        session: &mut Session,
        expected: MessageType,
        timeout: Duration,
    ) -> Result<bool, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(target: "hamstr::system", "Timeout waiting for {expected}");
                return Ok(false);
            }
            let Some(inbound) = self
                .receive_message(backend, Some(session), (deadline - now).min(Duration::from_millis(500)))
                .await?
            else {
                continue;
            };
            if inbound.ty() == expected {
                return Ok(true);
            }
            if inbound.ty() == MessageType::Disconnect {
                self.acknowledge_disconnect(backend, session).await;
                return Ok(false);
            }
            debug!(target: "hamstr::control", "Ignoring {} while waiting for {expected}", inbound.ty());
        }
    }

    /// Wait for the peer's READY during a transmit/receive role swap.
    ///
    /// A DATA_REQUEST is accepted as READY-equivalent (the peer is plainly
    /// ready if it is already asking). Halfway through the window our own
    /// READY is re-sent once as a prompt in case the first one was lost.
    pub async fn wait_for_ready(
        &self,
        backend: &mut PacketBackend,
        session: &mut Session,
        timeout: Duration,
    ) -> Result<bool, SessionError> {
        let deadline = Instant::now() + timeout;
        let halfway = Instant::now() + timeout / 2;
        let mut prompted = false;
        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(target: "hamstr::system", "READY message not received within timeout");
                return Ok(false);
            }
            if !prompted && now >= halfway {
                info!(target: "hamstr::control", "No READY yet, sending our own READY as a prompt");
                self.send_ready(backend, session).await?;
                prompted = true;
            }
            let Some(inbound) = self
                .receive_message(backend, Some(session), (deadline - now).min(Duration::from_millis(500)))
                .await?
            else {
                continue;
            };
            match inbound.ty() {
                MessageType::Ready => {
                    sleep(self.stab()).await;
                    return Ok(true);
                }
                MessageType::DataRequest => {
                    info!(target: "hamstr::control", "Received DATA_REQUEST, accepting as READY equivalent");
                    sleep(self.stab()).await;
                    return Ok(true);
                }
                MessageType::Disconnect => {
                    self.acknowledge_disconnect(backend, session).await;
                    return Ok(false);
                }
                other => {
                    warn!(target: "hamstr::control", "Unexpected {other} while waiting for READY");
                }
            }
        }
    }

    /// Single authority for the end-of-transfer wait: true on DONE_ACK,
    /// false on DISCONNECT or timeout.
    pub async fn receive_done_ack(
        &self,
        backend: &mut PacketBackend,
        session: &mut Session,
        timeout: Duration,
    ) -> Result<bool, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(target: "hamstr::system", "DONE_ACK not received within timeout");
                return Ok(false);
            }
            let Some(inbound) = self
                .receive_message(backend, Some(session), (deadline - now).min(Duration::from_millis(500)))
                .await?
            else {
                continue;
            };
            match inbound.ty() {
                MessageType::DoneAck => {
                    info!(target: "hamstr::control", "Received DONE_ACK from {}", inbound.from);
                    return Ok(true);
                }
                MessageType::Disconnect => {
                    self.acknowledge_disconnect(backend, session).await;
                    return Ok(false);
                }
                other => {
                    debug!(target: "hamstr::control", "Ignoring {other} while waiting for DONE_ACK");
                }
            }
        }
    }

    // =========================================================================
    // OUTBOUND TRANSFER
    // =========================================================================

    /// Split `message` into data packets.
    pub fn split_message<'m>(&self, message: &'m [u8]) -> Vec<&'m [u8]> {
        let max = self.cfg.max_payload().max(1);
        if message.is_empty() {
            return vec![&[]];
        }
        message.chunks(max).collect()
    }

    /// Transmit `message` as a sequence of ACK-confirmed data packets.
    ///
    /// A packet that never gets its ACK after `send_retries` attempts is
    /// left for the missing-packet phase rather than failing the whole
    /// transfer here.
    pub async fn send_message(
        &self,
        backend: &mut PacketBackend,
        session: &mut Session,
        message: &[u8],
        ty: MessageType,
    ) -> Result<(), SessionError> {
        let packets: Vec<Vec<u8>> = self
            .split_message(message)
            .into_iter()
            .map(<[u8]>::to_vec)
            .collect();
        let total = u16::try_from(packets.len())
            .map_err(|_| SessionError::TransferFailed("message needs more than 9999 packets".into()))?;

        session.reset_transfer();
        session.total_packets = total;
        session.outbound_kind = Some(ty);
        session.state = SessionState::Sending;
        info!(target: "hamstr::packet", "Sending message: {ty} to {} in {total} packet(s)", session.remote);

        for (idx, packet) in packets.iter().enumerate() {
            let seq = idx as u16 + 1;
            // First packet rides a fresh turnaround; give its ACK more room.
            let ack_timeout = if seq == 1 {
                self.cfg.ack_timeout_dur() * 2
            } else {
                self.cfg.ack_timeout_dur()
            };

            let mut acked = false;
            for attempt in 0..self.cfg.send_retries {
                self.send_single_packet(backend, session, seq, total, packet, ty)
                    .await?;
                session.sent_packets.insert(seq, packet.clone());

                sleep(self.stab()).await;
                if self.wait_for_ack(backend, session, Some(seq), ack_timeout).await? {
                    session.acked_packets.insert(seq);
                    let progress =
                        (session.acked_packets.len() as f64 / f64::from(total)) * 100.0;
                    info!(target: "hamstr::progress", "Sent packet {seq}/{total} - {progress:.2}% complete");
                    acked = true;
                    break;
                }
                warn!(target: "hamstr::control", "Failed to receive ACK for packet {seq}");
                if attempt + 1 < self.cfg.send_retries {
                    info!(target: "hamstr::packet", "Retrying packet {seq}, attempt {}", attempt + 2);
                    sleep(self.cfg.ack_timeout_dur()).await;
                }
            }
            if !acked {
                error!(
                    target: "hamstr::packet",
                    "Packet {seq} unacknowledged after {} attempts, continuing",
                    self.cfg.send_retries
                );
            }
        }
        Ok(())
    }

    /// DONE / DONE_ACK closing phase with PKT_MISSING recovery.
    ///
    /// The sender lingers `missing_packets_timeout` for the receiver's
    /// verdict, re-armed after every recovery round. Returns true once the
    /// receiver confirms the complete message. Two PKT_MISSING rounds in a
    /// row with no forward progress fail the transfer.
    pub async fn finish_transfer(
        &self,
        backend: &mut PacketBackend,
        session: &mut Session,
    ) -> Result<bool, SessionError> {
        self.send_done(backend, session).await?;

        let mut last_missing: Option<Vec<u16>> = None;
        let window = Duration::from_secs(self.cfg.missing_packets_timeout);
        let mut deadline = Instant::now() + window;
        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(target: "hamstr::system", "Did not receive DONE_ACK or PKT_MISSING within timeout");
                return Ok(false);
            }
            let Some(inbound) = self
                .receive_message(backend, Some(session), (deadline - now).min(Duration::from_secs(1)))
                .await?
            else {
                continue;
            };
            match inbound.ty() {
                MessageType::DoneAck => {
                    info!(target: "hamstr::control", "Received DONE_ACK");
                    return Ok(true);
                }
                MessageType::PktMissing => {
                    let missing = parse_missing_list(inbound.packet.content());
                    info!(target: "hamstr::control", "Received PKT_MISSING request: {missing:?}");
                    if missing.is_empty() {
                        // Malformed request; confirm and let the peer move on.
                        warn!(target: "hamstr::system", "Empty or malformed PKT_MISSING message");
                        self.send_control(backend, session, MessageType::DoneAck, b"DONE_ACK")
                            .await?;
                        return Ok(true);
                    }
                    if last_missing.as_deref() == Some(missing.as_slice()) {
                        error!(target: "hamstr::system", "No progress on missing packets {missing:?}, failing transfer");
                        return Ok(false);
                    }
                    last_missing = Some(missing.clone());
                    if self.resend_missing(backend, session, &missing).await? {
                        self.send_done(backend, session).await?;
                        deadline = Instant::now() + window;
                    } else {
                        error!(target: "hamstr::control", "Failed to send missing packets");
                        return Ok(false);
                    }
                }
                MessageType::Disconnect => {
                    self.acknowledge_disconnect(backend, session).await;
                    return Ok(false);
                }
                other => {
                    debug!(target: "hamstr::control", "Ignoring {other} during transfer close");
                }
            }
        }
    }

    /// Sender side of recovery: READY/READY swap, then each listed packet
    /// re-sent with a per-packet ACK, under the same type the transfer
    /// went out with.
    async fn resend_missing(
        &self,
        backend: &mut PacketBackend,
        session: &mut Session,
        missing: &[u16],
    ) -> Result<bool, SessionError> {
        info!(target: "hamstr::system", "Handling missing packets: {missing:?}");
        self.send_ready(backend, session).await?;
        if !self
            .wait_for_ready(backend, session, self.cfg.ack_timeout_dur() * 2)
            .await?
        {
            error!(target: "hamstr::system", "Did not receive READY from receiver");
            return Ok(false);
        }

        let total = session.total_packets;
        let ty = session.outbound_kind.unwrap_or(MessageType::Response);
        for &seq in missing {
            let Some(packet) = session.sent_packets.get(&seq).cloned() else {
                error!(target: "hamstr::system", "Could not find packet {seq} for resending");
                return Ok(false);
            };
            let mut acked = false;
            for _ in 0..self.cfg.send_retries {
                self.send_single_packet(backend, session, seq, total, &packet, ty)
                    .await?;
                if self
                    .wait_for_ack(backend, session, Some(seq), self.cfg.ack_timeout_dur())
                    .await?
                {
                    session.acked_packets.insert(seq);
                    info!(target: "hamstr::system", "Successfully resent packet {seq}");
                    acked = true;
                    break;
                }
                warn!(target: "hamstr::system", "Failed to receive ACK for resent packet {seq}");
            }
            if !acked {
                return Ok(false);
            }
        }
        info!(target: "hamstr::system", "All missing packets sent successfully");
        Ok(true)
    }

    /// Convenience: full outbound transfer including the closing phase.
    pub async fn send_response(
        &self,
        backend: &mut PacketBackend,
        session: &mut Session,
        response: &[u8],
    ) -> Result<bool, SessionError> {
        self.send_message(backend, session, response, MessageType::Response)
            .await?;
        self.finish_transfer(backend, session).await
    }

    // =========================================================================
    // INBOUND TRANSFER
    // =========================================================================

    /// Receive one complete segmented message of any data type.
    ///
    /// Duplicated packets are re-ACKed without being stored twice. When the
    /// sender goes quiet past `no_packet_timeout` and most of the message
    /// is already here, the engine asks for the stragglers instead of
    /// giving up.
    pub async fn receive_response(
        &self,
        backend: &mut PacketBackend,
        session: &mut Session,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        session.reset_transfer();
        session.state = SessionState::Receiving;

        let overall_deadline = Instant::now() + Duration::from_secs(self.cfg.connection_timeout);
        let mut last_packet = Instant::now();

        while Instant::now() < overall_deadline {
            if last_packet.elapsed() > Duration::from_secs(self.cfg.no_packet_timeout) {
                warn!(
                    target: "hamstr::packet",
                    "No packets received for {} seconds",
                    self.cfg.no_packet_timeout
                );
                let total = session.total_packets;
                if total > 0 {
                    let have = session.received_packets.len() as f64 / f64::from(total);
                    if have >= self.cfg.missing_packets_threshold {
                        info!(target: "hamstr::packet", "Most packets present, requesting the missing ones");
                        let missing = session.missing_received();
                        if self.request_missing_packets(backend, session, missing).await? {
                            last_packet = Instant::now();
                            continue;
                        }
                    }
                }
                warn!(target: "hamstr::system", "Disconnecting due to timeout");
                self.disconnect(backend, session).await?;
                return Ok(None);
            }

            let Some(inbound) = self
                .receive_message(backend, Some(session), Duration::from_secs(1))
                .await?
            else {
                continue;
            };
            match inbound.packet {
                Packet::Data { seq, total, content, .. } => {
                    last_packet = Instant::now();
                    if session.total_packets == 0 {
                        session.total_packets = total;
                    }
                    // Duplicate delivery is acknowledged but stored once.
                    session.received_packets.entry(seq).or_insert(content);
                    self.send_ack(backend, session, Some(seq)).await?;
                    let progress = (session.received_packets.len() as f64
                        / f64::from(session.total_packets.max(1)))
                        * 100.0;
                    info!(target: "hamstr::progress", "{progress:.2}% complete");
                }
                Packet::Control { ty: MessageType::Done, .. } => {
                    let missing = session.missing_received();
                    if missing.is_empty() {
                        info!(target: "hamstr::control", "Received DONE and all packets are accounted for");
                        let full = reassemble(session);
                        self.send_control(backend, session, MessageType::DoneAck, b"DONE_ACK")
                            .await?;
                        session.state = SessionState::Connected;
                        return Ok(Some(full));
                    }
                    warn!(target: "hamstr::system", "Received DONE but missing packets: {missing:?}");
                    if self.request_missing_packets(backend, session, missing).await? {
                        last_packet = Instant::now();
                    } else {
                        error!(target: "hamstr::system", "Failed to retrieve missing packets");
                        break;
                    }
                }
                Packet::Control { ty: MessageType::Disconnect, .. } => {
                    info!(target: "hamstr::control", "Received DISCONNECT message");
                    self.acknowledge_disconnect(backend, session).await;
                    return Err(SessionError::Disconnected);
                }
                Packet::Control { ty, .. } => {
                    debug!(target: "hamstr::control", "Ignoring {ty} during receive");
                }
            }
        }

        // Ran out the clock: one last chance if nearly complete.
        if session.total_packets > 0 && !session.missing_received().is_empty() {
            let missing = session.missing_received();
            warn!(
                target: "hamstr::system",
                "Incomplete response: {} of {} packets",
                session.received_packets.len(),
                session.total_packets
            );
            let _ = self.request_missing_packets(backend, session, missing).await?;
        }
        if session.total_packets > 0 && session.missing_received().is_empty() {
            return Ok(Some(reassemble(session)));
        }
        Ok(None)
    }

    /// Receiver side of recovery: PKT_MISSING, READY/READY, then collect
    /// the re-sent packets.
    pub async fn request_missing_packets(
        &self,
        backend: &mut PacketBackend,
        session: &mut Session,
        mut missing: Vec<u16>,
    ) -> Result<bool, SessionError> {
        if missing.is_empty() {
            return Ok(true);
        }
        let request = std::iter::once("PKT_MISSING".to_string())
            .chain(missing.iter().map(u16::to_string))
            .collect::<Vec<_>>()
            .join("|");
        self.send_single_packet(
            backend,
            session,
            0,
            0,
            request.as_bytes(),
            MessageType::PktMissing,
        )
        .await?;

        if !self
            .wait_for_ready(backend, session, self.cfg.ack_timeout_dur() * 2)
            .await?
        {
            error!(target: "hamstr::system", "Did not receive READY from sender");
            return Ok(false);
        }
        self.send_ready(backend, session).await?;

        let deadline = Instant::now() + Duration::from_secs(self.cfg.connection_timeout);
        while !missing.is_empty() && Instant::now() < deadline {
            let Some(inbound) = self
                .receive_message(backend, Some(session), Duration::from_secs(1))
                .await?
            else {
                continue;
            };
            match inbound.packet {
                Packet::Data { seq, content, .. } => {
                    if let Some(pos) = missing.iter().position(|&m| m == seq) {
                        session.received_packets.insert(seq, content);
                        missing.remove(pos);
                        self.send_ack(backend, session, Some(seq)).await?;
                        info!(target: "hamstr::packet", "Received missing packet {seq}");
                    } else {
                        self.send_ack(backend, session, Some(seq)).await?;
                    }
                    if missing.is_empty() {
                        info!(target: "hamstr::system", "All missing packets received");
                        return Ok(true);
                    }
                }
                Packet::Control { ty: MessageType::Done, .. } => {
                    if missing.is_empty() {
                        return Ok(true);
                    }
                    warn!(target: "hamstr::system", "Received DONE but still missing packets: {missing:?}");
                    return Ok(false);
                }
                Packet::Control { ty, .. } => {
                    debug!(target: "hamstr::control", "Ignoring {ty} while collecting missing packets");
                }
            }
        }
        if missing.is_empty() {
            Ok(true)
        } else {
            warn!(target: "hamstr::system", "Timeout while waiting for missing packets: {missing:?}");
            Ok(false)
        }
    }

    // =========================================================================
    // CONNECTION HANDSHAKE
    // =========================================================================

    /// Client side: CONNECT, await CONNECT_ACK, answer with ACK.
    ///
    /// The stabilization pauses around the final ACK give the far modem
    /// time to settle before data flows.
    pub async fn connect(
        &self,
        backend: &mut PacketBackend,
        remote: Callsign,
    ) -> Result<Session, SessionError> {
        let mut session = Session::new(remote);
        session.state = SessionState::Connecting;

        for attempt in 0..self.cfg.send_retries {
            info!(
                target: "hamstr::session",
                "Connection attempt {}/{} to {}",
                attempt + 1,
                self.cfg.send_retries,
                session.remote
            );
            self.send_single_packet(
                backend,
                &mut session,
                0,
                0,
                b"Connect Request",
                MessageType::Connect,
            )
            .await?;
            if self
                .wait_for_specific(
                    backend,
                    &mut session,
                    MessageType::ConnectAck,
                    Duration::from_secs(self.cfg.connection_attempt_timeout),
                )
                .await?
            {
                sleep(self.stab() * 2).await;
                self.send_ack(backend, &mut session, None).await?;
                session.state = SessionState::Connected;
                session.touch();
                info!(target: "hamstr::session", "CONNECTED to {}", session.remote);
                sleep(self.stab() * 2).await;
                return Ok(session);
            }
            warn!(
                target: "hamstr::system",
                "Timeout waiting for CONNECT_ACK on attempt {}",
                attempt + 1
            );
            if attempt + 1 < self.cfg.send_retries {
                sleep(Duration::from_secs(self.cfg.connection_attempt_timeout)).await;
            }
        }
        error!(
            target: "hamstr::system",
            "Failed to connect to {} after {} attempts",
            session.remote,
            self.cfg.send_retries
        );
        Err(SessionError::Timeout("CONNECT_ACK"))
    }

    /// Server side: wait up to `timeout` for a CONNECT (or a bare
    /// DATA_REQUEST from a client that believes it is still connected) and
    /// run the accept handshake.
    ///
    /// CONNECT_ACK is re-sent at 1/3 and 2/3 of the ACK window if nothing
    /// comes back. A DATA_REQUEST arriving instead of the final ACK is the
    /// common lost-ACK case: it counts as an implicit ACK and is queued on
    /// the session for processing after the transition to CONNECTED.
    pub async fn accept(
        &self,
        backend: &mut PacketBackend,
        timeout: Duration,
    ) -> Result<Option<Session>, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let Some(inbound) = self
                .receive_message(backend, None, (deadline - now).min(Duration::from_secs(1)))
                .await?
            else {
                continue;
            };
            match inbound.ty() {
                MessageType::Connect => {
                    info!(target: "hamstr::control", "Received CONNECT request from {}", inbound.from);
                    let mut session = Session::new(inbound.from);
                    session.state = SessionState::Connecting;
                    sleep(self.stab()).await;
                    if let Some(session) = self.accept_handshake(backend, session).await? {
                        return Ok(Some(session));
                    }
                }
                MessageType::DataRequest => {
                    // Peer skipped the handshake; treat it as connected and
                    // queue the request.
                    info!(target: "hamstr::control", "Received DATA_REQUEST from {} with no session", inbound.from);
                    let mut session = Session::new(inbound.from);
                    session.state = SessionState::Connected;
                    session.pending_request = Some(inbound.packet.content().to_vec());
                    session.touch();
                    return Ok(Some(session));
                }
                other => {
                    debug!(target: "hamstr::control", "Ignoring {other} while waiting for CONNECT");
                }
            }
        }
    }

    async fn accept_handshake(
        &self,
        backend: &mut PacketBackend,
        mut session: Session,
    ) -> Result<Option<Session>, SessionError> {
        self.send_single_packet(
            backend,
            &mut session,
            0,
            0,
            b"Connection Accepted",
            MessageType::ConnectAck,
        )
        .await?;
        sleep(self.stab()).await;

        let window = self.cfg.ack_timeout_dur();
        let start = Instant::now();
        let mut resends = 0u32;
        loop {
            let elapsed = start.elapsed();
            if elapsed >= window {
                warn!(target: "hamstr::system", "Failed to establish connection with {}", session.remote);
                return Ok(None);
            }
            // Resend CONNECT_ACK at 1/3 and 2/3 of the window.
            if resends < CONNECT_ACK_RESENDS && elapsed > window / 3 * (resends + 1) {
                info!(target: "hamstr::control", "No ACK yet, resending CONNECT_ACK (attempt {})", resends + 1);
                sleep(self.stab()).await;
                self.send_single_packet(
                    backend,
                    &mut session,
                    0,
                    0,
                    b"Connection Accepted",
                    MessageType::ConnectAck,
                )
                .await?;
                resends += 1;
                sleep(self.stab()).await;
            }
            let Some(inbound) = self
                .receive_message(backend, Some(&mut session), Duration::from_millis(500))
                .await?
            else {
                continue;
            };
            match inbound.ty() {
                MessageType::Ack => {
                    session.state = SessionState::Connected;
                    session.touch();
                    info!(target: "hamstr::session", "CONNECTED to {}", session.remote);
                    return Ok(Some(session));
                }
                MessageType::DataRequest => {
                    info!(
                        target: "hamstr::session",
                        "Received DATA_REQUEST from {}, treating as implicit ACK",
                        session.remote
                    );
                    session.pending_request = Some(inbound.packet.content().to_vec());
                    session.state = SessionState::Connected;
                    session.touch();
                    return Ok(Some(session));
                }
                MessageType::Disconnect => {
                    self.acknowledge_disconnect(backend, &mut session).await;
                    return Ok(None);
                }
                other => {
                    warn!(target: "hamstr::control", "Unexpected {other} while waiting for ACK");
                }
            }
        }
    }

    // =========================================================================
    // DISCONNECT
    // =========================================================================

    /// Initiate a disconnect and wait for the ACK. Idempotent: a session
    /// already down is a successful no-op.
    pub async fn disconnect(
        &self,
        backend: &mut PacketBackend,
        session: &mut Session,
    ) -> Result<bool, SessionError> {
        if session.state == SessionState::Disconnected {
            return Ok(true);
        }
        info!(target: "hamstr::control", "Sending DISCONNECT for session: {}", session.id);
        session.state = SessionState::Disconnecting;
        if let Err(e) = self
            .send_single_packet(backend, session, 0, 0, b"Disconnect", MessageType::Disconnect)
            .await
        {
            error!(target: "hamstr::system", "Failed to send DISCONNECT: {e}");
            session.state = SessionState::Disconnected;
            return Ok(false);
        }
        let acked = matches!(
            self.wait_for_ack(
                backend,
                session,
                None,
                Duration::from_secs(self.cfg.disconnect_timeout),
            )
            .await,
            Ok(true)
        );
        if !acked {
            warn!(target: "hamstr::system", "No ACK received for DISCONNECT, cleaning up anyway");
        }
        session.state = SessionState::Disconnected;
        Ok(acked)
    }

    /// Answer a peer's DISCONNECT with an ACK and mark the session down.
    pub async fn acknowledge_disconnect(&self, backend: &mut PacketBackend, session: &mut Session) {
        if let Err(e) = self.send_ack(backend, session, None).await {
            error!(target: "hamstr::system", "Failed to ACK DISCONNECT: {e}");
        }
        session.state = SessionState::Disconnected;
    }

    // =========================================================================
    // REQUEST HELPERS (client side of the packet protocol)
    // =========================================================================

    /// Send a DATA_REQUEST and complete the READY swap that hands the
    /// channel to the server.
    pub async fn send_data_request(
        &self,
        backend: &mut PacketBackend,
        session: &mut Session,
        request: &[u8],
    ) -> Result<bool, SessionError> {
        self.send_message(backend, session, request, MessageType::DataRequest)
            .await?;
        if !session.missing_acks().is_empty() {
            warn!(target: "hamstr::system", "DATA_REQUEST not fully acknowledged");
            return Ok(false);
        }
        if !self
            .wait_for_specific(
                backend,
                session,
                MessageType::Ready,
                Duration::from_secs(self.cfg.ready_timeout),
            )
            .await?
        {
            error!(target: "hamstr::system", "Failed to receive READY for DATA_REQUEST");
            return Ok(false);
        }
        self.send_ready(backend, session).await?;
        Ok(true)
    }
}

/// Stitch a completed transfer back together in sequence order.
pub fn reassemble(session: &Session) -> Vec<u8> {
    let mut out = Vec::new();
    for seq in 1..=session.total_packets {
        if let Some(part) = session.received_packets.get(&seq) {
            out.extend_from_slice(part);
        }
    }
    out
}

/// `"ACK|0007"` -> `Some(7)`; a bare `"ACK"` -> `None`.
fn parse_ack_seq(content: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(content).ok()?;
    let (_, seq) = text.split_once('|')?;
    seq.trim().parse().ok()
}

/// `"PKT_MISSING|2|4"` -> `[2, 4]`. Anything unparseable yields an empty
/// list, which the sender answers with DONE_ACK to keep the peer moving.
fn parse_missing_list(content: &[u8]) -> Vec<u16> {
    let Ok(text) = std::str::from_utf8(content) else {
        return Vec::new();
    };
    let Some((_, rest)) = text.split_once('|') else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for part in rest.split('|') {
        match part.trim().parse() {
            Ok(seq) => out.push(seq),
            Err(_) => return Vec::new(),
        }
    }
    out
}
