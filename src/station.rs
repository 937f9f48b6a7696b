//! Station: the top-level owner.
//!
//! One station owns one backend, one protocol manager, and at most one
//! session. The transmitter is a serialized resource: a transfer in flight
//! makes any second operation fail immediately rather than queue, because
//! a queued radio operation is a stale radio operation.
//!
//! The server loop is strictly sequential: accept, handle, reset, next
//! peer. Every exit from a session, clean or not, resets transport state
//! so the next caller finds a fresh station.

use crate::backend::{create_backend, BackendError, RadioBackend};
use crate::config::StationConfig;
use crate::nostr::{
    compress_payload, decompress_payload, ErrorReply, GatewayError, NostrGateway, NoteRequest,
    PayloadError,
};
use crate::protocol::{direct, InboundRequest, ProtocolError, ProtocolKind, ProtocolManager};
use crate::session::{Session, SessionError, SessionRegistry};
use crate::types::{Callsign, MessageType, SessionState};
use crate::wire::packet::Packet;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Reply wait for a full note exchange.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(180);

/// Server-side wait for the first request on a fresh direct session.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum StationError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("radio operation in progress")]
    RadioBusy,

    #[error("no server callsign configured")]
    NoRemote,

    #[error("failed to connect to the server station")]
    ConnectFailed,

    #[error("no response received from the server")]
    NoResponse,
}

/// Exclusive claim on the transmitter for one operation.
struct TransferGuard(Arc<AtomicBool>);

impl Drop for TransferGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Serialize)]
struct ContentRecord<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    content: &'a str,
}

pub struct Station<G: NostrGateway> {
    cfg: StationConfig,
    backend: RadioBackend,
    protocol: ProtocolManager,
    registry: SessionRegistry,
    gateway: G,
    transfer_active: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl<G: NostrGateway> Station<G> {
    pub async fn new(cfg: StationConfig, gateway: G) -> Result<Self, StationError> {
        let backend = create_backend(&cfg).await?;
        let protocol = ProtocolManager::new(cfg.protocol.clone(), cfg.backend);
        Ok(Self {
            cfg,
            backend,
            protocol,
            registry: SessionRegistry::new(),
            gateway,
            transfer_active: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn backend(&self) -> &RadioBackend {
        &self.backend
    }

    /// Handle the caller keeps to stop the server loop from another task.
    pub fn shutdown_handle(&self) -> (Arc<AtomicBool>, Arc<Notify>) {
        (self.running.clone(), self.shutdown.clone())
    }

    fn begin_transfer(&self) -> Result<TransferGuard, StationError> {
        if self.transfer_active.swap(true, Ordering::SeqCst) {
            return Err(StationError::RadioBusy);
        }
        Ok(TransferGuard(self.transfer_active.clone()))
    }

    fn remote(&self) -> Result<Callsign, StationError> {
        self.cfg.remote.clone().ok_or(StationError::NoRemote)
    }

    // =========================================================================
    // CLIENT SIDE
    // =========================================================================

    /// Open a session to the configured server.
    async fn connect_to_server(&mut self) -> Result<Session, StationError> {
        let remote = self.remote()?;
        info!(target: "hamstr::session", "Connecting to {remote}...");
        match self.protocol.kind() {
            ProtocolKind::Packet => {
                let packet = self.backend.as_packet_mut()?;
                packet.start().await?;
                let session = self
                    .protocol
                    .engine()
                    .connect(packet, remote)
                    .await
                    .map_err(|_| StationError::ConnectFailed)?;
                // Let the far modem settle before the first data frame.
                sleep(self.cfg.protocol.stabilization_delay().mul_f64(1.3)).await;
                Ok(session)
            }
            ProtocolKind::Direct => Ok(self.backend.connect(Some(&remote)).await?),
        }
    }

    /// Fetch notes from the server. Returns the decompressed reply body,
    /// which is either the relay response or an error record; both are
    /// JSON text for the caller.
    pub async fn fetch_notes(&mut self, request: NoteRequest) -> Result<String, StationError> {
        let _guard = self.begin_transfer()?;
        let mut session = self.connect_to_server().await?;

        let result = self.fetch_notes_inner(&mut session, &request).await;
        self.finish_client_session(&mut session, result.is_ok()).await;
        self.registry.remove();
        result
    }

    async fn fetch_notes_inner(
        &mut self,
        session: &mut Session,
        request: &NoteRequest,
    ) -> Result<String, StationError> {
        if !self
            .protocol
            .send_nostr_request(&mut self.backend, session, request)
            .await?
        {
            return Err(StationError::NoResponse);
        }
        let Some(body) = self
            .protocol
            .receive_nostr_response(&mut self.backend, session, RESPONSE_TIMEOUT)
            .await?
        else {
            return Err(StationError::NoResponse);
        };

        // Error replies travel uncompressed; pass them through verbatim.
        if let Ok(err) = serde_json::from_str::<ErrorReply>(&body) {
            if !err.success {
                error!(
                    target: "hamstr::system",
                    "Server error: type={}, message={}",
                    err.error_type,
                    err.message
                );
                return Ok(body);
            }
        }
        let decompressed = decompress_payload(&body)?;
        info!(target: "hamstr::packet", "Response received from server ({} chars)", decompressed.len());
        Ok(decompressed)
    }

    /// Publish a signed note event through the server.
    pub async fn publish_note(&mut self, note_json: &str) -> Result<bool, StationError> {
        let _guard = self.begin_transfer()?;
        let compressed = compress_payload(note_json);
        let mut session = self.connect_to_server().await?;

        let published = match self.protocol.kind() {
            ProtocolKind::Direct => {
                self.direct_content_exchange(&mut session, "NOTE", &compressed)
                    .await?
            }
            ProtocolKind::Packet => {
                let engine = self.protocol.engine();
                let packet = self.backend.as_packet_mut()?;
                engine.send_ready(packet, &mut session).await?;
                let ready = engine
                    .wait_for_ready(
                        packet,
                        &mut session,
                        Duration::from_secs(self.cfg.protocol.ready_timeout),
                    )
                    .await?;
                if ready {
                    engine
                        .send_message(packet, &mut session, compressed.as_bytes(), MessageType::Note)
                        .await?;
                    engine.finish_transfer(packet, &mut session).await?
                } else {
                    false
                }
            }
        };

        if published {
            info!(target: "hamstr::system", "Note published");
        } else {
            error!(target: "hamstr::system", "Failed to publish note");
        }
        self.finish_client_session(&mut session, published).await;
        self.registry.remove();
        Ok(published)
    }

    /// Request a Lightning invoice for a zap. The reply body carries the
    /// invoice or an error record.
    pub async fn send_zap(&mut self, zap_note_json: &str) -> Result<String, StationError> {
        let _guard = self.begin_transfer()?;
        let compressed = compress_payload(zap_note_json);
        let mut session = self.connect_to_server().await?;

        let result = match self.protocol.kind() {
            ProtocolKind::Direct => {
                direct::send_record(
                    &mut self.backend,
                    &mut session,
                    &ContentRecord {
                        kind: "ZAP_REQUEST",
                        content: &compressed,
                    },
                )
                .await?;
                match direct::receive_response(&mut self.backend, &mut session, RESPONSE_TIMEOUT)
                    .await?
                {
                    Some(body) => self.decode_reply(body),
                    None => Err(StationError::NoResponse),
                }
            }
            ProtocolKind::Packet => {
                let engine = self.protocol.engine();
                let packet = self.backend.as_packet_mut()?;
                engine
                    .send_message(
                        packet,
                        &mut session,
                        compressed.as_bytes(),
                        MessageType::ZapRequest,
                    )
                    .await?;
                if !engine.finish_transfer(packet, &mut session).await? {
                    Err(StationError::NoResponse)
                } else if engine
                    .wait_for_specific(
                        packet,
                        &mut session,
                        MessageType::Ready,
                        Duration::from_secs(self.cfg.protocol.ready_timeout),
                    )
                    .await?
                {
                    engine.send_ready(packet, &mut session).await?;
                    match engine.receive_response(packet, &mut session).await? {
                        Some(bytes) => {
                            let body = String::from_utf8_lossy(&bytes).into_owned();
                            self.decode_reply(body)
                        }
                        None => Err(StationError::NoResponse),
                    }
                } else {
                    Err(StationError::NoResponse)
                }
            }
        };

        self.finish_client_session(&mut session, result.is_ok()).await;
        self.registry.remove();
        result
    }

    fn decode_reply(&self, body: String) -> Result<String, StationError> {
        if let Ok(err) = serde_json::from_str::<ErrorReply>(&body) {
            if !err.success {
                return Ok(body);
            }
        }
        Ok(decompress_payload(&body)?)
    }

    /// Direct-path content publication: send the record, confirm success,
    /// then walk the abbreviated closing ladder.
    async fn direct_content_exchange(
        &mut self,
        session: &mut Session,
        kind: &str,
        compressed: &str,
    ) -> Result<bool, StationError> {
        direct::send_record(
            &mut self.backend,
            session,
            &ContentRecord {
                kind,
                content: compressed,
            },
        )
        .await?;
        let reply = direct::receive_json(&mut self.backend, session, Duration::from_secs(60)).await?;
        let success = reply
            .as_ref()
            .and_then(|v| v.get("success"))
            .and_then(|s| s.as_bool())
            .unwrap_or(false);
        if success {
            direct::send_control(&mut self.backend, session, "DONE").await?;
            if !direct::wait_for_control(&mut self.backend, session, "DONE_ACK", Duration::from_secs(15))
                .await?
            {
                warn!(target: "hamstr::control", "No DONE_ACK received");
            }
            direct::send_control(&mut self.backend, session, "DISCONNECT").await?;
        }
        Ok(success)
    }

    /// Tear the client session down along whichever path the protocol
    /// prescribes. Runs on success and failure alike.
    async fn finish_client_session(&mut self, session: &mut Session, clean: bool) {
        if session.state == SessionState::Disconnected {
            return;
        }
        match self.protocol.kind() {
            ProtocolKind::Direct => {
                let result = if clean {
                    direct::client_shutdown(&mut self.backend, session).await
                } else {
                    self.backend
                        .disconnect(session)
                        .await
                        .map_err(ProtocolError::from)
                };
                if let Err(e) = result {
                    warn!(target: "hamstr::session", "Error during disconnect: {e}");
                }
            }
            ProtocolKind::Packet => {
                let engine = self.protocol.engine();
                match self.backend.as_packet_mut() {
                    Ok(packet) => {
                        if let Err(e) = engine.disconnect(packet, session).await {
                            warn!(target: "hamstr::session", "Error during disconnect: {e}");
                        }
                        packet.stop();
                    }
                    Err(e) => warn!(target: "hamstr::session", "Disconnect skipped: {e}"),
                }
            }
        }
    }

    // =========================================================================
    // SERVER SIDE
    // =========================================================================

    /// Sequential accept / handle / reset loop. Returns when shutdown is
    /// requested.
    pub async fn run_server(&mut self) -> Result<(), StationError> {
        info!(target: "hamstr::system", "Server is running as {}", self.cfg.callsign);
        while self.running.load(Ordering::SeqCst) {
            info!(target: "hamstr::system", "Waiting for incoming connections...");
            let accepted = self.accept_session().await;
            match accepted {
                Ok(Some(session)) => {
                    let id = session.id.clone();
                    self.registry.install(session);
                    let mut session = self.registry.take().expect("just installed");
                    if let Err(e) = self.handle_session(&mut session).await {
                        error!(target: "hamstr::system", "Error handling session {id}: {e}");
                    }
                    info!(target: "hamstr::system", "Session ended, resetting for next connection");
                    self.reset_for_next().await;
                }
                Ok(None) => {
                    self.registry
                        .sweep(Duration::from_secs(self.cfg.protocol.connection_timeout));
                }
                Err(e) => {
                    error!(target: "hamstr::system", "Error in connection handling: {e}");
                    self.reset_for_next().await;
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!(target: "hamstr::system", "Server main loop exited");
        self.backend.shutdown().await;
        Ok(())
    }

    async fn accept_session(&mut self) -> Result<Option<Session>, StationError> {
        match self.protocol.kind() {
            ProtocolKind::Packet => {
                let engine = self.protocol.engine();
                let packet = self.backend.as_packet_mut()?;
                if !packet.is_started() {
                    packet.start().await?;
                }
                Ok(engine.accept(packet, Duration::from_secs(2)).await?)
            }
            ProtocolKind::Direct => {
                let shutdown = self.shutdown.clone();
                tokio::select! {
                    _ = shutdown.notified() => Ok(None),
                    session = self.backend.connect(None) => Ok(Some(session?)),
                }
            }
        }
    }

    async fn handle_session(&mut self, session: &mut Session) -> Result<(), StationError> {
        info!(target: "hamstr::session", "Handling session for {}", session.remote);
        match self.protocol.kind() {
            ProtocolKind::Direct => self.handle_direct_session(session).await,
            ProtocolKind::Packet => self.handle_packet_session(session).await,
        }
    }

    /// Direct path: one request record, one response, shutdown ladder.
    async fn handle_direct_session(&mut self, session: &mut Session) -> Result<(), StationError> {
        let Some(value) =
            direct::receive_json(&mut self.backend, session, REQUEST_TIMEOUT).await?
        else {
            warn!(target: "hamstr::system", "No request arrived on the new session");
            self.backend.disconnect(session).await?;
            return Ok(());
        };
        let Some(request) = ProtocolManager::decode_direct_request(&value) else {
            warn!(target: "hamstr::system", "Undecodable request record: {value}");
            self.backend.disconnect(session).await?;
            return Ok(());
        };

        match request {
            InboundRequest::Notes(req) => {
                let body = self.process_notes_request(&req).await;
                direct::send_response(&mut self.backend, session, body).await?;
                direct::server_shutdown(&mut self.backend, session).await?;
            }
            InboundRequest::Note { content } => {
                let body = self.process_note_publish(&content).await;
                direct::send_record(
                    &mut self.backend,
                    session,
                    &serde_json::json!({"success": body.is_ok()}),
                )
                .await?;
                // The client closes with DONE / DISCONNECT; answer in kind.
                if direct::wait_for_control(&mut self.backend, session, "DONE", direct::CONTROL_WAIT)
                    .await?
                {
                    direct::send_control(&mut self.backend, session, "DONE_ACK").await?;
                }
                let _ = direct::wait_for_control(
                    &mut self.backend,
                    session,
                    "DISCONNECT",
                    direct::CONTROL_WAIT,
                )
                .await?;
                self.backend.disconnect(session).await?;
            }
            InboundRequest::Zap { content } => {
                let body = self.process_zap_request(&content).await;
                direct::send_response(&mut self.backend, session, body).await?;
                direct::server_shutdown(&mut self.backend, session).await?;
            }
        }
        Ok(())
    }

    /// Packet path: drive the engine until the client disconnects or goes
    /// quiet.
    async fn handle_packet_session(&mut self, session: &mut Session) -> Result<(), StationError> {
        // A DATA_REQUEST that stood in for the handshake ACK is served
        // first.
        if let Some(pending) = session.pending_request.take() {
            info!(target: "hamstr::session", "Processing request queued during handshake");
            self.serve_notes_over_packet(session, &pending).await?;
        }

        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if !session.is_connected() {
                break;
            }
            if session.idle_for() > Duration::from_secs(self.cfg.protocol.connection_timeout) {
                info!(target: "hamstr::session", "Connection timeout for {}", session.remote);
                break;
            }

            let engine = self.protocol.engine();
            let packet = self.backend.as_packet_mut()?;
            let Some(inbound) = engine
                .receive_message(packet, Some(session), Duration::from_secs(1))
                .await?
            else {
                continue;
            };

            match inbound.packet {
                Packet::Control { ty: MessageType::Ready, .. } => {
                    engine.send_ready(packet, session).await?;
                }
                Packet::Control { ty: MessageType::Disconnect, .. } => {
                    engine.acknowledge_disconnect(packet, session).await;
                    break;
                }
                Packet::Control { ty: MessageType::Done, .. } => {
                    // DONE closes an inbound NOTE / zap transfer.
                    if session.total_packets > 0 && session.missing_received().is_empty() {
                        engine
                            .send_control(packet, session, MessageType::DoneAck, b"DONE_ACK")
                            .await?;
                        let (ty, body) = take_inbound_transfer(session);
                        self.dispatch_inbound_transfer(session, ty, body).await?;
                    } else if session.total_packets > 0 {
                        let missing = session.missing_received();
                        engine
                            .request_missing_packets(packet, session, missing)
                            .await?;
                    }
                }
                Packet::Control { ty, .. } => {
                    info!(target: "hamstr::control", "Ignoring {ty} in server loop");
                }
                Packet::Data { ty: MessageType::DataRequest, seq, total, content } => {
                    if session.total_packets == 0 {
                        session.total_packets = total;
                    }
                    session.received_packets.entry(seq).or_insert(content);
                    engine.send_ack(packet, session, Some(seq)).await?;
                    if session.missing_received().is_empty() {
                        let (_, request) = take_inbound_transfer(session);
                        self.serve_notes_over_packet(session, &request).await?;
                    }
                }
                Packet::Data { ty, seq, total, content } => {
                    // NOTE / zap payloads accumulate until the DONE above.
                    if session.total_packets == 0 {
                        session.total_packets = total;
                        session.inbound_kind = Some(ty);
                    }
                    session.received_packets.entry(seq).or_insert(content);
                    engine.send_ack(packet, session, Some(seq)).await?;
                }
            }
        }
        Ok(())
    }

    /// READY swap, collaborator call, segmented response.
    async fn serve_notes_over_packet(
        &mut self,
        session: &mut Session,
        request: &[u8],
    ) -> Result<(), StationError> {
        let request_text = String::from_utf8_lossy(request).into_owned();
        info!(target: "hamstr::control", "Received DATA_REQUEST: {request_text}");

        let engine = self.protocol.engine();
        let packet = self.backend.as_packet_mut()?;
        engine.send_ready(packet, session).await?;
        if !engine
            .wait_for_ready(
                packet,
                session,
                Duration::from_secs(self.cfg.protocol.ready_timeout),
            )
            .await?
        {
            error!(target: "hamstr::system", "Did not receive READY message from client");
            return Ok(());
        }

        let body = match NoteRequest::parse_wire_string(&request_text) {
            Some(req) => self.process_notes_request(&req).await,
            None => ErrorReply::new("bad_request", format!("unparseable request: {request_text}"))
                .to_json(),
        };

        let engine = self.protocol.engine();
        let packet = self.backend.as_packet_mut()?;
        if engine.send_response(packet, session, body.as_bytes()).await? {
            info!(target: "hamstr::system", "Response sent successfully");
        } else {
            error!(target: "hamstr::system", "Failed to send response");
        }
        Ok(())
    }

    async fn dispatch_inbound_transfer(
        &mut self,
        session: &mut Session,
        ty: Option<MessageType>,
        body: Vec<u8>,
    ) -> Result<(), StationError> {
        let text = String::from_utf8_lossy(&body).into_owned();
        match ty {
            Some(MessageType::ZapRequest) => {
                let reply = self.process_zap_request(&text).await;
                let engine = self.protocol.engine();
                let packet = self.backend.as_packet_mut()?;
                engine.send_ready(packet, session).await?;
                if engine
                    .wait_for_ready(
                        packet,
                        session,
                        Duration::from_secs(self.cfg.protocol.ready_timeout),
                    )
                    .await?
                {
                    engine.send_response(packet, session, reply.as_bytes()).await?;
                }
            }
            _ => {
                // NOTE publication wants no response body, only the
                // DONE_ACK already sent.
                let _ = self.process_note_publish(&text).await;
            }
        }
        Ok(())
    }

    // =========================================================================
    // COLLABORATOR CALLS
    // =========================================================================

    async fn process_notes_request(&self, request: &NoteRequest) -> String {
        info!(
            target: "hamstr::system",
            "Processing note request: type={:?} count={}",
            request.request_type,
            request.count
        );
        match self.gateway.fetch_events(request).await {
            Ok(events_json) => compress_payload(&events_json),
            Err(e) => {
                error!(target: "hamstr::system", "Gateway error: {e}");
                e.to_reply().to_json()
            }
        }
    }

    async fn process_note_publish(&self, compressed: &str) -> Result<String, GatewayError> {
        let note_json = decompress_payload(compressed)
            .map_err(|e| GatewayError::Relay(format!("undecodable note payload: {e}")))?;
        let result = self.gateway.publish_note(&note_json).await;
        match &result {
            Ok(_) => info!(target: "hamstr::system", "Note published to relays"),
            Err(e) => error!(target: "hamstr::system", "Note publish failed: {e}"),
        }
        result
    }

    async fn process_zap_request(&self, compressed: &str) -> String {
        let zap_json = match decompress_payload(compressed) {
            Ok(json) => json,
            Err(e) => {
                return ErrorReply::new("bad_request", format!("undecodable zap payload: {e}"))
                    .to_json()
            }
        };
        match self.gateway.zap_invoice(&zap_json).await {
            Ok(reply) => compress_payload(&reply),
            Err(e) => e.to_reply().to_json(),
        }
    }

    /// Post-session reset: drop registry state. The packet TNC stream and
    /// the VARA listener survive between sessions; mesh links are already
    /// gone by the time a session ends.
    async fn reset_for_next(&mut self) {
        self.registry.remove();
    }
}

/// Pull the accumulated inbound transfer out of the session buffers.
fn take_inbound_transfer(session: &mut Session) -> (Option<MessageType>, Vec<u8>) {
    let body = crate::session::engine::reassemble(session);
    let ty = session.inbound_kind.take();
    session.reset_transfer();
    (ty, body)
}
