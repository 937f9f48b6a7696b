//! Direct protocol: one-shot JSON exchange for transports that are
//! reliable on their own (VARA, mesh).
//!
//! The whole request is serialized once and handed to the backend, which
//! segments internally as needed; the reply comes back the same way. After
//! the reply, both sides walk an explicit shutdown ladder of one-shot
//! control records so neither leaves the other keyed up waiting:
//!
//! ```text
//! client: ACK -> server: DONE -> client: DONE_ACK
//!       -> server: DISCONNECT -> client: DISCONNECT_ACK -> teardown
//! ```
//!
//! Each step is a `{"type":"..."}` JSON with a window sized for slow
//! links. A timeout anywhere still tears the transport down.

use crate::backend::RadioBackend;
use crate::nostr::WireRequest;
use crate::session::Session;
use super::ProtocolError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Wait for each shutdown-ladder step.
pub const CONTROL_WAIT: Duration = Duration::from_secs(30);

/// Wait for a full reply; large requests on slow links need the room.
pub const RESPONSE_WAIT: Duration = Duration::from_secs(180);

/// One-shot control record.
#[derive(Debug, Serialize, Deserialize)]
struct ControlRecord<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
}

/// Server reply envelope: the payload rides in `data`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub data: String,
}

/// Serialize any record to JSON and hand it to the backend whole.
pub async fn send_record(
    backend: &mut RadioBackend,
    session: &mut Session,
    value: &impl Serialize,
) -> Result<(), ProtocolError> {
    let bytes = serde_json::to_vec(value)?;
    backend.send_data(session, &bytes).await?;
    Ok(())
}

/// Send one `{"type":...}` control record.
pub async fn send_control(
    backend: &mut RadioBackend,
    session: &mut Session,
    kind: &str,
) -> Result<(), ProtocolError> {
    send_record(backend, session, &ControlRecord { kind }).await?;
    info!(target: "hamstr::control", "Sent {kind}");
    Ok(())
}

/// Wait for a specific control record. Anything else (or nothing) is a
/// miss; the ladder keeps descending regardless.
pub async fn wait_for_control(
    backend: &mut RadioBackend,
    session: &mut Session,
    expected: &str,
    timeout: Duration,
) -> Result<bool, ProtocolError> {
    let Some(bytes) = backend.receive_data(session, timeout).await? else {
        warn!(target: "hamstr::control", "Timed out waiting for {expected}");
        return Ok(false);
    };
    match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(value) if value.get("type").and_then(|t| t.as_str()) == Some(expected) => {
            info!(target: "hamstr::control", "Received {expected}");
            Ok(true)
        }
        Ok(other) => {
            warn!(target: "hamstr::control", "Expected {expected}, got {other}");
            Ok(false)
        }
        Err(_) => {
            warn!(target: "hamstr::control", "Expected {expected}, got undecodable payload");
            Ok(false)
        }
    }
}

/// Client: ship the request record as one JSON buffer.
pub async fn send_request(
    backend: &mut RadioBackend,
    session: &mut Session,
    request: &WireRequest,
) -> Result<(), ProtocolError> {
    info!(
        target: "hamstr::control",
        "Sending request type {} ({} notes)",
        request.request_type,
        request.count
    );
    send_record(backend, session, request).await
}

/// Receive one JSON value, whatever it is.
pub async fn receive_json(
    backend: &mut RadioBackend,
    session: &mut Session,
    timeout: Duration,
) -> Result<Option<serde_json::Value>, ProtocolError> {
    let Some(bytes) = backend.receive_data(session, timeout).await? else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Receive the reply envelope and unwrap its payload. An envelope without
/// `data` is handed back verbatim so error replies reach the caller.
pub async fn receive_response(
    backend: &mut RadioBackend,
    session: &mut Session,
    timeout: Duration,
) -> Result<Option<String>, ProtocolError> {
    let Some(value) = receive_json(backend, session, timeout).await? else {
        warn!(target: "hamstr::system", "No response received, timeout");
        return Ok(None);
    };
    info!(target: "hamstr::progress", "100.00% complete");
    match value.get("data").and_then(|d| d.as_str()) {
        Some(data) => Ok(Some(data.to_string())),
        None => Ok(Some(value.to_string())),
    }
}

/// Server: wrap the reply payload and send it.
pub async fn send_response(
    backend: &mut RadioBackend,
    session: &mut Session,
    payload: String,
) -> Result<(), ProtocolError> {
    send_record(backend, session, &ResponseEnvelope { data: payload }).await?;
    info!(target: "hamstr::control", "Transmission complete");
    Ok(())
}

/// Client half of the shutdown ladder, run after the reply is in hand.
/// Every step tolerates a timeout; the transport comes down either way.
pub async fn client_shutdown(
    backend: &mut RadioBackend,
    session: &mut Session,
) -> Result<(), ProtocolError> {
    send_control(backend, session, "ACK").await?;
    if wait_for_control(backend, session, "DONE", CONTROL_WAIT).await? {
        send_control(backend, session, "DONE_ACK").await?;
        if wait_for_control(backend, session, "DISCONNECT", CONTROL_WAIT).await? {
            send_control(backend, session, "DISCONNECT_ACK").await?;
        }
    }
    backend.disconnect(session).await?;
    info!(target: "hamstr::session", "Client disconnect complete");
    Ok(())
}

/// Server half of the shutdown ladder, run after the response is sent.
pub async fn server_shutdown(
    backend: &mut RadioBackend,
    session: &mut Session,
) -> Result<(), ProtocolError> {
    if wait_for_control(backend, session, "ACK", CONTROL_WAIT).await? {
        send_control(backend, session, "DONE").await?;
        if wait_for_control(backend, session, "DONE_ACK", CONTROL_WAIT).await? {
            send_control(backend, session, "DISCONNECT").await?;
            let _ = wait_for_control(backend, session, "DISCONNECT_ACK", CONTROL_WAIT).await?;
        }
    }
    backend.disconnect(session).await?;
    info!(target: "hamstr::session", "Server disconnect complete");
    Ok(())
}
