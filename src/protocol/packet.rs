//! Packet protocol: the session engine's segmented transfer path for the
//! bare packet backend.
//!
//! Requests travel as a pipe-delimited DATA_REQUEST string, the channel
//! changes hands through the READY swap, and the reply streams back as
//! ACK-confirmed packets reassembled by the engine.

use super::ProtocolError;
use crate::backend::packet::PacketBackend;
use crate::nostr::NoteRequest;
use crate::session::{Session, SessionEngine};
use tracing::{info, warn};

/// Client: send the request and hand the channel to the server.
pub async fn send_request(
    engine: &SessionEngine,
    backend: &mut PacketBackend,
    session: &mut Session,
    request: &NoteRequest,
) -> Result<bool, ProtocolError> {
    let wire = request.to_wire_string();
    info!(target: "hamstr::packet", "Sending request via packet protocol: {wire}");
    Ok(engine
        .send_data_request(backend, session, wire.as_bytes())
        .await?)
}

/// Client: collect the segmented reply.
pub async fn receive_response(
    engine: &SessionEngine,
    backend: &mut PacketBackend,
    session: &mut Session,
) -> Result<Option<String>, ProtocolError> {
    info!(target: "hamstr::packet", "Waiting for response via packet protocol");
    match engine.receive_response(backend, session).await? {
        Some(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Ok(Some(text)),
            Err(_) => {
                warn!(target: "hamstr::packet", "Response payload is not UTF-8, dropping");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}
