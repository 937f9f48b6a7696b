//! Protocol dispatcher.
//!
//! Two strategies behind one surface: transports that guarantee delivery
//! themselves exchange whole JSON buffers (direct), the bare packet
//! transport runs the per-packet ACK engine. Selection is a static table
//! on the backend kind; changing backends means tearing sessions down
//! first.

pub mod direct;
pub mod packet;

use crate::backend::{BackendError, BackendKind, RadioBackend};
use crate::config::ProtocolConfig;
use crate::nostr::{NoteRequest, WireRequest};
use crate::session::{Session, SessionEngine, SessionError};
use std::time::Duration;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("payload codec error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which strategy a backend runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Direct,
    Packet,
}

impl ProtocolKind {
    pub fn for_backend(kind: BackendKind) -> Self {
        if kind.is_reliable_transport() {
            ProtocolKind::Direct
        } else {
            ProtocolKind::Packet
        }
    }
}

/// A request arriving at the server, decoded at the dispatcher boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRequest {
    /// Note retrieval.
    Notes(NoteRequest),
    /// Note publication; content is the signed event JSON (compressed).
    Note { content: String },
    /// Zap payment request; content is the kind 9734 event JSON.
    Zap { content: String },
}

/// Routes NOSTR operations to the right strategy for the active backend.
pub struct ProtocolManager {
    engine: SessionEngine,
    kind: ProtocolKind,
}

impl ProtocolManager {
    pub fn new(cfg: ProtocolConfig, backend_kind: BackendKind) -> Self {
        let kind = ProtocolKind::for_backend(backend_kind);
        info!(target: "hamstr::system", "Using {kind:?} protocol for {backend_kind}");
        Self {
            engine: SessionEngine::new(cfg),
            kind,
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    pub fn engine(&self) -> &SessionEngine {
        &self.engine
    }

    /// Client: send a note retrieval request.
    pub async fn send_nostr_request(
        &self,
        backend: &mut RadioBackend,
        session: &mut Session,
        request: &NoteRequest,
    ) -> Result<bool, ProtocolError> {
        match self.kind {
            ProtocolKind::Direct => {
                direct::send_request(backend, session, &WireRequest::from(request)).await?;
                Ok(true)
            }
            ProtocolKind::Packet => {
                packet::send_request(&self.engine, backend.as_packet_mut()?, session, request).await
            }
        }
    }

    /// Client: wait for the reply body (compressed payload or an error
    /// record, both as text).
    pub async fn receive_nostr_response(
        &self,
        backend: &mut RadioBackend,
        session: &mut Session,
        timeout: Duration,
    ) -> Result<Option<String>, ProtocolError> {
        match self.kind {
            ProtocolKind::Direct => direct::receive_response(backend, session, timeout).await,
            ProtocolKind::Packet => {
                packet::receive_response(&self.engine, backend.as_packet_mut()?, session).await
            }
        }
    }

    /// Server, direct path: decode one inbound request record.
    pub fn decode_direct_request(value: &serde_json::Value) -> Option<InboundRequest> {
        match value.get("type") {
            Some(serde_json::Value::Number(n)) => {
                let ty = u8::try_from(n.as_u64()?).ok()?;
                let request_type = ty.try_into().ok()?;
                let count = value.get("count").and_then(|c| c.as_u64()).unwrap_or(1) as u32;
                let params = value
                    .get("params")
                    .and_then(|p| p.as_str())
                    .map(str::to_string);
                Some(InboundRequest::Notes(NoteRequest {
                    request_type,
                    count,
                    params,
                }))
            }
            Some(serde_json::Value::String(kind)) => {
                let content = value.get("content").and_then(|c| c.as_str())?.to_string();
                match kind.as_str() {
                    "NOTE" => Some(InboundRequest::Note { content }),
                    "ZAP_REQUEST" => Some(InboundRequest::Zap { content }),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nostr::NoteRequestType;

    #[test]
    fn selection_table() {
        assert_eq!(
            ProtocolKind::for_backend(BackendKind::Packet),
            ProtocolKind::Packet
        );
        assert_eq!(
            ProtocolKind::for_backend(BackendKind::Vara),
            ProtocolKind::Direct
        );
        assert_eq!(
            ProtocolKind::for_backend(BackendKind::Reticulum),
            ProtocolKind::Direct
        );
        assert_eq!(
            ProtocolKind::for_backend(BackendKind::Fldigi),
            ProtocolKind::Direct
        );
    }

    #[test]
    fn direct_request_decoding() {
        let notes = serde_json::json!({"type": 2, "count": 5, "params": "npub1x"});
        match ProtocolManager::decode_direct_request(&notes) {
            Some(InboundRequest::Notes(req)) => {
                assert_eq!(req.request_type, NoteRequestType::SpecificUser);
                assert_eq!(req.count, 5);
                assert_eq!(req.params.as_deref(), Some("npub1x"));
            }
            other => panic!("expected notes request, got {other:?}"),
        }

        let note = serde_json::json!({"type": "NOTE", "content": "compressed-blob"});
        assert_eq!(
            ProtocolManager::decode_direct_request(&note),
            Some(InboundRequest::Note {
                content: "compressed-blob".into()
            })
        );

        let zap = serde_json::json!({"type": "ZAP_REQUEST", "content": "kind9734"});
        assert_eq!(
            ProtocolManager::decode_direct_request(&zap),
            Some(InboundRequest::Zap {
                content: "kind9734".into()
            })
        );

        let junk = serde_json::json!({"type": true});
        assert_eq!(ProtocolManager::decode_direct_request(&junk), None);
    }
}
