//! NOSTR collaborator interface and payload encoding.
//!
//! The session layer never looks inside application payloads. At the
//! dispatcher boundary they become typed records: note retrieval requests,
//! note publications, zap payment requests. Actual relay and Lightning
//! access sits behind [`NostrGateway`]; the bridge only moves the bytes.
//!
//! Payloads are brotli-compressed and base64-armored before they ride the
//! radio link. At 1200 baud every byte is seconds of airtime.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Brotli quality level. High compression is worth the CPU on links this
/// slow.
const BROTLI_QUALITY: u32 = 9;
const BROTLI_LGWIN: u32 = 22;

// =============================================================================
// REQUEST RECORDS
// =============================================================================

/// Note retrieval modes, encoded as a small integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NoteRequestType {
    Following = 1,
    SpecificUser = 2,
    Global = 3,
    SearchText = 4,
    SearchHashtag = 5,
    SearchUser = 6,
    /// Exercises the error reply path end to end.
    TestError = 99,
}

impl TryFrom<u8> for NoteRequestType {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            1 => NoteRequestType::Following,
            2 => NoteRequestType::SpecificUser,
            3 => NoteRequestType::Global,
            4 => NoteRequestType::SearchText,
            5 => NoteRequestType::SearchHashtag,
            6 => NoteRequestType::SearchUser,
            99 => NoteRequestType::TestError,
            other => return Err(other),
        })
    }
}

/// A note retrieval request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteRequest {
    pub request_type: NoteRequestType,
    pub count: u32,
    pub params: Option<String>,
}

impl NoteRequest {
    /// Packet-protocol wire form: `GET_NOTES <type>|<count>[|<params>]`.
    pub fn to_wire_string(&self) -> String {
        let mut out = format!("GET_NOTES {}|{}", self.request_type as u8, self.count);
        if let Some(params) = &self.params {
            out.push('|');
            out.push_str(params);
        }
        out
    }

    pub fn parse_wire_string(s: &str) -> Option<Self> {
        let rest = s.trim().strip_prefix("GET_NOTES")?.trim_start();
        let mut fields = rest.splitn(3, '|');
        let ty: u8 = fields.next()?.trim().parse().ok()?;
        let request_type = NoteRequestType::try_from(ty).ok()?;
        let count: u32 = fields.next()?.trim().parse().ok()?;
        let params = fields.next().map(str::to_string).filter(|p| !p.is_empty());
        Some(Self {
            request_type,
            count,
            params,
        })
    }
}

/// Direct-protocol JSON form of a note request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    #[serde(rename = "type")]
    pub request_type: u8,
    pub count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,
}

impl From<&NoteRequest> for WireRequest {
    fn from(req: &NoteRequest) -> Self {
        Self {
            request_type: req.request_type as u8,
            count: req.count,
            params: req.params.clone(),
        }
    }
}

/// Collaborator failures encoded into the reply payload. The session
/// itself succeeds; the error travels as data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub success: bool,
    pub error_type: String,
    pub message: String,
}

impl ErrorReply {
    pub fn new(error_type: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_type: error_type.to_string(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("error reply serializes")
    }
}

// =============================================================================
// GATEWAY
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("relay error: {0}")]
    Relay(String),

    #[error("lightning error: {0}")]
    Lightning(String),

    #[error("no gateway configured")]
    Unconfigured,
}

impl GatewayError {
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Relay(_) => "relay_error",
            GatewayError::Lightning(_) => "lightning_error",
            GatewayError::Unconfigured => "not_configured",
        }
    }

    pub fn to_reply(&self) -> ErrorReply {
        ErrorReply::new(self.error_type(), self.to_string())
    }
}

/// The Internet-side collaborator: relay access and Lightning flows.
///
/// Every method returns the JSON reply body as a plain string; the
/// station compresses it for the air. Whatever async machinery an
/// implementation uses internally is its own concern.
pub trait NostrGateway: Send + Sync {
    fn fetch_events(
        &self,
        request: &NoteRequest,
    ) -> impl std::future::Future<Output = Result<String, GatewayError>> + Send;

    fn publish_note(
        &self,
        note_json: &str,
    ) -> impl std::future::Future<Output = Result<String, GatewayError>> + Send;

    fn zap_invoice(
        &self,
        zap_note_json: &str,
    ) -> impl std::future::Future<Output = Result<String, GatewayError>> + Send;
}

/// Placeholder gateway for stations that have not wired a relay client.
/// Every request yields a well-formed error reply.
pub struct UnconfiguredGateway;

impl NostrGateway for UnconfiguredGateway {
    async fn fetch_events(&self, _request: &NoteRequest) -> Result<String, GatewayError> {
        Err(GatewayError::Unconfigured)
    }

    async fn publish_note(&self, _note_json: &str) -> Result<String, GatewayError> {
        Err(GatewayError::Unconfigured)
    }

    async fn zap_invoice(&self, _zap_note_json: &str) -> Result<String, GatewayError> {
        Err(GatewayError::Unconfigured)
    }
}

// =============================================================================
// PAYLOAD ENCODING
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("decompression failed: {0}")]
    Brotli(std::io::Error),

    #[error("payload is not valid UTF-8")]
    Utf8,
}

/// Compress a JSON payload and armor it for the ASCII wire.
pub fn compress_payload(data: &str) -> String {
    let mut compressed = Vec::new();
    {
        let mut writer =
            brotli::CompressorWriter::new(&mut compressed, 4096, BROTLI_QUALITY, BROTLI_LGWIN);
        writer
            .write_all(data.as_bytes())
            .expect("in-memory write cannot fail");
    }
    base64::engine::general_purpose::STANDARD.encode(compressed)
}

/// Reverse of [`compress_payload`].
pub fn decompress_payload(encoded: &str) -> Result<String, PayloadError> {
    let compressed = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
    let mut decompressed = Vec::new();
    brotli::Decompressor::new(compressed.as_slice(), 4096)
        .read_to_end(&mut decompressed)
        .map_err(PayloadError::Brotli)?;
    String::from_utf8(decompressed).map_err(|_| PayloadError::Utf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_string_roundtrip() {
        let req = NoteRequest {
            request_type: NoteRequestType::SpecificUser,
            count: 5,
            params: Some("npub1example".into()),
        };
        let wire = req.to_wire_string();
        assert_eq!(wire, "GET_NOTES 2|5|npub1example");
        assert_eq!(NoteRequest::parse_wire_string(&wire).unwrap(), req);

        let bare = NoteRequest {
            request_type: NoteRequestType::Following,
            count: 2,
            params: None,
        };
        assert_eq!(bare.to_wire_string(), "GET_NOTES 1|2");
        assert_eq!(NoteRequest::parse_wire_string("GET_NOTES 1|2").unwrap(), bare);
    }

    #[test]
    fn wire_string_rejects_malformed() {
        assert!(NoteRequest::parse_wire_string("PUT_NOTES 1|2").is_none());
        assert!(NoteRequest::parse_wire_string("GET_NOTES").is_none());
        assert!(NoteRequest::parse_wire_string("GET_NOTES 42|2").is_none());
        assert!(NoteRequest::parse_wire_string("GET_NOTES x|2").is_none());
    }

    #[test]
    fn payload_compression_roundtrip() {
        let payload = r#"{"events":[{"id":"abc","content":"Greetings from the HF bands","created_at":1722470400}]}"#;
        let encoded = compress_payload(payload);
        assert!(encoded.bytes().all(|b| b.is_ascii()));
        assert_eq!(decompress_payload(&encoded).unwrap(), payload);
    }

    #[test]
    fn compression_helps_on_real_payloads() {
        // Repetitive relay responses should shrink noticeably.
        let event = r#"{"id":"0000000000000000","pubkey":"ffffffffffffffff","content":"CQ CQ CQ de N0CALL","tags":[]}"#;
        let payload = format!(r#"{{"events":[{}]}}"#, vec![event; 20].join(","));
        let encoded = compress_payload(&payload);
        assert!(encoded.len() < payload.len() / 2);
        assert_eq!(decompress_payload(&encoded).unwrap(), payload);
    }

    #[test]
    fn decompress_rejects_garbage() {
        assert!(decompress_payload("!!!not base64!!!").is_err());
        let valid_b64 = base64::engine::general_purpose::STANDARD.encode(b"not brotli data xx");
        assert!(decompress_payload(&valid_b64).is_err());
    }

    #[test]
    fn error_reply_shape() {
        let reply = GatewayError::Relay("relay pool empty".into()).to_reply();
        let json = reply.to_json();
        let parsed: ErrorReply = serde_json::from_str(&json).unwrap();
        assert!(!parsed.success);
        assert_eq!(parsed.error_type, "relay_error");
    }
}
