//! Session-layer packet codec.
//!
//! Two shapes share the AX.25 payload:
//!
//! ```text
//! control:  "M:<content>"
//! data:     "SSSS|TTTT|M:<content>|CCCCCCCC"
//! ```
//!
//! `M` is the decimal message type, `SSSS`/`TTTT` are zero-padded 1-based
//! sequence / total counts, and `CCCCCCCC` is the lowercase hex CRC-32
//! (zlib polynomial) over `header:content`. Content is opaque bytes; only
//! the header is required to be ASCII.

use super::WireError;
use crate::types::MessageType;

/// Header + checksum overhead reserved per data packet:
/// `SSSS|TTTT|M:` (12) plus `|CCCCCCCC` (9), rounded to the 15 bytes the
/// payload splitter actually reserves for single-digit type values.
pub const DATA_OVERHEAD: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Control {
        ty: MessageType,
        content: Vec<u8>,
    },
    Data {
        ty: MessageType,
        seq: u16,
        total: u16,
        content: Vec<u8>,
    },
}

impl Packet {
    pub fn message_type(&self) -> MessageType {
        match self {
            Packet::Control { ty, .. } => *ty,
            Packet::Data { ty, .. } => *ty,
        }
    }

    pub fn content(&self) -> &[u8] {
        match self {
            Packet::Control { content, .. } => content,
            Packet::Data { content, .. } => content,
        }
    }
}

fn crc32_hex(data: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(data))
}

/// Encode a control packet: `"M:<content>"`, no sequence numbers, no CRC.
pub fn encode_control(ty: MessageType, content: &[u8]) -> Vec<u8> {
    let mut out = format!("{}:", ty.wire_value()).into_bytes();
    out.extend_from_slice(content);
    out
}

/// Encode a data packet with CRC trailer.
pub fn encode_data(ty: MessageType, seq: u16, total: u16, content: &[u8]) -> Vec<u8> {
    let header = format!("{:04}|{:04}|{}", seq, total, ty.wire_value());
    let mut body = header.into_bytes();
    body.push(b':');
    body.extend_from_slice(content);
    let crc = crc32_hex(&body);
    body.push(b'|');
    body.extend_from_slice(crc.as_bytes());
    body
}

/// Parse an AX.25 payload into a session packet, verifying the CRC on data
/// packets. A checksum mismatch is an error the caller answers with RETRY.
pub fn parse_packet(payload: &[u8]) -> Result<Packet, WireError> {
    let colon = payload
        .iter()
        .position(|&b| b == b':')
        .ok_or(WireError::BadHeader)?;
    let header = &payload[..colon];
    let rest = &payload[colon + 1..];
    if header.is_empty() || !header.iter().all(|b| b.is_ascii_digit() || *b == b'|') {
        return Err(WireError::BadHeader);
    }

    if !header.contains(&b'|') {
        // Control packet: the whole header is the type integer.
        let ty = parse_type(header)?;
        return Ok(Packet::Control {
            ty,
            content: rest.to_vec(),
        });
    }

    let mut parts = header.split(|&b| b == b'|');
    let seq = parse_decimal(parts.next().ok_or(WireError::BadHeader)?)?;
    let total = parse_decimal(parts.next().ok_or(WireError::BadHeader)?)?;
    let ty = parse_type(parts.next().ok_or(WireError::BadHeader)?)?;
    if parts.next().is_some() {
        return Err(WireError::BadHeader);
    }

    // Checksum rides after the last '|' of the content section.
    let pipe = rest
        .iter()
        .rposition(|&b| b == b'|')
        .ok_or(WireError::MissingChecksum)?;
    let content = &rest[..pipe];
    let received = std::str::from_utf8(&rest[pipe + 1..])
        .map_err(|_| WireError::MissingChecksum)?
        .to_ascii_lowercase();

    let mut checked = Vec::with_capacity(colon + 1 + content.len());
    checked.extend_from_slice(header);
    checked.push(b':');
    checked.extend_from_slice(content);
    let calculated = crc32_hex(&checked);

    if calculated != received {
        return Err(WireError::ChecksumMismatch {
            calculated,
            received,
        });
    }

    Ok(Packet::Data {
        ty,
        seq,
        total,
        content: content.to_vec(),
    })
}

fn parse_decimal(bytes: &[u8]) -> Result<u16, WireError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(WireError::BadHeader)
}

fn parse_type(bytes: &[u8]) -> Result<MessageType, WireError> {
    let v: u8 = std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(WireError::BadHeader)?;
    MessageType::try_from(v).map_err(WireError::UnknownType)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_roundtrip() {
        let encoded = encode_control(MessageType::Done, b"DONE");
        assert_eq!(encoded, b"11:DONE");
        let parsed = parse_packet(&encoded).unwrap();
        assert_eq!(
            parsed,
            Packet::Control {
                ty: MessageType::Done,
                content: b"DONE".to_vec()
            }
        );
    }

    #[test]
    fn data_packet_format() {
        // The documented reference vector: CRC over "0001|0001|1:GET_NOTES 1|2".
        let encoded = encode_data(MessageType::DataRequest, 1, 1, b"GET_NOTES 1|2");
        let expected_crc = format!("{:08x}", crc32fast::hash(b"0001|0001|1:GET_NOTES 1|2"));
        let mut expected = b"0001|0001|1:GET_NOTES 1|2|".to_vec();
        expected.extend_from_slice(expected_crc.as_bytes());
        assert_eq!(encoded, expected);

        match parse_packet(&encoded).unwrap() {
            Packet::Data {
                ty,
                seq,
                total,
                content,
            } => {
                assert_eq!(ty, MessageType::DataRequest);
                assert_eq!(seq, 1);
                assert_eq!(total, 1);
                assert_eq!(content, b"GET_NOTES 1|2");
            }
            other => panic!("expected data packet, got {other:?}"),
        }
    }

    #[test]
    fn content_with_pipes_survives() {
        // The checksum split is the rightmost pipe, so payload pipes pass
        // through untouched.
        let content = b"PKT_MISSING|2|4";
        let encoded = encode_data(MessageType::Response, 3, 9, content);
        match parse_packet(&encoded).unwrap() {
            Packet::Data { content: got, .. } => assert_eq!(got, content),
            other => panic!("expected data packet, got {other:?}"),
        }
    }

    #[test]
    fn corrupted_packet_rejected() {
        let mut encoded = encode_data(MessageType::Response, 2, 5, b"payload bytes");
        // Flip a content byte; CRC must catch it.
        let idx = encoded.len() / 2;
        encoded[idx] ^= 0x01;
        match parse_packet(&encoded) {
            Err(WireError::ChecksumMismatch { .. }) | Err(WireError::BadHeader) => {}
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn missing_checksum_rejected() {
        assert!(matches!(
            parse_packet(b"0001|0002|2:no trailer here"),
            Err(WireError::MissingChecksum)
        ));
    }

    #[test]
    fn ack_with_sequence_number() {
        let encoded = encode_control(MessageType::Ack, b"ACK|0003");
        match parse_packet(&encoded).unwrap() {
            Packet::Control { ty, content } => {
                assert_eq!(ty, MessageType::Ack);
                assert_eq!(content, b"ACK|0003");
            }
            other => panic!("expected control packet, got {other:?}"),
        }
    }

    #[test]
    fn overhead_covers_header_and_crc() {
        let encoded = encode_data(MessageType::Response, 9999, 9999, b"");
        assert!(encoded.len() <= DATA_OVERHEAD + 9);
        let small = encode_data(MessageType::Response, 1, 1, b"x");
        assert_eq!(small.len(), 1 + DATA_OVERHEAD + 6);
    }
}
