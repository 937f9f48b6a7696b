//! AX.25 UI frame envelope.
//!
//! Every on-air buffer rides in an unnumbered-information frame:
//!
//! ```text
//! [dest addr: 7][src addr: 7][control 0x03][PID 0xF0][payload...]
//! ```
//!
//! Address fields are six callsign characters (space padded) each shifted
//! left one bit, then one SSID byte `(ssid & 0x0F) << 1`, with bit 0 set on
//! the final address of the chain (the source, here).

use super::WireError;
use crate::types::{Callsign, MAX_CALL_LEN};

pub const CONTROL_UI: u8 = 0x03;
pub const PID_NO_LAYER3: u8 = 0xF0;

/// Address field length: 6 shifted call bytes + 1 SSID byte.
pub const ADDR_LEN: usize = 7;

/// Offset of the payload within a UI frame (two addresses + control + PID).
pub const PAYLOAD_OFFSET: usize = 2 * ADDR_LEN + 2;

/// A decoded UI frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiFrame {
    pub dest: Callsign,
    pub source: Callsign,
    pub payload: Vec<u8>,
}

/// Encode one address field.
pub fn encode_address(cs: &Callsign, last: bool) -> [u8; ADDR_LEN] {
    let mut out = [b' ' << 1; ADDR_LEN];
    for (i, b) in cs.call.bytes().take(MAX_CALL_LEN).enumerate() {
        out[i] = (b << 1) & 0xFE;
    }
    let mut ssid = (cs.ssid & 0x0F) << 1;
    if last {
        ssid |= 0x01;
    }
    out[6] = ssid;
    out
}

/// Decode an address field back into a callsign.
pub fn decode_address(field: &[u8]) -> Result<Callsign, WireError> {
    if field.len() < ADDR_LEN {
        return Err(WireError::TooShort(field.len()));
    }
    let call: String = field[..6]
        .iter()
        .map(|&b| (b >> 1) as char)
        .collect::<String>()
        .trim_end()
        .to_string();
    let ssid = (field[6] >> 1) & 0x0F;
    Callsign::new(&call, ssid).map_err(|_| WireError::BadHeader)
}

/// Build a UI frame carrying `payload` from `source` to `dest`.
pub fn build_ui_frame(source: &Callsign, dest: &Callsign, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(PAYLOAD_OFFSET + payload.len());
    frame.extend_from_slice(&encode_address(dest, false));
    frame.extend_from_slice(&encode_address(source, true));
    frame.push(CONTROL_UI);
    frame.push(PID_NO_LAYER3);
    frame.extend_from_slice(payload);
    frame
}

/// Parse a UI frame, returning addresses and the payload past the PID byte.
///
/// Leading NUL bytes in the payload are dropped; some TNCs emit them as
/// keyup padding.
pub fn parse_ui_frame(frame: &[u8]) -> Result<UiFrame, WireError> {
    if frame.len() < PAYLOAD_OFFSET {
        return Err(WireError::TooShort(frame.len()));
    }
    let dest = decode_address(&frame[..ADDR_LEN])?;
    let source = decode_address(&frame[ADDR_LEN..2 * ADDR_LEN])?;
    let mut payload = &frame[PAYLOAD_OFFSET..];
    while let [0x00, rest @ ..] = payload {
        payload = rest;
    }
    Ok(UiFrame {
        dest,
        source,
        payload: payload.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cs(s: &str) -> Callsign {
        s.parse().unwrap()
    }

    #[test]
    fn address_roundtrip() {
        for call in ["A", "N0CALL", "W1AW", "K5XYZ", "9A1A"] {
            for ssid in [0u8, 1, 7, 15] {
                for last in [false, true] {
                    let c = Callsign::new(call, ssid).unwrap();
                    let field = encode_address(&c, last);
                    let back = decode_address(&field).unwrap();
                    assert_eq!(back, c, "call={call} ssid={ssid} last={last}");
                    assert_eq!(field[6] & 0x01, u8::from(last));
                }
            }
        }
    }

    #[test]
    fn ui_frame_layout() {
        let frame = build_ui_frame(&cs("SRC-1"), &cs("DEST-2"), b"hello");
        assert_eq!(frame[14], CONTROL_UI);
        assert_eq!(frame[15], PID_NO_LAYER3);
        // Source address carries the last-address bit.
        assert_eq!(frame[13] & 0x01, 1);
        assert_eq!(frame[6] & 0x01, 0);
        assert_eq!(&frame[16..], b"hello");
    }

    #[test]
    fn ui_frame_roundtrip() {
        let frame = build_ui_frame(&cs("N0CALL-7"), &cs("TEST-1"), b"0001|0001|1:GET_NOTES 1|2");
        let parsed = parse_ui_frame(&frame).unwrap();
        assert_eq!(parsed.source, cs("N0CALL-7"));
        assert_eq!(parsed.dest, cs("TEST-1"));
        assert_eq!(parsed.payload, b"0001|0001|1:GET_NOTES 1|2");
    }

    #[test]
    fn leading_nulls_stripped() {
        let mut frame = build_ui_frame(&cs("SRC"), &cs("DST"), b"");
        frame.extend_from_slice(&[0x00, 0x00]);
        frame.extend_from_slice(b"11:DONE");
        let parsed = parse_ui_frame(&frame).unwrap();
        assert_eq!(parsed.payload, b"11:DONE");
    }

    #[test]
    fn short_frame_rejected() {
        assert!(parse_ui_frame(&[0u8; 10]).is_err());
    }
}
