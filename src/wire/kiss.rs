//! KISS framing between host and TNC.
//!
//! Frames are delimited by `FEND`; a `FEND` inside the payload becomes
//! `FESC TFEND` and a `FESC` becomes `FESC TFESC`. The first byte after the
//! opening delimiter is the KISS command, 0x00 for data on port 0.

use super::WireError;

pub const FEND: u8 = 0xC0;
pub const FESC: u8 = 0xDB;
pub const TFEND: u8 = 0xDC;
pub const TFESC: u8 = 0xDD;

/// KISS data-frame command for TNC port 0.
pub const CMD_DATA: u8 = 0x00;

/// Wrap an AX.25 frame for transmission to the TNC.
pub fn kiss_wrap(ax25: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ax25.len() + 3);
    out.push(FEND);
    out.push(CMD_DATA);
    for &b in ax25 {
        match b {
            FEND => out.extend_from_slice(&[FESC, TFEND]),
            FESC => out.extend_from_slice(&[FESC, TFESC]),
            _ => out.push(b),
        }
    }
    out.push(FEND);
    out
}

/// Unwrap one complete KISS frame (delimiters included) back to AX.25 bytes.
///
/// The KISS command byte is stripped along with the framing.
pub fn kiss_unwrap(frame: &[u8]) -> Result<Vec<u8>, WireError> {
    if frame.len() < 3 || frame[0] != FEND || frame[frame.len() - 1] != FEND {
        return Err(WireError::BadKissFraming);
    }
    let body = &frame[1..frame.len() - 1];
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        match body[i] {
            FESC if i + 1 < body.len() => {
                match body[i + 1] {
                    TFEND => out.push(FEND),
                    TFESC => out.push(FESC),
                    other => out.push(other),
                }
                i += 2;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    // Drop the command byte.
    if out.is_empty() {
        return Err(WireError::BadKissFraming);
    }
    out.remove(0);
    Ok(out)
}

/// Incremental FEND-delimited frame scanner for a raw byte stream.
///
/// Bytes arrive in arbitrary chunks from a socket or serial port; frames may
/// split across reads or arrive several to a read. `push` appends input,
/// `next_frame` yields one complete frame (with delimiters) at a time.
#[derive(Debug, Default)]
pub struct FrameScanner {
    buf: Vec<u8>,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let start = self.buf.iter().position(|&b| b == FEND)?;
            // Collapse adjacent delimiters (idle FENDs between frames).
            let mut body_start = start + 1;
            while body_start < self.buf.len() && self.buf[body_start] == FEND {
                body_start += 1;
            }
            if body_start >= self.buf.len() {
                self.buf.drain(..start.max(body_start.saturating_sub(1)));
                return None;
            }
            let end_rel = self.buf[body_start..].iter().position(|&b| b == FEND)?;
            let end = body_start + end_rel;
            let mut frame = Vec::with_capacity(end - body_start + 2);
            frame.push(FEND);
            frame.extend_from_slice(&self.buf[body_start..=end]);
            self.buf.drain(..end);
            if frame.len() >= 3 {
                return Some(frame);
            }
            // Degenerate frame, keep scanning.
        }
    }
}
