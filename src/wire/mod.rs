//! On-wire codecs.
//!
//! Three layers, innermost first: the session packet format (ASCII header,
//! opaque payload bytes, CRC-32 trailer), the AX.25 UI frame that envelopes
//! it on the air, and the KISS framing that carries AX.25 between host and
//! TNC.

pub mod ax25;
pub mod kiss;
pub mod packet;

pub use ax25::{build_ui_frame, parse_ui_frame, UiFrame};
pub use kiss::{kiss_unwrap, kiss_wrap, FEND, FESC, TFEND, TFESC};
pub use packet::{encode_control, encode_data, parse_packet, Packet};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("missing KISS delimiters")]
    BadKissFraming,

    #[error("malformed packet header")]
    BadHeader,

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("missing checksum")]
    MissingChecksum,

    #[error("checksum mismatch: calculated {calculated}, received {received}")]
    ChecksumMismatch {
        calculated: String,
        received: String,
    },
}
