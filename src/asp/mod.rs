//! ASP — the framed SSM↔AM SPI protocol.
//!
//! Wire format:
//!
//! ```text
//! ┌──────┬─────┬────┬──────────────┬──────────┐
//! │ 0xA5 │ LEN │ ID │ payload[LEN] │ CHECKSUM │
//! └──────┴─────┴────┴──────────────┴──────────┘
//! ```
//!
//! `LEN ≤ 210`. `CHECKSUM` is the two's complement of
//! `LEN + ID + Σ payload`. Framing errors (bad length, unknown ID, bad
//! checksum) return the receiver to start-of-frame hunting and are
//! answered with a zero-payload NACK; there is no automatic retry at
//! this layer.
//!
//! The SSM receives byte-by-byte from the SPI ISR queue
//! ([`frame::FrameDecoder`]); the AM receives whole DMA buffers
//! ([`frame::decode_buffer`]). Both directions share the payload codecs
//! in [`messages`].

pub mod frame;
pub mod messages;

pub use frame::{decode_buffer, encode_frame, frame_checksum, DecoderEvent, FrameDecoder, TxSlot};
pub use messages::{AttnList, AttnSource, Command, ConfigPayload, Message, MsgId, StatusPayload};

use core::fmt;

/// Start-of-frame marker.
pub const START_BYTE: u8 = 0xA5;
/// Largest admissible payload length.
pub const MAX_PAYLOAD: usize = 210;
/// Start byte + length byte + ID byte.
pub const HEADER_BYTES: usize = 3;
/// Frame overhead: header plus trailing checksum.
pub const OVERHEAD_BYTES: usize = HEADER_BYTES + 1;
/// Largest whole frame.
pub const MAX_FRAME: usize = MAX_PAYLOAD + OVERHEAD_BYTES;

/// Which endpoint is receiving. The allowed-ID table differs per
/// direction; only the two fixed endpoints exist on this link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// AM → SSM traffic (commands, config, time, acks of attention).
    ToSsm,
    /// SSM → AM traffic (everything, including responses).
    ToAm,
}

/// Protocol-level failure codes surfaced to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspError {
    /// Malformed frame (missing start byte, truncated, payload length
    /// not matching the message ID).
    Erroneous,
    /// Length byte exceeded [`MAX_PAYLOAD`].
    InvalidLen,
    /// ID not allowed for this receive direction.
    InvalidMsgId,
    /// Computed checksum did not match the trailing byte.
    InvalidChecksum,
    /// The counter-party answered with a NACK.
    Nacked,
    /// No (or incomplete) response within the transaction deadline.
    Timeout,
}

impl fmt::Display for AspError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Erroneous => write!(f, "malformed frame"),
            Self::InvalidLen => write!(f, "invalid length"),
            Self::InvalidMsgId => write!(f, "invalid message id"),
            Self::InvalidChecksum => write!(f, "checksum mismatch"),
            Self::Nacked => write!(f, "nacked"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

impl std::error::Error for AspError {}
