//! Error types for frame detection and PDU encoding/decoding.

use std::io;

use thiserror::Error;

/// Errors produced while delimiting an RDP transport frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The header prefix is too short to determine the frame size.
    #[error("insufficient data in buffer to determine frame size")]
    InsufficientData,

    /// The stream ended cleanly before the first byte of a frame.
    #[error("stream closed before a frame started")]
    StreamClosed,

    /// The stream ended in the middle of a frame.
    #[error("unexpected end of stream: frame incomplete")]
    UnexpectedEof,

    /// The low two bits of the first byte are neither Fast-Path nor TPKT.
    #[error("invalid action code {action} in header byte {header:#04x}")]
    UnknownAction { action: u8, header: u8 },

    /// TPKT header carries a version other than 3.
    #[error("invalid TPKT header version: expected 0x03, got {0:#04x}")]
    InvalidTpktVersion(u8),

    /// Declared length is smaller than the header that carries it.
    #[error("invalid frame length {length}: smaller than header size {minimum}")]
    InvalidLength { length: usize, minimum: usize },

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[source] io::Error),
}

impl FrameError {
    /// Returns true if the stream ended, cleanly or mid-frame.
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::StreamClosed | FrameError::UnexpectedEof)
    }

    /// Returns true if the header bytes themselves are invalid.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            FrameError::UnknownAction { .. }
                | FrameError::InvalidTpktVersion(_)
                | FrameError::InvalidLength { .. }
        )
    }
}

/// Errors produced by the DER layer and the RDCleanPath codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PduError {
    /// Input ended before a complete TLV could be read.
    #[error("truncated DER input: needed {needed} more bytes")]
    Truncated { needed: usize },

    /// A TLV carried a different tag than the schema requires.
    #[error("unexpected DER tag {actual:#04x}, expected {expected}")]
    UnexpectedTag { expected: &'static str, actual: u8 },

    /// Indefinite-length encoding is not valid DER.
    #[error("indefinite length encoding is not allowed")]
    IndefiniteLength,

    /// Length field is wider than this implementation accepts.
    #[error("DER length field of {0} bytes is too large")]
    LengthOverflow(usize),

    /// INTEGER content is empty or negative.
    #[error("invalid INTEGER encoding")]
    InvalidInteger,

    /// INTEGER does not fit the field it decodes into.
    #[error("INTEGER out of range for field `{field}`")]
    IntegerOutOfRange { field: &'static str },

    /// A text field is not valid UTF-8.
    #[error("field `{field}` is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    /// A context tag has no entry in the schema.
    #[error("unknown field tag [{0}]")]
    UnknownField(u8),

    /// Fields must appear in ascending tag order, each at most once.
    #[error("field tag [{tag}] out of order after [{previous}]")]
    FieldOutOfOrder { tag: u8, previous: u8 },

    /// A non-optional field is absent.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// Bytes remain after the outer structure.
    #[error("trailing data after PDU: {0} bytes")]
    TrailingData(usize),
}
