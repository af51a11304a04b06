//! RDP transport frame detection.
//!
//! An RDP byte stream interleaves two frame formats, told apart by the low
//! two bits of the first byte:
//!
//! - `00`: Fast-Path ([MS-RDPBCGR] 2.2.9.1.2). One length byte, or two when
//!   the high bit of the first length byte is set. The length counts the
//!   payload only.
//! - `11`: TPKT ([MS-RDPBCGR] 2.2.1.1) carrying X.224. Four byte header:
//!   version (always 3), reserved, big-endian total length including the
//!   header.
//!
//! The reader first reads one byte and then issues only the reads needed to
//! finish the frame. It never buffers past the frame, because the same stream
//! is handed to a TLS handshake right after the X.224 exchange.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::error::FrameError;

/// Bytes needed to determine the frame variant.
pub const MIN_HEADER_SIZE: usize = 1;

/// Fast-Path header size with a 7-bit length.
pub const FAST_PATH_MIN_SIZE: usize = 2;

/// Fast-Path header size with a 15-bit length.
pub const FAST_PATH_LARGE_SIZE: usize = 3;

/// TPKT header size.
pub const TPKT_HEADER_SIZE: usize = 4;

/// The only TPKT version in use.
pub const TPKT_VERSION: u8 = 0x03;

const ACTION_MASK: u8 = 0b11;
const ACTION_FAST_PATH: u8 = 0b00;
const ACTION_X224: u8 = 0b11;

/// Continuation flag on the first Fast-Path length byte.
const FAST_PATH_LENGTH_LARGE: u8 = 0x80;

/// Frame format selected by the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameVariant {
    /// Fast-Path PDU; declared length is the payload length.
    FastPath,
    /// TPKT/X.224 PDU; declared length includes the 4-byte header.
    LengthPrefixed,
}

impl FrameVariant {
    /// Short name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameVariant::FastPath => "fast_path",
            FrameVariant::LengthPrefixed => "x224",
        }
    }
}

impl fmt::Display for FrameVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size information decoded from a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Frame format.
    pub variant: FrameVariant,
    /// Length as declared on the wire.
    pub length: usize,
    /// Number of header bytes.
    pub header_len: usize,
}

impl FrameInfo {
    /// Bytes following the header.
    pub fn payload_len(&self) -> usize {
        match self.variant {
            FrameVariant::FastPath => self.length,
            FrameVariant::LengthPrefixed => self.length - self.header_len,
        }
    }

    /// Header plus payload.
    pub fn total_len(&self) -> usize {
        self.header_len + self.payload_len()
    }
}

/// Inspect a header prefix and determine the size of the frame it starts.
///
/// Returns [`FrameError::InsufficientData`] when `buf` does not yet hold the
/// whole header.
pub fn detect_frame(buf: &[u8]) -> Result<FrameInfo, FrameError> {
    let Some(&header) = buf.first() else {
        return Err(FrameError::InsufficientData);
    };

    match header & ACTION_MASK {
        ACTION_FAST_PATH => {
            let Some(&a) = buf.get(1) else {
                return Err(FrameError::InsufficientData);
            };

            if a & FAST_PATH_LENGTH_LARGE != 0 {
                let Some(&b) = buf.get(2) else {
                    return Err(FrameError::InsufficientData);
                };
                Ok(FrameInfo {
                    variant: FrameVariant::FastPath,
                    length: (usize::from(a & !FAST_PATH_LENGTH_LARGE) << 8) | usize::from(b),
                    header_len: FAST_PATH_LARGE_SIZE,
                })
            } else {
                // Zero is accepted: an empty Fast-Path PDU is unusual but legal.
                Ok(FrameInfo {
                    variant: FrameVariant::FastPath,
                    length: usize::from(a),
                    header_len: FAST_PATH_MIN_SIZE,
                })
            }
        }
        ACTION_X224 => {
            if buf.len() < TPKT_HEADER_SIZE {
                return Err(FrameError::InsufficientData);
            }
            if header != TPKT_VERSION {
                return Err(FrameError::InvalidTpktVersion(header));
            }

            let length = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
            if length < TPKT_HEADER_SIZE {
                return Err(FrameError::InvalidLength {
                    length,
                    minimum: TPKT_HEADER_SIZE,
                });
            }

            Ok(FrameInfo {
                variant: FrameVariant::LengthPrefixed,
                length,
                header_len: TPKT_HEADER_SIZE,
            })
        }
        action => Err(FrameError::UnknownAction { action, header }),
    }
}

/// One complete frame, header included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    info: FrameInfo,
    bytes: Vec<u8>,
}

impl Frame {
    /// Frame format.
    pub fn variant(&self) -> FrameVariant {
        self.info.variant
    }

    /// Length as declared in the header.
    pub fn length(&self) -> usize {
        self.info.length
    }

    /// Decoded header information.
    pub fn info(&self) -> FrameInfo {
        self.info
    }

    /// Header and payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Payload without the header.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.info.header_len..]
    }

    /// Consume the frame, returning header and payload.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Read exactly one frame from `reader`.
///
/// End of stream before the first byte is [`FrameError::StreamClosed`]; end of
/// stream anywhere later is [`FrameError::UnexpectedEof`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; TPKT_HEADER_SIZE];

    if let Err(e) = reader.read_exact(&mut header[..MIN_HEADER_SIZE]).await {
        return Err(match e.kind() {
            io::ErrorKind::UnexpectedEof => FrameError::StreamClosed,
            _ => FrameError::Io(e),
        });
    }

    let header_len = match header[0] & ACTION_MASK {
        ACTION_FAST_PATH => {
            read_exact_in_frame(reader, &mut header[MIN_HEADER_SIZE..FAST_PATH_MIN_SIZE]).await?;
            if header[1] & FAST_PATH_LENGTH_LARGE != 0 {
                read_exact_in_frame(reader, &mut header[FAST_PATH_MIN_SIZE..FAST_PATH_LARGE_SIZE])
                    .await?;
                FAST_PATH_LARGE_SIZE
            } else {
                FAST_PATH_MIN_SIZE
            }
        }
        ACTION_X224 => {
            read_exact_in_frame(reader, &mut header[MIN_HEADER_SIZE..TPKT_HEADER_SIZE]).await?;
            TPKT_HEADER_SIZE
        }
        action => {
            return Err(FrameError::UnknownAction {
                action,
                header: header[0],
            })
        }
    };

    let info = detect_frame(&header[..header_len])?;

    let mut bytes = vec![0u8; info.total_len()];
    bytes[..header_len].copy_from_slice(&header[..header_len]);
    read_exact_in_frame(reader, &mut bytes[header_len..]).await?;

    trace!(
        variant = %info.variant,
        length = info.length,
        total = bytes.len(),
        "Frame read"
    );

    Ok(Frame { info, bytes })
}

async fn read_exact_in_frame<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FrameError::UnexpectedEof),
        Err(e) => Err(FrameError::Io(e)),
    }
}
