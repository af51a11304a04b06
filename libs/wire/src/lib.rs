//! # webrdp-wire
//!
//! Wire formats spoken by the webrdp gateway.
//!
//! - [`frame`]: delimits Fast-Path and TPKT/X.224 frames on an RDP byte
//!   stream without reading past the frame.
//! - [`cleanpath`]: the RDCleanPath handshake PDU exchanged with the browser
//!   client, encoded as DER from an explicit schema table.
//! - [`der`]: the DER primitives the codec is built on.

pub mod cleanpath;
pub mod der;
mod error;
pub mod frame;

pub use cleanpath::{CleanPathError, CleanPathPdu, FieldKind, FieldSpec, VERSION_1};
pub use error::{FrameError, PduError};
pub use frame::{detect_frame, read_frame, Frame, FrameInfo, FrameVariant};
