//! Session error types.

use std::io;
use std::time::Duration;

use thiserror::Error;
use webrdp_wire::{FrameError, PduError};

use crate::proxy::HandshakeStage;

/// A failure that aborts one session. Each variant belongs to exactly one
/// handshake stage.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Could not read the RDCleanPath request frame from the client.
    #[error("read client request: {0}")]
    ReadRequest(#[source] FrameError),

    /// The request frame is not a valid RDCleanPath PDU.
    #[error("decode client request: {0}")]
    DecodeRequest(#[source] PduError),

    /// The request lacks a field the gateway needs.
    #[error("client request missing field `{0}`")]
    MissingField(&'static str),

    /// TCP connect to the RDP server failed.
    #[error("dial {destination}: {source}")]
    Dial {
        destination: String,
        #[source]
        source: io::Error,
    },

    /// TCP connect to the RDP server did not finish in time.
    #[error("dial {destination}: timed out after {timeout:?}")]
    DialTimeout {
        destination: String,
        timeout: Duration,
    },

    /// Destination host cannot be used as a TLS server name.
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),

    /// Could not write the preconnection blob and X.224 request.
    #[error("forward connection request: {0}")]
    ForwardPdu(#[source] io::Error),

    /// Could not read the server's X.224 connection confirm.
    #[error("read connection confirm: {0}")]
    ReadConfirm(#[source] FrameError),

    /// TLS handshake with the RDP server failed.
    #[error("tls handshake: {0}")]
    TlsHandshake(#[source] io::Error),

    /// The server presented no certificate.
    #[error("no peer certificates found")]
    NoPeerCertificates,

    /// Could not encode the response PDU.
    #[error("encode response: {0}")]
    EncodeResponse(#[source] PduError),

    /// Could not write the response to the client.
    #[error("write response: {0}")]
    WriteResponse(#[source] io::Error),

    /// The session was cancelled before the handshake finished.
    #[error("cancelled during {stage}")]
    Cancelled { stage: HandshakeStage },
}

impl SessionError {
    /// Stage in which the error occurred.
    pub fn stage(&self) -> HandshakeStage {
        match self {
            SessionError::ReadRequest(_)
            | SessionError::DecodeRequest(_)
            | SessionError::MissingField(_) => HandshakeStage::AwaitClientRequest,
            SessionError::Dial { .. } | SessionError::DialTimeout { .. } => {
                HandshakeStage::DialBackend
            }
            SessionError::ForwardPdu(_) => HandshakeStage::ForwardConnectionPdu,
            SessionError::ReadConfirm(_) => HandshakeStage::AwaitBackendReply,
            SessionError::InvalidServerName(_) | SessionError::TlsHandshake(_) => {
                HandshakeStage::TlsUpgrade
            }
            SessionError::NoPeerCertificates => HandshakeStage::CollectCertChain,
            SessionError::EncodeResponse(_) | SessionError::WriteResponse(_) => {
                HandshakeStage::SendClientResponse
            }
            SessionError::Cancelled { stage } => *stage,
        }
    }

    /// Stable reason code for logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SessionError::ReadRequest(e) if e.is_eof() => "client_disconnect",
            SessionError::ReadRequest(_) => "invalid_request_frame",
            SessionError::DecodeRequest(_) => "invalid_request_pdu",
            SessionError::MissingField(_) => "incomplete_request",
            SessionError::Dial { .. } => "backend_unreachable",
            SessionError::DialTimeout { .. } => "connect_timeout",
            SessionError::InvalidServerName(_) => "invalid_server_name",
            SessionError::ForwardPdu(_) => "backend_write_failed",
            SessionError::ReadConfirm(_) => "invalid_connection_confirm",
            SessionError::TlsHandshake(_) => "tls_handshake_failed",
            SessionError::NoPeerCertificates => "no_peer_certificates",
            SessionError::EncodeResponse(_) => "encode_failed",
            SessionError::WriteResponse(_) => "client_write_failed",
            SessionError::Cancelled { .. } => "cancelled",
        }
    }
}
