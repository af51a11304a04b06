//! RDCleanPath handshake.
//!
//! The stages run strictly in order and any failure aborts the session:
//!
//! ```text
//! AwaitClientRequest -> DialBackend -> ForwardConnectionPdu -> AwaitBackendReply
//!     -> TlsUpgrade -> CollectCertChain -> SendClientResponse -> Relay
//! ```
//!
//! The client cannot resume a half-finished handshake, so there are no
//! retries. A client that sees its transport close before a response arrives
//! treats the handshake as failed.

use std::fmt;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use webrdp_wire::{read_frame, CleanPathPdu, VERSION_1};

use super::backend::{peer_cert_chain, BackendConnector, BackendStream};
use crate::error::SessionError;

/// Position in the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    AwaitClientRequest,
    DialBackend,
    ForwardConnectionPdu,
    AwaitBackendReply,
    TlsUpgrade,
    CollectCertChain,
    SendClientResponse,
    Relay,
}

impl HandshakeStage {
    /// Name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            HandshakeStage::AwaitClientRequest => "await_client_request",
            HandshakeStage::DialBackend => "dial_backend",
            HandshakeStage::ForwardConnectionPdu => "forward_connection_pdu",
            HandshakeStage::AwaitBackendReply => "await_backend_reply",
            HandshakeStage::TlsUpgrade => "tls_upgrade",
            HandshakeStage::CollectCertChain => "collect_cert_chain",
            HandshakeStage::SendClientResponse => "send_client_response",
            HandshakeStage::Relay => "relay",
        }
    }
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fields of a client request the gateway acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ClientRequest {
    destination: String,
    preconnection_blob: String,
    x224_connection_pdu: Vec<u8>,
}

impl TryFrom<CleanPathPdu> for ClientRequest {
    type Error = SessionError;

    fn try_from(pdu: CleanPathPdu) -> Result<Self, Self::Error> {
        if pdu.version != VERSION_1 {
            debug!(version = pdu.version, "Client sent unexpected RDCleanPath version");
        }
        if pdu.proxy_auth.is_some() || pdu.server_auth.is_some() {
            debug!("Ignoring auth tokens in client request");
        }

        Ok(Self {
            destination: pdu
                .destination
                .ok_or(SessionError::MissingField("destination"))?,
            preconnection_blob: pdu.preconnection_blob.unwrap_or_default(),
            x224_connection_pdu: pdu
                .x224_connection_pdu
                .ok_or(SessionError::MissingField("x224_connection_pdu"))?,
        })
    }
}

/// A completed handshake, ready to relay.
pub struct Handshake {
    /// TLS stream to the RDP server.
    pub backend: BackendStream,
    /// Destination as requested by the client.
    pub destination: String,
    /// Resolved address of the RDP server.
    pub server_addr: SocketAddr,
    /// Number of certificates forwarded to the client.
    pub cert_chain_len: usize,
}

/// Run the handshake over `client`, returning the upgraded backend stream.
///
/// `progress` always holds the stage being worked on, so a caller that drops
/// this future early can tell where it stopped.
pub async fn perform_handshake<C>(
    client: &mut C,
    connector: &BackendConnector,
    progress: &mut HandshakeStage,
) -> Result<Handshake, SessionError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    enter(progress, HandshakeStage::AwaitClientRequest);
    let frame = read_frame(client)
        .await
        .map_err(SessionError::ReadRequest)?;
    let pdu = CleanPathPdu::decode(frame.as_bytes()).map_err(SessionError::DecodeRequest)?;
    let request = ClientRequest::try_from(pdu)?;

    enter(progress, HandshakeStage::DialBackend);
    let mut tcp = connector.dial(&request.destination).await?;
    let server_addr = tcp.peer_addr().map_err(|source| SessionError::Dial {
        destination: request.destination.clone(),
        source,
    })?;
    debug!(destination = %request.destination, backend_addr = %server_addr, "Connected to backend");

    enter(progress, HandshakeStage::ForwardConnectionPdu);
    // The server expects the blob and the X.224 request back to back.
    let mut initial = Vec::with_capacity(
        request.preconnection_blob.len() + request.x224_connection_pdu.len(),
    );
    initial.extend_from_slice(request.preconnection_blob.as_bytes());
    initial.extend_from_slice(&request.x224_connection_pdu);
    tcp.write_all(&initial)
        .await
        .map_err(SessionError::ForwardPdu)?;
    tcp.flush().await.map_err(SessionError::ForwardPdu)?;

    enter(progress, HandshakeStage::AwaitBackendReply);
    let confirm = read_frame(&mut tcp)
        .await
        .map_err(SessionError::ReadConfirm)?;
    debug!(
        variant = %confirm.variant(),
        length = confirm.length(),
        "Connection confirm received"
    );

    enter(progress, HandshakeStage::TlsUpgrade);
    let backend = connector.upgrade(tcp, &request.destination).await?;

    enter(progress, HandshakeStage::CollectCertChain);
    let cert_chain = peer_cert_chain(&backend)?;
    let cert_chain_len = cert_chain.len();

    enter(progress, HandshakeStage::SendClientResponse);
    let response =
        CleanPathPdu::response(server_addr.to_string(), confirm.into_bytes(), cert_chain);
    let encoded = response.encode().map_err(SessionError::EncodeResponse)?;
    client
        .write_all(&encoded)
        .await
        .map_err(SessionError::WriteResponse)?;
    client.flush().await.map_err(SessionError::WriteResponse)?;

    enter(progress, HandshakeStage::Relay);
    Ok(Handshake {
        backend,
        destination: request.destination,
        server_addr,
        cert_chain_len,
    })
}

fn enter(progress: &mut HandshakeStage, stage: HandshakeStage) {
    *progress = stage;
    debug!(stage = %stage, "Handshake stage");
}
