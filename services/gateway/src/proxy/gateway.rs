//! Session runner: one handshake followed by one relay per client transport.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::backend::{BackendConnector, DEFAULT_CONNECT_TIMEOUT};
use super::handshake::{perform_handshake, HandshakeStage};
use super::relay::{relay, RelayOutcome};
use crate::error::SessionError;

/// Bound on closing the client transport after a failed handshake.
const CLIENT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Timeout for the TCP connect to the RDP server.
    pub connect_timeout: Duration,
    /// Relay idle timeout, if any.
    pub idle_timeout: Option<Duration>,
    /// Offer TLS 1.3 to RDP servers.
    pub allow_tls13: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
            allow_tls13: false,
        }
    }
}

/// Counters across all sessions served by one [`Gateway`].
#[derive(Debug, Default)]
pub struct GatewayStats {
    /// Sessions started.
    pub sessions_accepted: AtomicU64,
    /// Sessions currently running.
    pub sessions_active: AtomicU64,
    /// Sessions finished, successfully or not.
    pub sessions_closed: AtomicU64,
    /// Handshakes that reached the relay.
    pub handshakes_completed: AtomicU64,
    /// Handshakes that aborted.
    pub handshakes_failed: AtomicU64,
    /// Bytes relayed client to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed backend to client.
    pub bytes_from_backend: AtomicU64,
}

/// Runs RDCleanPath sessions.
#[derive(Clone)]
pub struct Gateway {
    config: SessionConfig,
    connector: BackendConnector,
    stats: Arc<GatewayStats>,
}

impl Gateway {
    /// Create a gateway with the given session settings.
    pub fn new(config: SessionConfig) -> Result<Self, rustls::Error> {
        let connector = BackendConnector::new(config.connect_timeout, config.allow_tls13)?;
        Ok(Self {
            config,
            connector,
            stats: Arc::new(GatewayStats::default()),
        })
    }

    /// Get gateway statistics.
    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    /// Serve one client transport to completion.
    ///
    /// The client transport is always closed when this returns. A handshake
    /// failure closes it without sending anything.
    pub async fn serve<C>(
        &self,
        client: C,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<RelayOutcome, SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.stats.sessions_accepted.fetch_add(1, Ordering::Relaxed);
        self.stats.sessions_active.fetch_add(1, Ordering::Relaxed);

        let result = self
            .run_session(client, &cancel)
            .instrument(tracing::info_span!("session", peer = %peer))
            .await;

        self.stats.sessions_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.sessions_closed.fetch_add(1, Ordering::Relaxed);
        result
    }

    async fn run_session<C>(
        &self,
        mut client: C,
        cancel: &CancellationToken,
    ) -> Result<RelayOutcome, SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        debug!("Session started");

        // The handshake has no timeouts of its own on client or backend
        // reads, so cancellation must reach it as well as the relay.
        let mut stage = HandshakeStage::AwaitClientRequest;
        let attempt = tokio::select! {
            biased;

            _ = cancel.cancelled() => None,
            result = perform_handshake(&mut client, &self.connector, &mut stage) => Some(result),
        };
        let result = attempt.unwrap_or(Err(SessionError::Cancelled { stage }));

        let handshake = match result {
            Ok(handshake) => handshake,
            Err(e) => {
                self.stats.handshakes_failed.fetch_add(1, Ordering::Relaxed);
                if matches!(e, SessionError::ReadRequest(ref fe) if fe.is_eof()) {
                    debug!(reason = e.reason_code(), "Client left before sending a request");
                } else if matches!(e, SessionError::Cancelled { .. }) {
                    info!(stage = %e.stage(), "Session cancelled during handshake");
                } else {
                    warn!(
                        stage = %e.stage(),
                        reason = e.reason_code(),
                        error = %e,
                        "Handshake failed"
                    );
                }
                close_client(&mut client).await;
                return Err(e);
            }
        };

        self.stats
            .handshakes_completed
            .fetch_add(1, Ordering::Relaxed);
        info!(
            destination = %handshake.destination,
            backend_addr = %handshake.server_addr,
            cert_chain_len = handshake.cert_chain_len,
            "Handshake complete, relaying"
        );

        let outcome = relay(client, handshake.backend, cancel, self.config.idle_timeout).await;

        self.stats
            .bytes_to_backend
            .fetch_add(outcome.bytes_to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(outcome.bytes_from_backend, Ordering::Relaxed);

        info!(
            end = outcome.end.as_str(),
            bytes_to_backend = outcome.bytes_to_backend,
            bytes_from_backend = outcome.bytes_from_backend,
            "Session closed"
        );
        debug!(detail = %outcome.end, "Relay ended");

        Ok(outcome)
    }
}

async fn close_client<C: AsyncWrite + Unpin>(client: &mut C) {
    match tokio::time::timeout(CLIENT_CLOSE_TIMEOUT, client.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Client shutdown failed"),
        Err(_) => debug!("Client shutdown timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(config.idle_timeout.is_none());
        assert!(!config.allow_tls13);
    }

    #[tokio::test]
    async fn test_client_eof_before_request() {
        let gateway = Gateway::new(SessionConfig::default()).unwrap();
        let (client, gw_side) = tokio::io::duplex(64);
        drop(client);

        let err = gateway
            .serve(gw_side, "127.0.0.1:50000".parse().unwrap(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "client_disconnect");

        let stats = gateway.stats();
        assert_eq!(stats.sessions_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.sessions_active.load(Ordering::Relaxed), 0);
        assert_eq!(stats.sessions_closed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.handshakes_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_cancel_reaches_silent_client() {
        let gateway = Gateway::new(SessionConfig::default()).unwrap();
        let (mut client, gw_side) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let gateway = gateway.clone();
            let cancel = cancel.clone();
            async move {
                gateway
                    .serve(gw_side, "127.0.0.1:50002".parse().unwrap(), cancel)
                    .await
            }
        });

        // The client connects but never sends a request.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let err = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("serve did not observe cancellation")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, SessionError::Cancelled { .. }));
        assert_eq!(err.stage(), HandshakeStage::AwaitClientRequest);
        assert_eq!(err.reason_code(), "cancelled");

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
        assert_eq!(gateway.stats().sessions_active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_long_form_request() {
        let gateway = Gateway::new(SessionConfig::default()).unwrap();
        let mut pdu = webrdp_wire::CleanPathPdu::request("h:1", None, vec![0x03]);
        pdu.proxy_auth = Some("a".repeat(150));
        let encoded = pdu.encode().unwrap();
        // Long-form DER length: read as Fast-Path, the frame looks larger
        // than what was sent.
        assert_eq!(encoded[1], 0x81);

        let (mut client, gw_side) = tokio::io::duplex(1024);
        client.write_all(&encoded).await.unwrap();
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let gateway = gateway.clone();
            let cancel = cancel.clone();
            async move {
                gateway
                    .serve(gw_side, "127.0.0.1:50003".parse().unwrap(), cancel)
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());
        cancel.cancel();

        let err = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("serve did not observe cancellation")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.reason_code(), "cancelled");
        assert_eq!(err.stage(), HandshakeStage::AwaitClientRequest);
    }

    #[tokio::test]
    async fn test_bad_request_closes_client_without_reply() {
        let gateway = Gateway::new(SessionConfig::default()).unwrap();
        let (mut client, gw_side) = tokio::io::duplex(64);
        // TPKT header with version 7.
        client.write_all(&[0x07, 0x00, 0x00, 0x08]).await.unwrap();

        let err = gateway
            .serve(gw_side, "127.0.0.1:50001".parse().unwrap(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "invalid_request_frame");

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }
}
