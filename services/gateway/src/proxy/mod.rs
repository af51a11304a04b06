//! RDCleanPath session handling.
//!
//! This module provides:
//! - The handshake state machine that negotiates the RDP connection on the
//!   client's behalf
//! - Backend dialing and the in-place TLS upgrade
//! - The byte relay that runs once the handshake is done
//! - A byte-stream adapter over browser WebSockets
//!
//! ## Architecture
//!
//! ```text
//! Browser --WebSocket--> WebSocketStream -> Gateway::serve
//!                                              |
//!                              perform_handshake (TCP, X.224, TLS)
//!                                              |
//!                                   relay <-> RDP server
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let gateway = Gateway::new(SessionConfig::default())?;
//! let outcome = gateway.serve(client, peer_addr, cancel).await?;
//! ```

mod backend;
mod gateway;
mod handshake;
mod relay;
mod websocket;

pub use backend::{tls_client_config, BackendConnector, BackendStream, DEFAULT_CONNECT_TIMEOUT};
pub use gateway::{Gateway, GatewayStats, SessionConfig};
pub use handshake::{perform_handshake, Handshake, HandshakeStage};
pub use relay::{relay, Direction, RelayEnd, RelayOutcome, RELAY_BUFFER_SIZE};
pub use websocket::WebSocketStream;
