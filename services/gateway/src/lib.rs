//! # webrdp-gateway
//!
//! Lets a browser RDP client reach an RDP server through a WebSocket.
//!
//! The browser sends one RDCleanPath request naming the server and carrying
//! its X.224 connection request. The gateway dials the server, forwards the
//! request, performs the TLS upgrade on the browser's behalf, returns the
//! server's certificate chain and confirm PDU, then relays bytes until either
//! side leaves.

pub mod config;
pub mod error;
pub mod proxy;
pub mod server;

pub use config::Config;
pub use error::SessionError;
pub use proxy::{
    Gateway, GatewayStats, HandshakeStage, RelayEnd, RelayOutcome, SessionConfig, WebSocketStream,
};
