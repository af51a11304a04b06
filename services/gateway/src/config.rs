//! Gateway configuration.
//!
//! Everything is env-driven; the gateway has no config file.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::proxy::SessionConfig;

/// Default HTTP/WebSocket bind address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:4567";

/// Default directory for the browser client.
pub const DEFAULT_WEB_ROOT: &str = "./web";

/// Default backend connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Shorter connect timeouts are raised to this.
const MIN_CONNECT_TIMEOUT_MS: u64 = 100;

/// Gateway configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub listen_addr: SocketAddr,

    /// Directory holding the browser client (index.html and its scripts).
    pub web_root: PathBuf,

    /// Timeout for the TCP connect to the RDP server.
    pub connect_timeout: Duration,

    /// Close a relaying session after this long without data in one direction.
    pub idle_timeout: Option<Duration>,

    /// Offer TLS 1.3 to RDP servers in addition to TLS 1.2.
    pub allow_tls13: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = var("WEBRDP_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse()
            .context("WEBRDP_LISTEN_ADDR must be a socket address (example: 0.0.0.0:4567).")?;

        let web_root = var("WEBRDP_WEB_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WEB_ROOT));

        let connect_timeout_ms: u64 = var("WEBRDP_CONNECT_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("WEBRDP_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
        let connect_timeout =
            Duration::from_millis(connect_timeout_ms.max(MIN_CONNECT_TIMEOUT_MS));

        // Zero disables the idle timeout.
        let idle_timeout = var("WEBRDP_IDLE_TIMEOUT_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("WEBRDP_IDLE_TIMEOUT_MS must be an integer (milliseconds).")?
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis);

        let allow_tls13 = var("WEBRDP_ALLOW_TLS13")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let log_level = var("WEBRDP_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            web_root,
            connect_timeout,
            idle_timeout,
            allow_tls13,
            log_level,
        })
    }

    /// Per-session settings derived from this configuration.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: self.connect_timeout,
            idle_timeout: self.idle_timeout,
            allow_tls13: self.allow_tls13,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR.parse().unwrap());
        assert_eq!(config.web_root, PathBuf::from(DEFAULT_WEB_ROOT));
        assert_eq!(
            config.connect_timeout,
            Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS)
        );
        assert!(config.idle_timeout.is_none());
        assert!(!config.allow_tls13);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("WEBRDP_LISTEN_ADDR", "127.0.0.1:9000"),
            ("WEBRDP_WEB_ROOT", "/srv/webrdp"),
            ("WEBRDP_CONNECT_TIMEOUT_MS", "2500"),
            ("WEBRDP_IDLE_TIMEOUT_MS", "60000"),
            ("WEBRDP_ALLOW_TLS13", "TRUE"),
            ("WEBRDP_LOG_LEVEL", "debug"),
        ])
        .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.web_root, PathBuf::from("/srv/webrdp"));
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(60)));
        assert!(config.allow_tls13);
        assert_eq!(config.log_level, "debug");

        let session = config.session_config();
        assert_eq!(session.connect_timeout, Duration::from_millis(2500));
        assert!(session.allow_tls13);
    }

    #[test]
    fn test_connect_timeout_floor_and_zero_idle() {
        let config = load(&[
            ("WEBRDP_CONNECT_TIMEOUT_MS", "5"),
            ("WEBRDP_IDLE_TIMEOUT_MS", "0"),
        ])
        .unwrap();
        assert_eq!(config.connect_timeout, Duration::from_millis(100));
        assert!(config.idle_timeout.is_none());
    }

    #[test]
    fn test_invalid_values() {
        let err = load(&[("WEBRDP_LISTEN_ADDR", "not-an-addr")]).unwrap_err();
        assert!(err.to_string().contains("WEBRDP_LISTEN_ADDR"));

        let err = load(&[("WEBRDP_CONNECT_TIMEOUT_MS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("WEBRDP_CONNECT_TIMEOUT_MS"));
    }
}
