use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WireError};
use crate::protocol::DEFAULT_SERVER_VERSION;
use crate::tls::TlsConfig;

/// Listener configuration. All fields have defaults so a zero-config
/// listener works out of the box; timeouts and the slow-connect
/// threshold are in milliseconds with 0 meaning disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerOpts {
    /// Version string advertised in the greeting.
    pub server_version: String,

    /// When set, `CLIENT_SSL` is advertised and clients may upgrade.
    pub tls: Option<TlsConfig>,

    /// Allow clear-text auth plugins on non-TLS connections.
    pub allow_clear_text_without_tls: bool,

    /// Warn (and count) when establishing a connection takes longer
    /// than this many milliseconds.
    pub slow_connect_warn_threshold_ms: u64,

    /// Per-connection read deadline.
    pub conn_read_timeout_ms: u64,

    /// Per-connection write deadline.
    pub conn_write_timeout_ms: u64,
}

impl Default for ListenerOpts {
    fn default() -> Self {
        Self {
            server_version: DEFAULT_SERVER_VERSION.to_string(),
            tls: None,
            allow_clear_text_without_tls: false,
            slow_connect_warn_threshold_ms: 0,
            conn_read_timeout_ms: 0,
            conn_write_timeout_ms: 0,
        }
    }
}

impl ListenerOpts {
    /// Load options from a JSON file.
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| WireError::Config(format!("cannot read {}: {}", path, e)))?;
        serde_json::from_str(&content)
            .map_err(|e| WireError::Config(format!("cannot parse {}: {}", path, e)))
    }

    pub(crate) fn read_timeout(&self) -> Option<Duration> {
        (self.conn_read_timeout_ms > 0).then(|| Duration::from_millis(self.conn_read_timeout_ms))
    }

    pub(crate) fn write_timeout(&self) -> Option<Duration> {
        (self.conn_write_timeout_ms > 0).then(|| Duration::from_millis(self.conn_write_timeout_ms))
    }

    pub(crate) fn slow_connect_warn_threshold(&self) -> Option<Duration> {
        (self.slow_connect_warn_threshold_ms > 0)
            .then(|| Duration::from_millis(self.slow_connect_warn_threshold_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = ListenerOpts::default();
        assert_eq!(opts.server_version, DEFAULT_SERVER_VERSION);
        assert!(opts.tls.is_none());
        assert!(!opts.allow_clear_text_without_tls);
        assert!(opts.read_timeout().is_none());
        assert!(opts.slow_connect_warn_threshold().is_none());
    }

    #[test]
    fn test_parse_partial_json() {
        let opts: ListenerOpts =
            serde_json::from_str(r#"{"server_version": "8.0.0-test", "conn_read_timeout_ms": 250}"#)
                .unwrap();
        assert_eq!(opts.server_version, "8.0.0-test");
        assert_eq!(opts.read_timeout(), Some(Duration::from_millis(250)));
        assert!(opts.write_timeout().is_none());
    }
}
