//! Client configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// TLS settings for a client connection.
#[derive(Clone)]
pub struct ClientTls {
    pub config: Arc<rustls::ClientConfig>,
    /// Name the server certificate must be valid for.
    pub server_name: String,
}

impl fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTls")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Client timeouts, method prefix and TLS.
///
/// # Fields
///
/// - `timeout` - Maximum duration of one call once connected (default: 30 seconds)
/// - `connect_timeout` - Maximum duration of connecting, TLS handshake included
///   (default: 10 seconds)
/// - `prefix` - Prepended to every method name (default: empty)
/// - `tls` - TLS client settings; set through [`with_tls`](Self::with_tls), never serialized
///
/// # Example
///
/// ```
/// use weftrpc_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::new()
///     .with_timeout(Duration::from_secs(2))
///     .with_prefix("math.");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub prefix: String,
    #[serde(skip)]
    pub tls: Option<ClientTls>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            prefix: String::new(),
            tls: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Speaks TLS, verifying the server certificate against `server_name`.
    pub fn with_tls(mut self, config: Arc<rustls::ClientConfig>, server_name: impl Into<String>) -> Self {
        self.tls = Some(ClientTls {
            config,
            server_name: server_name.into(),
        });
        self
    }

    /// Validates the client configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if either timeout is zero or the TLS server name is
    /// empty.
    pub fn validate(&self) -> Result<(), String> {
        if self.timeout.is_zero() {
            return Err("timeout must be greater than zero".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("connect timeout must be greater than zero".to_string());
        }
        if let Some(tls) = &self.tls {
            if tls.server_name.is_empty() {
                return Err("TLS server name must not be empty".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_client_config() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout.as_secs(), 30);
        assert_eq!(config.connect_timeout.as_secs(), 10);
        assert!(config.prefix.is_empty());
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_builder_pattern_chaining() {
        let config = ClientConfig::new()
            .with_timeout(Duration::from_millis(500))
            .with_connect_timeout(Duration::from_millis(100))
            .with_prefix("calc.");
        assert_eq!(config.timeout, Duration::from_millis(500));
        assert_eq!(config.connect_timeout, Duration::from_millis(100));
        assert_eq!(config.prefix, "calc.");
    }

    #[test]
    fn test_validate_zero_timeout_fails() {
        let config = ClientConfig::new().with_timeout(Duration::ZERO);
        assert!(config.validate().unwrap_err().contains("timeout"));
        let config = ClientConfig::new().with_connect_timeout(Duration::ZERO);
        assert!(config.validate().unwrap_err().contains("connect timeout"));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"prefix": "svc.", "timeout": {"secs": 3, "nanos": 0}}"#)
                .unwrap();
        assert_eq!(config.prefix, "svc.");
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }
}
