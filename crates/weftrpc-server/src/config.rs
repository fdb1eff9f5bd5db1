//! Server configuration.
//!
//! Timeouts and size limits shared by the HTTP server and the raw RPC server.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use weftrpc_common::http::DEFAULT_MAX_HEADER_SIZE;

/// Connection timeouts and limits.
///
/// # Fields
///
/// - `read_timeout` - Maximum wait for request bytes (default: 20 seconds)
/// - `write_timeout` - Maximum wait for the peer to accept reply bytes (default: 20 seconds)
/// - `keep_alive_timeout` - Maximum idle time between requests (default: 30 seconds)
/// - `max_header_size` - Largest accepted HTTP header (default: 64 KiB)
/// - `max_body_size` - Largest accepted request body (default: 16 MiB)
/// - `server_name` - Value of the `Server` reply header (default: "weftrpc")
///
/// # Example
///
/// ```
/// use weftrpc_server::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::new()
///     .with_keep_alive_timeout(Duration::from_secs(5))
///     .with_max_body_size(1024 * 1024);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub keep_alive_timeout: Duration,
    pub max_header_size: usize,
    pub max_body_size: usize,
    pub server_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(20),
            write_timeout: Duration::from_secs(20),
            keep_alive_timeout: Duration::from_secs(30),
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_body_size: 16 * 1024 * 1024,
            server_name: "weftrpc".to_string(),
        }
    }
}

impl ServerConfig {
    /// Creates a new ServerConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    pub fn with_max_header_size(mut self, size: usize) -> Self {
        self.max_header_size = size;
        self
    }

    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Validates the server configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Any timeout is zero
    /// - The header size limit is below 256 bytes
    /// - The body size limit is zero
    /// - The server name is empty or contains line breaks
    pub fn validate(&self) -> Result<(), String> {
        for (name, timeout) in [
            ("read timeout", self.read_timeout),
            ("write timeout", self.write_timeout),
            ("keep-alive timeout", self.keep_alive_timeout),
        ] {
            if timeout.is_zero() {
                return Err(format!("{} must be greater than zero", name));
            }
        }

        if self.max_header_size < 256 {
            return Err(format!(
                "max header size must be >= 256 bytes (got {})",
                self.max_header_size
            ));
        }

        if self.max_body_size == 0 {
            return Err("max body size must be greater than zero".to_string());
        }

        if self.server_name.is_empty() || self.server_name.contains(['\r', '\n']) {
            return Err(format!("invalid server name {:?}", self.server_name));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.read_timeout.as_secs(), 20);
        assert_eq!(config.write_timeout.as_secs(), 20);
        assert_eq!(config.keep_alive_timeout.as_secs(), 30);
        assert_eq!(config.max_header_size, 64 * 1024);
        assert_eq!(config.max_body_size, 16 * 1024 * 1024);
        assert_eq!(config.server_name, "weftrpc");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_setters() {
        let config = ServerConfig::new()
            .with_read_timeout(Duration::from_millis(100))
            .with_write_timeout(Duration::from_millis(200))
            .with_max_header_size(1024)
            .with_server_name("test");
        assert_eq!(config.read_timeout, Duration::from_millis(100));
        assert_eq!(config.write_timeout, Duration::from_millis(200));
        assert_eq!(config.max_header_size, 1024);
        assert_eq!(config.server_name, "test");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ServerConfig::new()
            .with_read_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(ServerConfig::new().with_max_header_size(10).validate().is_err());
        assert!(ServerConfig::new().with_max_body_size(0).validate().is_err());
        assert!(ServerConfig::new()
            .with_server_name("bad\r\nname")
            .validate()
            .is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"server_name":"custom","max_body_size":10}"#).unwrap();
        assert_eq!(config.server_name, "custom");
        assert_eq!(config.max_body_size, 10);
        assert_eq!(config.keep_alive_timeout.as_secs(), 30);
    }
}
