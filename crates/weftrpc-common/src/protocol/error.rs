use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WeftError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Cannot convert {from_kind} value '{value}' to {target}")]
    Conversion {
        target: &'static str,
        from_kind: &'static str,
        value: String,
    },

    #[error("Range error: {0}")]
    Range(String),

    #[error("Member not found: {0}")]
    MemberNotFound(String),

    #[error("Timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logic error: {0}")]
    Logic(String),

    #[error("Remote fault {code}: {message}")]
    Remote { code: i32, message: String },
}

impl WeftError {
    /// Builds a fault as returned by a remote procedure.
    pub fn remote(code: i32, message: impl Into<String>) -> Self {
        WeftError::Remote {
            code,
            message: message.into(),
        }
    }

    /// True for failures of the underlying connection (socket, TLS, timeout).
    ///
    /// A remote fault leaves the connection usable; the client engine drops
    /// it after any other failure.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            WeftError::Transport(_) | WeftError::Tls(_) | WeftError::Io(_) | WeftError::Timeout(_)
        )
    }

    /// Maps an I/O error into the taxonomy, giving timeouts their own variant.
    pub fn from_io(err: std::io::Error, context: &str, timeout: Duration) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                WeftError::Timeout(timeout)
            }
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::NotConnected => {
                WeftError::Transport(format!("{}: connection lost", context))
            }
            _ => WeftError::Io(err),
        }
    }
}

impl From<std::net::AddrParseError> for WeftError {
    fn from(err: std::net::AddrParseError) -> Self {
        WeftError::Transport(err.to_string())
    }
}

impl From<std::str::Utf8Error> for WeftError {
    fn from(err: std::str::Utf8Error) -> Self {
        WeftError::Protocol(format!("invalid UTF-8: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(WeftError::Transport("x".into()).is_transport());
        assert!(WeftError::Timeout(Duration::from_millis(5)).is_transport());
        assert!(!WeftError::Protocol("x".into()).is_transport());
        assert!(!WeftError::remote(7, "Fault").is_transport());
        assert!(!WeftError::Logic("busy".into()).is_transport());
    }

    #[test]
    fn test_io_mapping() {
        let timeout = Duration::from_secs(1);
        let err = WeftError::from_io(
            std::io::Error::new(std::io::ErrorKind::TimedOut, "t"),
            "reading",
            timeout,
        );
        assert!(matches!(err, WeftError::Timeout(d) if d == timeout));

        let err = WeftError::from_io(
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "r"),
            "reading",
            timeout,
        );
        assert!(matches!(err, WeftError::Transport(ref m) if m.contains("reading")));
    }

    #[test]
    fn test_display() {
        let err = WeftError::remote(7, "Fault");
        assert_eq!(err.to_string(), "Remote fault 7: Fault");
        let err = WeftError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "Timeout after 250ms");
    }
}
