//! Error types shared across the proxy

use std::io;

/// Error type for proxy construction and per-connection operations
#[derive(Debug)]
pub enum ProxyError {
    /// Malformed or missing configuration
    Config(String),
    /// Target address does not parse as host:port
    InvalidTarget(String),
    /// The readiness notifier could not be created or driven
    Poller(io::Error),
    /// Connecting to a backend failed
    Dial { addr: String, source: io::Error },
    /// Connecting to a backend did not complete within the dial timeout
    DialTimeout { addr: String },
    /// No backend of the application is currently active
    NoActiveBackend,
    /// Other I/O failure while setting up a connection
    Io(io::Error),
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::Config(msg) => write!(f, "config error: {}", msg),
            ProxyError::InvalidTarget(addr) => {
                write!(f, "invalid target address: {}", addr)
            }
            ProxyError::Poller(e) => write!(f, "readiness notifier error: {}", e),
            ProxyError::Dial { addr, source } => {
                write!(f, "dial {} failed: {}", addr, source)
            }
            ProxyError::DialTimeout { addr } => write!(f, "dial {} timed out", addr),
            ProxyError::NoActiveBackend => write!(f, "no active backends"),
            ProxyError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Poller(e) | ProxyError::Io(e) => Some(e),
            ProxyError::Dial { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for ProxyError {
    fn from(err: io::Error) -> Self {
        ProxyError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            ProxyError::Config("duplicate port 9000".to_string()).to_string(),
            "config error: duplicate port 9000"
        );
        assert_eq!(
            ProxyError::InvalidTarget("nohost".to_string()).to_string(),
            "invalid target address: nohost"
        );
        assert_eq!(ProxyError::NoActiveBackend.to_string(), "no active backends");
        assert_eq!(
            ProxyError::DialTimeout {
                addr: "10.0.0.1:80".to_string()
            }
            .to_string(),
            "dial 10.0.0.1:80 timed out"
        );
    }

    #[test]
    fn test_dial_error_keeps_source() {
        let err = ProxyError::Dial {
            addr: "127.0.0.1:1".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("refused"));
    }
}
