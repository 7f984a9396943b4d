//! Error types for searchdispatch

use std::fmt;

/// Result type alias for searchdispatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for searchdispatch
#[derive(Debug)]
pub enum Error {
    /// Could not talk to the node at all (refused, reset, unreachable)
    Connectivity(String),
    /// No response within the time budget
    Timeout(String),
    /// Response arrived but could not be decoded
    Protocol(String),
    /// Distribution key not present in the dispatch configuration
    UnknownNode(u32),
    /// Request could not be routed
    Routing(String),
    /// Payload could not be encoded or compressed
    Encode(String),
    /// Connection was closed by a pool release
    TransportClosed,
    /// Configuration errors
    Config(String),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Internal error
    Internal(String),
}

/// Classification of an error as seen by the node health model.
///
/// Only `Connectivity` ever counts against a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connectivity,
    Protocol,
    Routing,
    Encode,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Routing => "routing",
            ErrorKind::Encode => "encode",
        }
    }
}

impl Error {
    /// Map this error onto the four-way dispatch taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connectivity(_) | Error::Timeout(_) | Error::TransportClosed | Error::Io(_) => {
                ErrorKind::Connectivity
            }
            Error::Protocol(_) | Error::Serialization(_) => ErrorKind::Protocol,
            Error::UnknownNode(_) | Error::Routing(_) | Error::Config(_) | Error::Internal(_) => {
                ErrorKind::Routing
            }
            Error::Encode(_) => ErrorKind::Encode,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connectivity(msg) => write!(f, "Connectivity error: {}", msg),
            Error::Timeout(msg) => write!(f, "Timed out: {}", msg),
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Error::UnknownNode(key) => {
                write!(f, "Unknown node: distribution key {} is not configured", key)
            }
            Error::Routing(msg) => write!(f, "Routing error: {}", msg),
            Error::Encode(msg) => write!(f, "Encode error: {}", msg),
            Error::TransportClosed => write!(f, "Transport closed"),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<prost::EncodeError> for Error {
    fn from(e: prost::EncodeError) -> Self {
        Error::Encode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_and_resets_are_connectivity() {
        assert_eq!(Error::Timeout("ping".into()).kind(), ErrorKind::Connectivity);
        assert_eq!(Error::TransportClosed.kind(), ErrorKind::Connectivity);
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(Error::from(reset).kind(), ErrorKind::Connectivity);
    }

    #[test]
    fn test_classification_of_non_connectivity_errors() {
        assert_eq!(Error::Protocol("bad frame".into()).kind(), ErrorKind::Protocol);
        assert_eq!(Error::UnknownNode(7).kind(), ErrorKind::Routing);
        assert_eq!(Error::Encode("lz4".into()).kind(), ErrorKind::Encode);
        assert!(Error::UnknownNode(7).to_string().contains("7"));
    }
}
