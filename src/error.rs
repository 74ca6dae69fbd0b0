//! ctlgroup Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for ctlgroup operations
pub type Result<T> = std::result::Result<T, Error>;

/// ctlgroup error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Group communication errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// `start` failed before the node reached the Active state
    #[error("Failed to start cluster client: {0}")]
    ClientConstructor(#[source] Box<Error>),

    // Administrative errors
    #[error("Detach failed: {0}")]
    Detach(String),

    #[error("Refresh failed: {0}")]
    Refresh(String),

    // External control process errors
    #[error("Control process error: {0}")]
    ControlProcess(String),

    // Encoding errors
    #[error("Message encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Frame serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error categories reported to observers through `ClusterEvent::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Config,
    Transport,
    ClientConstructor,
    Detach,
    Refresh,
    ControlProcess,
    Protocol,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Config => write!(f, "CONFIG"),
            ErrorKind::Transport => write!(f, "TRANSPORT"),
            ErrorKind::ClientConstructor => write!(f, "CLIENT_CONSTRUCTOR"),
            ErrorKind::Detach => write!(f, "DETACH"),
            ErrorKind::Refresh => write!(f, "REFRESH"),
            ErrorKind::ControlProcess => write!(f, "CONTROL_PROCESS"),
            ErrorKind::Protocol => write!(f, "PROTOCOL"),
        }
    }
}

impl Error {
    /// Map this error onto the observer taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => ErrorKind::Config,
            Error::Transport(_) | Error::Io(_) => ErrorKind::Transport,
            Error::ClientConstructor(_) => ErrorKind::ClientConstructor,
            Error::Detach(_) => ErrorKind::Detach,
            Error::Refresh(_) => ErrorKind::Refresh,
            Error::ControlProcess(_) => ErrorKind::ControlProcess,
            Error::Codec(_) | Error::Serialization(_) => ErrorKind::Protocol,
        }
    }

    /// Innermost cause of a wrapped start failure
    pub fn root(&self) -> &Error {
        match self {
            Error::ClientConstructor(inner) => inner.root(),
            other => other,
        }
    }

    /// Check if the caller may retry the operation that produced this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Io(_) | Error::Refresh(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_unwraps_start_failure() {
        let err = Error::ClientConstructor(Box::new(Error::Config("bad group".into())));
        assert_eq!(err.kind(), ErrorKind::ClientConstructor);
        assert!(matches!(err.root(), Error::Config(_)));
        assert_eq!(err.root().kind(), ErrorKind::Config);
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Transport("send failed".into()).is_retryable());
        assert!(!Error::Detach("unknown node 7".into()).is_retryable());
    }
}
