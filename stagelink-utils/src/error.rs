//! Error types for stagelink
//!
//! Provides a unified error type used across the stagelink crates.

use std::path::PathBuf;

/// Main error type for stagelink operations
#[derive(Debug, thiserror::Error)]
pub enum StagelinkError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to remove file {path}: {source}")]
    FileRemove {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Connection Errors ===

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Host unreachable at {address} after {attempts} attempts")]
    HostUnreachable { address: String, attempts: u32 },

    #[error("Host rejected handshake: {0}")]
    HandshakeRejected(String),

    // === Protocol Errors ===

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    // === Lifecycle ===

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StagelinkError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a malformed-message error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedMessage(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the client must stop when this happens during startup
    ///
    /// Mid-session the same errors are logged and skipped; only the initial
    /// handshake treats an unreachable or rejecting host as fatal.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Self::HostUnreachable { .. }
                | Self::HandshakeRejected(_)
                | Self::Connection(_)
                | Self::ConnectionClosed
                | Self::Config(_)
                | Self::ConfigInvalid { .. }
                | Self::ConfigNotFound(_)
        )
    }
}

/// Result type alias using StagelinkError
pub type Result<T> = std::result::Result<T, StagelinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Display Tests ====================

    #[test]
    fn test_error_display_host_unreachable() {
        let err = StagelinkError::HostUnreachable {
            address: "tcp://127.0.0.1:5555".into(),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "Host unreachable at tcp://127.0.0.1:5555 after 3 attempts"
        );
    }

    #[test]
    fn test_error_display_file_write() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "permission denied");
        let err = StagelinkError::FileWrite {
            path: PathBuf::from("/out/world.usda"),
            source: io_err,
        };
        let msg = err.to_string();
        assert!(msg.contains("Failed to write file"));
        assert!(msg.contains("/out/world.usda"));
    }

    #[test]
    fn test_error_display_file_remove() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = StagelinkError::FileRemove {
            path: PathBuf::from("/out/a.usda"),
            source: io_err,
        };
        assert!(err.to_string().contains("Failed to remove file /out/a.usda"));
    }

    #[test]
    fn test_error_display_handshake() {
        let err = StagelinkError::HandshakeRejected("fail".into());
        assert_eq!(err.to_string(), "Host rejected handshake: fail");
    }

    #[test]
    fn test_error_display_malformed() {
        let err = StagelinkError::malformed("layer: expected 3 argument frames, got 2");
        assert_eq!(
            err.to_string(),
            "Malformed message: layer: expected 3 argument frames, got 2"
        );
    }

    #[test]
    fn test_error_display_config_invalid() {
        let err = StagelinkError::ConfigInvalid {
            path: PathBuf::from("/home/user/.config/stagelink/config.toml"),
            message: "expected integer".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Invalid configuration"));
        assert!(msg.contains("config.toml"));
        assert!(msg.contains("expected integer"));
    }

    #[test]
    fn test_error_display_connection_closed() {
        assert_eq!(
            StagelinkError::ConnectionClosed.to_string(),
            "Connection closed unexpectedly"
        );
    }

    #[test]
    fn test_error_display_cancelled() {
        assert_eq!(StagelinkError::Cancelled.to_string(), "Operation cancelled");
    }

    // ==================== Classification Tests ====================

    #[test]
    fn test_fatal_at_startup() {
        assert!(StagelinkError::HostUnreachable {
            address: "x".into(),
            attempts: 3
        }
        .is_fatal_at_startup());
        assert!(StagelinkError::HandshakeRejected("no".into()).is_fatal_at_startup());
        assert!(StagelinkError::ConnectionClosed.is_fatal_at_startup());
        assert!(!StagelinkError::malformed("bad").is_fatal_at_startup());
        assert!(!StagelinkError::Cancelled.is_fatal_at_startup());
    }

    // ==================== From Trait Tests ====================

    #[test]
    fn test_from_io_error_preserves_kind() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StagelinkError = io_err.into();
        match err {
            StagelinkError::Io(inner) => {
                assert_eq!(inner.kind(), std::io::ErrorKind::PermissionDenied)
            }
            other => panic!("Expected Io variant, got {:?}", other),
        }
    }
}
