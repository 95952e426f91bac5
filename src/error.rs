//! Custom error types for the gateway.
//!
//! This module defines the primary error type, `GatewayError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures that can occur between the sensor transports and
//! the TCP consumers.
//!
//! ## Error Classes
//!
//! Every variant belongs to exactly one [`ErrorClass`], which decides how far the
//! error is allowed to travel:
//!
//! - **`TransientIo`**: bus, serial, I²C or socket failures. Caught at the boundary
//!   of the owning component (a signal source or the CAN sink); the connection is
//!   torn down and re-established after the reconnect delay.
//! - **`MalformedFrame`**: invalid JSON, truncated records, bad checksums. The frame
//!   is dropped and the pipeline continues.
//! - **`SubscriberSend`**: a consumer that cannot keep up or has gone away. The
//!   subscriber is removed from the broadcast set; producers never notice.
//! - **`FatalConfig`**: configuration errors and listeners that cannot be bound.
//!   These are the only errors that stop the process.
//!
//! By using `#[from]`, `GatewayError` can be created from underlying error types,
//! simplifying error handling with the `?` operator.

use std::net::SocketAddr;
use thiserror::Error;

/// Convenience alias for results using the gateway error type.
pub type AppResult<T> = std::result::Result<T, GatewayError>;

/// How far an error is allowed to propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Recovered by tearing down and reconnecting the owning transport.
    TransientIo,
    /// The offending frame is dropped.
    MalformedFrame,
    /// The subscriber is dropped.
    SubscriberSend,
    /// Terminates the process.
    FatalConfig,
}

/// Errors produced anywhere in the gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport not connected")]
    NotConnected,

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Invalid JSON record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Subscriber {0} dropped")]
    SubscriberGone(u64),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Task failed to complete: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<GatewayError>),
}

impl GatewayError {
    /// Classify the error according to its propagation rule.
    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::Config(_)
            | GatewayError::Configuration(_)
            | GatewayError::Bind { .. }
            | GatewayError::FeatureNotEnabled(_)
            | GatewayError::ShutdownFailed(_) => ErrorClass::FatalConfig,
            GatewayError::MalformedFrame(_) | GatewayError::Json(_) => ErrorClass::MalformedFrame,
            GatewayError::SubscriberGone(_) => ErrorClass::SubscriberSend,
            GatewayError::Io(_)
            | GatewayError::Transport(_)
            | GatewayError::NotConnected
            | GatewayError::ConnectionClosed
            | GatewayError::Join(_) => ErrorClass::TransientIo,
        }
    }

    /// True when the error must terminate the process.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::FatalConfig
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        GatewayError::MalformedFrame(msg.into())
    }

    pub(crate) fn transport(msg: impl std::fmt::Display) -> Self {
        GatewayError::Transport(msg.to_string())
    }
}

impl From<figment::Error> for GatewayError {
    fn from(value: figment::Error) -> Self {
        GatewayError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_failure_is_fatal() {
        let err = GatewayError::Bind {
            addr: SocketAddr::from(([127, 0, 0, 1], 7000)),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("127.0.0.1:7000"));
    }

    #[test]
    fn io_failures_are_transient() {
        let err: GatewayError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert_eq!(err.class(), ErrorClass::TransientIo);
        assert!(!err.is_fatal());
    }

    #[test]
    fn json_errors_are_malformed_frames() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json");
        let err: GatewayError = match parse {
            Err(e) => e.into(),
            Ok(v) => panic!("unexpected parse success: {v}"),
        };
        assert_eq!(err.class(), ErrorClass::MalformedFrame);
    }

    #[test]
    fn shutdown_failure_lists_inner_errors() {
        let err = GatewayError::ShutdownFailed(vec![
            GatewayError::ConnectionClosed,
            GatewayError::SubscriberGone(3),
        ]);
        assert!(err.is_fatal());
        match err {
            GatewayError::ShutdownFailed(inner) => assert_eq!(inner.len(), 2),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
