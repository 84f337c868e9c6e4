//! Application-level error type.
//!
//! `GatewayError` covers everything that can stop the gateway from starting or
//! serving: configuration problems, socket I/O, and an inconsistent device
//! set. Errors that belong to a single command or a single client line have
//! their own types next to the code that produces them and never reach this
//! level:
//!
//! - [`TransportError`](crate::transport::TransportError) for device I/O
//! - [`CommandError`](crate::queue::CommandError) for the result of one command
//! - [`SessionError`](crate::session::SessionError) for user-visible protocol errors
//! - [`FramingError`](crate::server::FramingError) for malformed input lines

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, GatewayError>;

/// Errors raised while starting or running the gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Socket or file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Two devices share an id.
    #[error("Duplicate device id: '{0}'")]
    DuplicateDevice(String),

    /// These devices did not stop cleanly.
    #[error("Shutdown failed for devices: {}", .0.join(", "))]
    ShutdownFailed(Vec<String>),
}
