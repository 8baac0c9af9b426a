//! Custom error types for the application.
//!
//! This module defines the primary error type, `KataraError`, for the whole crate.
//! Using the `thiserror` crate, it gives one consistent taxonomy for everything
//! that can go wrong between the protocol editor and the valve controller.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: A bad, duplicate, out-of-range or unfilled step parameter. These
//!   are local and non-fatal: they block a run or a save and carry the [`NodePath`] of
//!   the offending node so the editor can highlight it.
//! - **`Concurrency`**: A second protocol run, a pump start or an edit attempted while
//!   something else owns the device. Rejected immediately with no state change.
//! - **`ConnectionWarning`**: A transient I/O failure that the device client already
//!   recovered from (reconnect, handshake, replay of energized pins, resend).
//! - **`ConnectionFatal`**: The reconnect itself failed. The current run is aborted.
//! - **`Device`**: A command the device client refused to encode (bad pin, bad state,
//!   out-of-range pump rate).
//! - **`Persistence`**, **`Json`**, **`Io`**: Saved-protocol decoding and file access.
//! - **`Config`**: Settings that failed to load or validate.

use crate::config::ConfigError;
use crate::expression::ExpressionError;
use crate::protocol::NodePath;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, KataraError>;

/// Message surfaced when a lost connection was restored transparently.
pub const CONNECTION_RESTORED: &str = "There was a problem in the connection. \
     The connection has been reset and the valve states have been restored.";

/// Message carried by the error raised when a reconnect attempt fails.
pub const LINK_LOST: &str = "The connection to the arduino was lost. \
     Check to make sure it is still plugged in and reconnect.";

/// Message surfaced when a run is aborted by a lost connection.
pub const CONNECTION_LOST: &str =
    "The connection with the arduino was lost and the protocol was terminated.";

/// Primary error type for the crate.
#[derive(Error, Debug)]
pub enum KataraError {
    /// A step or loop parameter failed validation.
    #[error("Invalid entry at {path}: {message}")]
    Validation {
        /// Location of the offending node in the routine tree.
        path: NodePath,
        /// Human readable explanation.
        message: String,
    },

    /// An iteration expression could not be parsed or evaluated.
    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    /// The device or a protocol is busy.
    #[error("{0}")]
    Concurrency(String),

    /// No device session is open.
    #[error("Not connected to the device")]
    NotConnected,

    /// The link failed but was reset and resynchronized.
    #[error("Connection warning: {0}")]
    ConnectionWarning(String),

    /// The link failed and could not be restored.
    #[error("Connection lost: {0}")]
    ConnectionFatal(String),

    /// The device client refused a command.
    #[error("Device error: {0}")]
    Device(String),

    /// A saved protocol or panel is malformed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// File access failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings could not be loaded or failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl KataraError {
    /// Build a validation error for the node at `path`.
    pub fn invalid(path: &NodePath, message: impl Into<String>) -> Self {
        KataraError::Validation {
            path: path.clone(),
            message: message.into(),
        }
    }

    /// True for errors that were already recovered from and must not abort a run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, KataraError::ConnectionWarning(_))
    }

    /// True when the hardware link is gone for good.
    pub fn is_fatal_connection(&self) -> bool {
        matches!(self, KataraError::ConnectionFatal(_))
    }
}
