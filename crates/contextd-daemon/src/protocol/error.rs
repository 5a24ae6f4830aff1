//! Error types for the line protocol layer.
//!
//! Both planes speak newline-delimited text, so the failure modes are the
//! same: oversized lines, unparseable commands, and ordinary connection
//! churn. The predicates let the connection loops decide whether to answer
//! with an `error:` line or to tear the connection down.

use std::io;

use thiserror::Error;

/// Maximum accepted line length in bytes.
///
/// A peer that streams more than this without a newline is not speaking
/// the protocol; the connection is closed rather than buffering without
/// bound.
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Protocol errors for both the provider and the subscriber plane.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A line exceeded [`MAX_LINE_LENGTH`] before its newline arrived.
    #[error("line too long: exceeds {max} bytes")]
    LineTooLong {
        /// Maximum allowed line length.
        max: usize,
    },

    /// The line does not parse as a command of this plane.
    #[error("{reason}")]
    InvalidCommand {
        /// Description reported back on the offending connection.
        reason: String,
    },

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Create a line too long error.
    #[must_use]
    pub const fn line_too_long() -> Self {
        Self::LineTooLong {
            max: MAX_LINE_LENGTH,
        }
    }

    /// Create an invalid command error.
    #[must_use]
    pub fn invalid_command(reason: impl Into<String>) -> Self {
        Self::InvalidCommand {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the connection can continue after this error.
    ///
    /// Command-level mistakes are answered with an `error:` line on the
    /// offending connection's own channel; everything else ends it.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidCommand { .. })
    }

    /// Returns `true` if the peer spoke the protocol wrong, as opposed to
    /// ordinary connection churn.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::InvalidCommand { .. } | Self::LineTooLong { .. })
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
