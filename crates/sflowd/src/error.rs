//! Error types for sflowd operations.
//!
//! Configuration operations surface [`SflowError`] to the caller. Runtime
//! failures inside tasks (UDP writes, encoder failures) are logged where they
//! happen and never cross a task boundary.

use std::io;
use thiserror::Error;

/// Result type alias for sflowd operations.
pub type SflowResult<T> = Result<T, SflowError>;

/// Errors that can occur while configuring or running the sFlow pipeline.
#[derive(Debug, Error)]
pub enum SflowError {
    /// Malformed or conflicting configuration rejected before any state change.
    #[error("{message}")]
    Validation {
        /// Operator-facing description, e.g. "Create SflowCollector failed. ...".
        message: String,
    },

    /// A collector or interface task failed to come up.
    #[error("Failed to start {entity} '{key}': {message}")]
    TaskStartup {
        /// "collector" or "interface".
        entity: &'static str,
        /// Collector IP or interface reference.
        key: String,
        /// Error message.
        message: String,
    },

    /// Hardware collaborator call failed.
    #[error("Hardware operation {operation} failed for ifIndex {if_index}: {message}")]
    Hardware {
        /// The operation that failed (e.g. "enable_sampling").
        operation: &'static str,
        /// Interface the call targeted.
        if_index: i32,
        /// Error message.
        message: String,
    },

    /// Packet capture could not be opened or read.
    #[error("Capture failed on device '{device}': {message}")]
    Capture {
        /// Kernel device name.
        device: String,
        /// Error message.
        message: String,
    },

    /// An internal task mailbox was closed.
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Argument outside the accepted range for a query.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Requested object does not exist.
    #[error("{object} '{key}' not found")]
    NotFound {
        /// Object type name.
        object: &'static str,
        /// Lookup key.
        key: String,
    },

    /// Daemon configuration file problem.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors produced by the sFlow v5 wire codec and datagram encoder.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// No GlobalConfig, so no agent address to encode with.
    #[error("encoder not initialized")]
    NotInitialized,

    /// Counter record kind has no generic interface counter mapping.
    #[error("unsupported counter kind {0}")]
    UnsupportedCounter(u32),

    /// Datagram exceeds the configured maximum size.
    #[error("datagram of {size} bytes exceeds limit of {limit} bytes")]
    DatagramTooLarge {
        /// Encoded size.
        size: usize,
        /// Configured maxDatagramSize.
        limit: usize,
    },

    /// A datagram must carry at least one sample.
    #[error("no samples to encode")]
    Empty,

    /// Captured header longer than the wire format allows.
    #[error("sampled header of {0} bytes too long")]
    HeaderTooLong(usize),
}

impl SflowError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a task startup error.
    pub fn task_startup(
        entity: &'static str,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::TaskStartup {
            entity,
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates a hardware error.
    pub fn hardware(operation: &'static str, if_index: i32, message: impl Into<String>) -> Self {
        Self::Hardware {
            operation,
            if_index,
            message: message.into(),
        }
    }

    /// Creates a capture error.
    pub fn capture(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Capture {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(object: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            object,
            key: key.into(),
        }
    }

    /// Returns true if the request was rejected without touching any state.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Returns true if the error came from bringing up a task.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            Self::TaskStartup { .. } | Self::Hardware { .. } | Self::Capture { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_is_verbatim() {
        let err = SflowError::validation("Create SflowCollector failed. Invalid UDP port value provided");
        assert!(err.is_validation());
        assert_eq!(
            err.to_string(),
            "Create SflowCollector failed. Invalid UDP port value provided"
        );
    }

    #[test]
    fn test_startup_classification() {
        assert!(SflowError::task_startup("collector", "10.0.0.1", "bind failed").is_startup_failure());
        assert!(SflowError::hardware("enable_sampling", 3, "asic busy").is_startup_failure());
        assert!(!SflowError::InvalidArgument("count".into()).is_startup_failure());
    }

    #[test]
    fn test_codec_error_display() {
        assert_eq!(
            CodecError::UnsupportedCounter(42).to_string(),
            "unsupported counter kind 42"
        );
    }
}
