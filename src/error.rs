//! # Error Handling
//!
//! Error taxonomy for the capture transport core.
//!
//! ## Architecture
//!
//! - **Error Types**: one enum, [`DctError`], whose variants follow the failure
//!   classes of the transport layer (I/O, network, protocol, state, ...)
//! - **Error Context**: every variant carries an [`ErrorContext`] with the
//!   operation, free-form context and a retry hint
//! - **Retryable**: lets the upload session decide whether a failed write is
//!   worth a reconnect without matching on variants
//!
//! Northbound calls (`start_encoding`, `configure_rtp_stream`, ...) report
//! failure as `false` and log the error. `DctError` travels between the layers
//! underneath them.
//!
//! ## Usage
//!
//! ```rust
//! use dct_capture::error::{DctError, Retryable};
//!
//! let error = DctError::protocol("SETUP", "response has no session token")
//!     .with_context("rtsp://10.0.0.12:8554/cetonmpeg0")
//!     .retryable();
//!
//! assert!(error.is_retryable());
//! ```

use std::{error::Error as StdError, fmt};

/// Where an error happened and whether trying again can help
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// The operation being performed when the error occurred
    pub operation: Option<String>,
    /// Additional context about the error
    pub context: Option<String>,
    pub retryable: bool,
}

/// Base error type for the capture transport core
#[derive(Debug)]
pub enum DctError {
    /// Configuration validation errors
    Config {
        field: String,
        value: String,
        reason: String,
        context: ErrorContext,
    },
    /// I/O errors on sockets, files and streams
    Io {
        operation: String,
        source: std::io::Error,
        context: ErrorContext,
    },
    /// A remote endpoint could not be reached or dropped the connection
    Network {
        endpoint: String,
        reason: String,
        context: ErrorContext,
    },
    /// A peer answered with something the protocol does not allow
    Protocol {
        command: String,
        reason: String,
        context: ErrorContext,
    },
    /// An operation was attempted in the wrong lifecycle state
    State {
        current_state: String,
        attempted_operation: String,
        reason: String,
        context: ErrorContext,
    },
    /// Waiting for a peer or a thread took too long
    Timeout {
        operation: String,
        duration_ms: u64,
        context: ErrorContext,
    },
    /// A caller passed something the operation cannot use
    Validation {
        field: String,
        constraint: String,
        value: String,
        context: ErrorContext,
    },
}

impl DctError {
    pub fn config(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Config {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
            context: ErrorContext::default(),
        }
    }

    pub fn network(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Network {
            endpoint: endpoint.into(),
            reason: reason.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn protocol(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            command: command.into(),
            reason: reason.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn state(
        current_state: impl Into<String>,
        attempted_operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::State {
            current_state: current_state.into(),
            attempted_operation: attempted_operation.into(),
            reason: reason.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
            context: ErrorContext::default(),
        }
    }

    pub fn validation(
        field: impl Into<String>,
        constraint: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::Validation {
            field: field.into(),
            constraint: constraint.into(),
            value: value.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context_mut().context = Some(context.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.context_mut().operation = Some(operation.into());
        self
    }

    /// Marks an error that would otherwise be final as worth another attempt.
    pub fn retryable(mut self) -> Self {
        self.context_mut().retryable = true;
        self
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::Config { context, .. }
            | Self::Io { context, .. }
            | Self::Network { context, .. }
            | Self::Protocol { context, .. }
            | Self::State { context, .. }
            | Self::Timeout { context, .. }
            | Self::Validation { context, .. } => context,
        }
    }

    fn context_mut(&mut self) -> &mut ErrorContext {
        match self {
            Self::Config { context, .. }
            | Self::Io { context, .. }
            | Self::Network { context, .. }
            | Self::Protocol { context, .. }
            | Self::State { context, .. }
            | Self::Timeout { context, .. }
            | Self::Validation { context, .. } => context,
        }
    }

    /// Get the error category as a string
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Io { .. } => "io",
            Self::Network { .. } => "network",
            Self::Protocol { .. } => "protocol",
            Self::State { .. } => "state",
            Self::Timeout { .. } => "timeout",
            Self::Validation { .. } => "validation",
        }
    }
}

impl fmt::Display for DctError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DctError::Config {
                field,
                value,
                reason,
                ..
            } => write!(
                f,
                "Configuration error in '{}': {} (value: {})",
                field, reason, value
            ),
            DctError::Io {
                operation, source, ..
            } => write!(f, "I/O error during '{}': {}", operation, source),
            DctError::Network {
                endpoint, reason, ..
            } => write!(f, "Network error with '{}': {}", endpoint, reason),
            DctError::Protocol {
                command, reason, ..
            } => write!(f, "Protocol error on '{}': {}", command, reason),
            DctError::State {
                current_state,
                attempted_operation,
                reason,
                ..
            } => write!(
                f,
                "Cannot '{}' while {}: {}",
                attempted_operation, current_state, reason
            ),
            DctError::Timeout {
                operation,
                duration_ms,
                ..
            } => write!(f, "'{}' timed out after {}ms", operation, duration_ms),
            DctError::Validation {
                field,
                constraint,
                value,
                ..
            } => write!(
                f,
                "Validation failed for '{}': {} (value: {})",
                field, constraint, value
            ),
        }?;

        if let Some(context) = &self.context().context {
            write!(f, " [{}]", context)?;
        }
        Ok(())
    }
}

impl StdError for DctError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            DctError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type alias using our custom error type
pub type DctResult<T> = Result<T, DctError>;

/// Whether an operation that failed with this error may succeed if repeated.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for DctError {
    /// Connection-level failures are retryable. Protocol refusals, bad
    /// configuration and state errors are not unless explicitly marked.
    fn is_retryable(&self) -> bool {
        self.context().retryable
            || matches!(
                self,
                Self::Timeout { .. } | Self::Network { .. } | Self::Io { .. }
            )
    }
}

impl From<std::io::Error> for DctError {
    fn from(error: std::io::Error) -> Self {
        Self::io("unknown", error)
    }
}

impl From<serde_json::Error> for DctError {
    fn from(error: serde_json::Error) -> Self {
        Self::config("json", "", error.to_string())
    }
}

impl From<DctError> for std::io::Error {
    fn from(error: DctError) -> Self {
        match error {
            DctError::Io { source, .. } => source,
            DctError::Timeout { .. } => std::io::Error::new(std::io::ErrorKind::TimedOut, error),
            other => std::io::Error::other(other),
        }
    }
}
