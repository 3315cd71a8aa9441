//! Error types for the DNS service
//!
//! This module defines the error hierarchy shared by the listeners, the
//! forwarder, and the cache middleware.
//!
//! # Error Categories
//!
//! - **Config errors**: Invalid configuration parameters
//! - **Parse/Serialize errors**: DNS message encoding/decoding failures
//! - **Network errors**: Socket I/O and connection issues
//! - **Upstream errors**: Primary and all fallbacks failed
//! - **Lifecycle errors**: Starting a running server, stopping a stopped one
//! - **Device-ID errors**: Bad device ID in SNI or DoH path, never fatal
//!
//! # Example
//!
//! ```
//! use dnsgate::error::DnsError;
//!
//! let err = DnsError::timeout("query to 8.8.8.8:53", std::time::Duration::from_secs(5));
//! assert!(err.is_timeout());
//! assert!(err.to_string().contains("timed out"));
//! ```

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::device::DeviceIdError;

/// Error type for all DNS service operations
///
/// # Reportability
///
/// Errors are classified as reportable or routine.  Routine errors
/// (malformed client messages, bad device IDs, timeouts) are logged at
/// debug level; reportable errors are handed to the error collector for
/// operator attention.  See [`DnsError::is_reportable`].
#[derive(Debug, Error)]
pub enum DnsError {
    /// Invalid configuration
    #[error("invalid configuration: {reason}")]
    ConfigError {
        /// Description of the configuration error
        reason: String,
        /// The configuration field that is invalid, if applicable
        field: Option<String>,
    },

    /// DNS message parsing failed
    ///
    /// The received bytes are not a well-formed DNS message.  The
    /// connection survives this error; only the message is dropped.
    #[error("invalid dns message: {reason}")]
    ParseError {
        /// Description of what went wrong during parsing
        reason: String,
    },

    /// DNS message serialization failed
    #[error("failed to serialize dns message: {reason}")]
    SerializeError {
        /// Description of what went wrong during serialization
        reason: String,
    },

    /// Network I/O error
    #[error("network error: {reason}")]
    NetworkError {
        /// Description of the network failure
        reason: String,
        /// The underlying I/O error, if available
        #[source]
        source: Option<io::Error>,
    },

    /// Operation timed out
    #[error("{context} timed out after {timeout:?}")]
    TimeoutError {
        /// Description of what timed out
        context: String,
        /// The timeout duration that was exceeded
        timeout: Duration,
    },

    /// Upstream communication failed
    ///
    /// Returned by the forwarder when the primary and every fallback
    /// failed.  The pipeline translates this to SERVFAIL.
    #[error("upstream {upstream}: {reason}")]
    UpstreamError {
        /// The last upstream address that was tried
        upstream: String,
        /// Description of the upstream failure
        reason: String,
    },

    /// Bad device ID in SNI or DoH URL path
    ///
    /// Non-fatal for the query: the pipeline proceeds without a device ID.
    #[error(transparent)]
    DeviceId(#[from] DeviceIdError),

    /// The server is already running
    #[error("server {name} is already started")]
    AlreadyStarted {
        /// Server name
        name: String,
    },

    /// The server has not been started
    #[error("server {name} is not started")]
    NotStarted {
        /// Server name
        name: String,
    },

    /// A response has already been written through this writer
    #[error("response has already been written")]
    AlreadyWritten,

    /// A query handler panicked
    ///
    /// Handler panics are isolated to the query task and reported through
    /// this error; accept-loop panics are fatal and never reach here.
    #[error("handler panic while {context}")]
    HandlerPanic {
        /// What the handler was doing
        context: String,
    },

    /// Unexpected internal error
    #[error("internal error: {reason}")]
    InternalError {
        /// Description of the internal error
        reason: String,
    },
}

impl DnsError {
    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
            field: None,
        }
    }

    /// Create a configuration error with field context
    ///
    /// # Example
    ///
    /// ```
    /// use dnsgate::error::DnsError;
    ///
    /// let err = DnsError::config_field("must be positive", "upstream.timeout");
    /// assert!(err.to_string().contains("must be positive"));
    /// ```
    pub fn config_field(reason: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
            field: Some(field.into()),
        }
    }

    /// Create a parse error
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::ParseError {
            reason: reason.into(),
        }
    }

    /// Create a serialization error
    pub fn serialize(reason: impl Into<String>) -> Self {
        Self::SerializeError {
            reason: reason.into(),
        }
    }

    /// Create a network error
    pub fn network(reason: impl Into<String>) -> Self {
        Self::NetworkError {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a network error from an I/O error
    pub fn network_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::NetworkError {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create a timeout error
    pub fn timeout(context: impl Into<String>, timeout: Duration) -> Self {
        Self::TimeoutError {
            context: context.into(),
            timeout,
        }
    }

    /// Create an upstream error
    pub fn upstream(upstream: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamError {
            upstream: upstream.into(),
            reason: reason.into(),
        }
    }

    /// Create an already-started error
    pub fn already_started(name: impl Into<String>) -> Self {
        Self::AlreadyStarted { name: name.into() }
    }

    /// Create a not-started error
    pub fn not_started(name: impl Into<String>) -> Self {
        Self::NotStarted { name: name.into() }
    }

    /// Create a handler panic error
    pub fn handler_panic(context: impl Into<String>) -> Self {
        Self::HandlerPanic {
            context: context.into(),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::InternalError {
            reason: reason.into(),
        }
    }

    /// Check if this error indicates a timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutError { .. })
    }

    /// Check if this error indicates a malformed client message
    #[must_use]
    pub fn is_parse_error(&self) -> bool {
        matches!(self, Self::ParseError { .. })
    }

    /// Check if this error indicates an upstream failure
    #[must_use]
    pub fn is_upstream_error(&self) -> bool {
        matches!(self, Self::UpstreamError { .. })
    }

    /// Check if this error should be surfaced to the error collector as
    /// a reportable problem
    ///
    /// Routine errors caused by client input or transient network
    /// conditions stay at debug level.  Device-ID errors are explicitly
    /// non-reportable, matching the inspection hook the collector expects.
    #[must_use]
    pub fn is_reportable(&self) -> bool {
        match self {
            Self::ParseError { .. }
            | Self::TimeoutError { .. }
            | Self::DeviceId(_)
            | Self::AlreadyWritten => false,
            Self::ConfigError { .. }
            | Self::SerializeError { .. }
            | Self::NetworkError { .. }
            | Self::UpstreamError { .. }
            | Self::AlreadyStarted { .. }
            | Self::NotStarted { .. }
            | Self::HandlerPanic { .. }
            | Self::InternalError { .. } => true,
        }
    }

    /// Check if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NetworkError { source, .. } => source.as_ref().map_or(true, |e| {
                matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionRefused
                )
            }),
            Self::TimeoutError { .. } | Self::UpstreamError { .. } => true,
            _ => false,
        }
    }
}

impl From<io::Error> for DnsError {
    fn from(err: io::Error) -> Self {
        Self::NetworkError {
            reason: err.to_string(),
            source: Some(err),
        }
    }
}

/// Type alias for Result with [`DnsError`]
pub type DnsResult<T> = std::result::Result<T, DnsError>;
