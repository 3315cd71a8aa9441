//! Error collector interface
//!
//! Components never decide on their own where operational errors go; they
//! hand them to a collector together with a short source tag.  Collection
//! must not block the calling task.
//!
//! Whether an error deserves operator attention is decided by the error
//! itself through [`DnsError::is_reportable`]; routine errors (malformed
//! client input, timeouts, bad device IDs) stay at debug level.

use tracing::{debug, error};

use crate::error::DnsError;

/// Sink for operational errors
pub trait ErrorCollector: Send + Sync {
    /// Collect an error from the given source
    ///
    /// Must be non-blocking.
    fn collect(&self, source: &str, err: &DnsError);
}

/// Collector that routes errors into the tracing output
///
/// Reportable errors are logged at error level, routine ones at debug.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCollector;

impl LogCollector {
    /// Create a new logging collector
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ErrorCollector for LogCollector {
    fn collect(&self, source: &str, err: &DnsError) {
        if err.is_reportable() {
            error!(source, error = %err, "collected error");
        } else {
            debug!(source, error = %err, "collected error");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// Collector that records everything it sees, for assertions in tests
    #[derive(Debug, Default, Clone)]
    pub(crate) struct RecordingCollector {
        collected: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl RecordingCollector {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn collected(&self) -> Vec<(String, String)> {
            self.collected.lock().clone()
        }
    }

    impl ErrorCollector for RecordingCollector {
        fn collect(&self, source: &str, err: &DnsError) {
            self.collected
                .lock()
                .push((source.to_string(), err.to_string()));
        }
    }
}
