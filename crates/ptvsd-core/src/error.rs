//! Errors reported by a host runtime when installing tracing hooks.

use thiserror::Error;

/// Errors that can occur while talking to the host runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    /// The runtime refused to install a hook
    #[error("Runtime rejected {operation}: {reason}")]
    Rejected { operation: String, reason: String },
}

/// Result type for runtime hook operations.
pub type TraceResult<T> = Result<T, TraceError>;
