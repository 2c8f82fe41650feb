//! Error taxonomy for worker construction, messaging and transfer.
//!
//! Everything that can fail synchronously (constructor argument handling,
//! option capture, serialization, transfer-list validation) surfaces through
//! [`WorkerError`]. Errors raised inside a running worker never appear here;
//! they are delivered asynchronously through the `error` event surface.

use thiserror::Error;

/// Errors surfaced to the immediate caller of a worker operation.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// A required argument was missing or empty.
    #[error("missing required argument: {0}")]
    Argument(&'static str),

    /// The creating execution context has already been torn down.
    #[error("execution context is unavailable")]
    ContextUnavailable,

    /// A value could not be deep-cloned into a transport snapshot, or a
    /// received snapshot could not be rehydrated.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The collaborator failed to start the background thread.
    #[error("Failed to start Worker thread")]
    ThreadStart,

    /// An argument had a shape no overload recognizes.
    #[error("type error: {0}")]
    Type(String),

    /// A listed transfer target is invalid, duplicated, or already gone.
    #[error("invalid transfer: {0}")]
    Transfer(String),
}

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_start_message_is_stable() {
        // Callers match on this string; it mirrors the native collaborator's.
        assert_eq!(
            WorkerError::ThreadStart.to_string(),
            "Failed to start Worker thread"
        );
    }

    #[test]
    fn display_includes_detail() {
        let err = WorkerError::Transfer("duplicate transferable".into());
        assert!(err.to_string().contains("duplicate transferable"));
    }
}
