//! Thread context error types

use thiserror::Error;

/// Recoverable thread context errors.
///
/// Protocol violations (double attachment, detaching while detached,
/// draining a foreign block) are programming errors and panic instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThreadError {
    /// The isolate already has a mutator thread
    #[error("isolate '{isolate}' already has a mutator thread")]
    MutatorSlotOccupied {
        /// Name of the contended isolate
        isolate: String,
    },

    /// `init_once_after_object_and_stub_code` ran twice
    #[error("cached VM constants are already initialized")]
    ConstantsAlreadyInitialized,

    /// The calling native thread has no VM thread context
    #[error("current thread has no VM thread context")]
    NotInitialized,

    /// The native thread is tearing down its thread-locals
    #[error("native thread is exiting, its VM thread context slot is gone")]
    ThreadExiting,
}

/// Result type for thread context operations
pub type ThreadResult<T> = Result<T, ThreadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ThreadError::MutatorSlotOccupied {
            isolate: "main".to_string(),
        };
        assert_eq!(err.to_string(), "isolate 'main' already has a mutator thread");
        assert_eq!(
            ThreadError::NotInitialized.to_string(),
            "current thread has no VM thread context"
        );
    }
}
