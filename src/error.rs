//! Error types for priority-gate
//!
//! Defines the gate's error taxonomy using thiserror for clear error propagation.
//! Both variants are recoverable: neither leaves the gate's internal state
//! inconsistent.

use thiserror::Error;

/// Result type for gate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by gate queries
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The caller's priority is not the current highest registered priority.
    ///
    /// Expected in normal operation; callers typically retry later, yield,
    /// or abandon the attempt. `current` is `None` when no task is registered
    /// at all (in which case every priority is "too low").
    #[error("priority too low: attempted {attempted}, current highest {current:?}")]
    PriorityTooLow {
        /// Priority the caller asked to proceed with
        attempted: i32,
        /// Highest registered priority at the time of the query
        current: Option<i32>,
    },

    /// A blocking wait was abandoned via its cancellation token.
    ///
    /// Cleanup is the caller's responsibility, including unregistering its
    /// priority if it is giving up on the task.
    #[error("wait cancelled")]
    Cancelled,
}
