//! Error types for registry and driver operations.
//!
//! The transition protocol itself has no recoverable errors: every
//! operation either completes or blocks, and programmer misuse is a fatal
//! assertion rather than an error value. The variants here cover the
//! environment-driven failures around the protocol (attachment lifecycle).

use std::fmt;

/// Errors that can occur while managing thread attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// A thread with this id is already attached.
    AlreadyAttached(u64),
    /// No attached thread has this id.
    UnknownThread(u64),
    /// The thread cannot be detached in its current state.
    DetachWhileParked(u64),
}

impl fmt::Display for CoordinationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinationError::AlreadyAttached(id) => {
                write!(f, "thread {} is already attached", id)
            }
            CoordinationError::UnknownThread(id) => write!(f, "no attached thread with id {}", id),
            CoordinationError::DetachWhileParked(id) => {
                write!(f, "thread {} cannot detach while parked at a safepoint", id)
            }
        }
    }
}

impl std::error::Error for CoordinationError {}

/// Result type for registry operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;
