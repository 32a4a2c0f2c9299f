//! Error types for the execution bridge.

use buddy_core::types::{ConfirmationOutcome, JobId, JobKind, RequestId, UserId};

/// Errors raised by an import engine call.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The overwrite callback returned false; the engine stopped.
    #[error("Overwrite declined, keeping the existing item")]
    OverwriteDenied,
    #[error("Unsupported source: {0}")]
    UnsupportedSource(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Any other engine failure, text kept verbatim.
    #[error("{0}")]
    Failed(String),
}

/// Errors from submitting a job.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("The {kind} queue is full ({depth} jobs waiting or running)")]
    QueueFull { kind: JobKind, depth: usize },
    #[error("The import queue is shutting down")]
    ShuttingDown,
    #[error("Failed to start {kind} worker: {source}")]
    Spawn {
        kind: JobKind,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from answering an overwrite prompt.
#[derive(Debug, thiserror::Error)]
pub enum ConfirmationError {
    #[error("Confirmation request not found: {0}")]
    NotFound(RequestId),
    #[error("The command was initiated by {}", .owner.mention())]
    Unauthorized { owner: UserId },
    #[error("Confirmation already resolved: {0}")]
    AlreadyResolved(ConfirmationOutcome),
}

/// Errors from posting or editing a chat message.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Platform error: {0}")]
    Platform(String),
    #[error("Message no longer exists")]
    Gone,
}

/// Errors from waiting on a [`JobHandle`](crate::dispatcher::JobHandle).
#[derive(Debug, thiserror::Error)]
pub enum JobHandleError {
    #[error("Job {0} was dropped without a result")]
    Dropped(JobId),
}
