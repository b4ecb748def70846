//! Deterministic per-service executor.
//!
//! Applies committed operations to registered handlers under a logical
//! clock and drives a deterministic timer schedule. Given the same ordered
//! sequence of `apply` and `tick` calls, every replica produces identical
//! handler invocations in identical order.

use thiserror::Error;

use crate::core::OperationId;

pub mod executor;
pub mod schedule;

pub use executor::{OperationContext, ServiceExecutor};
pub use schedule::Scheduled;

/// Failure type for handlers, post-op tasks, and scheduled callbacks.
pub type TaskError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type ExecutorResult<T> = Result<T, ExecutorError>;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("unknown state machine operation: {0}")]
    UnknownOperation(OperationId),

    #[error("state machine operation {operation} failed")]
    Application {
        operation: OperationId,
        #[source]
        source: TaskError,
    },

    #[error("{reason}")]
    IllegalContext { reason: &'static str },
}
