#![forbid(unsafe_code)]

pub mod core;
pub mod error;
pub mod log;
pub mod service;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{Commit, OperationId, OperationType};
pub use crate::log::{LogError, LogResult, LogSegment, SegmentConfig};
pub use crate::service::{
    ExecutorError, ExecutorResult, OperationContext, Scheduled, ServiceExecutor, TaskError,
};
