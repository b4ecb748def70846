use thiserror::Error;

use crate::log::LogError;
use crate::service::ExecutorError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the per-module errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Log(#[from] LogError),
}
