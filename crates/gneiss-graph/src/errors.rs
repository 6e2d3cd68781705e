use sled::transaction::TransactionError;
use thiserror::Error;

/// The failure taxonomy of the graph engine.
///
/// `BadRequest`, `Precondition` and `Postcondition` are caller errors and are reported verbatim.
/// `Locking` covers both failed acquisition and a lock lease lost mid-edit (a rejected conditional
/// write); callers may retry it. Everything else is an internal fault.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("postcondition failed: {0}")]
    Postcondition(String),

    #[error("locking failed: {0}")]
    Locking(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;

impl GraphError {
    /// Folds a transaction abort into the taxonomy, treating non-abort failures as store faults.
    pub(crate) fn from_transaction<E: Into<GraphError>>(err: TransactionError<E>) -> Self {
        match err {
            TransactionError::Abort(reason) => reason.into(),
            TransactionError::Storage(err) => GraphError::Store(err),
        }
    }
}
