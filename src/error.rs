use sea_orm::{DbErr, RuntimeErr};
use thiserror::Error;

use crate::node::{NodeId, Scope};
use crate::validate::ErrorCounts;

/// SQLSTATE codes that mean "another writer got there first; retry".
const RETRYABLE_SQLSTATES: &[&str] = &[
    "55P03", // lock_not_available (lock_timeout)
    "40001", // serialization_failure
    "40P01", // deadlock_detected
];

/// Errors returned by the nested-set APIs.
#[derive(Debug, Error)]
pub enum NestedSetError {
    #[error("node {0} not found")]
    NotFound(NodeId),

    #[error("node {id} belongs to scope {actual}, not {expected}")]
    ScopeMismatch {
        id: NodeId,
        expected: Scope,
        actual: Scope,
    },

    #[error("node {0} would become its own ancestor")]
    Cycle(NodeId),

    #[error("concurrent modification, retry the operation: {0}")]
    ConcurrentModification(String),

    #[error("tree is corrupted: {0}")]
    CorruptionDetected(ErrorCounts),

    #[error("nested-set invariant violation: {0}")]
    Invariant(String),

    #[error("nested-set currently supports PostgreSQL connections only")]
    UnsupportedBackend,

    #[error("database error: {0}")]
    Database(DbErr),

    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl NestedSetError {
    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::Invariant(detail.into())
    }

    /// Whether retrying the whole operation from scratch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification(_))
    }
}

impl From<DbErr> for NestedSetError {
    fn from(err: DbErr) -> Self {
        if is_retryable_db_err(&err) {
            Self::ConcurrentModification(err.to_string())
        } else {
            Self::Database(err)
        }
    }
}

fn is_retryable_db_err(err: &DbErr) -> bool {
    let runtime = match err {
        DbErr::Exec(runtime) | DbErr::Query(runtime) | DbErr::Conn(runtime) => runtime,
        _ => return false,
    };
    match runtime {
        RuntimeErr::SqlxError(sqlx::Error::Database(db)) => db
            .code()
            .is_some_and(|code| RETRYABLE_SQLSTATES.iter().any(|state| code == *state)),
        _ => false,
    }
}
