use super::models::RepoState;
use crate::forge::ForgeError;
use thiserror::Error;
use uuid::Uuid;

/// Store failure taxonomy. Callers distinguish transient failures (retry
/// with backoff), `NotFound`, and fatal failures (invariant violations that
/// shut the process down).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: RepoState, to: RepoState },

    #[error("corrupt row {id}: {message}")]
    Corrupt { id: String, message: String },
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Connection-level failures that back off and retry. Everything else is
    /// either `NotFound` or fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            StoreError::InvalidTransition { .. } | StoreError::Corrupt { .. } => true,
            StoreError::NotFound { .. } | StoreError::Serialization(_) => false,
            StoreError::Database(_) => !self.is_transient(),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Top-level error for worker and manager operations.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("forge error: {0}")]
    Forge(#[from] ForgeError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("repository {repo_id} no longer owned in state {state}")]
    OwnershipLost { repo_id: Uuid, state: RepoState },

    #[error("manager is already running")]
    AlreadyRunning,

    #[error("repository {repo_id} is in terminal state {state}")]
    Terminal { repo_id: Uuid, state: RepoState },
}

pub type Result<T> = std::result::Result<T, MigrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classes() {
        let e = StoreError::Database(sqlx::Error::PoolTimedOut);
        assert!(e.is_transient());
        assert!(!e.is_fatal());

        let e = StoreError::Corrupt {
            id: "x".to_string(),
            message: "bad state".to_string(),
        };
        assert!(!e.is_transient());
        assert!(e.is_fatal());

        let e = StoreError::not_found("repository", Uuid::nil());
        assert!(!e.is_transient());
        assert!(!e.is_fatal());
    }
}
