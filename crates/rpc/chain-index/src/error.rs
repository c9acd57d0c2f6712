//! Error types for repository operations.

use std::fmt;

use thiserror::Error;

/// Kind of entity a lookup was looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Account,
    Block,
    Transaction,
    TokenTransaction,
    Contract,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::Account => "account",
            Entity::Block => "block",
            Entity::Transaction => "transaction",
            Entity::TokenTransaction => "token transaction",
            Entity::Contract => "contract",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in the repository and its adapters.
///
/// The type is `Clone` so a single collapsed upstream result can be handed
/// to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    /// Entity absent at every tier.
    #[error("{entity} not found: {key}")]
    NotFound { entity: Entity, key: String },

    /// Pagination position is no longer resolvable.
    #[error("invalid cursor: {0}")]
    CursorInvalid(String),

    /// Node RPC failure or timeout.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Malformed log or transaction payload.
    #[error("decode error: {0}")]
    Decode(String),

    /// Idempotent-write precondition violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Structurally broken setup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Persistent store fault.
    #[error("storage error: {0}")]
    Storage(String),
}

impl RepositoryError {
    /// Shorthand for a `NotFound` on the given entity.
    pub fn not_found(entity: Entity, key: impl fmt::Display) -> Self {
        RepositoryError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound { .. })
    }
}

impl From<rusqlite::Error> for RepositoryError {
    fn from(err: rusqlite::Error) -> Self {
        RepositoryError::Storage(format!("sqlite: {err}"))
    }
}

impl From<r2d2::Error> for RepositoryError {
    fn from(err: r2d2::Error) -> Self {
        RepositoryError::Storage(format!("connection pool: {err}"))
    }
}

/// Result type for repository operations.
pub type RepositoryResult<T> = Result<T, RepositoryError>;
