//! Failure modes of the state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// The database file could not be created, opened, or upgraded.
    #[error("cannot open state database: {0}")]
    Open(#[from] redb::DatabaseError),

    /// Another writer holds the database or the read snapshot is unavailable.
    #[error("cannot start state transaction: {0}")]
    Begin(#[from] redb::TransactionError),

    #[error("cannot open table {table}: {source}")]
    Table {
        table: String,
        #[source]
        source: redb::TableError,
    },

    /// I/O failure underneath redb while reading or writing rows.
    #[error("state storage failure: {0}")]
    Storage(#[from] redb::StorageError),

    /// The transaction was not durably committed; nothing from it is visible.
    #[error("state commit failed: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("cannot encode {table} row {key:?}: {source}")]
    Encode {
        table: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A stored row no longer decodes into the current type.
    #[error("corrupt {table} row {key:?}: {source}")]
    Corrupt {
        table: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },
}
