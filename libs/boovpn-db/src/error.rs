use thiserror::Error;

/// Local persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Subscriber {0} not found")]
    NotFound(i64),

    #[error("Subscriber {0} already exists")]
    AlreadyExists(i64),

    #[error("Subscriber {0} is not active")]
    Inactive(i64),

    #[error("Device slot {0} is out of range")]
    InvalidSlot(usize),
}
