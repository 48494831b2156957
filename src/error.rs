use thiserror::Error;

/// Message fragments that mark a backend error as a lost connection.
const CONNECTION_LOST_PATTERNS: &[&str] = &[
    "server has gone away",
    "connection reset",
    "connection refused",
    "broken pipe",
    "database is locked",
];

/// Errors raised by an [`EntityStore`](crate::store::EntityStore).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage connection lost: {0}")]
    ConnectionLost(String),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// True for the error class that is healed by reconnecting and retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::ConnectionLost(_) => true,
            StoreError::Backend(message) => {
                let message = message.to_lowercase();
                CONNECTION_LOST_PATTERNS
                    .iter()
                    .any(|pattern| message.contains(pattern))
            }
            StoreError::NotFound { .. } => false,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                entity: "row",
                key: "query".to_string(),
            },
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Backend(format!("invalid stored JSON: {}", e))
    }
}

#[derive(Error, Debug)]
pub enum FarmError {
    #[error("Not the leader, current leader is {0:?}")]
    NotLeader(Option<String>),

    #[error("Bucket group not defined for bucket {0}")]
    UnknownBucket(String),

    #[error("Task hook failed: {0}")]
    HookFailed(String),

    #[error("Checkout error: {0}")]
    Checkout(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Panicked: {0}")]
    Panic(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FarmError {
    /// True when the failure is a transient storage error worth a retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, FarmError::Store(e) if e.is_transient())
    }
}

pub type Result<T> = std::result::Result<T, FarmError>;
