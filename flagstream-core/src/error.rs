use thiserror::Error;

/// Errors surfaced by store implementations.
///
/// The in-memory store is infallible in practice; persistent store cores and
/// the caching wrapper report their failures through this type so that the
/// data systems can translate them into `STORE_ERROR` statuses.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
