//! Error types for mailqueue-view.

use thiserror::Error;

use crate::model::{ItemKey, Partition, QueueName};

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A storage partition or backend is temporarily unreachable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("failed to scan partition {partition}: {source}")]
    Partition {
        partition: Partition,
        #[source]
        source: Box<Error>,
    },

    /// The transport accepted the item but it could not be indexed. The item
    /// will still be delivered; it just will not show up when browsing.
    #[error("item {key} in queue {queue} was not indexed: {reason}")]
    Indexing {
        queue: QueueName,
        key: ItemKey,
        reason: String,
    },

    #[error("content {0} not found in blob store")]
    ContentMissing(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid continuation token: {0}")]
    InvalidToken(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Unavailable(_) => true,
            Error::Storage(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)
            ),
            Error::Partition { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
