//! The indexing pipeline boundary.
//!
//! Workers hand a document's path and text to an [`IndexingPipeline`] and
//! only record the file in the manifest once the pipeline reports success.
//! [`SqliteIndex`](sqlite::SqliteIndex) is the shipped implementation.

pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::SyncError;

#[derive(Error, Debug)]
pub enum IndexError {
    /// The embedding or index service is throttling us.
    #[error("rate limited by {service}")]
    RateLimited {
        service: String,
        retry_after: Option<Duration>,
    },

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl From<sqlx::Error> for IndexError {
    fn from(err: sqlx::Error) -> Self {
        IndexError::Failed(err.into())
    }
}

impl IndexError {
    pub fn into_sync_error(self, path: &str) -> SyncError {
        match self {
            IndexError::RateLimited {
                service,
                retry_after,
            } => SyncError::RateLimited {
                service,
                retry_after,
            },
            IndexError::Failed(source) => SyncError::Index {
                path: path.to_string(),
                source,
            },
        }
    }
}

#[async_trait]
pub trait IndexingPipeline: Send + Sync {
    /// Chunk, embed and store `content` as the document at `path`,
    /// replacing whatever was indexed for it before. Returns the number of
    /// chunks written.
    async fn index(&self, path: &str, content: &str) -> Result<usize, IndexError>;

    /// Remove the document at `path`. Removing an unknown path succeeds.
    async fn deindex(&self, path: &str) -> Result<(), IndexError>;
}
