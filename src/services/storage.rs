//! Storage writer abstraction consumed by the ingestion pipeline.

use crate::models::Metadata;
use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::io::AsyncBufRead;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object key `{0}` is not accepted by this store")]
    InvalidKey(String),
    #[error("body ended after {received} of {expected} declared bytes")]
    ShortBody { expected: u64, received: u64 },
    #[error("body is longer than the {expected} declared bytes")]
    LongBody { expected: u64 },
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("storage writer is closed")]
    Closed,
    #[error("storage write cancelled")]
    Cancelled,
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Body handed to [`StorageWriter::put`]. The caller keeps ownership so it
/// can inspect the stream (e.g. read its digest) once the write returns.
pub type PutBody<'a> = &'a mut (dyn AsyncBufRead + Send + Unpin);

/// Durable object persistence.
///
/// Implementations must be safe for concurrent `put`s on different keys.
/// Concurrent writes to the same key resolve as last-write-wins.
#[async_trait]
pub trait StorageWriter: Send + Sync {
    /// Write exactly `length` bytes from `body` under `key`, attaching
    /// `metadata` as opaque object metadata.
    ///
    /// A body yielding fewer or more bytes than `length` fails the write;
    /// it is never truncated or padded. Implementations read `body` to its
    /// end on success.
    async fn put(
        &self,
        key: &str,
        body: PutBody<'_>,
        length: u64,
        metadata: &Metadata,
    ) -> StorageResult<()>;

    /// Release pooled resources. Calling it again is a no-op.
    async fn close(&self) -> StorageResult<()>;
}
