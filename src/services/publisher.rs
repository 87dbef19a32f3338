//! Event publisher abstraction consumed by the ingestion pipeline.

use crate::models::Metadata;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publisher is closed")]
    Closed,
    #[error("publish cancelled")]
    Cancelled,
    #[error("flush did not complete within {0:?}")]
    FlushTimeout(Duration),
    #[error("encoding event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("broker rejected message: {0}")]
    Backend(String),
}

pub type PublishResult<T> = Result<T, PublishError>;

/// Durable, keyed, header-annotated message publishing.
///
/// Messages sharing a key keep their `publish` order for consumers; no order
/// holds across keys.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Enqueue one message. Returns only once the broker has accepted it,
    /// not when it has merely been buffered client-side.
    async fn publish(&self, key: &[u8], payload: Vec<u8>, headers: &Metadata)
    -> PublishResult<()>;

    /// Flush everything still buffered, giving up after `timeout`.
    /// Calling it again is a no-op.
    async fn close(&self, timeout: Duration) -> PublishResult<()>;
}
