//! src/services/ingest_service.rs
//!
//! IngestService — the upload pipeline. One call streams the payload
//! through SHA-256 into storage, then announces the stored object as an
//! `ingestion.created` event:
//!
//! `Received → Storing → Stored → Publishing → Completed`
//!
//! with `Rejected` (nothing attempted) and `Failed` (storage attempted) as
//! the only other exits. A stored object is never rolled back when the
//! publish fails; the error says so and reconciliation happens elsewhere.

use crate::{
    models::{
        Metadata,
        event::IngestionEvent,
        upload::{UploadOptions, UploadResult},
    },
    services::{
        hashing::HashingReader,
        keys::derive_object_key,
        publisher::{EventPublisher, PublishError, PublishResult},
        storage::{StorageError, StorageWriter},
    },
};
use chrono::Utc;
use serde::Serialize;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, error, field, info, warn};
use uuid::Uuid;

/// Reserved metadata key holding the caller's filename.
pub const ORIGINAL_FILENAME_KEY: &str = "original_filename";

/// Reserved metadata key holding the declared content type.
pub const CONTENT_TYPE_KEY: &str = "content_type";

/// Which step of the pipeline an error came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestPhase {
    Validation,
    Storage,
    Publish,
}

impl fmt::Display for IngestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Validation => "validation",
            Self::Storage => "storage",
            Self::Publish => "publish",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UploadState {
    Received,
    Storing,
    Stored,
    Publishing,
    Completed,
    Rejected,
    Failed,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid upload: {0}")]
    InvalidInput(String),
    #[error("storing object `{key}` failed: {source}")]
    Storage { key: String, source: StorageError },
    #[error("object `{key}` stored but event `{media_id}` was not published: {source}")]
    Publish {
        key: String,
        media_id: Uuid,
        source: PublishError,
    },
}

impl IngestError {
    pub fn phase(&self) -> IngestPhase {
        match self {
            Self::InvalidInput(_) => IngestPhase::Validation,
            Self::Storage { .. } => IngestPhase::Storage,
            Self::Publish { .. } => IngestPhase::Publish,
        }
    }

    /// True when the payload is durably stored even though the upload
    /// failed, i.e. the object exists but was never announced.
    pub fn object_stored(&self) -> bool {
        matches!(self, Self::Publish { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Storage {
                source: StorageError::Cancelled,
                ..
            } | Self::Publish {
                source: PublishError::Cancelled,
                ..
            }
        )
    }
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("closing event publisher: {0}")]
    Publisher(PublishError),
    #[error("closing storage writer: {0}")]
    Storage(StorageError),
}

/// Stateless coordinator over the two collaborators. Cheap to clone and
/// safe to call from any number of tasks at once.
#[derive(Clone)]
pub struct IngestService {
    storage: Arc<dyn StorageWriter>,
    publisher: Arc<dyn EventPublisher>,
}

impl IngestService {
    pub fn new(storage: Arc<dyn StorageWriter>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { storage, publisher }
    }

    /// Store `reader` (exactly `declared_length` bytes) and announce it.
    ///
    /// `cancel` is observed while storing and while publishing. Cancelling
    /// during storage aborts the write and nothing is published; cancelling
    /// during publish leaves the object stored, as a publish failure would.
    #[tracing::instrument(
        name = "ingest.upload",
        skip_all,
        fields(
            size_bytes = declared_length,
            object_key = field::Empty,
            media_id = field::Empty,
        )
    )]
    pub async fn process_upload<R>(
        &self,
        reader: R,
        declared_length: u64,
        options: UploadOptions,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, IngestError>
    where
        R: AsyncRead + Send + Unpin,
    {
        transition(UploadState::Received);
        if let Err(err) = validate(declared_length, &options) {
            transition(UploadState::Rejected);
            warn!(error = %err, "upload rejected");
            return Err(err);
        }

        let mut body = HashingReader::buffered(reader);
        let object_key = derive_object_key(Utc::now(), options.filename.as_deref());
        Span::current().record("object_key", object_key.as_str());
        let metadata = build_metadata(&options);

        transition(UploadState::Storing);
        let stored = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
            res = self.storage.put(&object_key, &mut body, declared_length, &metadata) => res,
        };
        let checksum = match stored.and_then(|()| finish_digest(body.into_inner(), declared_length)) {
            Ok(checksum) => checksum,
            Err(source) => {
                transition(UploadState::Failed);
                error!(error = %source, phase = %IngestPhase::Storage, "upload failed; nothing published");
                return Err(IngestError::Storage {
                    key: object_key,
                    source,
                });
            }
        };
        transition(UploadState::Stored);

        let media_id = Uuid::new_v4();
        Span::current().record("media_id", field::display(media_id));
        let event = IngestionEvent {
            id: media_id,
            object_key,
            checksum,
            size_bytes: declared_length,
            content_type: options.content_type,
            metadata,
            created_at: Utc::now(),
        };

        transition(UploadState::Publishing);
        if let Err(source) = self.announce(&event, cancel).await {
            transition(UploadState::Failed);
            error!(
                error = %source,
                phase = %IngestPhase::Publish,
                "object stored but not announced; needs reconciliation"
            );
            return Err(IngestError::Publish {
                key: event.object_key,
                media_id,
                source,
            });
        }

        let result = UploadResult {
            media_id,
            object_key: event.object_key,
            checksum: event.checksum,
            size_bytes: declared_length,
            uploaded_at: Utc::now(),
        };
        transition(UploadState::Completed);
        info!(checksum = %result.checksum, "upload ingested");
        Ok(result)
    }

    /// Serialize `event` and publish it keyed by its identity.
    async fn announce(&self, event: &IngestionEvent, cancel: &CancellationToken) -> PublishResult<()> {
        let payload = serde_json::to_vec(event)?;
        let headers = event.headers();
        let key = event.id.to_string();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PublishError::Cancelled),
            res = self.publisher.publish(key.as_bytes(), payload, &headers) => res,
        }
    }

    /// Flush the publisher (bounded by `timeout`), then close storage.
    /// Storage is closed even if the publisher fails; the first error wins.
    pub async fn close(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let published = self
            .publisher
            .close(timeout)
            .await
            .map_err(ShutdownError::Publisher);
        let stored = self.storage.close().await.map_err(ShutdownError::Storage);

        match (published, stored) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(first), Err(second)) => {
                warn!(error = %second, "storage close failed after publisher close failed");
                Err(first)
            }
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
        }
    }
}

fn transition(state: UploadState) {
    debug!(state = ?state, "upload state");
}

fn validate(declared_length: u64, options: &UploadOptions) -> Result<(), IngestError> {
    if declared_length == 0 {
        return Err(IngestError::InvalidInput(
            "declared length must be positive".into(),
        ));
    }
    if options.content_type.trim().is_empty() {
        return Err(IngestError::InvalidInput("content type is required".into()));
    }
    Ok(())
}

/// Caller metadata with the reserved keys forced to the declared values.
fn build_metadata(options: &UploadOptions) -> Metadata {
    let mut metadata = options.metadata().clone();
    metadata.insert(
        ORIGINAL_FILENAME_KEY.to_string(),
        options.filename.clone().unwrap_or_default(),
    );
    metadata.insert(CONTENT_TYPE_KEY.to_string(), options.content_type.clone());
    metadata
}

/// The digest is only trusted if storage consumed exactly the declared
/// bytes and reached the end of the body.
fn finish_digest<R>(hasher: HashingReader<R>, declared_length: u64) -> Result<String, StorageError> {
    let read = hasher.bytes_read();
    if read < declared_length {
        return Err(StorageError::ShortBody {
            expected: declared_length,
            received: read,
        });
    }
    if read > declared_length {
        return Err(StorageError::LongBody {
            expected: declared_length,
        });
    }
    hasher
        .finalize()
        .map_err(|err| StorageError::Backend(format!("storage accepted an unfinished body: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::event::{EVENT_TYPE_INGESTION_CREATED, HEADER_EVENT_TYPE, HEADER_MEDIA_ID},
        test_support::{Journal, MemoryStorage, RecordingPublisher},
    };
    use sha2::{Digest, Sha256};

    fn service(storage: &Arc<MemoryStorage>, publisher: &Arc<RecordingPublisher>) -> IngestService {
        IngestService::new(storage.clone(), publisher.clone())
    }

    fn today() -> String {
        Utc::now().format("%Y/%m/%d").to_string()
    }

    fn clip_options() -> UploadOptions {
        UploadOptions::new("video/mp4")
            .with_filename("clip.mp4")
            .with_metadata_entry("owner", "abc")
    }

    #[tokio::test]
    async fn stores_then_announces_clip() {
        let storage = Arc::new(MemoryStorage::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();

        let result = service(&storage, &publisher)
            .process_upload(&payload[..], 1000, clip_options(), &CancellationToken::new())
            .await
            .unwrap();

        let puts = storage.puts();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].key, format!("{}/clip.mp4", today()));
        assert_eq!(puts[0].length, 1000);
        assert_eq!(puts[0].metadata["original_filename"], "clip.mp4");
        assert_eq!(puts[0].metadata["content_type"], "video/mp4");
        assert_eq!(puts[0].metadata["owner"], "abc");

        let messages = publisher.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].headers[HEADER_EVENT_TYPE],
            EVENT_TYPE_INGESTION_CREATED
        );
        assert_eq!(messages[0].headers[HEADER_MEDIA_ID], result.media_id.to_string());
        assert_eq!(messages[0].key, result.media_id.to_string().into_bytes());

        assert_eq!(result.size_bytes, 1000);
        assert_eq!(result.object_key, puts[0].key);
        assert_eq!(result.checksum.len(), 64);
        assert!(
            result
                .checksum
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        );
        let stored = storage.object(&result.object_key).unwrap();
        assert_eq!(result.checksum, hex::encode(Sha256::digest(&stored)));
    }

    #[tokio::test]
    async fn event_payload_matches_result() {
        let storage = Arc::new(MemoryStorage::default());
        let publisher = Arc::new(RecordingPublisher::default());

        let result = service(&storage, &publisher)
            .process_upload(&b"hello"[..], 5, clip_options(), &CancellationToken::new())
            .await
            .unwrap();

        let event: IngestionEvent =
            serde_json::from_slice(&publisher.messages()[0].payload).unwrap();
        assert_eq!(event.id, result.media_id);
        assert_eq!(event.object_key, result.object_key);
        assert_eq!(event.checksum, result.checksum);
        assert_eq!(event.size_bytes, 5);
        assert_eq!(event.content_type, "video/mp4");
        assert_eq!(event.metadata["owner"], "abc");
        assert!(result.uploaded_at >= event.created_at);
    }

    #[tokio::test]
    async fn publish_strictly_follows_put() {
        let journal = Journal::default();
        let storage = Arc::new(MemoryStorage::default().with_journal(journal.clone()));
        let publisher = Arc::new(RecordingPublisher::default().with_journal(journal.clone()));

        service(&storage, &publisher)
            .process_upload(&b"abc"[..], 3, clip_options(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*journal.lock().unwrap(), ["put", "publish"]);
    }

    #[tokio::test]
    async fn storage_failure_skips_publish() {
        let journal = Journal::default();
        let storage = Arc::new(MemoryStorage::default().failing().with_journal(journal.clone()));
        let publisher = Arc::new(RecordingPublisher::default().with_journal(journal.clone()));

        let err = service(&storage, &publisher)
            .process_upload(&b"abc"[..], 3, clip_options(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.phase(), IngestPhase::Storage);
        assert!(!err.object_stored());
        assert_eq!(*journal.lock().unwrap(), ["put"]);
    }

    #[tokio::test]
    async fn publish_failure_leaves_object_stored() {
        let storage = Arc::new(MemoryStorage::default());
        let publisher = Arc::new(RecordingPublisher::default().failing());

        let err = service(&storage, &publisher)
            .process_upload(&b"abc"[..], 3, clip_options(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.phase(), IngestPhase::Publish);
        assert!(err.object_stored());
        let IngestError::Publish { key, .. } = &err else {
            panic!("expected publish failure, got {err:?}");
        };
        assert_eq!(storage.object(key).unwrap(), b"abc");
        assert_eq!(storage.puts().len(), 1);
    }

    #[tokio::test]
    async fn zero_length_is_rejected_before_any_call() {
        let storage = Arc::new(MemoryStorage::default());
        let publisher = Arc::new(RecordingPublisher::default());

        let err = service(&storage, &publisher)
            .process_upload(&b""[..], 0, clip_options(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::InvalidInput(_)));
        assert_eq!(err.phase(), IngestPhase::Validation);
        assert!(storage.puts().is_empty());
        assert!(publisher.messages().is_empty());
    }

    #[tokio::test]
    async fn missing_content_type_is_rejected() {
        let storage = Arc::new(MemoryStorage::default());
        let publisher = Arc::new(RecordingPublisher::default());

        let err = service(&storage, &publisher)
            .process_upload(&b"abc"[..], 3, UploadOptions::new(" "), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::InvalidInput(_)));
        assert!(storage.puts().is_empty());
    }

    #[tokio::test]
    async fn length_mismatch_is_a_storage_failure() {
        let storage = Arc::new(MemoryStorage::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let svc = service(&storage, &publisher);

        let short = svc
            .process_upload(&[0u8; 10][..], 20, clip_options(), &CancellationToken::new())
            .await
            .unwrap_err();
        let long = svc
            .process_upload(&[0u8; 30][..], 20, clip_options(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            short,
            IngestError::Storage {
                source: StorageError::ShortBody { .. },
                ..
            }
        ));
        assert!(matches!(
            long,
            IngestError::Storage {
                source: StorageError::LongBody { .. },
                ..
            }
        ));
        assert!(publisher.messages().is_empty());
    }

    #[tokio::test]
    async fn same_name_same_day_overwrites_with_new_identity() {
        let storage = Arc::new(MemoryStorage::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let svc = service(&storage, &publisher);

        let first = svc
            .process_upload(&b"one"[..], 3, clip_options(), &CancellationToken::new())
            .await
            .unwrap();
        let second = svc
            .process_upload(&b"second"[..], 6, clip_options(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(first.object_key, second.object_key);
        assert_ne!(first.media_id, second.media_id);
        assert_eq!(storage.object(&second.object_key).unwrap(), b"second");
    }

    #[tokio::test]
    async fn unnamed_upload_gets_generated_key() {
        let storage = Arc::new(MemoryStorage::default());
        let publisher = Arc::new(RecordingPublisher::default());

        let result = service(&storage, &publisher)
            .process_upload(
                &b"abc"[..],
                3,
                UploadOptions::new("application/octet-stream"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let token = result
            .object_key
            .strip_prefix(&format!("{}/", today()))
            .unwrap();
        let token = Uuid::parse_str(token).unwrap();
        assert_ne!(token, result.media_id);
        assert_eq!(storage.puts()[0].metadata["original_filename"], "");
    }

    #[tokio::test]
    async fn reserved_metadata_overrides_caller_values() {
        let storage = Arc::new(MemoryStorage::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let options = clip_options()
            .with_metadata_entry("Original_Filename", "spoofed.exe")
            .with_metadata_entry("content_type", "text/html");

        service(&storage, &publisher)
            .process_upload(&b"abc"[..], 3, options, &CancellationToken::new())
            .await
            .unwrap();

        let metadata = &storage.puts()[0].metadata;
        assert_eq!(metadata["original_filename"], "clip.mp4");
        assert_eq!(metadata["content_type"], "video/mp4");
    }

    #[tokio::test]
    async fn cancel_during_storage_aborts_without_publish() {
        let storage = Arc::new(MemoryStorage::default().stalling());
        let publisher = Arc::new(RecordingPublisher::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = service(&storage, &publisher)
            .process_upload(&b"abc"[..], 3, clip_options(), &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(err.phase(), IngestPhase::Storage);
        assert!(publisher.messages().is_empty());
    }

    #[tokio::test]
    async fn cancel_during_publish_leaves_object_stored() {
        let storage = Arc::new(MemoryStorage::default());
        let publisher = Arc::new(RecordingPublisher::default().stalling());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = service(&storage, &publisher)
            .process_upload(&b"abc"[..], 3, clip_options(), &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(err.object_stored());
        assert_eq!(storage.object(&format!("{}/clip.mp4", today())).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn close_runs_publisher_then_storage_and_is_repeatable() {
        let journal = Journal::default();
        let storage = Arc::new(MemoryStorage::default().with_journal(journal.clone()));
        let publisher = Arc::new(RecordingPublisher::default().with_journal(journal.clone()));
        let svc = service(&storage, &publisher);

        svc.close(Duration::from_secs(1)).await.unwrap();
        svc.close(Duration::from_secs(1)).await.unwrap();

        assert_eq!(
            *journal.lock().unwrap(),
            ["close_publisher", "close_storage", "close_publisher", "close_storage"]
        );
    }

    #[tokio::test]
    async fn close_still_closes_storage_when_flush_fails() {
        let storage = Arc::new(MemoryStorage::default());
        let publisher = Arc::new(RecordingPublisher::default().failing_close());

        let err = service(&storage, &publisher)
            .close(Duration::from_millis(10))
            .await
            .unwrap_err();

        assert!(matches!(err, ShutdownError::Publisher(_)));
        assert_eq!(storage.close_calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_uploads_are_independent() {
        let storage = Arc::new(MemoryStorage::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let svc = service(&storage, &publisher);

        let mut tasks = Vec::new();
        for i in 0..16usize {
            let svc = svc.clone();
            tasks.push(tokio::spawn(async move {
                let payload = vec![i as u8; i + 1];
                let options = UploadOptions::new("application/octet-stream")
                    .with_filename(format!("file-{i}.bin"));
                let result = svc
                    .process_upload(&payload[..], payload.len() as u64, options, &CancellationToken::new())
                    .await
                    .unwrap();
                (result, hex::encode(Sha256::digest(&payload)))
            }));
        }

        for task in tasks {
            let (result, expected) = task.await.unwrap();
            assert_eq!(result.checksum, expected);
        }
        assert_eq!(publisher.messages().len(), 16);
    }
}
