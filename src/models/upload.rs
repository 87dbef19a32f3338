//! Caller-facing request options and the result of a completed upload.

use super::Metadata;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Describes an inbound upload besides its byte stream and length.
#[derive(Clone, Debug, Default)]
pub struct UploadOptions {
    /// Human-readable name; becomes the last key segment when present.
    pub filename: Option<String>,

    /// Declared MIME type of the payload.
    pub content_type: String,

    metadata: Metadata,
}

impl UploadOptions {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            filename: None,
            content_type: content_type.into(),
            metadata: Metadata::new(),
        }
    }

    /// Sets the filename. Empty names are treated as absent.
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        let filename = filename.into();
        self.filename = (!filename.is_empty()).then_some(filename);
        self
    }

    /// Adds a metadata entry. Keys are lowercased and a later value for the
    /// same key replaces an earlier one.
    pub fn with_metadata_entry(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.insert_metadata(key, value);
        self
    }

    pub fn insert_metadata(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.metadata
            .insert(key.as_ref().to_lowercase(), value.into());
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

/// Returned to the caller once the event has been durably published.
#[derive(Serialize, Clone, Debug)]
pub struct UploadResult {
    pub media_id: Uuid,
    pub object_key: String,
    pub checksum: String,
    pub size_bytes: u64,

    /// Stamped after the broker acknowledged the event.
    pub uploaded_at: DateTime<Utc>,
}
