//! Represents an object stored by the local storage backend.

use super::Metadata;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, types::Json};

/// Metadata row kept for each stored payload.
///
/// The payload bytes live on disk; this struct never holds them.
#[derive(Serialize, Clone, FromRow, Debug)]
pub struct StoredObject {
    /// Object key (path-like identifier, e.g. `2026/10/19/clip.mp4`).
    pub key: String,

    /// Size in bytes, always equal to the declared length of the write.
    pub size_bytes: i64,

    /// Content type taken from the `content_type` metadata entry.
    pub content_type: Option<String>,

    /// MD5 of the payload, computed by the backend while writing.
    pub etag: String,

    /// Opaque metadata supplied with the write.
    pub metadata: Json<Metadata>,

    /// Version file holding the payload, relative to the store's base path.
    #[serde(skip)]
    pub blob_path: String,

    /// When the object was last written.
    pub last_modified: DateTime<Utc>,
}
