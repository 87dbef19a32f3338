//! The record announced to downstream consumers once an object is stored.

use super::Metadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header carrying the event identity.
pub const HEADER_MEDIA_ID: &str = "media_id";

/// Header carrying the event type tag.
pub const HEADER_EVENT_TYPE: &str = "event_type";

/// Event type tag for newly ingested media.
pub const EVENT_TYPE_INGESTION_CREATED: &str = "ingestion.created";

/// Emitted after raw media has been accepted and durably stored.
///
/// Consumers depend on these exact JSON field names. `checksum` is the
/// lowercase hex SHA-256 of the full payload and `created_at` is ISO-8601 UTC.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IngestionEvent {
    /// Fresh identity, unrelated to any token embedded in `object_key`.
    pub id: Uuid,

    /// Storage key the payload was written under.
    pub object_key: String,

    pub checksum: String,

    pub size_bytes: u64,

    pub content_type: String,

    /// Caller metadata plus the reserved `original_filename` / `content_type` keys.
    pub metadata: Metadata,

    /// Assigned once, after the storage write completed.
    pub created_at: DateTime<Utc>,
}

impl IngestionEvent {
    /// Message headers that accompany this event on the log.
    pub fn headers(&self) -> Metadata {
        Metadata::from([
            (HEADER_MEDIA_ID.to_string(), self.id.to_string()),
            (
                HEADER_EVENT_TYPE.to_string(),
                EVENT_TYPE_INGESTION_CREATED.to_string(),
            ),
        ])
    }
}
