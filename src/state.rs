//! Shared state handed to every handler.

use crate::services::{ingest_service::IngestService, storage_service::LocalObjectStore};
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    /// Upload pipeline.
    pub ingest: IngestService,

    /// Read side of the storage backend, for object retrieval and readiness.
    pub objects: LocalObjectStore,

    pub max_upload_bytes: u64,

    /// Budget for the text fields of one multipart form, all fields together.
    pub multipart_mem_bytes: u64,

    pub upload_timeout: Duration,
}
