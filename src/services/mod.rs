//! Upload pipeline and its collaborators.
//!
//! - `ingest_service`: the orchestrator (hash + store, then announce)
//! - `storage` / `publisher`: the collaborator contracts it consumes
//! - `storage_service` / `event_log`: the SQLite + local disk backends
//! - `hashing` / `keys`: streaming digest and object key derivation

pub mod event_log;
pub mod hashing;
pub mod ingest_service;
pub mod keys;
pub mod publisher;
pub mod storage;
pub mod storage_service;
