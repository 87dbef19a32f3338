//! Data carried through one upload: what the caller hands in, what gets
//! announced to consumers, and what is kept about each stored object.
//!
//! None of these are persisted by the ingestion core itself; `StoredObject`
//! is the row the local storage backend keeps next to each payload.

use std::collections::BTreeMap;

pub mod event;
pub mod object;
pub mod upload;

/// String-to-string metadata attached to objects and events.
pub type Metadata = BTreeMap<String, String>;
