//! Object key derivation: `YYYY/MM/DD/{filename | generated token}`.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Derive the storage key for an upload arriving at `now`.
///
/// The filename is used verbatim, separators included, so callers can
/// build directory-like prefixes. Two uploads with the same name on the
/// same UTC day map to the same key and the later write replaces the
/// earlier one.
pub fn derive_object_key(now: DateTime<Utc>, filename: Option<&str>) -> String {
    let partition = now.format("%Y/%m/%d");
    match filename {
        Some(name) if !name.is_empty() => format!("{}/{}", partition, name),
        _ => format!("{}/{}", partition, Uuid::new_v4()),
    }
}
