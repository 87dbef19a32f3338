//! src/services/storage_service.rs
//!
//! LocalObjectStore — the storage writer backed by local disk for payloads
//! and SQLite for object metadata. Payloads are sharded beneath
//! `base_path/{shard}/{shard}/{key}/{version}`.
//!
//! Every write lands in a fresh version file and the metadata row is then
//! pointed at it in one statement, so an overwrite either fully replaces the
//! previous object or leaves it untouched. Superseded versions are removed
//! after the row has moved on.

use crate::{
    models::{Metadata, object::StoredObject},
    services::storage::{PutBody, StorageError, StorageResult, StorageWriter},
};
use async_trait::async_trait;
use chrono::Utc;
use md5::Context;
use sqlx::{SqlitePool, types::Json};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    fs::{self, File},
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;

/// Metadata entry whose value is mirrored into the `content_type` column.
const CONTENT_TYPE_KEY: &str = "content_type";

#[derive(Clone)]
pub struct LocalObjectStore {
    /// Shared SQLite connection pool used for metadata rows.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    closed: Arc<AtomicBool>,
}

impl LocalObjectStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Reject keys that would escape `base_path` or that the filesystem
    /// cannot hold.
    ///
    /// Key derivation passes caller filenames through untouched; this
    /// backend maps keys onto real paths, so traversal is refused here.
    fn ensure_key_safe(key: &str) -> StorageResult<()> {
        let invalid = || StorageError::InvalidKey(key.to_string());
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(invalid());
        }
        if key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(invalid());
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }
        Ok(())
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    /// Two-level shard identifiers: the first two bytes of MD5(key) as
    /// lowercase hex. Keeps date partitions from piling into one directory.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// `{shard}/{shard}/{key}`, relative to `base_path`. Holds the version
    /// files of one key.
    fn object_dir(key: &str) -> String {
        let (shard_a, shard_b) = Self::object_shards(key);
        format!("{}/{}/{}", shard_a, shard_b, key)
    }

    fn resolve(&self, blob_path: &str) -> PathBuf {
        self.base_path.join(blob_path)
    }

    /// Version file the row for `key` currently points at, if any.
    async fn current_blob(&self, key: &str) -> StorageResult<Option<String>> {
        let blob = sqlx::query_scalar::<_, String>("SELECT blob_path FROM objects WHERE key = ?")
            .bind(key)
            .fetch_optional(&*self.db)
            .await?;
        Ok(blob)
    }

    /// SQLite answers and a file can be written, read back and removed in
    /// the object tree.
    pub async fn check_ready(&self) -> StorageResult<()> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&*self.db).await?;
        if one != 1 {
            return Err(StorageError::Backend(format!("SELECT 1 returned {}", one)));
        }

        fs::create_dir_all(&self.base_path).await?;
        let marker = Uuid::new_v4().to_string();
        let probe = TempObject::new(self.base_path.join(format!(".tmp-ready-{}", marker)));
        fs::write(probe.path(), marker.as_bytes()).await?;
        let read = fs::read(probe.path()).await?;
        if read != marker.as_bytes() {
            return Err(StorageError::Backend("readiness file read back differently".into()));
        }
        Ok(())
    }

    async fn fetch_object(&self, key: &str) -> StorageResult<StoredObject> {
        sqlx::query_as::<_, StoredObject>(
            "SELECT key, size_bytes, content_type, etag, metadata, blob_path, last_modified
             FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::NotFound(key.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    /// Stream `body` into a temp file next to the final location, enforcing
    /// the declared length. Returns the MD5 etag of the written bytes.
    async fn write_payload(
        tmp: &TempObject,
        body: PutBody<'_>,
        length: u64,
    ) -> StorageResult<String> {
        let mut file = File::create(tmp.path()).await?;
        let mut digest = Context::new();
        let mut written: u64 = 0;

        // One byte past the declared length is enough to detect an overrun.
        let mut limited = body.take(length.saturating_add(1));
        loop {
            let chunk = limited.fill_buf().await?;
            if chunk.is_empty() {
                break;
            }
            let n = chunk.len();
            written += n as u64;
            if written > length {
                return Err(StorageError::LongBody { expected: length });
            }
            digest.consume(chunk);
            file.write_all(chunk).await?;
            limited.consume(n);
        }

        if written < length {
            return Err(StorageError::ShortBody {
                expected: length,
                received: written,
            });
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(format!("{:x}", digest.compute()))
    }

    /// Fetch an object for reading: its metadata row and an open handle on
    /// the payload.
    pub async fn get_object_reader(&self, key: &str) -> StorageResult<(StoredObject, File)> {
        Self::ensure_key_safe(key)?;
        let object = self.fetch_object(key).await?;

        let file = File::open(self.resolve(&object.blob_path)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io(err)
            }
        })?;

        Ok((object, file))
    }

    pub async fn get_object_metadata(&self, key: &str) -> StorageResult<StoredObject> {
        Self::ensure_key_safe(key)?;
        self.fetch_object(key).await
    }
}

#[async_trait]
impl StorageWriter for LocalObjectStore {
    /// Temp file, fsync, rename to a new version file, then an upsert that
    /// points the row at it (overwrite semantics). A failed or cancelled
    /// write never touches the version the row currently points at.
    async fn put(
        &self,
        key: &str,
        body: PutBody<'_>,
        length: u64,
        metadata: &Metadata,
    ) -> StorageResult<()> {
        self.ensure_open()?;
        Self::ensure_key_safe(key)?;

        let dir = Self::object_dir(key);
        fs::create_dir_all(self.resolve(&dir)).await?;

        let version = Uuid::new_v4();
        let blob_path = format!("{}/{}", dir, version);
        let tmp = TempObject::new(self.resolve(&format!("{}/.tmp-{}", dir, version)));
        let etag = Self::write_payload(&tmp, body, length).await?;

        let version_file = self.resolve(&blob_path);
        fs::rename(tmp.path(), &version_file).await?;
        // From here a dropped future leaves at most an unreferenced version
        // file; the row may already point at it.
        tmp.persisted();

        let previous = match self.current_blob(key).await {
            Ok(previous) => previous,
            Err(err) => {
                remove_version(&version_file).await;
                return Err(err);
            }
        };

        let upserted = sqlx::query(
            r#"
            INSERT INTO objects (key, size_bytes, content_type, etag, metadata, blob_path, last_modified)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                content_type = excluded.content_type,
                etag = excluded.etag,
                metadata = excluded.metadata,
                blob_path = excluded.blob_path,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(key)
        .bind(length as i64)
        .bind(metadata.get(CONTENT_TYPE_KEY).cloned())
        .bind(&etag)
        .bind(Json(metadata))
        .bind(&blob_path)
        .bind(Utc::now())
        .execute(&*self.db)
        .await;

        if let Err(err) = upserted {
            remove_version(&version_file).await;
            return Err(StorageError::Sqlx(err));
        }

        if let Some(previous) = previous.filter(|p| *p != blob_path) {
            remove_version(&self.resolve(&previous)).await;
        }
        debug!(key, size_bytes = length, etag = %etag, version = %version, "stored object");
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("object store already closed");
            return Ok(());
        }
        self.db.close().await;
        debug!("object store closed");
        Ok(())
    }
}

/// Best-effort removal of a version file nothing points at.
async fn remove_version(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("failed to remove object version {}: {}", path.display(), err),
    }
}

/// Temp payload path that is unlinked on drop unless marked persisted.
struct TempObject {
    path: PathBuf,
    armed: AtomicBool,
}

impl TempObject {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            armed: AtomicBool::new(true),
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn persisted(&self) {
        self.armed.store(false, Ordering::Relaxed);
    }
}

impl Drop for TempObject {
    fn drop(&mut self) {
        if *self.armed.get_mut() {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!("removed temp file {}", self.path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => debug!("failed to remove temp file {}: {}", self.path.display(), err),
            }
        }
    }
}
