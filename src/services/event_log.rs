//! SqliteEventLog — a partitioned, append-only message log kept in SQLite.
//!
//! Publishes are handed to one background writer task that batches them
//! (up to `batch_size` messages or `batch_timeout` of linger), appends each
//! batch in a single transaction and only then acknowledges the callers.
//! Messages with the same key always land on the same partition, and the
//! single writer assigns offsets in arrival order, so per-key order holds.

use crate::{
    models::Metadata,
    services::publisher::{EventPublisher, PublishError, PublishResult},
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{SqlitePool, types::Json};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{RwLock, mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct EventLogConfig {
    pub topic: String,
    pub partitions: u32,
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

/// Position assigned to an appended message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogPosition {
    pub partition: u32,
    pub offset: i64,
}

struct Envelope {
    partition: u32,
    key: Vec<u8>,
    payload: Vec<u8>,
    headers: Metadata,
    ack: oneshot::Sender<PublishResult<LogPosition>>,
}

pub struct SqliteEventLog {
    db: Arc<SqlitePool>,
    config: EventLogConfig,
    intake: RwLock<Option<mpsc::Sender<Envelope>>>,
    writer: RwLock<Option<JoinHandle<()>>>,
}

impl SqliteEventLog {
    /// Start the log and its writer task. Must be called inside a tokio runtime.
    pub fn start(db: Arc<SqlitePool>, config: EventLogConfig) -> Self {
        let config = EventLogConfig {
            partitions: config.partitions.max(1),
            batch_size: config.batch_size.max(1),
            ..config
        };
        let (tx, rx) = mpsc::channel(config.batch_size * 4);
        let writer = tokio::spawn(run_writer(db.clone(), config.clone(), rx));

        Self {
            db,
            config,
            intake: RwLock::new(Some(tx)),
            writer: RwLock::new(Some(writer)),
        }
    }

    /// Partition for `key`: first four bytes of MD5(key), modulo the
    /// partition count.
    pub fn partition_for(&self, key: &[u8]) -> u32 {
        let digest = md5::compute(key);
        let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        head % self.config.partitions
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// Append `payload` and wait for the commit that makes it durable.
    pub async fn append(
        &self,
        key: &[u8],
        payload: Vec<u8>,
        headers: &Metadata,
    ) -> PublishResult<LogPosition> {
        let intake = self
            .intake
            .read()
            .await
            .clone()
            .ok_or(PublishError::Closed)?;

        let (ack, acked) = oneshot::channel();
        let envelope = Envelope {
            partition: self.partition_for(key),
            key: key.to_vec(),
            payload,
            headers: headers.clone(),
            ack,
        };
        intake
            .send(envelope)
            .await
            .map_err(|_| PublishError::Closed)?;
        // Holding the sender while waiting would keep a closing writer lingering.
        drop(intake);

        acked
            .await
            .map_err(|_| PublishError::Backend("event log writer stopped".into()))?
    }
}

#[async_trait]
impl EventPublisher for SqliteEventLog {
    async fn publish(
        &self,
        key: &[u8],
        payload: Vec<u8>,
        headers: &Metadata,
    ) -> PublishResult<()> {
        let position = self.append(key, payload, headers).await?;
        debug!(
            topic = %self.config.topic,
            partition = position.partition,
            offset = position.offset,
            "message appended"
        );
        Ok(())
    }

    async fn close(&self, timeout: Duration) -> PublishResult<()> {
        // Dropping the last sender lets the writer drain what is queued and exit.
        self.intake.write().await.take();

        let Some(writer) = self.writer.write().await.take() else {
            debug!(topic = %self.config.topic, "event log already closed");
            return Ok(());
        };

        match tokio::time::timeout(timeout, writer).await {
            Ok(Ok(())) => {
                debug!(topic = %self.config.topic, "event log flushed and closed");
                Ok(())
            }
            Ok(Err(err)) => Err(PublishError::Backend(format!("event log writer failed: {err}"))),
            Err(_) => Err(PublishError::FlushTimeout(timeout)),
        }
    }
}

async fn run_writer(db: Arc<SqlitePool>, config: EventLogConfig, mut rx: mpsc::Receiver<Envelope>) {
    let mut batch: Vec<Envelope> = Vec::with_capacity(config.batch_size);

    while let Some(first) = rx.recv().await {
        batch.push(first);
        let linger_until = Instant::now() + config.batch_timeout;
        while batch.len() < config.batch_size {
            match tokio::time::timeout_at(linger_until, rx.recv()).await {
                Ok(Some(envelope)) => batch.push(envelope),
                Ok(None) | Err(_) => break,
            }
        }
        flush_batch(&db, &config.topic, &mut batch).await;
    }

    debug!(topic = %config.topic, "event log writer stopped");
}

/// Append every still-wanted message of `batch` in one transaction, then
/// acknowledge each caller with its position or the shared failure.
async fn flush_batch(db: &SqlitePool, topic: &str, batch: &mut Vec<Envelope>) {
    let before = batch.len();
    // A closed ack means the caller gave up (cancelled) before the write.
    batch.retain(|envelope| !envelope.ack.is_closed());
    if batch.len() < before {
        debug!(skipped = before - batch.len(), "dropping abandoned messages");
    }
    if batch.is_empty() {
        return;
    }

    match append_batch(db, topic, batch).await {
        Ok(positions) => {
            for (envelope, position) in batch.drain(..).zip(positions) {
                let _ = envelope.ack.send(Ok(position));
            }
        }
        Err(err) => {
            warn!(topic, error = %err, messages = batch.len(), "event log append failed");
            let reason = err.to_string();
            for envelope in batch.drain(..) {
                let _ = envelope
                    .ack
                    .send(Err(PublishError::Backend(reason.clone())));
            }
        }
    }
}

async fn append_batch(
    db: &SqlitePool,
    topic: &str,
    batch: &[Envelope],
) -> Result<Vec<LogPosition>, sqlx::Error> {
    let mut tx = db.begin().await?;
    let mut positions = Vec::with_capacity(batch.len());
    let appended_at = Utc::now();

    for envelope in batch {
        let offset: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(log_offset) + 1, 0)
             FROM event_log WHERE topic = ? AND partition_id = ?",
        )
        .bind(topic)
        .bind(envelope.partition as i64)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO event_log
                (topic, partition_id, log_offset, message_key, payload, headers, appended_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(topic)
        .bind(envelope.partition as i64)
        .bind(offset)
        .bind(&envelope.key[..])
        .bind(&envelope.payload[..])
        .bind(Json(&envelope.headers))
        .bind(appended_at)
        .execute(&mut *tx)
        .await?;

        positions.push(LogPosition {
            partition: envelope.partition,
            offset,
        });
    }

    tx.commit().await?;
    Ok(positions)
}
