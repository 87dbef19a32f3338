//! In-memory stand-ins for the storage writer and event publisher, with
//! call recording plus failure and stall injection.

use crate::{
    models::Metadata,
    services::{
        publisher::{EventPublisher, PublishError, PublishResult},
        storage::{PutBody, StorageError, StorageResult, StorageWriter},
    },
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::io::AsyncReadExt;

/// Shared, ordered record of calls across both fakes.
pub type Journal = Arc<Mutex<Vec<&'static str>>>;

#[derive(Clone, Debug)]
pub struct PutCall {
    pub key: String,
    pub length: u64,
    pub metadata: Metadata,
}

#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    puts: Mutex<Vec<PutCall>>,
    fail: AtomicBool,
    stall: AtomicBool,
    closes: AtomicUsize,
    journal: Journal,
}

impl MemoryStorage {
    pub fn failing(self) -> Self {
        self.fail.store(true, Ordering::SeqCst);
        self
    }

    pub fn stalling(self) -> Self {
        self.stall.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn puts(&self) -> Vec<PutCall> {
        self.puts.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageWriter for MemoryStorage {
    async fn put(
        &self,
        key: &str,
        body: PutBody<'_>,
        length: u64,
        metadata: &Metadata,
    ) -> StorageResult<()> {
        self.journal.lock().unwrap().push("put");
        self.puts.lock().unwrap().push(PutCall {
            key: key.to_string(),
            length,
            metadata: metadata.clone(),
        });

        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected storage failure".into()));
        }

        let mut data = Vec::new();
        body.read_to_end(&mut data).await?;
        let received = data.len() as u64;
        if received < length {
            return Err(StorageError::ShortBody {
                expected: length,
                received,
            });
        }
        if received > length {
            return Err(StorageError::LongBody { expected: length });
        }

        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.journal.lock().unwrap().push("close_storage");
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Published {
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    pub headers: Metadata,
}

#[derive(Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<Published>>,
    fail: AtomicBool,
    stall: AtomicBool,
    fail_close: AtomicBool,
    journal: Journal,
}

impl RecordingPublisher {
    pub fn failing(self) -> Self {
        self.fail.store(true, Ordering::SeqCst);
        self
    }

    pub fn stalling(self) -> Self {
        self.stall.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_close(self) -> Self {
        self.fail_close.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    pub fn messages(&self) -> Vec<Published> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(
        &self,
        key: &[u8],
        payload: Vec<u8>,
        headers: &Metadata,
    ) -> PublishResult<()> {
        self.journal.lock().unwrap().push("publish");
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(PublishError::Backend("injected broker failure".into()));
        }
        self.messages.lock().unwrap().push(Published {
            key: key.to_vec(),
            payload,
            headers: headers.clone(),
        });
        Ok(())
    }

    async fn close(&self, timeout: Duration) -> PublishResult<()> {
        self.journal.lock().unwrap().push("close_publisher");
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(PublishError::FlushTimeout(timeout));
        }
        Ok(())
    }
}
