use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::memory::MemoryStore;
use crate::store::CheckpointStore;

/// Store wrapper for deterministic tests: records every write and can be
/// told to reject the next N reads or writes, or to hang.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    writes: Mutex<Vec<(String, String)>>,
    reads: AtomicU32,
    failing_writes: AtomicU32,
    failing_reads: AtomicU32,
    stalled_writes: AtomicBool,
    stalled_reads: AtomicBool,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(key: &str, value: &str) -> Self {
        Self {
            inner: MemoryStore::with_entry(key, value),
            ..Self::default()
        }
    }

    /// Reject the next `n` writes.
    pub fn fail_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Reject the next `n` reads.
    pub fn fail_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Make every write (`true`) or none (`false`) hang forever.
    pub fn stall_writes(&self, stalled: bool) {
        self.stalled_writes.store(stalled, Ordering::SeqCst);
    }

    /// Make every read (`true`) or none (`false`) hang forever.
    pub fn stall_reads(&self, stalled: bool) {
        self.stalled_reads.store(stalled, Ordering::SeqCst);
    }

    /// Successful writes in order.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    /// Read attempts, including rejected ones.
    pub fn read_count(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CheckpointStore for RecordingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _ = self.reads.fetch_add(1, Ordering::SeqCst);
        if self.stalled_reads.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if Self::take_failure(&self.failing_reads) {
            return Err(StoreError::Unavailable("scripted read failure".into()));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if self.stalled_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if Self::take_failure(&self.failing_writes) {
            return Err(StoreError::Unavailable("scripted write failure".into()));
        }
        self.inner.set(key, value).await?;
        self.writes.lock().push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}
