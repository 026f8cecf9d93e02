use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Record, Repository};

/// Non-durable repository for `--ephemeral` mode and tests.
pub struct InMemoryRepository<R> {
    records: RwLock<Vec<R>>,
    fail_writes: AtomicBool,
}

impl<R: Record> InMemoryRepository<R> {
    pub fn new() -> Self {
        Self::with_records(Vec::new())
    }

    pub fn with_records(records: Vec<R>) -> Self {
        Self {
            records: RwLock::new(records),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail, simulating a storage outage.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("storage unavailable");
        }
        Ok(())
    }
}

impl<R: Record> Default for InMemoryRepository<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: Record> Repository<R> for InMemoryRepository<R> {
    async fn load_all(&self) -> Result<Vec<R>> {
        Ok(self.records.read().await.clone())
    }

    async fn put(&self, record: &R) -> Result<()> {
        self.check_writable()?;
        let mut records = self.records.write().await;
        match records
            .iter_mut()
            .find(|r| r.record_id() == record.record_id())
        {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        Ok(())
    }

    async fn delete(&self, ids: &[R::Id]) -> Result<()> {
        self.check_writable()?;
        self.records
            .write()
            .await
            .retain(|r| !ids.contains(&r.record_id()));
        Ok(())
    }
}
