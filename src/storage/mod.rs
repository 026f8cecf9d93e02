pub mod json;
pub mod memory;

use std::fmt::Debug;
use std::hash::Hash;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::models::Job;

pub use json::JsonRepository;
pub use memory::InMemoryRepository;

/// A persisted record addressable by id.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type Id: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn record_id(&self) -> Self::Id;
}

impl Record for Job {
    type Id = Uuid;

    fn record_id(&self) -> Uuid {
        self.id
    }
}

/// Durable keyed collection. Every write is all-or-nothing.
#[async_trait]
pub trait Repository<R: Record>: Send + Sync {
    async fn load_all(&self) -> Result<Vec<R>>;
    async fn put(&self, record: &R) -> Result<()>;
    async fn delete(&self, ids: &[R::Id]) -> Result<()>;
}

pub type JobRepository = dyn Repository<Job>;
