use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Record, Repository};

/// Repository backed by a single JSON file holding every record.
pub struct JsonRepository<R> {
    file_path: PathBuf,
    cache: RwLock<Vec<R>>,
}

impl<R: Record> JsonRepository<R> {
    /// Open `{data_dir}/{file_name}`, loading existing records if present.
    ///
    /// A corrupted file is copied to `{file_name}.bak` and the repository
    /// starts empty.
    pub async fn open(data_dir: &Path, file_name: &str) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .context("Failed to create data directory")?;

        let file_path = data_dir.join(file_name);

        let records = if file_path.exists() {
            let content = tokio::fs::read_to_string(&file_path)
                .await
                .with_context(|| format!("Failed to read {}", file_name))?;
            match serde_json::from_str::<Vec<R>>(&content) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(
                        "{} is corrupted ({}), creating backup and starting empty",
                        file_name,
                        e
                    );
                    let backup_path = data_dir.join(format!("{}.bak", file_name));
                    if let Err(backup_err) = tokio::fs::copy(&file_path, &backup_path).await {
                        tracing::error!(
                            "Failed to create backup of corrupted {}: {}",
                            file_name,
                            backup_err
                        );
                    }
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        tracing::debug!(
            "Loaded {} records from {}",
            records.len(),
            file_path.display()
        );

        Ok(Self {
            file_path,
            cache: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Write to a .tmp file first, then rename over the real file.
    async fn persist(&self, records: &[R]) -> Result<()> {
        let tmp_path = self.file_path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(records).context("Failed to serialize records")?;

        tokio::fs::write(&tmp_path, json.as_bytes())
            .await
            .context("Failed to write temporary records file")?;

        tokio::fs::rename(&tmp_path, &self.file_path)
            .await
            .context("Failed to rename temporary records file")?;

        Ok(())
    }
}

#[async_trait]
impl<R: Record> Repository<R> for JsonRepository<R> {
    async fn load_all(&self) -> Result<Vec<R>> {
        Ok(self.cache.read().await.clone())
    }

    async fn put(&self, record: &R) -> Result<()> {
        let mut cache = self.cache.write().await;

        let mut next = cache.clone();
        match next.iter_mut().find(|r| r.record_id() == record.record_id()) {
            Some(existing) => *existing = record.clone(),
            None => next.push(record.clone()),
        }

        self.persist(&next).await?;
        *cache = next;
        Ok(())
    }

    async fn delete(&self, ids: &[R::Id]) -> Result<()> {
        let mut cache = self.cache.write().await;

        let next: Vec<R> = cache
            .iter()
            .filter(|r| !ids.contains(&r.record_id()))
            .cloned()
            .collect();
        if next.len() == cache.len() {
            return Ok(());
        }

        self.persist(&next).await?;
        *cache = next;
        Ok(())
    }
}
