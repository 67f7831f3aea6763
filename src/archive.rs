use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::db::{self, Pool};
use crate::model::ProcessingRecord;

/// Durable store for every classified record, published or not.
///
/// Storing the same record twice must leave the store unchanged.
#[async_trait]
pub trait Archive: Send + Sync {
    async fn store(&self, records: &[ProcessingRecord]) -> Result<usize>;
}

/// Archive backed by the `archived_items` table, partitioned by creation year.
#[derive(Debug, Clone)]
pub struct SqliteArchive {
    pool: Pool,
}

impl SqliteArchive {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Archive for SqliteArchive {
    async fn store(&self, records: &[ProcessingRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let stored = db::upsert_archived_items(&self.pool, records).await?;
        info!(stored, "archived records");
        Ok(stored)
    }
}
