//! Worker Repository (spec.md §3, §4.6, §4.7): durable per-chain sync and
//! processor progress. All progress advances via conflict-update upserts so
//! a worker loop can call `upsert` on every persist boundary without
//! first checking existence.

use kyomei_common::error::CoreResult;
use kyomei_common::types::{ChainId, ProcessWorker, SyncWorker};
use sqlx::{PgPool, Row};

use crate::schema::Schema;

pub struct SyncWorkerRepository {
    pool: PgPool,
    schema: Schema,
}

impl SyncWorkerRepository {
    pub fn new(pool: PgPool, schema: Schema) -> Self {
        Self { pool, schema }
    }

    pub async fn list_for_chain(&self, chain_id: ChainId) -> CoreResult<Vec<SyncWorker>> {
        let table = self.schema.sync_workers();
        let sql = format!("SELECT * FROM {table} WHERE chain_id = $1 ORDER BY worker_id");
        let rows = sqlx::query(&sql).bind(chain_id as i64).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_sync_worker).collect()
    }

    pub async fn upsert(&self, worker: &SyncWorker) -> CoreResult<()> {
        let table = self.schema.sync_workers();
        let sql = format!(
            r#"
            INSERT INTO {table}
                (chain_id, worker_id, range_start, range_end, current_block, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (chain_id, worker_id) DO UPDATE SET
                current_block = EXCLUDED.current_block,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            "#
        );
        sqlx::query(&sql)
            .bind(worker.chain_id as i64)
            .bind(worker.worker_id as i32)
            .bind(worker.range_start as i64)
            .bind(worker.range_end.map(|v| v as i64))
            .bind(worker.current_block as i64)
            .bind(worker.status)
            .bind(worker.created_at)
            .bind(worker.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, chain_id: ChainId, worker_id: u32) -> CoreResult<()> {
        let table = self.schema.sync_workers();
        let sql = format!("DELETE FROM {table} WHERE chain_id = $1 AND worker_id = $2");
        sqlx::query(&sql)
            .bind(chain_id as i64)
            .bind(worker_id as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes every SyncWorker for a chain — the config-drift reset path
    /// (spec.md §4.6 phase 2).
    pub async fn delete_all_for_chain(&self, chain_id: ChainId) -> CoreResult<()> {
        let table = self.schema.sync_workers();
        let sql = format!("DELETE FROM {table} WHERE chain_id = $1");
        sqlx::query(&sql).bind(chain_id as i64).execute(&self.pool).await?;
        Ok(())
    }
}

pub struct ProcessWorkerRepository {
    pool: PgPool,
    schema: Schema,
}

impl ProcessWorkerRepository {
    pub fn new(pool: PgPool, schema: Schema) -> Self {
        Self { pool, schema }
    }

    pub async fn get(&self, chain_id: ChainId) -> CoreResult<Option<ProcessWorker>> {
        let table = self.schema.process_workers();
        let sql = format!("SELECT * FROM {table} WHERE chain_id = $1");
        let row = sqlx::query(&sql).bind(chain_id as i64).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_process_worker).transpose()
    }

    pub async fn upsert(&self, worker: &ProcessWorker) -> CoreResult<()> {
        let table = self.schema.process_workers();
        let sql = format!(
            r#"
            INSERT INTO {table}
                (chain_id, range_start, range_end, current_block, events_processed, status, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (chain_id) DO UPDATE SET
                current_block = EXCLUDED.current_block,
                events_processed = EXCLUDED.events_processed,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            "#
        );
        sqlx::query(&sql)
            .bind(worker.chain_id as i64)
            .bind(worker.range_start as i64)
            .bind(worker.range_end.map(|v| v as i64))
            .bind(worker.current_block as i64)
            .bind(worker.events_processed as i64)
            .bind(worker.status)
            .bind(worker.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_sync_worker(row: &sqlx::postgres::PgRow) -> CoreResult<SyncWorker> {
    Ok(SyncWorker {
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        worker_id: row.try_get::<i32, _>("worker_id")? as u32,
        range_start: row.try_get::<i64, _>("range_start")? as u64,
        range_end: row.try_get::<Option<i64>, _>("range_end")?.map(|v| v as u64),
        current_block: row.try_get::<i64, _>("current_block")? as u64,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_process_worker(row: &sqlx::postgres::PgRow) -> CoreResult<ProcessWorker> {
    Ok(ProcessWorker {
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        range_start: row.try_get::<i64, _>("range_start")? as u64,
        range_end: row.try_get::<Option<i64>, _>("range_end")?.map(|v| v as u64),
        current_block: row.try_get::<i64, _>("current_block")? as u64,
        events_processed: row.try_get::<i64, _>("events_processed")? as u64,
        status: row.try_get("status")?,
        updated_at: row.try_get("updated_at")?,
    })
}
