//! RPC Cache Repository (spec.md §4.4, §4.5): content-addressed cache of
//! upstream RPC responses keyed by `(chain_id, blockContext, requestHash)`.
//! Inserts are conflict-ignore — a race between two handlers warming the
//! same key resolves to whichever write lands first, and both observe the
//! same cached bytes afterward.

use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};

use kyomei_common::error::CoreResult;
use kyomei_common::types::{ChainId, RpcCacheEntry};

use crate::schema::Schema;

/// `requestHash = SHA-256(canonical_json({method, params}))`, hex-encoded.
/// `serde_json::to_string` on a `Value` built from a map preserves key
/// insertion order, so callers must pass `params` already canonicalized
/// (e.g. via `serde_json::to_value` on a struct with a stable field order).
pub fn compute_request_hash(method: &str, params: &serde_json::Value) -> String {
    let canonical = serde_json::json!({ "method": method, "params": params });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

pub struct RpcCacheRepository {
    pool: PgPool,
    schema: Schema,
}

impl RpcCacheRepository {
    pub fn new(pool: PgPool, schema: Schema) -> Self {
        Self { pool, schema }
    }

    pub async fn get(
        &self,
        chain_id: ChainId,
        block_context: u64,
        request_hash: &str,
    ) -> CoreResult<Option<RpcCacheEntry>> {
        let table = self.schema.rpc_cache();
        let sql = format!(
            "SELECT * FROM {table} WHERE chain_id = $1 AND block_number = $2 AND request_hash = $3"
        );
        let row = sqlx::query(&sql)
            .bind(chain_id as i64)
            .bind(block_context as i64)
            .bind(request_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_entry).transpose()
    }

    pub async fn put(&self, entry: &RpcCacheEntry) -> CoreResult<()> {
        let table = self.schema.rpc_cache();
        let sql = format!(
            r#"
            INSERT INTO {table}
                (chain_id, block_number, method, request_hash, params_json, response_json)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (chain_id, block_number, request_hash) DO NOTHING
            "#
        );
        sqlx::query(&sql)
            .bind(entry.chain_id as i64)
            .bind(entry.block_context as i64)
            .bind(&entry.method)
            .bind(&entry.request_hash)
            .bind(&entry.params_json)
            .bind(&entry.response_json)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_entry(row: &sqlx::postgres::PgRow) -> CoreResult<RpcCacheEntry> {
    Ok(RpcCacheEntry {
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        block_context: row.try_get::<i64, _>("block_number")? as u64,
        method: row.try_get("method")?,
        request_hash: row.try_get("request_hash")?,
        params_json: row.try_get("params_json")?,
        response_json: row.try_get("response_json")?,
    })
}
