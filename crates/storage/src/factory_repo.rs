//! Factory Repository (spec.md §4.3): persisted map from factory parent to
//! dynamically discovered child addresses. Inserts are conflict-ignore on
//! `(chain_id, child_address)` so re-scanning an already-seen block never
//! duplicates or overwrites a child.

use kyomei_common::error::CoreResult;
use kyomei_common::types::{ChainId, FactoryChild};
use sqlx::{PgPool, Row};

use crate::schema::Schema;

pub struct FactoryRepository {
    pool: PgPool,
    schema: Schema,
}

impl FactoryRepository {
    pub fn new(pool: PgPool, schema: Schema) -> Self {
        Self { pool, schema }
    }

    pub async fn insert(&self, child: &FactoryChild) -> CoreResult<bool> {
        let table = self.schema.factory_children();
        let sql = format!(
            r#"
            INSERT INTO {table}
                (chain_id, factory_address, child_address, contract_name,
                 creation_block, creation_tx_hash, creation_log_index, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (chain_id, child_address) DO NOTHING
            "#
        );
        let result = sqlx::query(&sql)
            .bind(child.chain_id as i64)
            .bind(&child.factory_address)
            .bind(&child.child_address)
            .bind(&child.contract_name)
            .bind(child.creation_block as i64)
            .bind(&child.creation_tx_hash)
            .bind(child.creation_log_index as i64)
            .bind(&child.metadata)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All children discovered for a chain, across every factory parent.
    pub async fn list_for_chain(&self, chain_id: ChainId) -> CoreResult<Vec<FactoryChild>> {
        let table = self.schema.factory_children();
        let sql = format!("SELECT * FROM {table} WHERE chain_id = $1 ORDER BY creation_block");
        let rows = sqlx::query(&sql).bind(chain_id as i64).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_child).collect()
    }

    /// Reorg primitive: children minted at or after `from` lose
    /// discoverability until their creation blocks are re-synced.
    pub async fn delete_children_from(&self, chain_id: ChainId, from: u64) -> CoreResult<u64> {
        let table = self.schema.factory_children();
        let sql = format!("DELETE FROM {table} WHERE chain_id = $1 AND creation_block >= $2");
        let result = sqlx::query(&sql)
            .bind(chain_id as i64)
            .bind(from as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_child(row: &sqlx::postgres::PgRow) -> CoreResult<FactoryChild> {
    Ok(FactoryChild {
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        factory_address: row.try_get("factory_address")?,
        child_address: row.try_get("child_address")?,
        contract_name: row.try_get("contract_name")?,
        creation_block: row.try_get::<i64, _>("creation_block")? as u64,
        creation_tx_hash: row.try_get("creation_tx_hash")?,
        creation_log_index: row.try_get::<i64, _>("creation_log_index")? as u64,
        metadata: row.try_get("metadata")?,
    })
}
