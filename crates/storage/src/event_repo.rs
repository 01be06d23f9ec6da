//! Event Repository (spec.md §4.5): append-only store of raw logs, keyed by
//! `(chain_id, block_number, tx_index, log_index)`. All writes are
//! conflict-ignore on that identity key so replaying the same batch after a
//! crash is a no-op rather than a duplicate.

use kyomei_common::error::CoreResult;
use kyomei_common::types::{ChainId, RawEvent};
use sqlx::{PgPool, Row};

use crate::schema::Schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// One contiguous, inclusive block span with no stored events — surfaced by
/// `get_gaps` for integrity checks, never consulted on the normal path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGap {
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub addresses: Option<Vec<String>>,
    /// Restrict to logs whose topic0 is one of these selectors — pushes the
    /// handler-relevance filter into the database (spec.md §4.7).
    pub selectors: Option<Vec<String>>,
    pub block_range: Option<(u64, u64)>,
    pub order: SortOrder,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl EventQuery {
    pub fn new() -> Self {
        Self {
            order: SortOrder::Ascending,
            ..Default::default()
        }
    }
}

impl Default for SortOrder {
    fn default() -> Self {
        SortOrder::Ascending
    }
}

pub struct EventRepository {
    pool: PgPool,
    schema: Schema,
    sub_batch_size: usize,
}

impl EventRepository {
    pub fn new(pool: PgPool, schema: Schema) -> Self {
        Self {
            pool,
            schema,
            sub_batch_size: 10_000,
        }
    }

    pub fn with_sub_batch_size(mut self, size: usize) -> Self {
        self.sub_batch_size = size.max(1);
        self
    }

    /// Insert events in a single transaction, chunked into sub-batches.
    /// Idempotent: conflicting identities are silently ignored.
    pub async fn insert_batch(&self, events: &[RawEvent]) -> CoreResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let table = self.schema.raw_events();
        let mut tx = self.pool.begin().await?;

        for chunk in events.chunks(self.sub_batch_size) {
            for event in chunk {
                let sql = format!(
                    r#"
                    INSERT INTO {table}
                        (chain_id, block_number, block_hash, block_timestamp, tx_hash,
                         tx_index, log_index, address, topic0, topic1, topic2, topic3, data)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                    ON CONFLICT (chain_id, block_number, tx_index, log_index) DO NOTHING
                    "#
                );
                sqlx::query(&sql)
                    .bind(event.chain_id as i64)
                    .bind(event.block_number as i64)
                    .bind(&event.block_hash)
                    .bind(event.block_timestamp)
                    .bind(&event.tx_hash)
                    .bind(event.tx_index as i64)
                    .bind(event.log_index as i64)
                    .bind(&event.address)
                    .bind(&event.topic0)
                    .bind(&event.topic1)
                    .bind(&event.topic2)
                    .bind(&event.topic3)
                    .bind(&event.data)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn query(&self, chain_id: ChainId, filter: &EventQuery) -> CoreResult<Vec<RawEvent>> {
        let table = self.schema.raw_events();
        let mut sql = format!("SELECT * FROM {table} WHERE chain_id = $1");
        let mut next_param = 2;

        let has_range = filter.block_range.is_some();
        if has_range {
            sql.push_str(&format!(" AND block_number BETWEEN ${next_param} AND ${}", next_param + 1));
            next_param += 2;
        }
        let has_addresses = filter.addresses.as_ref().is_some_and(|a| !a.is_empty());
        if has_addresses {
            sql.push_str(&format!(" AND address = ANY(${next_param})"));
            next_param += 1;
        }
        let has_selectors = filter.selectors.as_ref().is_some_and(|s| !s.is_empty());
        if has_selectors {
            sql.push_str(&format!(" AND topic0 = ANY(${next_param})"));
        }

        let order = match filter.order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        sql.push_str(&format!(" ORDER BY block_number {order}, tx_index {order}, log_index {order}"));
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = filter.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        let mut query = sqlx::query(&sql).bind(chain_id as i64);
        if has_range {
            let (from, to) = filter.block_range.unwrap();
            query = query.bind(from as i64).bind(to as i64);
        }
        if has_addresses {
            query = query.bind(filter.addresses.clone().unwrap());
        }
        if has_selectors {
            query = query.bind(filter.selectors.clone().unwrap());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    pub async fn get_by_block(&self, chain_id: ChainId, block: u64) -> CoreResult<Vec<RawEvent>> {
        let filter = EventQuery {
            block_range: Some((block, block)),
            order: SortOrder::Ascending,
            ..EventQuery::new()
        };
        self.query(chain_id, &filter).await
    }

    pub async fn has_block(&self, chain_id: ChainId, block: u64) -> CoreResult<bool> {
        let table = self.schema.raw_events();
        let sql = format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE chain_id = $1 AND block_number = $2)");
        let row = sqlx::query(&sql)
            .bind(chain_id as i64)
            .bind(block as i64)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<bool, _>(0)?)
    }

    pub async fn latest_block(&self, chain_id: ChainId) -> CoreResult<Option<u64>> {
        let table = self.schema.raw_events();
        let sql = format!("SELECT MAX(block_number) FROM {table} WHERE chain_id = $1");
        let row = sqlx::query(&sql).bind(chain_id as i64).fetch_one(&self.pool).await?;
        Ok(row.try_get::<Option<i64>, _>(0)?.map(|v| v as u64))
    }

    pub async fn earliest_block(&self, chain_id: ChainId) -> CoreResult<Option<u64>> {
        let table = self.schema.raw_events();
        let sql = format!("SELECT MIN(block_number) FROM {table} WHERE chain_id = $1");
        let row = sqlx::query(&sql).bind(chain_id as i64).fetch_one(&self.pool).await?;
        Ok(row.try_get::<Option<i64>, _>(0)?.map(|v| v as u64))
    }

    pub async fn count(&self, chain_id: ChainId) -> CoreResult<u64> {
        let table = self.schema.raw_events();
        let sql = format!("SELECT COUNT(*) FROM {table} WHERE chain_id = $1");
        let row = sqlx::query(&sql).bind(chain_id as i64).fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>(0)? as u64)
    }

    /// Blocks in `[from, to]` with zero stored events. Used for integrity
    /// checks, not the normal sync path — intentionally O(range) via a
    /// generate_series anti-join rather than an index-accelerated query.
    pub async fn get_gaps(&self, chain_id: ChainId, from: u64, to: u64) -> CoreResult<Vec<BlockGap>> {
        let table = self.schema.raw_events();
        let sql = format!(
            r#"
            SELECT gs AS block_number
            FROM generate_series($2::bigint, $3::bigint) AS gs
            WHERE NOT EXISTS (
                SELECT 1 FROM {table} e WHERE e.chain_id = $1 AND e.block_number = gs
            )
            ORDER BY gs
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(chain_id as i64)
            .bind(from as i64)
            .bind(to as i64)
            .fetch_all(&self.pool)
            .await?;

        let missing: Vec<u64> = rows
            .iter()
            .map(|r| r.try_get::<i64, _>(0).map(|v| v as u64))
            .collect::<Result<_, _>>()?;

        Ok(coalesce_into_gaps(missing))
    }

    /// Reorg primitive: delete every event at or above `from` (or in
    /// `[from, to]` when `to` is given).
    pub async fn delete_range(&self, chain_id: ChainId, from: u64, to: Option<u64>) -> CoreResult<u64> {
        let table = self.schema.raw_events();
        let sql = match to {
            Some(_) => format!("DELETE FROM {table} WHERE chain_id = $1 AND block_number BETWEEN $2 AND $3"),
            None => format!("DELETE FROM {table} WHERE chain_id = $1 AND block_number >= $2"),
        };
        let mut query = sqlx::query(&sql).bind(chain_id as i64).bind(from as i64);
        if let Some(to) = to {
            query = query.bind(to as i64);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

fn coalesce_into_gaps(missing_blocks: Vec<u64>) -> Vec<BlockGap> {
    let mut gaps = Vec::new();
    let mut iter = missing_blocks.into_iter();
    let Some(first) = iter.next() else {
        return gaps;
    };
    let mut start = first;
    let mut end = first;
    for block in iter {
        if block == end + 1 {
            end = block;
        } else {
            gaps.push(BlockGap { from: start, to: end });
            start = block;
            end = block;
        }
    }
    gaps.push(BlockGap { from: start, to: end });
    gaps
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> CoreResult<RawEvent> {
    Ok(RawEvent {
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        block_hash: row.try_get("block_hash")?,
        block_timestamp: row.try_get("block_timestamp")?,
        tx_hash: row.try_get("tx_hash")?,
        tx_index: row.try_get::<i64, _>("tx_index")? as u64,
        log_index: row.try_get::<i64, _>("log_index")? as u64,
        address: row.try_get("address")?,
        topic0: row.try_get("topic0")?,
        topic1: row.try_get("topic1")?,
        topic2: row.try_get("topic2")?,
        topic3: row.try_get("topic3")?,
        data: row.try_get("data")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_contiguous_gaps() {
        let gaps = coalesce_into_gaps(vec![5, 6, 7, 10, 11, 20]);
        assert_eq!(
            gaps,
            vec![
                BlockGap { from: 5, to: 7 },
                BlockGap { from: 10, to: 11 },
                BlockGap { from: 20, to: 20 },
            ]
        );
    }

    #[test]
    fn empty_missing_blocks_has_no_gaps() {
        assert!(coalesce_into_gaps(vec![]).is_empty());
    }

    #[test]
    fn single_missing_block_is_one_gap() {
        let gaps = coalesce_into_gaps(vec![42]);
        assert_eq!(gaps, vec![BlockGap { from: 42, to: 42 }]);
    }
}
