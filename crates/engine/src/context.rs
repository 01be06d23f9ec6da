//! Handler context: the application-schema DB façade and the block-pinned
//! RPC façade a handler receives for every event (spec.md §4.7 "Handler
//! context"). Handlers are registered at runtime against an application
//! schema this workspace doesn't know ahead of time — unlike a fixed set of
//! known tables reachable through compile-time `sqlx::query!` calls — so
//! the façade resolves columns from `information_schema` instead.

use std::collections::HashMap;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use kyomei_common::error::{CoreError, CoreResult};
use kyomei_common::types::DecodedEvent;
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::str::FromStr;

use crate::cached_rpc::{CachedRpc, json_to_bigint};

#[derive(Debug, Clone)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub primary_key: Vec<String>,
}

impl TableDescriptor {
    fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Table/column metadata loaded once at startup, so `insert("table")` can
/// resolve column types without a generated descriptor per table.
#[derive(Debug, Clone, Default)]
pub struct TableCatalog {
    tables: HashMap<String, TableDescriptor>,
}

impl TableCatalog {
    pub async fn load(pool: &PgPool, schema_name: &str) -> CoreResult<Self> {
        let rows = sqlx::query(
            r#"
            SELECT c.table_name, c.column_name, c.data_type, c.is_nullable,
                   (kcu.column_name IS NOT NULL) AS is_primary_key
            FROM information_schema.columns c
            LEFT JOIN information_schema.table_constraints tc
                ON tc.table_schema = c.table_schema
               AND tc.table_name = c.table_name
               AND tc.constraint_type = 'PRIMARY KEY'
            LEFT JOIN information_schema.key_column_usage kcu
                ON kcu.constraint_name = tc.constraint_name
               AND kcu.table_schema = tc.table_schema
               AND kcu.table_name = tc.table_name
               AND kcu.column_name = c.column_name
            WHERE c.table_schema = $1
            ORDER BY c.table_name, c.ordinal_position
            "#,
        )
        .bind(schema_name)
        .fetch_all(pool)
        .await?;

        let mut tables: HashMap<String, TableDescriptor> = HashMap::new();
        for row in &rows {
            let table_name: String = row.try_get("table_name")?;
            let column = ColumnDescriptor {
                name: row.try_get("column_name")?,
                data_type: row.try_get("data_type")?,
                nullable: row.try_get::<String, _>("is_nullable")? == "YES",
            };
            let is_pk: bool = row.try_get("is_primary_key")?;

            let entry = tables.entry(table_name.clone()).or_insert_with(|| TableDescriptor {
                name: table_name.clone(),
                columns: Vec::new(),
                primary_key: Vec::new(),
            });
            if is_pk {
                entry.primary_key.push(column.name.clone());
            }
            entry.columns.push(column);
        }

        Ok(Self { tables })
    }

    pub fn table(&self, name: &str) -> CoreResult<&TableDescriptor> {
        self.tables
            .get(name)
            .ok_or_else(|| CoreError::Config(format!("unknown application table {name:?}")))
    }
}

type RowMap = HashMap<String, Value>;

/// Dynamic façade over the application schema (spec.md §4.7's DB façade:
/// `insert`, `update`, `delete`, `find`, `get`).
#[derive(Clone)]
pub struct DbFacade {
    pool: PgPool,
    schema_name: String,
    catalog: Arc<TableCatalog>,
}

impl DbFacade {
    pub fn new(pool: PgPool, schema_name: impl Into<String>, catalog: Arc<TableCatalog>) -> Self {
        Self {
            pool,
            schema_name: schema_name.into(),
            catalog,
        }
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", self.schema_name, table)
    }

    pub fn insert(&self, table: &str) -> InsertBuilder {
        InsertBuilder {
            db: self.clone(),
            table: table.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn update(&self, table: &str) -> UpdateBuilder {
        UpdateBuilder {
            db: self.clone(),
            table: table.to_string(),
            fields: HashMap::new(),
            condition: Condition::default(),
        }
    }

    pub fn delete(&self, table: &str) -> DeleteBuilder {
        DeleteBuilder {
            db: self.clone(),
            table: table.to_string(),
            condition: Condition::default(),
        }
    }

    pub fn find(&self, table: &str) -> FindBuilder {
        FindBuilder {
            db: self.clone(),
            table: table.to_string(),
            condition: Condition::default(),
        }
    }

    pub async fn get(&self, table: &str, id: impl Into<Value>) -> CoreResult<Option<RowMap>> {
        let descriptor = self.catalog.table(table)?;
        let pk = descriptor
            .primary_key
            .first()
            .ok_or_else(|| CoreError::Config(format!("table {table} has no primary key")))?;
        self.find(table).where_eq(pk, id).one().await
    }
}

#[derive(Debug, Clone, Default)]
pub struct Condition(Vec<(String, Value)>);

impl Condition {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition(vec![(column.into(), value.into())])
    }

    pub fn and(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.push((column.into(), value.into()));
        self
    }
}

pub struct InsertBuilder {
    db: DbFacade,
    table: String,
    rows: Vec<RowMap>,
}

impl InsertBuilder {
    pub fn values(mut self, row: RowMap) -> Self {
        self.rows.push(row);
        self
    }

    pub fn values_many(mut self, rows: Vec<RowMap>) -> Self {
        self.rows.extend(rows);
        self
    }

    /// Conflict-ignore on the table's primary key, matching the Event
    /// Repository's idempotent-insert contract (spec.md §4.7: "insert
    /// operations conflict-ignore on primary key").
    pub async fn execute(self) -> CoreResult<u64> {
        if self.rows.is_empty() {
            return Ok(0);
        }
        let descriptor = self.db.catalog.table(&self.table)?;
        let qualified = self.db.qualified(&self.table);
        let mut affected = 0u64;

        for row in &self.rows {
            let columns: Vec<&String> = row.keys().collect();
            let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
            let conflict_cols = descriptor.primary_key.join(", ");
            let sql = format!(
                "INSERT INTO {qualified} ({}) VALUES ({}) ON CONFLICT ({conflict_cols}) DO NOTHING",
                columns
                    .iter()
                    .map(|c| c.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                placeholders.join(", ")
            );
            let mut query = sqlx::query(&sql);
            for column in &columns {
                let data_type = descriptor
                    .column(column)
                    .map(|c| c.data_type.as_str())
                    .unwrap_or("text");
                query = bind_dyn(query, data_type, &row[*column]);
            }
            let result = query.execute(&self.db.pool).await?;
            affected += result.rows_affected();
        }
        Ok(affected)
    }
}

pub struct UpdateBuilder {
    db: DbFacade,
    table: String,
    fields: HashMap<String, Value>,
    condition: Condition,
}

impl UpdateBuilder {
    pub fn set(mut self, fields: RowMap) -> Self {
        self.fields = fields;
        self
    }

    pub fn where_(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub async fn execute(self) -> CoreResult<u64> {
        if self.fields.is_empty() {
            return Ok(0);
        }
        let descriptor = self.db.catalog.table(&self.table)?;
        let qualified = self.db.qualified(&self.table);
        let columns: Vec<&String> = self.fields.keys().collect();
        let mut next_param = 1;
        let assignments: Vec<String> = columns
            .iter()
            .map(|c| {
                let clause = format!("{c} = ${next_param}");
                next_param += 1;
                clause
            })
            .collect();
        let where_clause = build_where(&self.condition, &mut next_param);

        let sql = format!("UPDATE {qualified} SET {} {where_clause}", assignments.join(", "));
        let mut query = sqlx::query(&sql);
        for column in &columns {
            let data_type = descriptor
                .column(column)
                .map(|c| c.data_type.as_str())
                .unwrap_or("text");
            query = bind_dyn(query, data_type, &self.fields[*column]);
        }
        for (column, value) in &self.condition.0 {
            let data_type = descriptor
                .column(column)
                .map(|c| c.data_type.as_str())
                .unwrap_or("text");
            query = bind_dyn(query, data_type, value);
        }
        let result = query.execute(&self.db.pool).await?;
        Ok(result.rows_affected())
    }
}

pub struct DeleteBuilder {
    db: DbFacade,
    table: String,
    condition: Condition,
}

impl DeleteBuilder {
    pub fn where_(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub async fn execute(self) -> CoreResult<u64> {
        let descriptor = self.db.catalog.table(&self.table)?;
        let qualified = self.db.qualified(&self.table);
        let mut next_param = 1;
        let where_clause = build_where(&self.condition, &mut next_param);
        let sql = format!("DELETE FROM {qualified} {where_clause}");
        let mut query = sqlx::query(&sql);
        for (column, value) in &self.condition.0 {
            let data_type = descriptor
                .column(column)
                .map(|c| c.data_type.as_str())
                .unwrap_or("text");
            query = bind_dyn(query, data_type, value);
        }
        let result = query.execute(&self.db.pool).await?;
        Ok(result.rows_affected())
    }
}

pub struct FindBuilder {
    db: DbFacade,
    table: String,
    condition: Condition,
}

impl FindBuilder {
    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.condition = self.condition.and(column, value);
        self
    }

    pub fn where_(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub async fn one(self) -> CoreResult<Option<RowMap>> {
        Ok(self.many().await?.into_iter().next())
    }

    pub async fn many(self) -> CoreResult<Vec<RowMap>> {
        let descriptor = self.db.catalog.table(&self.table)?;
        let qualified = self.db.qualified(&self.table);
        let mut next_param = 1;
        let where_clause = build_where(&self.condition, &mut next_param);
        let sql = format!("SELECT * FROM {qualified} {where_clause}");
        let mut query = sqlx::query(&sql);
        for (column, value) in &self.condition.0 {
            let data_type = descriptor
                .column(column)
                .map(|c| c.data_type.as_str())
                .unwrap_or("text");
            query = bind_dyn(query, data_type, value);
        }
        let rows = query.fetch_all(&self.db.pool).await?;
        rows.iter().map(|r| row_to_map(r, descriptor)).collect()
    }
}

fn build_where(condition: &Condition, next_param: &mut i32) -> String {
    if condition.0.is_empty() {
        return String::new();
    }
    let clauses: Vec<String> = condition
        .0
        .iter()
        .map(|(column, _)| {
            let clause = format!("{column} = ${next_param}");
            *next_param += 1;
            clause
        })
        .collect();
    format!("WHERE {}", clauses.join(" AND "))
}

fn bind_dyn<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    data_type: &str,
    value: &'q Value,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    if value.is_null() {
        return query.bind(None::<String>);
    }
    match data_type {
        "bigint" | "integer" | "smallint" => query.bind(value.as_i64()),
        "boolean" => query.bind(value.as_bool()),
        "double precision" | "real" => query.bind(value.as_f64()),
        "numeric" => {
            let decimal = json_to_bigint(value)
                .or_else(|| value.as_str().map(str::to_string))
                .or_else(|| value.as_f64().map(|f| f.to_string()));
            query.bind(decimal.and_then(|d| BigDecimal::from_str(&d).ok()))
        }
        "timestamp with time zone" | "timestamp without time zone" => {
            let parsed = value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc));
            query.bind(parsed)
        }
        "json" | "jsonb" => query.bind(value.clone()),
        _ => query.bind(value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string())),
    }
}

fn row_to_map(row: &sqlx::postgres::PgRow, descriptor: &TableDescriptor) -> CoreResult<RowMap> {
    let mut map = HashMap::new();
    for column in &descriptor.columns {
        let value = match column.data_type.as_str() {
            "bigint" | "integer" | "smallint" => row
                .try_get::<Option<i64>, _>(column.name.as_str())?
                .map(Value::from)
                .unwrap_or(Value::Null),
            "boolean" => row
                .try_get::<Option<bool>, _>(column.name.as_str())?
                .map(Value::from)
                .unwrap_or(Value::Null),
            "double precision" | "real" => row
                .try_get::<Option<f64>, _>(column.name.as_str())?
                .map(Value::from)
                .unwrap_or(Value::Null),
            "numeric" => row
                .try_get::<Option<BigDecimal>, _>(column.name.as_str())?
                .map(|d| Value::from(d.to_string()))
                .unwrap_or(Value::Null),
            "timestamp with time zone" | "timestamp without time zone" => row
                .try_get::<Option<DateTime<Utc>>, _>(column.name.as_str())?
                .map(|d| Value::from(d.to_rfc3339()))
                .unwrap_or(Value::Null),
            "json" | "jsonb" => row
                .try_get::<Option<Value>, _>(column.name.as_str())?
                .unwrap_or(Value::Null),
            _ => row
                .try_get::<Option<String>, _>(column.name.as_str())?
                .map(Value::from)
                .unwrap_or(Value::Null),
        };
        map.insert(column.name.clone(), value);
    }
    Ok(map)
}

/// RPC façade bound to the block of the event currently being handled. The
/// block travels with this façade value rather than through shared mutable
/// state on `CachedRpc`, so concurrent handler invocations sharing one
/// `CachedRpc` never observe each other's block context.
#[derive(Clone)]
pub struct RpcFacade {
    rpc: Arc<CachedRpc>,
    block: u64,
}

impl RpcFacade {
    pub fn for_block(rpc: Arc<CachedRpc>, block: u64) -> Self {
        Self { rpc, block }
    }

    pub async fn latest_block(&self) -> CoreResult<u64> {
        self.rpc.latest_block().await
    }

    pub async fn finalized_block(&self) -> CoreResult<u64> {
        self.rpc.finalized_block().await
    }

    pub async fn get_block(&self, number: u64) -> CoreResult<Value> {
        self.rpc.get_block(self.block, number).await
    }

    pub async fn get_block_by_hash(&self, hash: &str) -> CoreResult<Value> {
        self.rpc.get_block_by_hash(self.block, hash).await
    }

    pub async fn get_logs(&self, filter: Value) -> CoreResult<Value> {
        self.rpc.get_logs(self.block, filter).await
    }

    pub async fn get_transaction(&self, hash: &str) -> CoreResult<Value> {
        self.rpc.get_transaction(self.block, hash).await
    }

    pub async fn get_receipt(&self, hash: &str) -> CoreResult<Value> {
        self.rpc.get_receipt(self.block, hash).await
    }

    pub async fn get_balance(&self, address: &str) -> CoreResult<Value> {
        self.rpc.get_balance(self.block, address).await
    }

    pub async fn eth_call(&self, call: Value) -> CoreResult<Value> {
        self.rpc.eth_call(self.block, call).await
    }

    pub async fn call(&self, method: &str, params: Value) -> CoreResult<Value> {
        self.rpc.call(self.block, method, params).await
    }

    pub async fn call_batch(&self, calls: Vec<(String, Value)>) -> CoreResult<Vec<Value>> {
        self.rpc.call_batch(self.block, calls).await
    }
}

/// Everything a handler sees for one decoded event (spec.md §4.7 "Handler
/// context"). Transaction `from`/`to` aren't surfaced by the Block Source
/// contract — handlers that need them fetch via `rpc.get_transaction`.
#[derive(Clone)]
pub struct HandlerContext {
    pub event: DecodedEvent,
    pub db: DbFacade,
    pub rpc: RpcFacade,
}

impl HandlerContext {
    pub fn new(event: DecodedEvent, db: DbFacade, rpc: RpcFacade) -> Self {
        Self { event, db, rpc }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_builder_accumulates_clauses() {
        let cond = Condition::eq("chain_id", 1).and("address", "0xabc");
        assert_eq!(cond.0.len(), 2);
    }

    #[test]
    fn build_where_renders_parameter_placeholders() {
        let cond = Condition::eq("a", 1).and("b", 2);
        let mut next = 1;
        assert_eq!(build_where(&cond, &mut next), "WHERE a = $1 AND b = $2");
        assert_eq!(next, 3);
    }

    #[test]
    fn empty_condition_has_no_where_clause() {
        let mut next = 1;
        assert_eq!(build_where(&Condition::default(), &mut next), "");
    }
}
