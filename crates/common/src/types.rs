//! Shared domain types for the sync and processor engines.
//!
//! Block numbers and counts are carried as `u64` in domain logic and cast to
//! `i64` only at the repository boundary, matching Postgres's native integer
//! width. 256-bit values (topics, amounts) are always strings or byte slices
//! — never `f64` — so they round-trip through JSON without precision loss.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ChainId = u64;

/// The canonical unit of ingestion: one EVM log, identified by
/// `(chain, block_number, tx_index, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub chain_id: ChainId,
    pub block_number: u64,
    pub block_hash: String,
    pub block_timestamp: DateTime<Utc>,
    pub tx_hash: String,
    pub tx_index: u64,
    pub log_index: u64,
    /// Emitting contract address, always lowercased hex.
    pub address: String,
    pub topic0: Option<String>,
    pub topic1: Option<String>,
    pub topic2: Option<String>,
    pub topic3: Option<String>,
    /// Opaque ABI-encoded payload, hex-encoded with a `0x` prefix.
    pub data: String,
}

/// Status of a single sync worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum SyncWorkerStatus {
    Historical,
    Live,
}

/// Durable progress row for one sync worker. `worker_id = 0` is reserved for
/// the single live worker; historical workers use `worker_id >= 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWorker {
    pub chain_id: ChainId,
    pub worker_id: u32,
    pub range_start: u64,
    /// Absent for the live worker.
    pub range_end: Option<u64>,
    pub current_block: u64,
    pub status: SyncWorkerStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncWorker {
    pub fn is_live(&self) -> bool {
        self.worker_id == 0
    }
}

/// Status of the single processor checkpoint per chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum ProcessWorkerStatus {
    Processing,
    Live,
}

/// Durable replay checkpoint. One row per chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessWorker {
    pub chain_id: ChainId,
    pub range_start: u64,
    pub range_end: Option<u64>,
    pub current_block: u64,
    pub events_processed: u64,
    pub status: ProcessWorkerStatus,
    pub updated_at: DateTime<Utc>,
}

/// A dynamically discovered child contract address, persisted by the
/// Factory Watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryChild {
    pub chain_id: ChainId,
    pub factory_address: String,
    /// Always lowercased.
    pub child_address: String,
    pub contract_name: String,
    pub creation_block: u64,
    pub creation_tx_hash: String,
    pub creation_log_index: u64,
    pub metadata: serde_json::Value,
}

/// A cached response from an upstream RPC call, keyed so that replay at the
/// same block context is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcCacheEntry {
    pub chain_id: ChainId,
    pub block_context: u64,
    pub method: String,
    /// Hex-encoded SHA-256 over canonical JSON of `(method, params)`.
    pub request_hash: String,
    pub params_json: serde_json::Value,
    pub response_json: serde_json::Value,
}

/// A decoded event argument value. Handler inputs are carried as a
/// `map<String, DecodedValue>`-shaped bag rather than reflected into typed
/// Rust structs from user-supplied ABIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum DecodedValue {
    Address(String),
    /// Decimal string — never a float, regardless of magnitude.
    Uint(String),
    Int(String),
    Bool(bool),
    Bytes(#[serde(with = "hex_bytes")] Vec<u8>),
    String(String),
    Array(Vec<DecodedValue>),
    Tuple(Vec<DecodedValue>),
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

pub type DecodedArgs = HashMap<String, DecodedValue>;

/// A raw log resolved to `(contractName, eventName, args)` by the decoder,
/// carrying enough block/tx coordinates for handler context construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedEvent {
    pub chain_id: ChainId,
    pub block_number: u64,
    pub block_hash: String,
    pub block_timestamp: DateTime<Utc>,
    pub tx_hash: String,
    pub tx_index: u64,
    pub log_index: u64,
    pub address: String,
    pub contract_name: String,
    pub event_name: String,
    pub args: DecodedArgs,
}

/// Dispatch mode for a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HandlerMode {
    #[default]
    Sequential,
    Parallel,
}

/// How a contract's address set is determined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AddressDescriptor {
    Static(String),
    StaticList(Vec<String>),
    Factory {
        parent: String,
        event_abi: serde_json::Value,
        child_params: Vec<String>,
    },
}

/// One registered contract: its ABI, address descriptor, and sync range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractConfig {
    pub name: String,
    pub chain_id: ChainId,
    pub abi: serde_json::Value,
    pub address: AddressDescriptor,
    pub start_block: u64,
    pub end_block: Option<u64>,
}

/// Upstream data source family, used to pick type-specific defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    Rpc,
    Aggregator,
    HyperSync,
    Push,
}

impl SourceKind {
    /// Default `blockRangePerRequest` for this source family (spec.md §4.6).
    pub fn default_block_range_per_request(self) -> u64 {
        match self {
            SourceKind::Rpc => 1_000,
            SourceKind::Aggregator => 2_000,
            SourceKind::HyperSync => 10_000,
            SourceKind::Push => 1_000,
        }
    }
}

/// Per-chain sync configuration, merged with source-typed defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSyncConfig {
    pub chain_id: ChainId,
    pub source: SourceKind,
    pub finality_depth: u64,
    pub polling_interval_ms: u64,
    pub parallel_workers: u32,
    pub block_range_per_request: u64,
    pub blocks_per_worker: u64,
    pub event_batch_size: u64,
}

impl ChainSyncConfig {
    pub fn new(chain_id: ChainId, source: SourceKind) -> Self {
        Self {
            chain_id,
            source,
            finality_depth: 0,
            polling_interval_ms: 2_000,
            parallel_workers: 4,
            block_range_per_request: source.default_block_range_per_request(),
            blocks_per_worker: 250_000,
            event_batch_size: 10_000,
        }
    }
}

/// The validated per-chain configuration object handed to the core engines
/// (spec.md §6's "Configuration contract" — the loader that produces this is
/// an external collaborator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: ChainId,
    pub sync: ChainSyncConfig,
    pub contracts: Vec<ContractConfig>,
}

impl ChainConfig {
    /// `startBlock = min(contract.startBlock)` (spec.md §4.6 step 3).
    pub fn historical_start(&self) -> Option<u64> {
        self.contracts.iter().map(|c| c.start_block).min()
    }

    /// `max(contract.endBlock)` across contracts that declare one.
    pub fn configured_end(&self) -> Option<u64> {
        self.contracts.iter().filter_map(|c| c.end_block).max()
    }
}
