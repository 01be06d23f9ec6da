//! Request-cacheable view of on-chain state at a pinned block context
//! (spec.md §4.4). Grounded in the block source crate's per-call
//! `ProviderBuilder` pattern (`kyomei_blocksource::http::HttpBlockSource`)
//! for the upstream transport, and in `kyomei_storage::rpc_cache_repo` for
//! the persistence side.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use alloy::providers::{Provider, ProviderBuilder};
use async_trait::async_trait;
use futures::future::join_all;
use kyomei_common::error::{CoreError, CoreResult};
use kyomei_common::types::{ChainId, RpcCacheEntry};
use kyomei_storage::{RpcCacheRepository, compute_request_hash};
use serde_json::Value;
use tokio::sync::Semaphore;

const DEFAULT_SEMAPHORE_PERMITS: usize = 100;
const BIGINT_SENTINEL: &str = "__bigint__";

/// The upstream transport a `CachedRpc` dispatches misses through. Kept
/// separate from `CachedRpc` so tests can substitute a mock without
/// standing up a real chain endpoint.
#[async_trait]
pub trait RawRpcClient: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> CoreResult<Value>;
}

/// Plain JSON-RPC over HTTP via `alloy`, one connection per call — the same
/// trade-off `HttpBlockSource` makes: no retry/failover, that's an external
/// collaborator's concern.
pub struct AlloyRpcClient {
    rpc_url: String,
}

impl AlloyRpcClient {
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
        }
    }
}

#[async_trait]
impl RawRpcClient for AlloyRpcClient {
    async fn call(&self, method: &str, params: Value) -> CoreResult<Value> {
        let provider = ProviderBuilder::new().connect_http(
            self.rpc_url
                .parse()
                .map_err(|e| CoreError::BlockSource(format!("invalid rpc url: {e}")))?,
        );
        provider
            .raw_request(method.to_string().into(), params)
            .await
            .map_err(|e| CoreError::BlockSource(format!("{method}: {e}")))
    }
}

/// Advisory counters (spec.md §4.4: "exposed; they are advisory, not
/// load-bearing").
#[derive(Debug, Default, Clone, Copy)]
pub struct RpcCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stored: u64,
}

/// Wraps a decimal-string bigint with the reserved sentinel so it survives
/// a JSON round trip through `rpc_cache.response_json` without becoming an
/// imprecise `f64`.
pub fn bigint_to_json(decimal: impl Into<String>) -> Value {
    serde_json::json!({ BIGINT_SENTINEL: decimal.into() })
}

/// Inverse of [`bigint_to_json`]; `None` if `value` isn't a wrapped bigint.
pub fn json_to_bigint(value: &Value) -> Option<String> {
    value
        .as_object()?
        .get(BIGINT_SENTINEL)?
        .as_str()
        .map(str::to_string)
}

fn parse_hex_u64(value: &Value) -> CoreResult<u64> {
    let s = value
        .as_str()
        .ok_or_else(|| CoreError::BlockSource(format!("expected hex string, got {value}")))?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| CoreError::BlockSource(format!("invalid hex block number {s}: {e}")))
}

/// The Cached RPC (spec.md §4.4). One instance per chain, shared by every
/// handler invocation the Processor makes for that chain.
pub struct CachedRpc {
    chain_id: ChainId,
    client: Arc<dyn RawRpcClient>,
    cache: Arc<RpcCacheRepository>,
    semaphore: Arc<Semaphore>,
    hits: AtomicU64,
    misses: AtomicU64,
    stored: AtomicU64,
}

impl CachedRpc {
    pub fn new(chain_id: ChainId, client: Arc<dyn RawRpcClient>, cache: Arc<RpcCacheRepository>) -> Self {
        Self::with_concurrency(chain_id, client, cache, DEFAULT_SEMAPHORE_PERMITS)
    }

    pub fn with_concurrency(
        chain_id: ChainId,
        client: Arc<dyn RawRpcClient>,
        cache: Arc<RpcCacheRepository>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            chain_id,
            client,
            cache,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stored: AtomicU64::new(0),
        }
    }

    /// Bypasses the cache — tip queries are context-insensitive by nature.
    pub async fn latest_block(&self) -> CoreResult<u64> {
        let v = self.dispatch_upstream("eth_blockNumber", Value::Null).await?;
        parse_hex_u64(&v)
    }

    /// Bypasses the cache, same as `latest_block`.
    pub async fn finalized_block(&self) -> CoreResult<u64> {
        let v = self
            .dispatch_upstream(
                "eth_getBlockByNumber",
                serde_json::json!(["finalized", false]),
            )
            .await?;
        let number = v
            .get("number")
            .ok_or_else(|| CoreError::BlockSource("finalized block missing number".into()))?;
        parse_hex_u64(number)
    }

    pub async fn get_block(&self, block: u64, number: u64) -> CoreResult<Value> {
        self.call(block, "eth_getBlockByNumber", serde_json::json!([format!("0x{number:x}"), false]))
            .await
    }

    pub async fn get_block_by_hash(&self, block: u64, hash: &str) -> CoreResult<Value> {
        self.call(block, "eth_getBlockByHash", serde_json::json!([hash, false])).await
    }

    pub async fn get_logs(&self, block: u64, filter: Value) -> CoreResult<Value> {
        self.call(block, "eth_getLogs", serde_json::json!([filter])).await
    }

    pub async fn get_transaction(&self, block: u64, hash: &str) -> CoreResult<Value> {
        self.call(block, "eth_getTransactionByHash", serde_json::json!([hash])).await
    }

    pub async fn get_receipt(&self, block: u64, hash: &str) -> CoreResult<Value> {
        self.call(block, "eth_getTransactionReceipt", serde_json::json!([hash])).await
    }

    pub async fn get_balance(&self, block: u64, address: &str) -> CoreResult<Value> {
        let raw = self
            .call(block, "eth_getBalance", serde_json::json!([address, format!("0x{block:x}")]))
            .await?;
        let decimal = parse_hex_u64(&raw).map(|n| n.to_string()).unwrap_or_else(|_| "0".into());
        Ok(bigint_to_json(decimal))
    }

    pub async fn eth_call(&self, block: u64, call: Value) -> CoreResult<Value> {
        self.call(block, "eth_call", serde_json::json!([call, format!("0x{block:x}")])).await
    }

    /// Generic cached read at `block`. The caller (the `RpcFacade` handed to
    /// one handler invocation) supplies the block explicitly so concurrent
    /// handlers dispatched against the same `CachedRpc` never share mutable
    /// context.
    pub async fn call(&self, block: u64, method: &str, params: Value) -> CoreResult<Value> {
        self.cached_call(block, method, params).await
    }

    /// Splits `calls` into cache hits/misses, submits the misses as one
    /// concurrent batch, records all misses, and returns results in the
    /// original order (spec.md §4.4).
    pub async fn call_batch(&self, block: u64, calls: Vec<(String, Value)>) -> CoreResult<Vec<Value>> {
        let mut results: Vec<Option<Value>> = vec![None; calls.len()];
        let mut misses = Vec::new();

        for (i, (method, params)) in calls.iter().enumerate() {
            let hash = compute_request_hash(method, params);
            if let Some(entry) = self.cache.get(self.chain_id, block, &hash).await? {
                self.hits.fetch_add(1, Ordering::Relaxed);
                results[i] = Some(unwrap_response(entry.response_json));
            } else {
                misses.push(i);
            }
        }
        self.misses.fetch_add(misses.len() as u64, Ordering::Relaxed);

        let fetched = join_all(misses.iter().map(|&i| {
            let (method, params) = calls[i].clone();
            async move {
                let value = self.dispatch_upstream(&method, params.clone()).await;
                (i, method, params, value)
            }
        }))
        .await;

        for (i, method, params, value) in fetched {
            let value = value?;
            self.store(block, &method, &params, &value).await?;
            results[i] = Some(value);
        }

        Ok(results
            .into_iter()
            .map(|v| v.expect("every call has either a cache hit or a fetched result"))
            .collect())
    }

    async fn cached_call(&self, block: u64, method: &str, params: Value) -> CoreResult<Value> {
        let hash = compute_request_hash(method, &params);
        if let Some(entry) = self.cache.get(self.chain_id, block, &hash).await? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(unwrap_response(entry.response_json));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = self.dispatch_upstream(method, params.clone()).await?;
        self.store(block, method, &params, &value).await?;
        Ok(value)
    }

    async fn store(&self, block: u64, method: &str, params: &Value, value: &Value) -> CoreResult<()> {
        let hash = compute_request_hash(method, params);
        self.cache
            .put(&RpcCacheEntry {
                chain_id: self.chain_id,
                block_context: block,
                method: method.to_string(),
                request_hash: hash,
                params_json: params.clone(),
                response_json: value.clone(),
            })
            .await?;
        self.stored.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn dispatch_upstream(&self, method: &str, params: Value) -> CoreResult<Value> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| CoreError::BlockSource("rpc semaphore closed".into()))?;
        self.client.call(method, params).await
    }

    pub fn stats(&self) -> RpcCacheStats {
        RpcCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
        }
    }
}

/// Cached responses are stored verbatim; bigint sentinels are left intact
/// for the caller (e.g. `json_to_bigint`) to unwrap, not resolved here.
fn unwrap_response(value: Value) -> Value {
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bigint_round_trips_through_sentinel() {
        let wrapped = bigint_to_json("123456789012345678901234567890");
        assert_eq!(
            json_to_bigint(&wrapped).as_deref(),
            Some("123456789012345678901234567890")
        );
    }

    #[test]
    fn non_bigint_json_has_no_bigint_value() {
        assert_eq!(json_to_bigint(&serde_json::json!("0xabc")), None);
        assert_eq!(json_to_bigint(&serde_json::json!(42)), None);
    }

    #[test]
    fn parses_hex_block_number() {
        assert_eq!(parse_hex_u64(&serde_json::json!("0x10")).unwrap(), 16);
    }

    #[test]
    fn stats_start_at_zero() {
        let stats = RpcCacheStats::default();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.stored, 0);
    }
}
