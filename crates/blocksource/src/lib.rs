//! The Block Source abstraction (spec.md §4.1): the only way the Sync
//! Engine reaches an upstream chain data provider. Concrete production
//! clients (standard RPC with retries/failover, an aggregation service,
//! HyperSync) are external collaborators; this crate defines the contract
//! and ships two reference implementations used by tests and by the
//! `kyomei-node` binary's default wiring.

pub mod http;
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use kyomei_common::error::CoreError;

/// One EVM log, prior to decoding. Carries only what the Sync Engine and
/// Factory Watcher need to build a `RawEvent` / detect factory children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    /// Always lowercased.
    pub address: String,
    /// topics[0] is the event selector; up to 4 total.
    pub topics: Vec<String>,
    pub data: String,
    pub tx_hash: String,
    pub tx_index: u64,
    pub log_index: u64,
}

impl RawLog {
    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: DateTime<Utc>,
}

/// One block and the logs emitted within it, sorted by `(tx_index, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWithLogs {
    pub header: BlockHeader,
    pub logs: Vec<RawLog>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    pub fn len(&self) -> u64 {
        self.to.saturating_sub(self.from) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.from > self.to
    }
}

/// Address filter passed to `stream_blocks`. `None` (or an empty list) means
/// no filtering is requested of the source — the engine filters client-side,
/// per the address-filter invariant in spec.md §4.6 ("permitted to be wider,
/// never narrower").
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub addresses: Vec<String>,
}

impl LogFilter {
    pub fn new(addresses: Vec<String>) -> Self {
        Self { addresses }
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

pub type BlockStream = BoxStream<'static, Result<BlockWithLogs, CoreError>>;
pub type TipStream = BoxStream<'static, BlockHeader>;

/// Abstract upstream data source (spec.md §4.1). No retry policy lives here
/// — upstream errors propagate to the caller, which owns retry/backoff
/// policy. A source never silently drops or re-orders blocks within a
/// stream: block numbers are strictly increasing, and a block's logs are
/// sorted by `(tx_index, log_index)`.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Stream blocks in `range`, optionally narrowed by `filter`. Finite:
    /// the stream ends after yielding `range.to`. Restartable by calling
    /// again with a new range after an error or cancellation.
    async fn stream_blocks(&self, range: BlockRange, filter: Option<LogFilter>) -> BlockStream;

    async fn latest_block(&self) -> Result<u64, CoreError>;

    /// Tip minus chain-specific confirmation depth. May equal
    /// `latest_block` for sources whose data is pre-finalized.
    async fn finalized_block(&self) -> Result<u64, CoreError>;

    /// Optional push channel for new tips. `None` means the engine must
    /// poll `latest_block`/`finalized_block` itself.
    async fn subscribe_tips(&self) -> Option<TipStream> {
        None
    }

    /// Whether this source's data is already reorg-validated, letting the
    /// Sync Engine skip its own parent-hash verification.
    fn provides_validated_data(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_range_length_is_inclusive() {
        let r = BlockRange::new(100, 199);
        assert_eq!(r.len(), 100);
        assert!(!r.is_empty());
    }

    #[test]
    fn single_block_range_has_length_one() {
        let r = BlockRange::new(50, 50);
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn inverted_range_is_empty() {
        let r = BlockRange::new(50, 49);
        assert!(r.is_empty());
    }

    #[test]
    fn log_filter_empty_means_unfiltered() {
        let f = LogFilter::default();
        assert!(f.is_empty());
    }
}
