//! A deterministic, in-memory `BlockSource` used by unit/integration/property
//! tests. Not shipped to production — a first-class implementation of the
//! trait rather than a mocked HTTP transport, so tests exercise the same
//! interface the engines consume in production.

use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;
use kyomei_common::error::CoreError;

use crate::{BlockRange, BlockSource, BlockStream, BlockWithLogs, LogFilter, TipStream};

/// Scripted chain state: a flat, append-only list of blocks. Reorgs are
/// modeled by directly mutating `blocks` between calls (tests drive this),
/// which changes a later block's `parent_hash` relative to what the Sync
/// Engine last observed.
pub struct MockBlockSource {
    blocks: Mutex<Vec<BlockWithLogs>>,
    finality_depth: u64,
    provides_validated_data: bool,
}

impl MockBlockSource {
    pub fn new(blocks: Vec<BlockWithLogs>) -> Self {
        Self {
            blocks: Mutex::new(blocks),
            finality_depth: 0,
            provides_validated_data: false,
        }
    }

    pub fn with_finality_depth(mut self, depth: u64) -> Self {
        self.finality_depth = depth;
        self
    }

    pub fn with_validated_data(mut self, validated: bool) -> Self {
        self.provides_validated_data = validated;
        self
    }

    /// Replace the blocks from `from_block` onward, simulating a reorg: the
    /// next `stream_blocks` call over that range observes the new chain.
    pub fn reorg_from(&self, from_block: u64, replacement: Vec<BlockWithLogs>) {
        let mut blocks = self.blocks.lock().unwrap();
        blocks.retain(|b| b.header.number < from_block);
        blocks.extend(replacement);
        blocks.sort_by_key(|b| b.header.number);
    }

    pub fn push_block(&self, block: BlockWithLogs) {
        self.blocks.lock().unwrap().push(block);
    }
}

#[async_trait]
impl BlockSource for MockBlockSource {
    async fn stream_blocks(&self, range: BlockRange, filter: Option<LogFilter>) -> BlockStream {
        let blocks = self.blocks.lock().unwrap();
        let addresses = filter.map(|f| f.addresses).unwrap_or_default();

        let selected: Vec<Result<BlockWithLogs, CoreError>> = blocks
            .iter()
            .filter(|b| b.header.number >= range.from && b.header.number <= range.to)
            .cloned()
            .map(|mut b| {
                if !addresses.is_empty() {
                    b.logs
                        .retain(|log| addresses.iter().any(|a| a.eq_ignore_ascii_case(&log.address)));
                }
                Ok(b)
            })
            .collect();

        Box::pin(stream::iter(selected))
    }

    async fn latest_block(&self) -> Result<u64, CoreError> {
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .last()
            .map(|b| b.header.number)
            .unwrap_or(0))
    }

    async fn finalized_block(&self) -> Result<u64, CoreError> {
        let latest = self.latest_block().await?;
        Ok(latest.saturating_sub(self.finality_depth))
    }

    async fn subscribe_tips(&self) -> Option<TipStream> {
        None
    }

    fn provides_validated_data(&self) -> bool {
        self.provides_validated_data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlockHeader;
    use chrono::Utc;

    fn block(number: u64, parent_hash: &str) -> BlockWithLogs {
        BlockWithLogs {
            header: BlockHeader {
                number,
                hash: format!("0xhash{number}"),
                parent_hash: parent_hash.to_string(),
                timestamp: Utc::now(),
            },
            logs: vec![],
        }
    }

    #[tokio::test]
    async fn stream_blocks_respects_range() {
        let source = MockBlockSource::new(vec![block(1, "0x0"), block(2, "0xhash1"), block(3, "0xhash2")]);
        use futures::StreamExt;
        let results: Vec<_> = source
            .stream_blocks(BlockRange::new(2, 3), None)
            .await
            .collect()
            .await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().header.number, 2);
    }

    #[tokio::test]
    async fn latest_block_is_highest_seen() {
        let source = MockBlockSource::new(vec![block(1, "0x0"), block(5, "0xhash1")]);
        assert_eq!(source.latest_block().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn finalized_block_subtracts_depth() {
        let source =
            MockBlockSource::new(vec![block(1, "0x0"), block(10, "0xhash1")]).with_finality_depth(3);
        assert_eq!(source.finalized_block().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn reorg_from_replaces_tail() {
        let source = MockBlockSource::new(vec![block(1, "0x0"), block(2, "0xhash1"), block(3, "0xhash2")]);
        source.reorg_from(2, vec![block(2, "0xhash1-b"), block(3, "0xhash2-b")]);
        use futures::StreamExt;
        let results: Vec<_> = source
            .stream_blocks(BlockRange::new(1, 3), None)
            .await
            .collect()
            .await;
        assert_eq!(results[1].as_ref().unwrap().header.parent_hash, "0xhash1-b");
    }
}
