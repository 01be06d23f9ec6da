//! Sliding-window reorg detector (spec.md §4.6 "Reorg policy"). Maintains a
//! window of recently-seen `(block_number, block_hash)` pairs; on each new
//! header, verifies the parent-hash chain. Skipped entirely for sources
//! with `providesValidatedData = true` (spec.md §9 open question — trusted
//! for aggregator/HyperSync sources in this implementation).

use std::collections::VecDeque;

use kyomei_blocksource::{BlockRange, BlockSource};
use kyomei_common::error::CoreResult;

pub struct ReorgDetector {
    window: VecDeque<(u64, String)>,
    max_size: usize,
}

impl ReorgDetector {
    pub fn new(max_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(max_size),
            max_size: max_size.max(1),
        }
    }

    /// Returns `Some(reorg_block)` — the earliest divergent block — if
    /// `parent_hash` doesn't match the previously recorded hash at
    /// `block_number - 1`. Otherwise records this block and returns `None`.
    pub async fn check_and_record(
        &mut self,
        block_number: u64,
        block_hash: &str,
        parent_hash: &str,
        source: &dyn BlockSource,
    ) -> CoreResult<Option<u64>> {
        if block_number > 0
            && let Some(pos) = self.window.iter().position(|(num, _)| *num == block_number - 1)
        {
            let (_, expected_parent_hash) = &self.window[pos];
            if parent_hash != expected_parent_hash {
                tracing::warn!(
                    block_number,
                    expected = %expected_parent_hash,
                    actual = %parent_hash,
                    "reorg detected: parent hash mismatch"
                );
                let reorg_start = self.find_divergence_point(source).await?;
                self.window.retain(|(num, _)| *num < reorg_start);
                return Ok(Some(reorg_start));
            }
        }

        self.window.push_back((block_number, block_hash.to_string()));
        if self.window.len() > self.max_size {
            self.window.pop_front();
        }
        Ok(None)
    }

    /// Walk back through the window, re-fetching each block until one still
    /// matches the recorded hash; the reorg starts one block after that.
    async fn find_divergence_point(&self, source: &dyn BlockSource) -> CoreResult<u64> {
        for (block_number, expected_hash) in self.window.iter().rev() {
            let range = BlockRange::new(*block_number, *block_number);
            let mut stream = source.stream_blocks(range, None).await;
            use futures::StreamExt;
            match stream.next().await {
                Some(Ok(block)) if &block.header.hash == expected_hash => {
                    return Ok(*block_number + 1);
                }
                _ => continue,
            }
        }
        Ok(self.window.front().map(|(num, _)| *num).unwrap_or(0))
    }

    pub fn window_size(&self) -> usize {
        self.window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kyomei_blocksource::mock::MockBlockSource;
    use kyomei_blocksource::{BlockHeader, BlockWithLogs};
    use chrono::Utc;

    fn header(number: u64, hash: &str, parent_hash: &str) -> BlockWithLogs {
        BlockWithLogs {
            header: BlockHeader {
                number,
                hash: hash.to_string(),
                parent_hash: parent_hash.to_string(),
                timestamp: Utc::now(),
            },
            logs: vec![],
        }
    }

    #[test]
    fn new_detector_starts_empty() {
        let detector = ReorgDetector::new(10);
        assert_eq!(detector.window_size(), 0);
    }

    #[tokio::test]
    async fn matching_parent_hash_records_without_reorg() {
        let mut detector = ReorgDetector::new(10);
        let source = MockBlockSource::new(vec![]);
        assert!(detector.check_and_record(1, "0xa", "0xgenesis", &source).await.unwrap().is_none());
        assert!(detector.check_and_record(2, "0xb", "0xa", &source).await.unwrap().is_none());
        assert_eq!(detector.window_size(), 2);
    }

    #[tokio::test]
    async fn mismatched_parent_hash_triggers_reorg() {
        let mut detector = ReorgDetector::new(10);
        let source = MockBlockSource::new(vec![header(1, "0xa", "0xgenesis")]);

        detector.check_and_record(1, "0xa", "0xgenesis", &source).await.unwrap();
        let reorg = detector
            .check_and_record(2, "0xb-prime", "0xa-wrong", &source)
            .await
            .unwrap();
        assert_eq!(reorg, Some(2));
    }
}
