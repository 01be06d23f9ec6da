//! A minimal, alloy-backed `BlockSource` over plain JSON-RPC. This reference
//! adapter is intentionally thin: no retry/backoff, no multi-endpoint
//! failover, no push subscription. A hardened production RPC client is an
//! external collaborator.

use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::Filter;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::stream;
use kyomei_common::error::CoreError;

use crate::{BlockHeader, BlockRange, BlockSource, BlockStream, BlockWithLogs, LogFilter, RawLog};

pub struct HttpBlockSource {
    rpc_url: String,
}

impl HttpBlockSource {
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
        }
    }

    async fn fetch_block(&self, block_number: u64) -> Result<BlockWithLogs, CoreError> {
        let provider = ProviderBuilder::new()
            .connect_http(self.rpc_url.parse().map_err(|e| {
                CoreError::BlockSource(format!("invalid rpc url: {e}"))
            })?);

        let block = provider
            .get_block_by_number(block_number.into())
            .await
            .map_err(|e| CoreError::BlockSource(e.to_string()))?
            .ok_or_else(|| CoreError::BlockSource(format!("block {block_number} not found")))?;

        let timestamp = Utc
            .timestamp_opt(block.header.timestamp as i64, 0)
            .single()
            .unwrap_or_else(Utc::now);

        let filter = Filter::new().from_block(block_number).to_block(block_number);
        let logs = provider
            .get_logs(&filter)
            .await
            .map_err(|e| CoreError::BlockSource(e.to_string()))?;

        let mut raw_logs: Vec<RawLog> = logs
            .into_iter()
            .map(|log| RawLog {
                address: format!("{:#x}", log.inner.address).to_lowercase(),
                topics: log.inner.topics().iter().map(|t| format!("{t:#x}")).collect(),
                data: format!("0x{}", alloy::hex::encode(log.inner.data.data.as_ref())),
                tx_hash: log
                    .transaction_hash
                    .map(|h| format!("{h:#x}"))
                    .unwrap_or_default(),
                tx_index: log.transaction_index.unwrap_or_default(),
                log_index: log.log_index.unwrap_or_default(),
            })
            .collect();
        raw_logs.sort_by_key(|l| (l.tx_index, l.log_index));

        Ok(BlockWithLogs {
            header: BlockHeader {
                number: block_number,
                hash: format!("{:#x}", block.header.hash),
                parent_hash: format!("{:#x}", block.header.parent_hash),
                timestamp,
            },
            logs: raw_logs,
        })
    }
}

#[async_trait]
impl BlockSource for HttpBlockSource {
    async fn stream_blocks(&self, range: BlockRange, filter: Option<LogFilter>) -> BlockStream {
        let addresses: Vec<Address> = filter
            .map(|f| f.addresses)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|a| a.parse().ok())
            .collect();

        let blocks: Vec<u64> = (range.from..=range.to).collect();
        let rpc_url = self.rpc_url.clone();

        let results = stream::iter(blocks).then(move |n| {
            let rpc_url = rpc_url.clone();
            let addresses = addresses.clone();
            async move {
                let source = HttpBlockSource::new(rpc_url);
                let mut block = source.fetch_block(n).await?;
                if !addresses.is_empty() {
                    block.logs.retain(|log| {
                        addresses
                            .iter()
                            .any(|a| format!("{a:#x}").to_lowercase() == log.address)
                    });
                }
                Ok(block)
            }
        });

        Box::pin(results)
    }

    async fn latest_block(&self) -> Result<u64, CoreError> {
        let provider = ProviderBuilder::new()
            .connect_http(self.rpc_url.parse().map_err(|e| {
                CoreError::BlockSource(format!("invalid rpc url: {e}"))
            })?);
        provider
            .get_block_number()
            .await
            .map_err(|e| CoreError::BlockSource(e.to_string()))
    }

    async fn finalized_block(&self) -> Result<u64, CoreError> {
        // This minimal adapter treats "latest" as "finalized" and leaves
        // confirmation-depth adjustment to the Sync Engine's
        // `finality_depth` configuration.
        self.latest_block().await
    }

    fn provides_validated_data(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_does_not_connect() {
        let source = HttpBlockSource::new("http://localhost:8545");
        assert!(!source.provides_validated_data());
    }
}
