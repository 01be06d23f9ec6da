//! The per-worker execution loop (spec.md §4.6 step 5/8). Both historical
//! workers and the single live worker run through this same function —
//! the only difference is whether the worker's `range_end` is bounded.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use kyomei_blocksource::{BlockRange, BlockSource, LogFilter, RawLog};
use kyomei_common::error::CoreResult;
use kyomei_common::types::{ChainId, FactoryChild, RawEvent, SyncWorker};
use kyomei_decoders::FactoryWatcher;
use kyomei_storage::{EventRepository, FactoryRepository, SyncWorkerRepository};
use tokio_util::sync::CancellationToken;

use crate::address_filter::AddressFilter;
use crate::reorg::ReorgDetector;

pub struct WorkerDeps {
    pub chain_id: ChainId,
    pub source: Arc<dyn BlockSource>,
    pub event_repo: Arc<EventRepository>,
    pub factory_repo: Arc<FactoryRepository>,
    pub sync_worker_repo: Arc<SyncWorkerRepository>,
    pub factory_watcher: Arc<FactoryWatcher>,
    /// Static contract + factory-parent addresses, resolved once per chain
    /// at syncer startup (spec.md §4.6 "Resolves the address filter").
    pub base_filter: AddressFilter,
    pub event_batch_size: usize,
    pub block_range_per_request: u64,
}

/// Run one worker from `worker.current_block + 1` to `to` (inclusive). `to`
/// is re-evaluated by the caller on every live-tail iteration; for
/// historical workers it is the worker's fixed `range_end`.
pub async fn run_worker(
    deps: &WorkerDeps,
    mut worker: SyncWorker,
    to: u64,
    cancel: &CancellationToken,
) -> CoreResult<SyncWorker> {
    let mut filter = deps.base_filter.clone();
    for child in deps.factory_repo.list_for_chain(deps.chain_id).await? {
        filter.insert(&child.child_address);
    }

    let mut buffer: Vec<RawEvent> = Vec::new();
    let mut reorg_detector = ReorgDetector::new(64);
    let mut current = worker.current_block + 1;

    while current <= to {
        if cancel.is_cancelled() {
            break;
        }

        let chunk_end = (current + deps.block_range_per_request - 1).min(to);
        let range = BlockRange::new(current, chunk_end);
        let mut stream = deps
            .source
            .stream_blocks(range, Some(LogFilter::new(filter.as_vec())))
            .await;

        let mut reorged_to: Option<u64> = None;

        while let Some(block_result) = stream.next().await {
            if cancel.is_cancelled() {
                break;
            }
            let block = block_result?;

            if !deps.source.provides_validated_data() {
                let reorg = reorg_detector
                    .check_and_record(
                        block.header.number,
                        &block.header.hash,
                        &block.header.parent_hash,
                        deps.source.as_ref(),
                    )
                    .await?;
                if let Some(reorg_block) = reorg {
                    flush(deps, &mut buffer).await?;
                    deps.event_repo.delete_range(deps.chain_id, reorg_block, None).await?;
                    deps.factory_repo.delete_children_from(deps.chain_id, reorg_block).await?;
                    worker.current_block = reorg_block.saturating_sub(1);
                    worker.updated_at = Utc::now();
                    deps.sync_worker_repo.upsert(&worker).await?;
                    reorged_to = Some(reorg_block);
                    break;
                }
            }

            for log in &block.logs {
                if let Some(discovery) = deps.factory_watcher.scan_log(block.header.number, log) {
                    for child_addr in &discovery.children {
                        let child_hex = format!("{child_addr:#x}").to_lowercase();
                        let child = FactoryChild {
                            chain_id: deps.chain_id,
                            factory_address: discovery.parent_address.clone(),
                            child_address: child_hex.clone(),
                            contract_name: discovery.contract_name.clone(),
                            creation_block: discovery.discovered_at_block,
                            creation_tx_hash: discovery.tx_hash.clone(),
                            creation_log_index: discovery.log_index,
                            metadata: serde_json::json!({}),
                        };
                        if child_hex != "0x0000000000000000000000000000000000000000" {
                            deps.factory_repo.insert(&child).await?;
                            filter.insert(&child_hex);
                        }
                    }
                }

                if !filter.contains(&log.address) {
                    continue;
                }
                buffer.push(raw_event_from_log(deps.chain_id, &block.header, log));
            }

            if buffer.len() >= deps.event_batch_size {
                flush(deps, &mut buffer).await?;
            }

            worker.current_block = block.header.number;
        }

        if let Some(reorg_block) = reorged_to {
            current = reorg_block;
            continue;
        }

        flush(deps, &mut buffer).await?;
        worker.updated_at = Utc::now();
        deps.sync_worker_repo.upsert(&worker).await?;
        current = chunk_end + 1;
    }

    Ok(worker)
}

async fn flush(deps: &WorkerDeps, buffer: &mut Vec<RawEvent>) -> CoreResult<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    deps.event_repo.insert_batch(buffer).await?;
    buffer.clear();
    Ok(())
}

fn raw_event_from_log(chain_id: ChainId, header: &kyomei_blocksource::BlockHeader, log: &RawLog) -> RawEvent {
    RawEvent {
        chain_id,
        block_number: header.number,
        block_hash: header.hash.clone(),
        block_timestamp: header.timestamp,
        tx_hash: log.tx_hash.clone(),
        tx_index: log.tx_index,
        log_index: log.log_index,
        address: log.address.to_lowercase(),
        topic0: log.topics.first().cloned(),
        topic1: log.topics.get(1).cloned(),
        topic2: log.topics.get(2).cloned(),
        topic3: log.topics.get(3).cloned(),
        data: log.data.clone(),
    }
}
