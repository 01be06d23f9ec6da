//! The Processor Engine (spec.md §4.7 "HandlerExecutor"): replays stored
//! events in global chain order through registered handlers, bounded by the
//! Sync Engine's frontier, advancing its own durable checkpoint.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, TryStreamExt};
use kyomei_common::error::{CoreError, CoreResult};
use kyomei_common::types::{ChainConfig, ChainId, ProcessWorker, ProcessWorkerStatus, RawEvent};
use kyomei_decoders::DecoderRegistry;
use kyomei_storage::{EventQuery, EventRepository, ProcessWorkerRepository, SortOrder, SyncWorkerRepository};
use tokio_util::sync::CancellationToken;

use kyomei_common::telemetry::{Phase, Progress, ProgressCallback};

use crate::cached_rpc::CachedRpc;
use crate::context::{DbFacade, HandlerContext, RpcFacade};
use crate::handler::HandlerRegistry;

const PARALLEL_POOL_SIZE: usize = 50;

pub struct HandlerExecutor {
    chain_id: ChainId,
    config: ChainConfig,
    event_repo: Arc<EventRepository>,
    sync_worker_repo: Arc<SyncWorkerRepository>,
    process_worker_repo: Arc<ProcessWorkerRepository>,
    registry: Arc<DecoderRegistry>,
    handlers: Arc<HandlerRegistry>,
    db: DbFacade,
    rpc: Arc<CachedRpc>,
    cancel: CancellationToken,
    poll_interval: Duration,
    event_batch_size: u64,
    progress_callback: Option<ProgressCallback>,
}

impl HandlerExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ChainConfig,
        event_repo: Arc<EventRepository>,
        sync_worker_repo: Arc<SyncWorkerRepository>,
        process_worker_repo: Arc<ProcessWorkerRepository>,
        registry: Arc<DecoderRegistry>,
        handlers: Arc<HandlerRegistry>,
        db: DbFacade,
        rpc: Arc<CachedRpc>,
        cancel: CancellationToken,
    ) -> Self {
        let chain_id = config.chain_id;
        let event_batch_size = config.sync.event_batch_size;
        Self {
            chain_id,
            config,
            event_repo,
            sync_worker_repo,
            process_worker_repo,
            registry,
            handlers,
            db,
            rpc,
            cancel,
            poll_interval: Duration::from_secs(1),
            event_batch_size,
            progress_callback: None,
        }
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The set of topic0 selectors that have a registered handler — pushed
    /// into the Event Repository query so the database does the
    /// handler-relevance filtering (spec.md §4.7 batch mode).
    fn handler_selectors(&self) -> Vec<String> {
        self.handlers
            .registered_keys()
            .into_iter()
            .filter_map(|(contract, event)| self.registry.selector_for(&contract, &event))
            .map(|selector| format!("{selector:#x}"))
            .collect()
    }

    /// Blocks until either a live SyncWorker exists or at least one
    /// historical SyncWorker is present, so the Processor never races an
    /// empty database (spec.md §4.7 "Wait for data").
    async fn wait_for_data(&self) -> CoreResult<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let workers = self.sync_worker_repo.list_for_chain(self.chain_id).await?;
            if !workers.is_empty() {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.cancel.cancelled() => return Ok(()),
            }
        }
    }

    /// `targetBlock` per spec.md §4.7 step 1, plus whether the syncer is
    /// fully live (no historical workers remaining).
    async fn target_block(&self) -> CoreResult<Option<(u64, bool)>> {
        let workers = self.sync_worker_repo.list_for_chain(self.chain_id).await?;
        let live = workers.iter().find(|w| w.is_live());
        let historical: Vec<_> = workers.iter().filter(|w| !w.is_live()).collect();

        if historical.is_empty() {
            if let Some(live) = live {
                return Ok(Some((live.current_block, true)));
            }
            return Ok(None);
        }

        let min = historical.iter().map(|w| w.current_block).min().unwrap();
        Ok(Some((min, false)))
    }

    async fn ensure_process_worker(&self) -> CoreResult<ProcessWorker> {
        if let Some(worker) = self.process_worker_repo.get(self.chain_id).await? {
            return Ok(worker);
        }
        let range_start = self.config.historical_start().unwrap_or(0);
        let worker = ProcessWorker {
            chain_id: self.chain_id,
            range_start,
            range_end: None,
            current_block: range_start.saturating_sub(1),
            events_processed: 0,
            status: ProcessWorkerStatus::Processing,
            updated_at: Utc::now(),
        };
        self.process_worker_repo.upsert(&worker).await?;
        Ok(worker)
    }

    /// The main replay loop. Runs until cancelled.
    pub async fn run(&self) -> CoreResult<()> {
        self.wait_for_data().await?;
        let selectors = self.handler_selectors();

        while !self.cancel.is_cancelled() {
            let Some((target_block, is_live)) = self.target_block().await? else {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = self.cancel.cancelled() => break,
                }
                continue;
            };

            let mut worker = self.ensure_process_worker().await?;

            if worker.current_block >= target_block {
                if is_live && worker.status != ProcessWorkerStatus::Live {
                    worker.status = ProcessWorkerStatus::Live;
                    worker.updated_at = Utc::now();
                    self.process_worker_repo.upsert(&worker).await?;
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = self.cancel.cancelled() => break,
                }
                continue;
            }

            let query = EventQuery {
                block_range: Some((worker.current_block + 1, target_block)),
                selectors: Some(selectors.clone()),
                order: SortOrder::Ascending,
                limit: Some(self.event_batch_size as i64),
                ..EventQuery::new()
            };
            let events = self.event_repo.query(self.chain_id, &query).await?;

            if events.is_empty() {
                worker.current_block = target_block;
                worker.updated_at = Utc::now();
                self.process_worker_repo.upsert(&worker).await?;
                continue;
            }

            let batch_len = events.len() as u64;
            let last_block = events.last().map(|e| e.block_number).unwrap_or(worker.current_block);

            match self.dispatch_batch(events).await {
                Ok(()) => {
                    worker.current_block = if batch_len < self.event_batch_size {
                        target_block
                    } else {
                        last_block
                    };
                    worker.events_processed += batch_len;
                    worker.updated_at = Utc::now();
                    self.process_worker_repo.upsert(&worker).await?;
                    self.emit_progress(worker.current_block, target_block, worker.events_processed);
                }
                Err(err) => {
                    tracing::error!(chain_id = self.chain_id, block = last_block, error = %err, "handler batch failed, retrying from last checkpoint");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
            }
        }
        Ok(())
    }

    /// Decodes and dispatches one batch. `sequential` mode (the default) and
    /// the all-`parallel` fast path share this entry point; the dispatch
    /// strategy is chosen once per batch based on the registry's contents.
    async fn dispatch_batch(&self, events: Vec<RawEvent>) -> CoreResult<()> {
        if self.handlers.all_parallel() {
            stream::iter(events.into_iter().map(Ok::<RawEvent, CoreError>))
                .try_for_each_concurrent(Some(PARALLEL_POOL_SIZE), |event| async move {
                    self.dispatch_one(event).await
                })
                .await
        } else {
            for event in events {
                self.dispatch_one(event).await?;
            }
            Ok(())
        }
    }

    async fn dispatch_one(&self, event: RawEvent) -> CoreResult<()> {
        let Some(decoded) = self.registry.decode(
            event.chain_id,
            event.block_number,
            &event.block_hash,
            event.block_timestamp,
            &raw_event_to_log(&event),
        ) else {
            return Ok(());
        };

        let Some(registered) = self.handlers.get(&decoded.contract_name, &decoded.event_name) else {
            return Ok(());
        };

        let handler_label = format!("{}:{}", decoded.contract_name, decoded.event_name);
        let block = decoded.block_number;
        let rpc = RpcFacade::for_block(self.rpc.clone(), block);
        let ctx = HandlerContext::new(decoded.clone(), self.db.clone(), rpc);
        (registered.func)(decoded, ctx)
            .await
            .map_err(|source| CoreError::HandlerFailed {
                handler: handler_label,
                block,
                source,
            })
    }

    fn emit_progress(&self, current_block: u64, target_block: u64, events_processed: u64) {
        let total = target_block.saturating_sub(self.config.historical_start().unwrap_or(0)) + 1;
        let done = current_block.saturating_sub(self.config.historical_start().unwrap_or(0)) + 1;
        let progress = Progress {
            chain_id: self.chain_id,
            phase: Phase::Processing,
            blocks_synced: done.min(total),
            total_blocks: Some(total),
            percentage: Some(if total == 0 { 100.0 } else { (done as f64 / total as f64) * 100.0 }),
            rate: 0.0,
            workers: 1,
            eta_seconds: None,
        };
        progress.emit();
        if let Some(callback) = &self.progress_callback {
            callback(&progress);
        }
        tracing::debug!(chain_id = self.chain_id, events_processed, "processor progress");
    }
}

fn raw_event_to_log(event: &RawEvent) -> kyomei_blocksource::RawLog {
    let mut topics = Vec::new();
    for topic in [&event.topic0, &event.topic1, &event.topic2, &event.topic3] {
        match topic {
            Some(t) => topics.push(t.clone()),
            None => break,
        }
    }
    kyomei_blocksource::RawLog {
        address: event.address.clone(),
        topics,
        data: event.data.clone(),
        tx_hash: event.tx_hash.clone(),
        tx_index: event.tx_index,
        log_index: event.log_index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kyomei_common::types::{AddressDescriptor, ContractConfig};

    fn unreachable_pool() -> sqlx::PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool construction does not connect")
    }

    fn executor_with_handlers(handlers: HandlerRegistry, registry: DecoderRegistry) -> HandlerExecutor {
        let config = ChainConfig {
            chain_id: 1,
            sync: kyomei_common::types::ChainSyncConfig::new(1, kyomei_common::types::SourceKind::Rpc),
            contracts: vec![ContractConfig {
                name: "token".into(),
                chain_id: 1,
                abi: serde_json::json!([]),
                address: AddressDescriptor::Static("0xtoken".into()),
                start_block: 1,
                end_block: None,
            }],
        };
        let pool = unreachable_pool();
        let schema = kyomei_storage::Schema::new(1);
        let cache_repo = Arc::new(kyomei_storage::RpcCacheRepository::new(pool.clone(), schema.clone()));
        HandlerExecutor::new(
            config,
            Arc::new(EventRepository::new(pool.clone(), schema.clone())),
            Arc::new(SyncWorkerRepository::new(pool.clone(), schema.clone())),
            Arc::new(ProcessWorkerRepository::new(pool.clone(), schema.clone())),
            Arc::new(registry),
            Arc::new(handlers),
            DbFacade::new(pool.clone(), "kyomei_app_v1", Arc::new(crate::context::TableCatalog::default())),
            Arc::new(CachedRpc::new(1, Arc::new(NoopClient), cache_repo)),
            CancellationToken::new(),
        )
    }

    struct NoopClient;

    #[async_trait::async_trait]
    impl crate::cached_rpc::RawRpcClient for NoopClient {
        async fn call(&self, _method: &str, _params: serde_json::Value) -> CoreResult<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn handler_selectors_only_includes_registered_pairs() {
        let abi = serde_json::json!([
            {
                "type": "event",
                "name": "Transfer",
                "inputs": [
                    {"name": "from", "type": "address", "indexed": true},
                    {"name": "to", "type": "address", "indexed": true},
                    {"name": "value", "type": "uint256", "indexed": false}
                ]
            },
            {
                "type": "event",
                "name": "Approval",
                "inputs": [
                    {"name": "owner", "type": "address", "indexed": true},
                    {"name": "spender", "type": "address", "indexed": true},
                    {"name": "value", "type": "uint256", "indexed": false}
                ]
            }
        ]);
        let mut registry = DecoderRegistry::new();
        registry.register("token", &abi).unwrap();

        let mut handlers = HandlerRegistry::new();
        handlers.register("token", "Transfer", kyomei_common::types::HandlerMode::Sequential, |_, _| async {
            Ok(())
        });

        let executor = executor_with_handlers(handlers, registry);
        assert_eq!(executor.handler_selectors().len(), 1);
    }

    #[test]
    fn handler_selectors_empty_when_nothing_registered() {
        let executor = executor_with_handlers(HandlerRegistry::new(), DecoderRegistry::new());
        assert!(executor.handler_selectors().is_empty());
    }
}
