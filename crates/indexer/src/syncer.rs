//! The Sync Engine — `ChainSyncer` (spec.md §4.6). Drives one chain from
//! current progress to the tip under parallelism, with durable per-worker
//! resume, then converges to a single live-tailing worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kyomei_blocksource::BlockSource;
use kyomei_common::error::{CoreError, CoreResult};
use kyomei_common::telemetry::{Phase, Progress, ProgressCallback};
use kyomei_common::types::{ChainConfig, ChainId, SyncWorker, SyncWorkerStatus};
use kyomei_decoders::{AbiEvent, FactorySpec, FactoryWatcher};
use kyomei_storage::{EventRepository, FactoryRepository, SyncWorkerRepository};
use tokio_util::sync::CancellationToken;

use crate::address_filter::AddressFilter;
use crate::worker::{self, WorkerDeps};

pub struct ChainSyncer {
    chain_id: ChainId,
    config: ChainConfig,
    source: Arc<dyn BlockSource>,
    event_repo: Arc<EventRepository>,
    factory_repo: Arc<FactoryRepository>,
    sync_worker_repo: Arc<SyncWorkerRepository>,
    cancel: CancellationToken,
    progress_callback: Option<ProgressCallback>,
}

impl ChainSyncer {
    pub fn new(
        config: ChainConfig,
        source: Arc<dyn BlockSource>,
        event_repo: Arc<EventRepository>,
        factory_repo: Arc<FactoryRepository>,
        sync_worker_repo: Arc<SyncWorkerRepository>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            chain_id: config.chain_id,
            config,
            source,
            event_repo,
            factory_repo,
            sync_worker_repo,
            cancel,
            progress_callback: None,
        }
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    fn factory_watcher(&self) -> CoreResult<Arc<FactoryWatcher>> {
        let mut specs = Vec::new();
        for contract in &self.config.contracts {
            if let kyomei_common::types::AddressDescriptor::Factory {
                parent,
                event_abi,
                child_params,
            } = &contract.address
            {
                let events: Vec<AbiEvent> = kyomei_decoders::parse_events(event_abi)?;
                let Some(event) = events.into_iter().next() else {
                    return Err(CoreError::Config(format!(
                        "factory contract {} has no event in event_abi",
                        contract.name
                    )));
                };
                specs.push(FactorySpec {
                    parent_address: parent.to_lowercase(),
                    event,
                    child_params: child_params.clone(),
                    child_contract_name: contract.name.clone(),
                });
            }
        }
        Ok(Arc::new(FactoryWatcher::new(specs)))
    }

    fn worker_deps(&self, factory_watcher: Arc<FactoryWatcher>) -> WorkerDeps {
        WorkerDeps {
            chain_id: self.chain_id,
            source: self.source.clone(),
            event_repo: self.event_repo.clone(),
            factory_repo: self.factory_repo.clone(),
            sync_worker_repo: self.sync_worker_repo.clone(),
            factory_watcher,
            base_filter: AddressFilter::from_contracts(&self.config.contracts),
            event_batch_size: self.config.sync.event_batch_size as usize,
            block_range_per_request: self.config.sync.block_range_per_request,
        }
    }

    /// Runs phases 1–8 to completion of historical sync, then tails forever
    /// until cancelled.
    pub async fn run(&self) -> CoreResult<()> {
        let factory_watcher = self.factory_watcher()?;
        let deps = self.worker_deps(factory_watcher);

        let all_workers = self.sync_worker_repo.list_for_chain(self.chain_id).await?;
        let mut historical: Vec<SyncWorker> = all_workers
            .iter()
            .filter(|w| !w.is_live())
            .cloned()
            .collect();
        let live = all_workers.iter().find(|w| w.is_live()).cloned();

        let mut live = live;
        if self.needs_reset(&historical, &live) {
            tracing::warn!(chain_id = self.chain_id, "worker configuration changed — resetting");
            self.sync_worker_repo.delete_all_for_chain(self.chain_id).await?;
            historical.clear();
            live = None;
        }

        if historical.is_empty() && live.is_none() {
            historical = self.plan_fresh().await?;
            for w in &historical {
                self.sync_worker_repo.upsert(w).await?;
            }
        } else {
            let mut kept = Vec::new();
            for w in historical {
                match w.range_end {
                    Some(end) if w.current_block >= end => {
                        self.sync_worker_repo.delete(self.chain_id, w.worker_id).await?;
                    }
                    _ => kept.push(w),
                }
            }
            historical = kept;
        }

        if !historical.is_empty() {
            self.run_historical(&deps, historical).await?;
            live = Some(self.transition_to_live().await?);
        }

        let Some(live_worker) = live else {
            return Ok(());
        };

        self.tail_live(&deps, live_worker).await
    }

    fn needs_reset(&self, historical: &[SyncWorker], live: &Option<SyncWorker>) -> bool {
        let configured_workers = self.config.sync.parallel_workers as usize;
        let configured_start = self.config.historical_start();

        if !historical.is_empty() {
            if historical.len() != configured_workers {
                return true;
            }
            let min_start = historical.iter().map(|w| w.range_start).min();
            if min_start != configured_start {
                return true;
            }
        } else if let Some(live) = live {
            if let Some(start) = configured_start
                && start > live.current_block
            {
                return true;
            }
        }
        false
    }

    async fn plan_fresh(&self) -> CoreResult<Vec<SyncWorker>> {
        let start = self
            .config
            .historical_start()
            .ok_or_else(|| CoreError::Config("no contracts configured".to_string()))?;
        let finalized = self.source.finalized_block().await?;
        let target = match self.config.configured_end() {
            Some(end) => finalized.min(end),
            None => finalized,
        };

        if target < start {
            return Ok(Vec::new());
        }

        let total = target - start + 1;
        let now = Utc::now();
        if total <= self.config.sync.blocks_per_worker {
            return Ok(vec![SyncWorker {
                chain_id: self.chain_id,
                worker_id: 1,
                range_start: start,
                range_end: Some(target),
                current_block: start.saturating_sub(1),
                status: SyncWorkerStatus::Historical,
                created_at: now,
                updated_at: now,
            }]);
        }

        let workers = self.config.sync.parallel_workers.max(1) as u64;
        let chunk = total / workers;
        let mut result = Vec::new();
        let mut cursor = start;
        for i in 0..workers {
            let is_last = i + 1 == workers;
            let range_end = if is_last { target } else { cursor + chunk - 1 };
            result.push(SyncWorker {
                chain_id: self.chain_id,
                worker_id: (i + 1) as u32,
                range_start: cursor,
                range_end: Some(range_end),
                current_block: cursor.saturating_sub(1),
                status: SyncWorkerStatus::Historical,
                created_at: now,
                updated_at: now,
            });
            cursor = range_end + 1;
        }
        Ok(result)
    }

    async fn run_historical(&self, deps: &WorkerDeps, workers: Vec<SyncWorker>) -> CoreResult<()> {
        let mut handles = Vec::new();
        for w in workers {
            let deps = WorkerDeps {
                chain_id: deps.chain_id,
                source: deps.source.clone(),
                event_repo: deps.event_repo.clone(),
                factory_repo: deps.factory_repo.clone(),
                sync_worker_repo: deps.sync_worker_repo.clone(),
                factory_watcher: deps.factory_watcher.clone(),
                base_filter: deps.base_filter.clone(),
                event_batch_size: deps.event_batch_size,
                block_range_per_request: deps.block_range_per_request,
            };
            let cancel = self.cancel.clone();
            let to = w.range_end.unwrap_or(w.current_block);
            handles.push(tokio::spawn(async move { worker::run_worker(&deps, w, to, &cancel).await }));
        }

        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(finished)) => {
                    if let Some(end) = finished.range_end
                        && finished.current_block >= end
                    {
                        self.sync_worker_repo.delete(self.chain_id, finished.worker_id).await?;
                    }
                }
                Ok(Err(e)) => {
                    tracing::error!(chain_id = self.chain_id, error = %e, "historical worker failed");
                    first_error.get_or_insert(e);
                }
                Err(join_err) => {
                    tracing::error!(chain_id = self.chain_id, error = %join_err, "historical worker panicked");
                    first_error.get_or_insert(CoreError::BlockSource(join_err.to_string()));
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        self.emit_progress(Phase::Historical, 0, None, 0);
        Ok(())
    }

    async fn transition_to_live(&self) -> CoreResult<SyncWorker> {
        let target = match self.config.configured_end() {
            Some(end) => self.source.finalized_block().await?.min(end),
            None => self.source.finalized_block().await?,
        };
        let now = Utc::now();
        let live = SyncWorker {
            chain_id: self.chain_id,
            worker_id: 0,
            range_start: self.config.historical_start().unwrap_or(0),
            range_end: None,
            current_block: target,
            status: SyncWorkerStatus::Live,
            created_at: now,
            updated_at: now,
        };
        self.sync_worker_repo.upsert(&live).await?;
        Ok(live)
    }

    async fn tail_live(&self, deps: &WorkerDeps, mut live: SyncWorker) -> CoreResult<()> {
        let poll_interval = Duration::from_millis(self.config.sync.polling_interval_ms);
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let safe_tip = if self.source.provides_validated_data() {
                self.source.latest_block().await?
            } else {
                self.source.finalized_block().await?
            };

            if safe_tip > live.current_block {
                live = worker::run_worker(deps, live, safe_tip, &self.cancel).await?;
                self.emit_progress(Phase::Live, live.current_block, None, 1);
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = self.cancel.cancelled() => return Ok(()),
            }
        }
    }

    fn emit_progress(&self, phase: Phase, blocks_synced: u64, total_blocks: Option<u64>, workers: u32) {
        let progress = Progress {
            chain_id: self.chain_id,
            phase,
            blocks_synced,
            total_blocks,
            percentage: total_blocks.map(|t| {
                if t == 0 { 100.0 } else { (blocks_synced as f64 / t as f64) * 100.0 }
            }),
            rate: 0.0,
            workers,
            eta_seconds: None,
        };
        progress.emit();
        if let Some(callback) = &self.progress_callback {
            callback(&progress);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kyomei_common::types::{AddressDescriptor, ChainSyncConfig, ContractConfig, SourceKind};

    fn make_config(chain_id: ChainId, start: u64) -> ChainConfig {
        ChainConfig {
            chain_id,
            sync: ChainSyncConfig::new(chain_id, SourceKind::Rpc),
            contracts: vec![ContractConfig {
                name: "token".into(),
                chain_id,
                abi: serde_json::json!([]),
                address: AddressDescriptor::Static("0xAAA".into()),
                start_block: start,
                end_block: None,
            }],
        }
    }

    #[test]
    fn needs_reset_detects_worker_count_change() {
        let config = make_config(1, 100);
        let syncer = ChainSyncer {
            chain_id: 1,
            config,
            source: Arc::new(kyomei_blocksource::mock::MockBlockSource::new(vec![])),
            event_repo: Arc::new(EventRepository::new(
                unreachable_pool(),
                kyomei_storage::Schema::new(1),
            )),
            factory_repo: Arc::new(FactoryRepository::new(
                unreachable_pool(),
                kyomei_storage::Schema::new(1),
            )),
            sync_worker_repo: Arc::new(SyncWorkerRepository::new(
                unreachable_pool(),
                kyomei_storage::Schema::new(1),
            )),
            cancel: CancellationToken::new(),
            progress_callback: None,
        };

        let now = Utc::now();
        let workers = vec![SyncWorker {
            chain_id: 1,
            worker_id: 1,
            range_start: 100,
            range_end: Some(200),
            current_block: 150,
            status: SyncWorkerStatus::Historical,
            created_at: now,
            updated_at: now,
        }];
        assert!(syncer.needs_reset(&workers, &None));
    }

    fn unreachable_pool() -> sqlx::PgPool {
        // Constructing a lazy pool does not connect; used only so the
        // repositories type-check in tests that never issue a query.
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool construction does not connect")
    }
}
