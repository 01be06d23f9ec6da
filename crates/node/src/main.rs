mod chain_config;
mod handlers;

use std::sync::Arc;

use kyomei_blocksource::BlockSource;
use kyomei_blocksource::http::HttpBlockSource;
use kyomei_common::config::CoreConfig;
use kyomei_decoders::DecoderRegistry;
use kyomei_engine::{AlloyRpcClient, CachedRpc, DbFacade, HandlerExecutor, HandlerRegistry, TableCatalog};
use kyomei_indexer::ChainSyncer;
use kyomei_storage::{EventRepository, FactoryRepository, ProcessWorkerRepository, RpcCacheRepository, Schema, SyncWorkerRepository};
use tokio_util::sync::CancellationToken;

use crate::chain_config::ChainNodeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kyomei_indexer=info,kyomei_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("kyomei node starting...");

    let config = CoreConfig::from_env()?;
    let pool = kyomei_common::db::create_pool(&config.database_url, config.db_max_connections).await?;

    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("database migrations applied");

    let chains_path = std::env::var("CHAIN_CONFIG_PATH").unwrap_or_else(|_| "chains.json".to_string());
    let chains = chain_config::load_chains(&chains_path)?;

    let schema = Schema::new(config.schema_version);
    let cancel = CancellationToken::new();

    let mut handles = Vec::new();
    for chain in chains {
        let chain_id = chain.chain.chain_id;
        let pool = pool.clone();
        let cancel = cancel.clone();
        let processor_poll_interval_ms = config.processor_poll_interval_ms;
        let rpc_cache_concurrency = config.rpc_cache_concurrency;

        handles.push(tokio::spawn(async move {
            run_chain(chain, pool, schema, cancel, processor_poll_interval_ms, rpc_cache_concurrency)
                .await
                .map_err(|e| {
                    tracing::error!(chain_id, error = %e, "chain engine exited with error");
                    e
                })
        }));
    }

    tokio::select! {
        _ = futures::future::join_all(handles) => {
            tracing::warn!("all chain engines exited");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal, stopping gracefully...");
            cancel.cancel();
        }
    }

    tracing::info!("kyomei node stopped.");
    Ok(())
}

async fn run_chain(
    chain: ChainNodeConfig,
    pool: sqlx::PgPool,
    schema: Schema,
    cancel: CancellationToken,
    processor_poll_interval_ms: u64,
    rpc_cache_concurrency: usize,
) -> anyhow::Result<()> {
    let chain_id = chain.chain.chain_id;

    let mut registry = DecoderRegistry::new();
    for contract in &chain.chain.contracts {
        registry.register(contract.name.as_str(), &contract.abi)?;
    }
    let registry = Arc::new(registry);

    let mut handler_registry = HandlerRegistry::new();
    handlers::register_handlers(&mut handler_registry);
    let handler_registry = Arc::new(handler_registry);

    let source: Arc<dyn BlockSource> = Arc::new(HttpBlockSource::new(chain.rpc_url.clone()));
    let event_repo = Arc::new(EventRepository::new(pool.clone(), schema));
    let factory_repo = Arc::new(FactoryRepository::new(pool.clone(), schema));
    let sync_worker_repo = Arc::new(SyncWorkerRepository::new(pool.clone(), schema));
    let process_worker_repo = Arc::new(ProcessWorkerRepository::new(pool.clone(), schema));
    let rpc_cache_repo = Arc::new(RpcCacheRepository::new(pool.clone(), schema));

    let rpc_client = Arc::new(AlloyRpcClient::new(chain.rpc_url.clone()));
    let rpc = Arc::new(CachedRpc::with_concurrency(
        chain_id,
        rpc_client,
        rpc_cache_repo,
        rpc_cache_concurrency,
    ));

    let catalog = Arc::new(TableCatalog::load(&pool, &schema.app()).await?);
    let db = DbFacade::new(pool.clone(), schema.app(), catalog);

    let syncer = ChainSyncer::new(
        chain.chain.clone(),
        source,
        event_repo.clone(),
        factory_repo,
        sync_worker_repo.clone(),
        cancel.clone(),
    );

    let executor = HandlerExecutor::new(
        chain.chain,
        event_repo,
        sync_worker_repo,
        process_worker_repo,
        registry,
        handler_registry,
        db,
        rpc,
        cancel.clone(),
    )
    .with_poll_interval(std::time::Duration::from_millis(processor_poll_interval_ms));

    tracing::info!(chain_id, "starting sync and processor engines");

    tokio::select! {
        result = syncer.run() => {
            result.map_err(|e| anyhow::anyhow!("chain {chain_id} syncer exited: {e}"))
        }
        result = executor.run() => {
            result.map_err(|e| anyhow::anyhow!("chain {chain_id} processor exited: {e}"))
        }
        _ = cancel.cancelled() => Ok(()),
    }
}
