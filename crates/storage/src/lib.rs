pub mod event_repo;
pub mod factory_repo;
pub mod rpc_cache_repo;
pub mod schema;
pub mod worker_repo;

pub use event_repo::{BlockGap, EventQuery, EventRepository, SortOrder};
pub use factory_repo::FactoryRepository;
pub use rpc_cache_repo::{RpcCacheRepository, compute_request_hash};
pub use schema::Schema;
pub use worker_repo::{ProcessWorkerRepository, SyncWorkerRepository};
