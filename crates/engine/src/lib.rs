pub mod cached_rpc;
pub mod context;
pub mod handler;
pub mod processor;

pub use cached_rpc::{AlloyRpcClient, CachedRpc, RawRpcClient, RpcCacheStats, bigint_to_json, json_to_bigint};
pub use context::{Condition, DbFacade, HandlerContext, RpcFacade, TableCatalog};
pub use handler::{HandlerFn, HandlerKey, HandlerRegistry, HandlerResult};
pub use processor::HandlerExecutor;
