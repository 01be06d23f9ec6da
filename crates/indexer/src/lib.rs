pub mod address_filter;
pub mod reorg;
pub mod syncer;
pub mod worker;

pub use address_filter::AddressFilter;
pub use reorg::ReorgDetector;
pub use syncer::ChainSyncer;
