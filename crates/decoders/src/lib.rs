pub mod abi;
pub mod factory;
pub mod registry;

pub use abi::{AbiEvent, AbiParam, parse_events};
pub use factory::{FactoryDiscovery, FactorySpec, FactoryWatcher};
pub use registry::{DecoderRegistry, address_arg, address_list_arg};
