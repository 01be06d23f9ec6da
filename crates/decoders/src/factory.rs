//! Factory address discovery (spec.md §4.3). Pure scanning: given a log and
//! the set of factory specs configured for its chain, produce the children
//! it announces. Persisting discoveries and expanding the live address set
//! is the Sync Engine's job — this module has no storage dependency so
//! decoding and discovery both stay side-effect-free.

use alloy::primitives::Address;

use crate::abi::AbiEvent;
use crate::registry::{address_arg, address_list_arg, decode_event_args_pub};

/// One configured factory relationship: a parent contract whose `event_name`
/// emits one or more child addresses via `child_params`.
pub struct FactorySpec {
    pub parent_address: String,
    pub event: AbiEvent,
    pub child_params: Vec<String>,
    /// Optional label applied to every address this factory discovers,
    /// matching `ContractConfig::name` so discovered children attach to the
    /// right decoder/handler set.
    pub child_contract_name: String,
}

/// One or more child addresses discovered in a single log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryDiscovery {
    pub parent_address: String,
    pub contract_name: String,
    pub children: Vec<Address>,
    pub discovered_at_block: u64,
    pub tx_hash: String,
    pub log_index: u64,
}

pub struct FactoryWatcher {
    specs: Vec<FactorySpec>,
}

impl FactoryWatcher {
    pub fn new(specs: Vec<FactorySpec>) -> Self {
        Self { specs }
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Called once per log within the Sync Engine's per-block loop (after
    /// event decoding, per spec.md §4.6 phase 5). Returns `None` if the log
    /// doesn't match any configured factory's parent address + selector.
    pub fn scan_log(&self, block_number: u64, log: &kyomei_blocksource::RawLog) -> Option<FactoryDiscovery> {
        let topic0 = log.topic0()?;
        for spec in &self.specs {
            if spec.parent_address.to_lowercase() != log.address.to_lowercase() {
                continue;
            }
            if format!("{:#x}", spec.event.selector) != topic0.to_lowercase() {
                continue;
            }
            let args = decode_event_args_pub(&spec.event, log)?;

            let mut children = Vec::new();
            for param_name in &spec.child_params {
                if let Some(addr) = address_arg(&args, param_name) {
                    children.push(addr);
                } else if let Some(addrs) = address_list_arg(&args, param_name) {
                    children.extend(addrs);
                }
            }
            if children.is_empty() {
                continue;
            }

            return Some(FactoryDiscovery {
                parent_address: spec.parent_address.to_lowercase(),
                contract_name: spec.child_contract_name.clone(),
                children,
                discovered_at_block: block_number,
                tx_hash: log.tx_hash.clone(),
                log_index: log.log_index,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::parse_events;

    fn pool_created_event() -> AbiEvent {
        let abi = serde_json::json!([
            {
                "type": "event",
                "name": "PoolCreated",
                "inputs": [
                    {"name": "token0", "type": "address", "indexed": true},
                    {"name": "token1", "type": "address", "indexed": true},
                    {"name": "pool", "type": "address", "indexed": false}
                ]
            }
        ]);
        parse_events(&abi).unwrap().remove(0)
    }

    #[test]
    fn scans_matching_log_and_extracts_child() {
        let event = pool_created_event();
        let selector = event.selector;
        let watcher = FactoryWatcher::new(vec![FactorySpec {
            parent_address: "0xFactory".to_string(),
            event,
            child_params: vec!["pool".to_string()],
            child_contract_name: "Pool".to_string(),
        }]);

        let token0 = Address::repeat_byte(0x01);
        let token1 = Address::repeat_byte(0x02);
        let pool = Address::repeat_byte(0x03);
        let data = alloy::dyn_abi::DynSolValue::Tuple(vec![alloy::dyn_abi::DynSolValue::Address(pool)])
            .abi_encode_sequence()
            .unwrap_or_default();

        let log = kyomei_blocksource::RawLog {
            address: "0xfactory".to_string(),
            topics: vec![
                format!("{selector:#x}"),
                format!("0x{:0>64}", hex::encode(token0)),
                format!("0x{:0>64}", hex::encode(token1)),
            ],
            data: format!("0x{}", hex::encode(&data)),
            tx_hash: "0xabc".to_string(),
            tx_index: 0,
            log_index: 2,
        };

        let discovery = watcher.scan_log(500, &log).expect("should discover");
        assert_eq!(discovery.contract_name, "Pool");
        assert_eq!(discovery.children, vec![pool]);
        assert_eq!(discovery.discovered_at_block, 500);
    }

    #[test]
    fn ignores_log_from_non_factory_address() {
        let event = pool_created_event();
        let selector = event.selector;
        let watcher = FactoryWatcher::new(vec![FactorySpec {
            parent_address: "0xFactory".to_string(),
            event,
            child_params: vec!["pool".to_string()],
            child_contract_name: "Pool".to_string(),
        }]);

        let log = kyomei_blocksource::RawLog {
            address: "0xsomeoneelse".to_string(),
            topics: vec![format!("{selector:#x}")],
            data: "0x".to_string(),
            tx_hash: "0xabc".to_string(),
            tx_index: 0,
            log_index: 0,
        };

        assert!(watcher.scan_log(500, &log).is_none());
    }
}
