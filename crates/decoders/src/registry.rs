//! Registry of contract ABIs and the pure topic0-keyed decode routine
//! (spec.md §4.2). No I/O: the only "failure" condition is absence — an
//! unmatched topic0 decodes to `None` and is silently dropped by the
//! Processor.

use std::collections::HashMap;

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, B256, I256, U256};
use chrono::{DateTime, Utc};
use kyomei_blocksource::RawLog;
use kyomei_common::error::CoreError;
use kyomei_common::types::{ChainId, DecodedArgs, DecodedEvent, DecodedValue};

use crate::abi::{AbiEvent, parse_events};

struct RegisteredContract {
    name: String,
    events: Vec<AbiEvent>,
}

/// Maps raw logs to `(contractName, eventName, args)` via a topic0 index.
/// If multiple registered contracts share a selector, each is tried in
/// registration order until one decodes successfully.
pub struct DecoderRegistry {
    contracts: Vec<RegisteredContract>,
    /// selector -> indices into `contracts` whose ABI declares that selector
    by_selector: HashMap<B256, Vec<usize>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self {
            contracts: Vec::new(),
            by_selector: HashMap::new(),
        }
    }

    /// Parse and register one contract's ABI under `name`. Called once at
    /// startup per configured contract.
    pub fn register(&mut self, name: impl Into<String>, abi_json: &serde_json::Value) -> Result<(), CoreError> {
        let events = parse_events(abi_json)?;
        let idx = self.contracts.len();
        for event in &events {
            self.by_selector.entry(event.selector).or_default().push(idx);
        }
        self.contracts.push(RegisteredContract {
            name: name.into(),
            events,
        });
        Ok(())
    }

    /// Resolve one raw log into a decoded event, or `None` if no registered
    /// ABI has an event matching its topic0 (or decoding fails for every
    /// candidate — a malformed/unexpected log, not an exception).
    pub fn decode(
        &self,
        chain_id: ChainId,
        block_number: u64,
        block_hash: &str,
        block_timestamp: DateTime<Utc>,
        log: &RawLog,
    ) -> Option<DecodedEvent> {
        let topic0: B256 = log.topic0()?.parse().ok()?;
        let candidates = self.by_selector.get(&topic0)?;

        for &idx in candidates {
            let contract = &self.contracts[idx];
            let Some(event) = contract.events.iter().find(|e| e.selector == topic0) else {
                continue;
            };
            if let Some(args) = decode_event_args(event, log) {
                return Some(DecodedEvent {
                    chain_id,
                    block_number,
                    block_hash: block_hash.to_string(),
                    block_timestamp,
                    tx_hash: log.tx_hash.clone(),
                    tx_index: log.tx_index,
                    log_index: log.log_index,
                    address: log.address.to_lowercase(),
                    contract_name: contract.name.clone(),
                    event_name: event.name.clone(),
                    args,
                });
            }
        }
        None
    }

    /// All selectors across all registered contracts — used by the
    /// Processor to push the handler-relevance filter into the Event
    /// Repository query (spec.md §4.7 batch mode).
    pub fn all_selectors(&self) -> Vec<B256> {
        self.by_selector.keys().copied().collect()
    }

    /// The selector for one registered `(contractName, eventName)` pair, if
    /// any — lets the Processor narrow its query to exactly the events that
    /// have a handler registered, rather than every decodable event.
    pub fn selector_for(&self, contract_name: &str, event_name: &str) -> Option<B256> {
        self.contracts
            .iter()
            .find(|c| c.name == contract_name)
            .and_then(|c| c.events.iter().find(|e| e.name == event_name))
            .map(|e| e.selector)
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Public entry point for decoding a log against a single already-matched
/// event shape — used by the Factory Watcher, which matches on parent
/// address + selector itself before needing the args.
pub fn decode_event_args_pub(event: &AbiEvent, log: &RawLog) -> Option<DecodedArgs> {
    decode_event_args(event, log)
}

/// Decode one log's indexed topics and non-indexed data against `event`'s
/// declared shape. Returns `None` on any structural mismatch (wrong topic
/// count, undecodable data) rather than propagating an error — a decode
/// miss is never exceptional (spec.md §4.2).
fn decode_event_args(event: &AbiEvent, log: &RawLog) -> Option<DecodedArgs> {
    let indexed: Vec<_> = event.indexed_params().collect();
    if log.topics.len() != indexed.len() + 1 {
        return None;
    }

    let mut args = DecodedArgs::new();

    for (param, topic_hex) in indexed.iter().zip(log.topics.iter().skip(1)) {
        let topic_bytes: B256 = topic_hex.parse().ok()?;
        args.insert(param.name.clone(), decode_topic_value(&param.ty, &topic_bytes));
    }

    let data_params: Vec<_> = event.data_params().collect();
    if !data_params.is_empty() {
        let data_bytes = hex::decode(log.data.trim_start_matches("0x")).ok()?;
        let types: Vec<_> = data_params.iter().map(|p| p.ty.clone()).collect();
        let tuple_ty = alloy::dyn_abi::DynSolType::Tuple(types);
        let decoded = tuple_ty.abi_decode_sequence(&data_bytes).ok()?;
        let values = decoded.as_tuple()?;
        if values.len() != data_params.len() {
            return None;
        }
        for (param, value) in data_params.iter().zip(values.iter()) {
            args.insert(param.name.clone(), dyn_value_to_decoded(value));
        }
    }

    Some(args)
}

/// Decode one indexed topic's raw 32 bytes. Dynamic types (string, bytes,
/// arrays, tuples) are not recoverable from their topic hash — EVM indexes
/// them as `keccak256(value)` — so they're carried as opaque bytes.
fn decode_topic_value(ty: &alloy::dyn_abi::DynSolType, topic: &B256) -> DecodedValue {
    use alloy::dyn_abi::DynSolType as T;
    match ty {
        T::Address => DecodedValue::Address(format!("0x{}", hex::encode(&topic.as_slice()[12..32])).to_lowercase()),
        T::Bool => DecodedValue::Bool(topic.as_slice()[31] != 0),
        T::Uint(_) => DecodedValue::Uint(U256::from_be_bytes(topic.0).to_string()),
        T::Int(_) => DecodedValue::Int(I256::from_be_bytes(topic.0).to_string()),
        T::FixedBytes(n) => DecodedValue::Bytes(topic.as_slice()[..*n].to_vec()),
        _ => DecodedValue::Bytes(topic.as_slice().to_vec()),
    }
}

fn dyn_value_to_decoded(value: &DynSolValue) -> DecodedValue {
    match value {
        DynSolValue::Address(a) => DecodedValue::Address(format!("{a:#x}").to_lowercase()),
        DynSolValue::Bool(b) => DecodedValue::Bool(*b),
        DynSolValue::Uint(v, _) => DecodedValue::Uint(v.to_string()),
        DynSolValue::Int(v, _) => DecodedValue::Int(v.to_string()),
        DynSolValue::FixedBytes(b, n) => DecodedValue::Bytes(b.as_slice()[..*n].to_vec()),
        DynSolValue::Bytes(b) => DecodedValue::Bytes(b.clone()),
        DynSolValue::String(s) => DecodedValue::String(s.clone()),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) => {
            DecodedValue::Array(items.iter().map(dyn_value_to_decoded).collect())
        }
        DynSolValue::Tuple(items) => {
            DecodedValue::Tuple(items.iter().map(dyn_value_to_decoded).collect())
        }
        other => DecodedValue::String(format!("{other:?}")),
    }
}

/// Extract a single address-typed argument from decoded args — used by the
/// Factory Watcher to pull the child address out of a factory event.
pub fn address_arg(args: &DecodedArgs, name: &str) -> Option<Address> {
    match args.get(name)? {
        DecodedValue::Address(a) => a.parse().ok(),
        _ => None,
    }
}

/// Extract a list of addresses from a single array-typed argument.
pub fn address_list_arg(args: &DecodedArgs, name: &str) -> Option<Vec<Address>> {
    match args.get(name)? {
        DecodedValue::Array(items) => items
            .iter()
            .map(|v| match v {
                DecodedValue::Address(a) => a.parse().ok(),
                _ => None,
            })
            .collect(),
        DecodedValue::Address(a) => a.parse().ok().map(|addr| vec![addr]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn transfer_abi() -> serde_json::Value {
        serde_json::json!([
            {
                "type": "event",
                "name": "Transfer",
                "inputs": [
                    {"name": "from", "type": "address", "indexed": true},
                    {"name": "to", "type": "address", "indexed": true},
                    {"name": "value", "type": "uint256", "indexed": false}
                ]
            }
        ])
    }

    #[test]
    fn decodes_known_event() {
        let mut registry = DecoderRegistry::new();
        registry.register("Token", &transfer_abi()).unwrap();

        let selector = registry.all_selectors()[0];
        let value = U256::from(1_000_000u64);
        let data = alloy::dyn_abi::DynSolValue::Tuple(vec![alloy::dyn_abi::DynSolValue::Uint(value, 256)])
            .abi_encode_sequence()
            .unwrap_or_default();

        let from = Address::repeat_byte(0x11);
        let to = Address::repeat_byte(0x22);
        let log = RawLog {
            address: "0xabc".to_string(),
            topics: vec![
                format!("{selector:#x}"),
                format!("0x{:0>64}", hex::encode(from)),
                format!("0x{:0>64}", hex::encode(to)),
            ],
            data: format!("0x{}", hex::encode(&data)),
            tx_hash: "0xdeadbeef".to_string(),
            tx_index: 0,
            log_index: 0,
        };

        let decoded = registry
            .decode(1, 100, "0xblockhash", Utc::now(), &log)
            .expect("should decode");
        assert_eq!(decoded.event_name, "Transfer");
        assert_eq!(decoded.contract_name, "Token");
        assert_eq!(decoded.args.get("value").unwrap(), &DecodedValue::Uint("1000000".to_string()));
    }

    #[test]
    fn unknown_selector_returns_none() {
        let registry = DecoderRegistry::new();
        let log = RawLog {
            address: "0xabc".to_string(),
            topics: vec!["0x1111111111111111111111111111111111111111111111111111111111111111".to_string()],
            data: "0x".to_string(),
            tx_hash: "0x0".to_string(),
            tx_index: 0,
            log_index: 0,
        };
        assert!(registry.decode(1, 1, "0x0", Utc::now(), &log).is_none());
    }

    #[test]
    fn mismatched_topic_count_returns_none() {
        let mut registry = DecoderRegistry::new();
        registry.register("Token", &transfer_abi()).unwrap();
        let selector = registry.all_selectors()[0];
        let log = RawLog {
            address: "0xabc".to_string(),
            topics: vec![format!("{selector:#x}")],
            data: "0x".to_string(),
            tx_hash: "0x0".to_string(),
            tx_index: 0,
            log_index: 0,
        };
        assert!(registry.decode(1, 1, "0x0", Utc::now(), &log).is_none());
    }

    proptest::proptest! {
        /// Selector → signature round-trip (spec.md §8 invariant 7): for any
        /// uint256 transfer amount and any pair of addresses, decoding a log
        /// whose topic0 is the Transfer selector always resolves back to
        /// `eventName = "Transfer"` and the amount survives as a decimal
        /// string with no precision loss.
        #[test]
        fn transfer_amount_round_trips_for_arbitrary_values(
            raw_amount in proptest::prelude::any::<u64>(),
            from_byte in proptest::prelude::any::<u8>(),
            to_byte in proptest::prelude::any::<u8>(),
        ) {
            let mut registry = DecoderRegistry::new();
            registry.register("Token", &transfer_abi()).unwrap();
            let selector = registry.all_selectors()[0];

            let amount = U256::from(raw_amount);
            let data = alloy::dyn_abi::DynSolValue::Tuple(vec![alloy::dyn_abi::DynSolValue::Uint(amount, 256)])
                .abi_encode_sequence()
                .unwrap_or_default();

            let from = Address::repeat_byte(from_byte);
            let to = Address::repeat_byte(to_byte);
            let log = RawLog {
                address: "0xabc".to_string(),
                topics: vec![
                    format!("{selector:#x}"),
                    format!("0x{:0>64}", hex::encode(from)),
                    format!("0x{:0>64}", hex::encode(to)),
                ],
                data: format!("0x{}", hex::encode(&data)),
                tx_hash: "0xdeadbeef".to_string(),
                tx_index: 0,
                log_index: 0,
            };

            let decoded = registry
                .decode(1, 100, "0xblockhash", Utc::now(), &log)
                .expect("should decode");
            proptest::prop_assert_eq!(decoded.event_name, "Transfer");
            proptest::prop_assert_eq!(
                decoded.args.get("value").unwrap(),
                &DecodedValue::Uint(raw_amount.to_string())
            );
            proptest::prop_assert_eq!(
                decoded.args.get("from").unwrap(),
                &DecodedValue::Address(format!("{from:#x}").to_lowercase())
            );
        }
    }
}
