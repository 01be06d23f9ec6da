//! ABI-as-data: parse a JSON ABI array into events once at registration
//! time, computing each event's selector (topic0) so the registry's lookup
//! is O(1) (spec.md §4.2, DESIGN NOTES §9 "ABI as first-class runtime data").

use alloy::dyn_abi::DynSolType;
use alloy::primitives::{B256, keccak256};
use kyomei_common::error::CoreError;

/// One parameter of an ABI event, as declared in the source JSON.
#[derive(Debug, Clone)]
pub struct AbiParam {
    pub name: String,
    pub ty: DynSolType,
    pub indexed: bool,
}

/// One event declared in a contract ABI, with its selector precomputed.
#[derive(Debug, Clone)]
pub struct AbiEvent {
    pub name: String,
    pub selector: B256,
    pub inputs: Vec<AbiParam>,
}

impl AbiEvent {
    pub fn indexed_params(&self) -> impl Iterator<Item = &AbiParam> {
        self.inputs.iter().filter(|p| p.indexed)
    }

    pub fn data_params(&self) -> impl Iterator<Item = &AbiParam> {
        self.inputs.iter().filter(|p| !p.indexed)
    }
}

/// Parse a JSON ABI array (the shape produced by `solc`/Foundry) into the
/// events it declares. Non-event entries (functions, errors, constructor)
/// are skipped. Returns an error only for a malformed event entry —
/// per-log decode failures are never errors (spec.md §4.2).
pub fn parse_events(abi_json: &serde_json::Value) -> Result<Vec<AbiEvent>, CoreError> {
    let entries = abi_json
        .as_array()
        .ok_or_else(|| CoreError::Config("ABI JSON must be an array".to_string()))?;

    let mut events = Vec::new();
    for entry in entries {
        if entry.get("type").and_then(|v| v.as_str()) != Some("event") {
            continue;
        }
        let name = entry
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Config("ABI event missing name".to_string()))?
            .to_string();

        let inputs_json = entry
            .get("inputs")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut inputs = Vec::with_capacity(inputs_json.len());
        let mut canonical_types = Vec::with_capacity(inputs_json.len());
        for input in &inputs_json {
            let param_name = input
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let indexed = input
                .get("indexed")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let canonical = canonical_type(input)?;
            let ty = DynSolType::parse(&canonical)
                .map_err(|e| CoreError::Config(format!("unsupported ABI type {canonical}: {e}")))?;
            canonical_types.push(canonical);
            inputs.push(AbiParam {
                name: param_name,
                ty,
                indexed,
            });
        }

        let signature = format!("{name}({})", canonical_types.join(","));
        let selector = keccak256(signature.as_bytes());

        events.push(AbiEvent {
            name,
            selector,
            inputs,
        });
    }

    Ok(events)
}

/// Compute the canonical Solidity type string for one ABI input entry,
/// recursing into `components` for tuples.
fn canonical_type(input: &serde_json::Value) -> Result<String, CoreError> {
    let raw_ty = input
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::Config("ABI input missing type".to_string()))?;

    if let Some(rest) = raw_ty.strip_prefix("tuple") {
        let components = input
            .get("components")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let inner: Result<Vec<String>, CoreError> =
            components.iter().map(canonical_type).collect();
        Ok(format!("({}){rest}", inner?.join(",")))
    } else {
        Ok(raw_ty.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_event_selector() {
        let abi = serde_json::json!([
            {
                "type": "event",
                "name": "Transfer",
                "inputs": [
                    {"name": "from", "type": "address", "indexed": true},
                    {"name": "to", "type": "address", "indexed": true},
                    {"name": "value", "type": "uint256", "indexed": false}
                ]
            }
        ]);
        let events = parse_events(&abi).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "Transfer");
        // keccak256("Transfer(address,address,uint256)")
        assert_eq!(
            format!("{:#x}", events[0].selector),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn ignores_non_event_entries() {
        let abi = serde_json::json!([
            {"type": "function", "name": "balanceOf", "inputs": []},
            {"type": "event", "name": "Ping", "inputs": []}
        ]);
        let events = parse_events(&abi).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "Ping");
    }

    #[test]
    fn handles_tuple_components() {
        let abi = serde_json::json!([
            {
                "type": "event",
                "name": "PoolCreated",
                "inputs": [
                    {
                        "name": "info",
                        "type": "tuple",
                        "indexed": false,
                        "components": [
                            {"name": "token0", "type": "address"},
                            {"name": "token1", "type": "address"}
                        ]
                    }
                ]
            }
        ]);
        let events = parse_events(&abi).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].inputs[0].ty, DynSolType::Tuple(vec![DynSolType::Address, DynSolType::Address]));
    }

    #[test]
    fn rejects_non_array_abi() {
        let abi = serde_json::json!({"not": "an array"});
        assert!(parse_events(&abi).is_err());
    }
}
