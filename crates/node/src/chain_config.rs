//! Loads per-chain configuration from a JSON file (spec.md §6's
//! "Configuration contract"). The loader itself is an external collaborator
//! per spec.md §1; this is the minimal reference form the binary needs to
//! be runnable at all.

use kyomei_common::types::ChainConfig;
use serde::Deserialize;

/// One chain's `ChainConfig` plus the RPC endpoint it's reached through —
/// `ChainConfig` itself has no notion of a transport, since the Block
/// Source abstraction is pluggable per spec.md §4.1.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainNodeConfig {
    pub rpc_url: String,
    #[serde(flatten)]
    pub chain: ChainConfig,
}

/// Reads a JSON array of [`ChainNodeConfig`] from `path`.
pub fn load_chains(path: &str) -> anyhow::Result<Vec<ChainNodeConfig>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading chain config {path}: {e}"))?;
    let chains: Vec<ChainNodeConfig> = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("parsing chain config {path}: {e}"))?;
    if chains.is_empty() {
        anyhow::bail!("chain config {path} declares no chains");
    }
    Ok(chains)
}
