//! Handler registration (spec.md §4.7 "Handler registration"). Handlers are
//! keyed by `contractName:eventName` and carry a dispatch mode; a
//! topic0-backed lookup is built once at startup by the `DecoderRegistry`
//! the `HandlerExecutor` is constructed with.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use kyomei_common::types::{DecodedEvent, HandlerMode};

use crate::context::HandlerContext;

pub type HandlerResult = anyhow::Result<()>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
pub type HandlerFn = Arc<dyn Fn(DecodedEvent, HandlerContext) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    pub contract_name: String,
    pub event_name: String,
}

impl HandlerKey {
    pub fn new(contract_name: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            contract_name: contract_name.into(),
            event_name: event_name.into(),
        }
    }
}

#[derive(Clone)]
pub struct RegisteredHandler {
    pub mode: HandlerMode,
    pub func: HandlerFn,
}

/// Handler registration table. Constructed once at startup; the Processor
/// never mutates it while running.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerKey, RegisteredHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(
        &mut self,
        contract_name: impl Into<String>,
        event_name: impl Into<String>,
        mode: HandlerMode,
        handler: F,
    ) where
        F: Fn(DecodedEvent, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let key = HandlerKey::new(contract_name, event_name);
        let func: HandlerFn = Arc::new(move |event, ctx| Box::pin(handler(event, ctx)));
        self.handlers.insert(key, RegisteredHandler { mode, func });
    }

    pub fn get(&self, contract_name: &str, event_name: &str) -> Option<&RegisteredHandler> {
        self.handlers
            .get(&HandlerKey::new(contract_name, event_name))
    }

    /// Every registered `(contractName, eventName)` pair — used by the
    /// Processor to resolve the topic0 selectors it needs to query for.
    pub fn registered_keys(&self) -> Vec<(String, String)> {
        self.handlers
            .keys()
            .map(|k| (k.contract_name.clone(), k.event_name.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True when every registered handler dispatches in parallel — gates the
    /// streaming-pool fast path (spec.md §4.7).
    pub fn all_parallel(&self) -> bool {
        !self.handlers.is_empty()
            && self
                .handlers
                .values()
                .all(|h| h.mode == HandlerMode::Parallel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_not_all_parallel() {
        assert!(!HandlerRegistry::new().all_parallel());
    }

    #[test]
    fn all_parallel_requires_every_handler_to_opt_in() {
        let mut registry = HandlerRegistry::new();
        registry.register("token", "Transfer", HandlerMode::Parallel, |_, _| async { Ok(()) });
        assert!(registry.all_parallel());

        registry.register("token", "Approval", HandlerMode::Sequential, |_, _| async { Ok(()) });
        assert!(!registry.all_parallel());
    }

    #[test]
    fn lookup_is_keyed_by_contract_and_event_name() {
        let mut registry = HandlerRegistry::new();
        registry.register("token", "Transfer", HandlerMode::Sequential, |_, _| async { Ok(()) });
        assert!(registry.get("token", "Transfer").is_some());
        assert!(registry.get("token", "Approval").is_none());
    }
}
