//! Extension point for application-supplied handlers (spec.md §4.7 "Handler
//! registration API": "external code registers handlers ... before the
//! Processor starts; registrations after start are not permitted"). This
//! core workspace ships no business handlers of its own — a deployment
//! embeds its handler functions here, or builds its own binary against
//! `kyomei-engine` directly and calls `HandlerRegistry::register` the same
//! way.

use kyomei_engine::HandlerRegistry;

/// Registers every handler this deployment wants dispatched. Empty by
/// default; add `registry.register("contract", "Event", mode, handler)`
/// calls here before `HandlerExecutor::new` is constructed.
pub fn register_handlers(registry: &mut HandlerRegistry) {
    let _ = registry;
}
