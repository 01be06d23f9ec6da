//! Progress telemetry shared between the Sync Engine and Processor Engine.
//!
//! spec.md §6 leaves the progress callback's transport unspecified ("may be
//! piped to any sink"). This module supplements that with a `tracing`
//! emission so operators get a useful default without wiring up a collector.

use serde::Serialize;

/// Phase reported alongside progress, per spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Historical,
    Live,
    Processing,
}

/// A single progress observation, aggregated across workers for a chain.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub chain_id: u64,
    pub phase: Phase,
    pub blocks_synced: u64,
    pub total_blocks: Option<u64>,
    pub percentage: Option<f64>,
    /// Rolling blocks-per-second.
    pub rate: f64,
    pub workers: u32,
    /// Estimated seconds to completion, when `total_blocks` is known.
    pub eta_seconds: Option<f64>,
}

impl Progress {
    /// Emit this observation as a structured log line. Called by both
    /// engines' throttled progress callbacks in addition to whatever
    /// in-process callback the caller registered.
    pub fn emit(&self) {
        tracing::info!(
            chain_id = self.chain_id,
            phase = ?self.phase,
            blocks_synced = self.blocks_synced,
            total_blocks = self.total_blocks,
            percentage = self.percentage,
            rate = self.rate,
            workers = self.workers,
            eta_seconds = self.eta_seconds,
            "sync progress"
        );
    }
}

/// A callback invoked on every throttled progress tick. Boxed so callers can
/// register closures without the engines needing a generic parameter.
pub type ProgressCallback = Box<dyn Fn(&Progress) + Send + Sync>;
