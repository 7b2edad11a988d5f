//! Request metrics per routing mode.
//!
//! Counts are kept in-process only; they are logged on shutdown and exposed on
//! `/health`.

use crate::routing::RoutingMode;
use crate::types::LatencyMs;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ModeMetrics {
    pub requests: u64,
    pub failures: u64,
    pub short_circuits: u64,
    pub total_latency_ms: u128,
    pub last_latency_ms: u128,
}

impl ModeMetrics {
    pub fn average_latency_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.requests as f64
        }
    }
}

/// How a routed request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    /// A middleware answered without reaching the processor.
    ShortCircuited,
    Failed,
}

#[derive(Clone, Default)]
pub struct RouterMetrics {
    modes: Arc<RwLock<HashMap<RoutingMode, ModeMetrics>>>,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, mode: RoutingMode, outcome: Outcome, latency: LatencyMs) {
        let mut modes = self.modes.write().await;
        let entry = modes.entry(mode).or_default();
        entry.requests += 1;
        match outcome {
            Outcome::Processed => {}
            Outcome::ShortCircuited => entry.short_circuits += 1,
            Outcome::Failed => entry.failures += 1,
        }
        entry.total_latency_ms += latency.0;
        entry.last_latency_ms = latency.0;
    }

    pub async fn get(&self, mode: RoutingMode) -> ModeMetrics {
        self.modes.read().await.get(&mode).cloned().unwrap_or_default()
    }

    /// Keyed by the mode's header value (`debugger`, `agent-runner`).
    pub async fn snapshot(&self) -> HashMap<&'static str, ModeMetrics> {
        self.modes
            .read()
            .await
            .iter()
            .map(|(mode, m)| (mode.as_str(), m.clone()))
            .collect()
    }

    pub async fn log_summary(&self) {
        let modes = self.modes.read().await;
        if modes.is_empty() {
            return;
        }

        tracing::info!("=== ROUTER METRICS ===");
        for (mode, m) in modes.iter() {
            tracing::info!(
                "Mode {}: {} requests | {} failed | {} short-circuited | avg {:.1} ms",
                mode,
                m.requests,
                m.failures,
                m.short_circuits,
                m.average_latency_ms()
            );
        }
        tracing::info!("======================");
    }
}
