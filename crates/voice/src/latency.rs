//! Rolling latency distributions for the pipeline stages.
//!
//! A fixed-size sample ring per stage; percentiles are computed over the
//! window on demand. Every sample is also emitted to the metrics
//! recorder so Prometheus sees the full histogram.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;

const WINDOW: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Stt,
    Llm,
    Tts,
    Total,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stt => "stt",
            Self::Llm => "llm",
            Self::Tts => "tts",
            Self::Total => "total",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageStats {
    pub count: u64,
    pub p50_ms: u64,
    pub p99_ms: u64,
    pub mean_ms: f64,
    /// Samples that exceeded the stage's soft budget.
    pub over_budget: u64,
}

#[derive(Default)]
struct Ring {
    samples: VecDeque<u64>,
    count: u64,
    over_budget: u64,
}

/// Rolling distribution over the four stages.
pub struct LatencyTracker {
    stt: Mutex<Ring>,
    llm: Mutex<Ring>,
    tts: Mutex<Ring>,
    total: Mutex<Ring>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            stt: Mutex::new(Ring::default()),
            llm: Mutex::new(Ring::default()),
            tts: Mutex::new(Ring::default()),
            total: Mutex::new(Ring::default()),
        }
    }

    fn ring(&self, stage: Stage) -> &Mutex<Ring> {
        match stage {
            Stage::Stt => &self.stt,
            Stage::Llm => &self.llm,
            Stage::Tts => &self.tts,
            Stage::Total => &self.total,
        }
    }

    /// Record one sample; `budget_ms` marks the soft budget for overage
    /// accounting.
    pub fn record(&self, stage: Stage, elapsed_ms: u64, budget_ms: Option<u64>) {
        let mut ring = self.ring(stage).lock();
        if ring.samples.len() == WINDOW {
            ring.samples.pop_front();
        }
        ring.samples.push_back(elapsed_ms);
        ring.count += 1;
        if let Some(budget) = budget_ms {
            if elapsed_ms > budget {
                ring.over_budget += 1;
                tracing::warn!(
                    stage = stage.as_str(),
                    elapsed_ms,
                    budget_ms = budget,
                    "pipeline stage exceeded its soft budget"
                );
            }
        }
        metrics::histogram!("voxgate_pipeline_latency_ms", "stage" => stage.as_str())
            .record(elapsed_ms as f64);
    }

    pub fn stats(&self, stage: Stage) -> StageStats {
        let ring = self.ring(stage).lock();
        if ring.samples.is_empty() {
            return StageStats {
                count: ring.count,
                over_budget: ring.over_budget,
                ..Default::default()
            };
        }
        let mut sorted: Vec<u64> = ring.samples.iter().copied().collect();
        sorted.sort_unstable();
        let percentile = |p: f64| {
            let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
            sorted[idx]
        };
        StageStats {
            count: ring.count,
            p50_ms: percentile(0.50),
            p99_ms: percentile(0.99),
            mean_ms: sorted.iter().sum::<u64>() as f64 / sorted.len() as f64,
            over_budget: ring.over_budget,
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}
