//! Per-stage latency ledger
//!
//! One tracker per process. Each stage keeps a ring of the last 1,000
//! samples; percentile snapshots are computed under a short read lock.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Pipeline stage a sample is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Stt,
    Llm,
    Tts,
    Playback,
    Total,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Stt => "stt",
            Stage::Llm => "llm",
            Stage::Tts => "tts",
            Stage::Playback => "playback",
            Stage::Total => "total",
        }
    }
}

const SAMPLE_WINDOW: usize = 1000;

/// Percentile summary of one sample set
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
}

/// Summarise a non-empty sample slice
pub fn percentile_summary(samples: &[f64]) -> LatencySummary {
    if samples.is_empty() {
        return LatencySummary::default();
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let count = sorted.len();
    let at = |p: f64| sorted[((count as f64 * p) as usize).min(count - 1)];

    LatencySummary {
        count,
        mean: sorted.iter().sum::<f64>() / count as f64,
        p50: at(0.5),
        p95: at(0.95),
        p99: at(0.99),
        min: sorted[0],
        max: sorted[count - 1],
    }
}

/// Process-wide latency tracker
#[derive(Default)]
pub struct LatencyTracker {
    stages: RwLock<HashMap<Stage, VecDeque<f64>>>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one stage sample
    pub fn record(&self, request_id: &str, stage: Stage, duration_ms: f64) {
        {
            let mut stages = self.stages.write();
            let samples = stages.entry(stage).or_default();
            samples.push_back(duration_ms);
            while samples.len() > SAMPLE_WINDOW {
                samples.pop_front();
            }
        }
        tracing::debug!(
            request_id,
            stage = stage.as_str(),
            duration_ms,
            "Stage latency recorded"
        );
    }

    /// Snapshot one stage
    pub fn stats(&self, stage: Stage) -> LatencySummary {
        let stages = self.stages.read();
        match stages.get(&stage) {
            Some(samples) if !samples.is_empty() => {
                let copied: Vec<f64> = samples.iter().copied().collect();
                percentile_summary(&copied)
            },
            _ => LatencySummary::default(),
        }
    }

    /// Snapshot every stage with at least one sample
    pub fn all_stats(&self) -> HashMap<Stage, LatencySummary> {
        let stages = self.stages.read();
        stages
            .iter()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(stage, samples)| {
                let copied: Vec<f64> = samples.iter().copied().collect();
                (*stage, percentile_summary(&copied))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stage_is_zeroed() {
        let tracker = LatencyTracker::new();
        let stats = tracker.stats(Stage::Llm);
        assert_eq!(stats.count, 0);
        assert_eq!(stats.p95, 0.0);
    }

    #[test]
    fn test_summary_values() {
        let tracker = LatencyTracker::new();
        for i in 1..=100 {
            tracker.record("r", Stage::Tts, i as f64);
        }
        let stats = tracker.stats(Stage::Tts);
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 100.0);
        assert!((stats.mean - 50.5).abs() < 1e-9);
        assert!(stats.p50 >= 50.0 && stats.p50 <= 51.0);
        assert!(stats.p95 >= 95.0);
    }

    #[test]
    fn test_window_is_bounded() {
        let tracker = LatencyTracker::new();
        for i in 0..2500 {
            tracker.record("r", Stage::Llm, i as f64);
        }
        let stats = tracker.stats(Stage::Llm);
        assert_eq!(stats.count, 1000);
        // Oldest samples fell out of the ring
        assert_eq!(stats.min, 1500.0);
    }

    #[test]
    fn test_stages_are_independent() {
        let tracker = LatencyTracker::new();
        tracker.record("r", Stage::Stt, 5.0);
        assert_eq!(tracker.stats(Stage::Stt).count, 1);
        assert_eq!(tracker.stats(Stage::Playback).count, 0);
        assert_eq!(tracker.all_stats().len(), 1);
    }
}
