//! Simulation metrics.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use serde::Serialize;

/// Client-side view of a simulation run.
#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    /// Operations attempted.
    pub total_operations: u64,
    /// Operations the engine completed.
    pub successful_operations: u64,
    /// Operations the engine rejected.
    pub failed_operations: u64,
    /// Rejections grouped by error code.
    failures_by_code: BTreeMap<String, u64>,
    /// Latency samples (µs).
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    max_samples: usize,
}

/// Serialisable summary of [`SimulationMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub failures_by_code: BTreeMap<String, u64>,
    pub success_rate: f64,
    pub throughput_per_sec: f64,
    pub average_latency_us: u64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub p99_latency_us: u64,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self::with_capacity(100_000)
    }

    pub fn with_capacity(max_samples: usize) -> Self {
        Self {
            total_operations: 0,
            successful_operations: 0,
            failed_operations: 0,
            failures_by_code: BTreeMap::new(),
            latency_samples: VecDeque::with_capacity(max_samples.min(10_000)),
            max_samples: max_samples.max(1),
        }
    }

    /// Record a completed operation.
    pub fn record_success(&mut self, latency: Duration) {
        self.total_operations += 1;
        self.successful_operations += 1;
        self.push_sample(latency);
    }

    /// Record a rejected operation.
    pub fn record_failure(&mut self, code: &str, latency: Duration) {
        self.total_operations += 1;
        self.failed_operations += 1;
        *self.failures_by_code.entry(code.to_string()).or_default() += 1;
        self.push_sample(latency);
    }

    /// Fold another task's metrics into this one.
    pub fn merge(&mut self, other: SimulationMetrics) {
        self.total_operations += other.total_operations;
        self.successful_operations += other.successful_operations;
        self.failed_operations += other.failed_operations;
        for (code, count) in other.failures_by_code {
            *self.failures_by_code.entry(code).or_default() += count;
        }
        for sample in other.latency_samples {
            self.push_latency_us(sample);
        }
    }

    pub fn failures(&self, code: &str) -> u64 {
        self.failures_by_code.get(code).copied().unwrap_or(0)
    }

    /// Get average latency in µs.
    pub fn average_latency_us(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    /// Get percentile latency in µs.
    pub fn percentile_latency_us(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Get success rate.
    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }

        self.successful_operations as f64 / self.total_operations as f64
    }

    /// Operations per second over `elapsed`.
    pub fn throughput(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }

        self.total_operations as f64 / secs
    }

    pub fn summary(&self, elapsed: Duration) -> MetricsSummary {
        MetricsSummary {
            total_operations: self.total_operations,
            successful_operations: self.successful_operations,
            failed_operations: self.failed_operations,
            failures_by_code: self.failures_by_code.clone(),
            success_rate: self.success_rate(),
            throughput_per_sec: self.throughput(elapsed),
            average_latency_us: self.average_latency_us(),
            p50_latency_us: self.percentile_latency_us(50),
            p95_latency_us: self.percentile_latency_us(95),
            p99_latency_us: self.percentile_latency_us(99),
        }
    }

    fn push_sample(&mut self, latency: Duration) {
        self.push_latency_us(latency.as_micros().min(u64::MAX as u128) as u64);
    }

    fn push_latency_us(&mut self, sample: u64) {
        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(sample);
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
