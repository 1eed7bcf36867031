//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use paywallet_ledger::TransactionKind;

/// Transaction engine metrics.
#[derive(Default)]
pub struct EngineMetrics {
    /// Completed credits.
    pub credits: AtomicU64,
    /// Completed debits.
    pub debits: AtomicU64,
    /// Completed transfers.
    pub transfers: AtomicU64,
    /// Completed reversals.
    pub reversals: AtomicU64,
    /// Requests answered with an existing transaction.
    pub replays: AtomicU64,
    /// Operations that returned an error.
    pub failures: AtomicU64,
    /// Operations canceled by their deadline.
    pub canceled: AtomicU64,
    /// Attempts retried after a transient storage failure.
    pub storage_retries: AtomicU64,
    /// Operations currently in flight.
    pub in_flight: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an operation as in flight until the returned guard drops.
    pub fn operation_started(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlight { metrics: self }
    }

    /// Record a committed operation.
    pub fn completed(&self, kind: TransactionKind) {
        let counter = match kind {
            TransactionKind::Credit => &self.credits,
            TransactionKind::Debit => &self.debits,
            TransactionKind::Transfer => &self.transfers,
            TransactionKind::Reversal => &self.reversals,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn replayed(&self) {
        self.replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn canceled(&self) {
        self.canceled.fetch_add(1, Ordering::Relaxed);
        self.failed();
    }

    pub fn storage_retry(&self) {
        self.storage_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            credits: self.credits.load(Ordering::Relaxed),
            debits: self.debits.load(Ordering::Relaxed),
            transfers: self.transfers.load(Ordering::Relaxed),
            reversals: self.reversals.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            storage_retries: self.storage_retries.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();
        for (name, help, kind, value) in [
            ("credits_total", "Completed credits", "counter", s.credits),
            ("debits_total", "Completed debits", "counter", s.debits),
            ("transfers_total", "Completed transfers", "counter", s.transfers),
            ("reversals_total", "Completed reversals", "counter", s.reversals),
            ("replays_total", "Idempotent replays", "counter", s.replays),
            ("failures_total", "Failed operations", "counter", s.failures),
            ("canceled_total", "Operations past their deadline", "counter", s.canceled),
            ("storage_retries_total", "Retried storage attempts", "counter", s.storage_retries),
            ("in_flight", "Operations in progress", "gauge", s.in_flight),
        ] {
            out.push_str(&format!(
                "# HELP paywallet_{name} {help}\n# TYPE paywallet_{name} {kind}\npaywallet_{name} {value}\n\n"
            ));
        }
        out
    }
}

/// Holds one unit of the `in_flight` gauge.
#[must_use = "the operation leaves the gauge when this is dropped"]
pub struct InFlight<'a> {
    metrics: &'a EngineMetrics,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub credits: u64,
    pub debits: u64,
    pub transfers: u64,
    pub reversals: u64,
    pub replays: u64,
    pub failures: u64,
    pub canceled: u64,
    pub storage_retries: u64,
    pub in_flight: u64,
}

impl MetricsSnapshot {
    /// Operations that changed balances.
    pub fn completed(&self) -> u64 {
        self.credits + self.debits + self.transfers + self.reversals
    }
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<EngineMetrics>;
