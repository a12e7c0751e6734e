//! Prometheus-compatible self-heal metrics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A single Prometheus metric.
#[derive(Debug, Clone)]
pub struct Metric {
    /// Metric name (e.g., "mirrorfs_heal_attempts_total").
    pub name: String,
    /// Help text for the metric.
    pub help: String,
    /// Metric type ("counter" or "gauge").
    pub metric_type: String,
    /// Current value.
    pub value: u64,
}

impl Metric {
    /// Create a new counter metric.
    pub fn counter(name: &str, help: &str, value: u64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "counter".to_string(),
            value,
        }
    }

    /// Format this metric as Prometheus text exposition format.
    pub fn format(&self) -> String {
        let mut output = format!("# HELP {} {}\n", self.name, self.help);
        output.push_str(&format!("# TYPE {} {}\n", self.name, self.metric_type));
        output.push_str(&format!("{} {}\n", self.name, self.value));
        output
    }
}

/// Point-in-time copy of [`HealMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealMetricsSnapshot {
    /// Heal attempts started.
    pub attempts: u64,
    /// Attempts that found nothing to heal.
    pub clean: u64,
    /// Attempts that healed every sink.
    pub healed: u64,
    /// Attempts that healed only some sinks.
    pub partial: u64,
    /// Attempts aborted for lack of lockable replicas.
    pub insufficient_quorum: u64,
    /// Attempts that hit unresolved split brain.
    pub split_brain: u64,
    /// Split brains resolved by forced source selection.
    pub forced_split_brain: u64,
    /// Attempts that failed during classification, discovery or finalization.
    pub decision_failures: u64,
    /// Attempts whose source could not be read during repair.
    pub source_failures: u64,
    /// Attempts whose pending-marker commit failed.
    pub commit_failures: u64,
    /// Individual sinks repaired.
    pub sinks_healed: u64,
    /// Individual sinks left unrepaired.
    pub sinks_failed: u64,
}

/// Self-heal counters, safe to share between concurrent heals.
#[derive(Debug, Default)]
pub struct HealMetrics {
    attempts: AtomicU64,
    clean: AtomicU64,
    healed: AtomicU64,
    partial: AtomicU64,
    insufficient_quorum: AtomicU64,
    split_brain: AtomicU64,
    forced_split_brain: AtomicU64,
    decision_failures: AtomicU64,
    source_failures: AtomicU64,
    commit_failures: AtomicU64,
    sinks_healed: AtomicU64,
    sinks_failed: AtomicU64,
}

impl HealMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_attempts(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_clean(&self) {
        self.clean.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_healed(&self) {
        self.healed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_partial(&self) {
        self.partial.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_insufficient_quorum(&self) {
        self.insufficient_quorum.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_split_brain(&self) {
        self.split_brain.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_forced_split_brain(&self) {
        self.forced_split_brain.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_decision_failures(&self) {
        self.decision_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_source_failures(&self) {
        self.source_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_commit_failures(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_sinks(&self, healed: u64, failed: u64) {
        self.sinks_healed.fetch_add(healed, Ordering::Relaxed);
        self.sinks_failed.fetch_add(failed, Ordering::Relaxed);
    }

    /// Copies the current counter values.
    pub fn snapshot(&self) -> HealMetricsSnapshot {
        HealMetricsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            clean: self.clean.load(Ordering::Relaxed),
            healed: self.healed.load(Ordering::Relaxed),
            partial: self.partial.load(Ordering::Relaxed),
            insufficient_quorum: self.insufficient_quorum.load(Ordering::Relaxed),
            split_brain: self.split_brain.load(Ordering::Relaxed),
            forced_split_brain: self.forced_split_brain.load(Ordering::Relaxed),
            decision_failures: self.decision_failures.load(Ordering::Relaxed),
            source_failures: self.source_failures.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            sinks_healed: self.sinks_healed.load(Ordering::Relaxed),
            sinks_failed: self.sinks_failed.load(Ordering::Relaxed),
        }
    }
}

impl HealMetricsSnapshot {
    /// Converts the snapshot to Prometheus counters.
    pub fn to_metrics(&self) -> Vec<Metric> {
        vec![
            Metric::counter("mirrorfs_heal_attempts_total", "Metadata heal attempts started", self.attempts),
            Metric::counter("mirrorfs_heal_clean_total", "Attempts with nothing to heal", self.clean),
            Metric::counter("mirrorfs_heal_healed_total", "Attempts that healed every sink", self.healed),
            Metric::counter("mirrorfs_heal_partial_total", "Attempts that healed only some sinks", self.partial),
            Metric::counter(
                "mirrorfs_heal_insufficient_quorum_total",
                "Attempts aborted for lack of lockable replicas",
                self.insufficient_quorum,
            ),
            Metric::counter("mirrorfs_heal_split_brain_total", "Attempts that hit metadata split brain", self.split_brain),
            Metric::counter(
                "mirrorfs_heal_forced_split_brain_total",
                "Split brains resolved by forced source selection",
                self.forced_split_brain,
            ),
            Metric::counter(
                "mirrorfs_heal_decision_failures_total",
                "Attempts that failed before a source was chosen",
                self.decision_failures,
            ),
            Metric::counter(
                "mirrorfs_heal_source_failures_total",
                "Attempts whose source was unreadable during repair",
                self.source_failures,
            ),
            Metric::counter(
                "mirrorfs_heal_commit_failures_total",
                "Attempts whose pending-marker commit failed",
                self.commit_failures,
            ),
            Metric::counter("mirrorfs_heal_sinks_healed_total", "Sinks repaired", self.sinks_healed),
            Metric::counter("mirrorfs_heal_sinks_failed_total", "Sinks left unrepaired", self.sinks_failed),
        ]
    }

    /// Renders every counter in Prometheus text exposition format.
    pub fn format_prometheus(&self) -> String {
        self.to_metrics().iter().map(Metric::format).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_format() {
        let m = Metric::counter("x_total", "An x", 3);
        assert_eq!(m.format(), "# HELP x_total An x\n# TYPE x_total counter\nx_total 3\n");
    }

    #[test]
    fn test_snapshot_reflects_increments() {
        let metrics = HealMetrics::new();
        metrics.inc_attempts();
        metrics.inc_attempts();
        metrics.inc_partial();
        metrics.add_sinks(2, 1);

        let snap = metrics.snapshot();
        assert_eq!(snap.attempts, 2);
        assert_eq!(snap.partial, 1);
        assert_eq!(snap.sinks_healed, 2);
        assert_eq!(snap.sinks_failed, 1);
    }

    #[test]
    fn test_format_prometheus_lists_every_counter() {
        let text = HealMetrics::new().snapshot().format_prometheus();
        assert_eq!(text.matches("# TYPE").count(), 12);
        assert!(text.contains("mirrorfs_heal_split_brain_total 0"));
    }
}
