//! Metrics collection for observability
//!
//! Prometheus collectors on a private registry, so several ledgers can live
//! in one process (tests open many).
//!
//! # Metrics
//!
//! - `tank_ledger_entries_appended_total` - Ledger entries committed
//! - `tank_ledger_events_derived_total{kind}` - Events recorded and derived, by kind
//! - `tank_ledger_events_deleted_total` - Events removed with their entries
//! - `tank_ledger_derive_duration_seconds` - Record-and-derive latency
//! - `tank_ledger_rebuild_entries_total` - Entries created by committed rebuilds
//! - `tank_ledger_integrity_issues` - Tanks flagged by the last reconciliation

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Entries committed
    pub entries_appended: IntCounter,

    /// Events derived, labelled by kind
    pub events_derived: IntCounterVec,

    /// Events deleted
    pub events_deleted: IntCounter,

    /// Record-and-derive duration histogram
    pub derive_duration: Histogram,

    /// Entries written by committed rebuilds
    pub rebuild_entries: IntCounter,

    /// Flagged tanks in the last integrity report
    pub integrity_issues: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("entries_appended", &self.entries_appended.get())
            .field("events_deleted", &self.events_deleted.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let entries_appended = IntCounter::new(
            "tank_ledger_entries_appended_total",
            "Ledger entries committed",
        )?;
        registry.register(Box::new(entries_appended.clone()))?;

        let events_derived = IntCounterVec::new(
            Opts::new(
                "tank_ledger_events_derived_total",
                "Events recorded and derived into entries",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(events_derived.clone()))?;

        let events_deleted = IntCounter::new(
            "tank_ledger_events_deleted_total",
            "Events removed together with their entries",
        )?;
        registry.register(Box::new(events_deleted.clone()))?;

        let derive_duration = Histogram::with_opts(
            HistogramOpts::new(
                "tank_ledger_derive_duration_seconds",
                "Record-and-derive latency",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0]),
        )?;
        registry.register(Box::new(derive_duration.clone()))?;

        let rebuild_entries = IntCounter::new(
            "tank_ledger_rebuild_entries_total",
            "Entries created by committed rebuilds",
        )?;
        registry.register(Box::new(rebuild_entries.clone()))?;

        let integrity_issues = IntGauge::new(
            "tank_ledger_integrity_issues",
            "Tanks flagged by the last reconciliation",
        )?;
        registry.register(Box::new(integrity_issues.clone()))?;

        Ok(Self {
            entries_appended,
            events_derived,
            events_deleted,
            derive_duration,
            rebuild_entries,
            integrity_issues,
            registry,
        })
    }

    /// Record a derived event and the entries it produced
    pub fn record_derived(&self, kind: &str, entries: usize, duration_seconds: f64) {
        self.events_derived.with_label_values(&[kind]).inc();
        self.entries_appended.inc_by(entries as u64);
        self.derive_duration.observe(duration_seconds);
    }

    /// Record entries appended outside derivation
    pub fn record_entries(&self, entries: usize) {
        self.entries_appended.inc_by(entries as u64);
    }

    /// Record an event deletion
    pub fn record_event_deleted(&self) {
        self.events_deleted.inc();
    }

    /// Record a committed rebuild
    pub fn record_rebuild(&self, entries: usize) {
        self.rebuild_entries.inc_by(entries as u64);
        self.entries_appended.inc_by(entries as u64);
    }

    /// Update the flagged tank count
    pub fn set_integrity_issues(&self, flagged: usize) {
        self.integrity_issues.set(flagged as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
