//! Main ledger orchestration layer
//!
//! Ties storage, the catalog and the writer actor together into the API
//! the rest of the winery backend calls.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tank_ledger::{Config, InMemoryCatalog, Ledger};
//!
//! #[tokio::main]
//! async fn main() -> tank_ledger::Result<()> {
//!     let catalog = Arc::new(InMemoryCatalog::from_file("catalog.toml")?);
//!     let ledger = Ledger::open(Config::default(), catalog).await?;
//!
//!     // let entries = ledger.record_transfer(transfer).await?;
//!     // let snapshot = ledger.composition(tank_id, None)?;
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    actor::{spawn_ledger_actor, LedgerHandle},
    catalog::Catalog,
    composition::CompositionSnapshot,
    derivation::Deriver,
    integrity::{self, IntegrityReport, LedgerStats, RebuildOptions, RebuildSummary},
    metrics::Metrics,
    types::{
        EntryId, EventId, IntakeEvent, LedgerEntry, LoggedEvent, SourceEventRecord, TankId,
        TenantId, TransferEvent,
    },
    Config, Error, Result, Storage,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Main ledger interface
pub struct Ledger {
    /// Actor handle for writes
    handle: LedgerHandle,

    /// Writer task, awaited on shutdown
    actor: JoinHandle<()>,

    /// Direct storage access (for reads)
    storage: Arc<Storage>,

    /// Tank and batch lookups
    catalog: Arc<dyn Catalog>,

    /// Metrics collector
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("data_dir", &self.config.data_dir)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Open ledger with configuration
    pub async fn open(config: Config, catalog: Arc<dyn Catalog>) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Metrics::new()
            .map_err(|e| Error::Other(format!("Failed to register metrics: {}", e)))?;

        let (handle, actor) = spawn_ledger_actor(
            storage.clone(),
            catalog.clone(),
            Deriver::new(config.composition.materiality_threshold_l),
            metrics.clone(),
            config.mailbox_capacity,
        );

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            data_dir = ?config.data_dir,
            "Tank ledger started"
        );

        Ok(Self {
            handle,
            actor,
            storage,
            catalog,
            metrics,
            config,
        })
    }

    /// Record a transfer and derive its entries
    pub async fn record_transfer(&self, transfer: TransferEvent) -> Result<Vec<LedgerEntry>> {
        self.handle.record(SourceEventRecord::Transfer(transfer)).await
    }

    /// Record an intake and derive its entry
    pub async fn record_intake(&self, intake: IntakeEvent) -> Result<Vec<LedgerEntry>> {
        self.handle.record(SourceEventRecord::Intake(intake)).await
    }

    /// Delete an event and every entry derived from it
    pub async fn delete_event(&self, event_id: EventId) -> Result<usize> {
        self.handle.delete_event(event_id).await
    }

    /// Append a hand-built entry (corrections, imports)
    pub async fn append_entry(&self, entry: LedgerEntry) -> Result<EntryId> {
        self.handle.append_entry(entry).await
    }

    /// Replay the recorded event log
    pub async fn rebuild(&self, options: RebuildOptions) -> Result<RebuildSummary> {
        self.handle.rebuild(options).await
    }

    /// Recorded event by ID
    pub fn event(&self, event_id: EventId) -> Result<LoggedEvent> {
        self.storage.get_event(event_id)
    }

    /// What a tank holds, optionally as of a past instant (inclusive)
    pub fn composition(
        &self,
        tank: TankId,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<CompositionSnapshot> {
        self.require_tank(tank)?;
        let entries = self.storage.entries_for_tank(tank, as_of)?;
        Ok(CompositionSnapshot::build(
            tank,
            as_of,
            &entries,
            self.catalog.as_ref(),
        ))
    }

    /// Current composition of every active tank holding wine
    pub fn all_compositions(&self, tenant: TenantId) -> Result<Vec<CompositionSnapshot>> {
        self.catalog
            .tanks(tenant)
            .into_iter()
            .filter(|t| t.active && t.current_volume > Decimal::ZERO)
            .map(|t| -> Result<CompositionSnapshot> {
                let entries = self.storage.entries_for_tank(t.id, None)?;
                Ok(CompositionSnapshot::build(
                    t.id,
                    None,
                    &entries,
                    self.catalog.as_ref(),
                ))
            })
            .collect()
    }

    /// A tank's entries, newest first; `None` uses the configured default limit
    pub fn entry_history(&self, tank: TankId, limit: Option<usize>) -> Result<Vec<LedgerEntry>> {
        self.require_tank(tank)?;
        let limit = limit.unwrap_or(self.config.composition.default_history_limit);

        let mut entries = self.storage.entries_for_tank(tank, None)?;
        entries.sort_by_key(|e| Reverse(e.order_key()));
        entries.truncate(limit);
        Ok(entries)
    }

    /// Reconcile a tenant's active tanks against their stored volumes
    pub fn integrity_report(&self, tenant: TenantId) -> Result<IntegrityReport> {
        let report = integrity::reconcile(
            &self.storage,
            self.catalog.as_ref(),
            tenant,
            self.config.composition.reconciliation_tolerance_l,
        )?;
        self.metrics.set_integrity_issues(report.tanks_with_issues);
        Ok(report)
    }

    /// Entry counts for a tenant
    pub fn stats(&self, tenant: TenantId) -> Result<LedgerStats> {
        integrity::stats(&self.storage, tenant)
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the writer and wait for it to finish
    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown().await?;
        self.actor
            .await
            .map_err(|e| Error::Concurrency(format!("Ledger actor panicked: {}", e)))?;
        tracing::info!("Tank ledger stopped");
        Ok(())
    }

    fn require_tank(&self, tank: TankId) -> Result<()> {
        match self.catalog.tank(tank) {
            Some(_) => Ok(()),
            None => Err(Error::TankNotFound(tank.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BatchRecord, GrapeSource, InMemoryCatalog, TankRecord};
    use crate::types::{BatchId, BatchRef, CompositionKey, Derivation};
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    struct TestLedger {
        ledger: Ledger,
        catalog: Arc<InMemoryCatalog>,
        tenant: TenantId,
        _temp: TempDir,
    }

    async fn create_test_ledger() -> TestLedger {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let catalog = Arc::new(InMemoryCatalog::new());
        let ledger = Ledger::open(config, catalog.clone()).await.unwrap();

        TestLedger {
            ledger,
            catalog,
            tenant: TenantId::new(),
            _temp: temp_dir,
        }
    }

    fn add_tank(t: &TestLedger, code: &str, volume: i64) -> TankId {
        let id = TankId::new();
        t.catalog.upsert_tank(TankRecord {
            id,
            tenant: t.tenant,
            code: code.to_string(),
            name: String::new(),
            capacity: Decimal::from(10_000),
            current_volume: Decimal::from(volume),
            active: true,
        });
        id
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 20, hour, 0, 0).unwrap()
    }

    fn intake(t: &TestLedger, tank: TankId, batch: &BatchRef, liters: i64, hour: u32) -> IntakeEvent {
        IntakeEvent {
            id: EventId::new(),
            tenant: t.tenant,
            destination_tank: tank,
            batch: batch.clone(),
            volume: Decimal::from(liters),
            event_timestamp: at(hour),
        }
    }

    #[tokio::test]
    async fn test_ledger_open() {
        let t = create_test_ledger().await;
        t.ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_composition_of_unknown_tank_fails() {
        let t = create_test_ledger().await;
        let err = t.ledger.composition(TankId::new(), None).unwrap_err();
        assert!(matches!(err, Error::TankNotFound(_)));
        t.ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_point_in_time_composition() {
        let t = create_test_ledger().await;
        let tank = add_tank(&t, "A01", 0);
        let (x, y) = (
            BatchRef::new(BatchId::new(), "X"),
            BatchRef::new(BatchId::new(), "Y"),
        );

        t.ledger.record_intake(intake(&t, tank, &x, 300, 8)).await.unwrap();
        t.ledger.record_intake(intake(&t, tank, &y, 100, 12)).await.unwrap();

        let morning = t.ledger.composition(tank, Some(at(9))).unwrap();
        assert_eq!(morning.total_volume, Decimal::from(300));
        assert_eq!(morning.by_batch.len(), 1);

        let exact = t.ledger.composition(tank, Some(at(12))).unwrap();
        assert_eq!(exact.total_volume, Decimal::from(400));

        let now = t.ledger.composition(tank, None).unwrap();
        assert_eq!(now.by_batch[0].label, "X");
        assert_eq!(now.by_batch[0].percentage, Decimal::new(7500, 2));

        t.ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_entry_history_newest_first_with_limit() {
        let t = create_test_ledger().await;
        let tank = add_tank(&t, "A01", 0);
        let batch = BatchRef::new(BatchId::new(), "24-CF-01");

        for hour in [9, 7, 11, 8] {
            t.ledger.record_intake(intake(&t, tank, &batch, 10, hour)).await.unwrap();
        }

        let history = t.ledger.entry_history(tank, Some(3)).unwrap();
        let hours: Vec<DateTime<Utc>> = history.iter().map(|e| e.event_timestamp).collect();
        assert_eq!(hours, vec![at(11), at(9), at(8)]);

        assert_eq!(t.ledger.entry_history(tank, None).unwrap().len(), 4);
        t.ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_all_compositions_lists_filled_active_tanks() {
        let t = create_test_ledger().await;
        let full = add_tank(&t, "A01", 300);
        let _empty = add_tank(&t, "A02", 0);
        let batch = BatchRef::new(BatchId::new(), "24-ZI-01");
        t.ledger.record_intake(intake(&t, full, &batch, 300, 8)).await.unwrap();

        let all = t.ledger.all_compositions(t.tenant).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].tank, full);

        t.ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_variety_breakdown_through_catalog() {
        let t = create_test_ledger().await;
        let tank = add_tank(&t, "A01", 500);
        let batch_id = BatchId::new();
        t.catalog.upsert_batch(BatchRecord {
            id: batch_id,
            tenant: t.tenant,
            code: "24-BL-01".into(),
            sources: vec![
                GrapeSource {
                    weight_kg: Decimal::from(800),
                    variety: Some("Grenache".into()),
                    vineyard: None,
                },
                GrapeSource {
                    weight_kg: Decimal::from(200),
                    variety: Some("Mourvèdre".into()),
                    vineyard: None,
                },
            ],
        });

        let batch = BatchRef::new(batch_id, "24-BL-01");
        t.ledger.record_intake(intake(&t, tank, &batch, 500, 8)).await.unwrap();

        let snapshot = t.ledger.composition(tank, None).unwrap();
        assert_eq!(snapshot.by_variety[0].variety, "Grenache");
        assert_eq!(snapshot.by_variety[0].volume, Decimal::from(400));
        assert_eq!(snapshot.by_variety[1].percentage, Decimal::new(2000, 2));

        t.ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_entry_and_stats() {
        let t = create_test_ledger().await;
        let tank = add_tank(&t, "A01", 40);

        t.ledger
            .append_entry(LedgerEntry::new(
                t.tenant,
                None,
                at(6),
                tank,
                Decimal::from(40),
                CompositionKey::unknown("Opening balance"),
                Derivation::Unknown,
            ))
            .await
            .unwrap();

        let stats = t.ledger.stats(t.tenant).unwrap();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.tanks_with_unknown, 1);

        let report = t.ledger.integrity_report(t.tenant).unwrap();
        assert_eq!(report.tanks_with_issues, 1);
        assert_eq!(t.ledger.metrics().integrity_issues.get(), 1);

        t.ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_keeps_entries() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let catalog = Arc::new(InMemoryCatalog::new());
        let tenant = TenantId::new();
        let tank = TankId::new();
        catalog.upsert_tank(TankRecord {
            id: tank,
            tenant,
            code: "A01".into(),
            name: String::new(),
            capacity: Decimal::from(1000),
            current_volume: Decimal::from(100),
            active: true,
        });

        let event = IntakeEvent {
            id: EventId::new(),
            tenant,
            destination_tank: tank,
            batch: BatchRef::new(BatchId::new(), "B"),
            volume: Decimal::from(100),
            event_timestamp: Utc::now() - Duration::hours(1),
        };

        let ledger = Ledger::open(config.clone(), catalog.clone()).await.unwrap();
        ledger.record_intake(event.clone()).await.unwrap();
        ledger.shutdown().await.unwrap();

        let ledger = Ledger::open(config, catalog).await.unwrap();
        assert_eq!(ledger.event(event.id).unwrap().event.id(), event.id);
        assert!(ledger.integrity_report(tenant).unwrap().is_clean());
        ledger.shutdown().await.unwrap();
    }
}
