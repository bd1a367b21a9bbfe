//! Integrity and rebuild
//!
//! - **Rebuild** replays the recorded event log through the deriver, one
//!   unit of work per tenant. Already-derived events are skipped unless the
//!   tenant's entries are cleared first.
//! - **Reconciliation** compares every active tank's ledger total to the
//!   tank's stored volume. Report only.
//! - **Stats** count a tenant's entries and the tanks they touch.

use crate::catalog::Catalog;
use crate::composition::CompositionSnapshot;
use crate::derivation::Deriver;
use crate::storage::Storage;
use crate::types::{Derivation, LedgerEntry, TankId, TenantId};
use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag that stops a running rebuild between events
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// New, unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the rebuild to stop
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Rebuild parameters
#[derive(Debug, Clone, Default)]
pub struct RebuildOptions {
    /// Limit to one tenant; all tenants with recorded events otherwise
    pub tenant: Option<TenantId>,
    /// Do all the work, then discard it
    pub dry_run: bool,
    /// Delete the tenant's entries before replaying
    pub clear_existing: bool,
    /// Checked between events
    pub cancel: CancelFlag,
}

/// What a rebuild did (or would have done, for a dry run)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildSummary {
    /// Tenants replayed
    pub tenants: usize,
    /// Events derived
    pub events_processed: usize,
    /// Events that already had entries
    pub events_skipped: usize,
    /// Entries created
    pub entries_created: usize,
    /// Entries deleted by `clear_existing`
    pub entries_cleared: usize,
    /// Nothing was committed
    pub dry_run: bool,
}

/// Replay recorded events into ledger entries
///
/// Each tenant commits on its own; a failure or cancellation leaves earlier
/// tenants committed and discards the current one.
pub fn rebuild(
    storage: &Storage,
    deriver: &Deriver,
    options: &RebuildOptions,
) -> Result<RebuildSummary> {
    let tenants = match options.tenant {
        Some(tenant) => vec![tenant],
        None => storage.tenants_with_events()?,
    };

    let mut summary = RebuildSummary {
        dry_run: options.dry_run,
        ..Default::default()
    };

    for tenant in tenants {
        let mut uow = storage.begin();
        let mut processed = 0;
        let mut skipped = 0;

        let cleared = if options.clear_existing {
            uow.clear_tenant(tenant)?
        } else {
            0
        };

        for logged in storage.events_for_tenant(tenant)? {
            if options.cancel.is_cancelled() {
                uow.rollback();
                tracing::warn!(tenant = %tenant, processed, "Rebuild cancelled");
                return Err(Error::Cancelled(format!(
                    "stopped in tenant {} after {} events",
                    tenant, processed
                )));
            }

            let event_id = logged.event.id();
            if !options.clear_existing && uow.has_entries_for_event(event_id)? {
                skipped += 1;
                continue;
            }

            for entry in deriver.derive(&uow, &logged.event)? {
                uow.append_entry(entry)?;
            }
            processed += 1;
        }

        let created = uow.appended();
        if options.dry_run {
            uow.rollback();
        } else {
            uow.commit()?;
        }

        tracing::info!(
            tenant = %tenant,
            processed,
            skipped,
            created,
            cleared,
            dry_run = options.dry_run,
            "Tenant rebuilt"
        );

        summary.tenants += 1;
        summary.events_processed += processed;
        summary.events_skipped += skipped;
        summary.entries_created += created;
        summary.entries_cleared += cleared;
    }

    Ok(summary)
}

/// One reconciled tank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TankIntegrity {
    /// Tank
    pub tank: TankId,
    /// Tank code
    pub tank_code: String,
    /// Liters of unknown origin
    pub unknown_volume: Decimal,
    /// Unknown share, 2 dp
    pub unknown_percentage: Decimal,
    /// Unknown volume present
    pub has_unknown_volume: bool,
    /// Some group is below zero
    pub has_negative_composition: bool,
    /// Ledger total
    pub ledger_volume: Decimal,
    /// Stored tank volume
    pub tank_volume: Decimal,
    /// Ledger total minus stored volume
    pub difference: Decimal,
    /// `|difference|` exceeds the tolerance
    pub mismatch: bool,
}

impl TankIntegrity {
    fn from_snapshot(
        tank_code: String,
        tank_volume: Decimal,
        snapshot: &CompositionSnapshot,
        tolerance: Decimal,
    ) -> Self {
        let difference = snapshot.total_volume - tank_volume;
        Self {
            tank: snapshot.tank,
            tank_code,
            unknown_volume: snapshot.unknown_volume,
            unknown_percentage: snapshot.unknown_percentage,
            has_unknown_volume: snapshot.unknown_volume > Decimal::ZERO,
            has_negative_composition: snapshot.has_negative_composition,
            ledger_volume: snapshot.total_volume,
            tank_volume,
            difference,
            mismatch: difference.abs() > tolerance,
        }
    }

    /// Whether the tank belongs in the report
    pub fn is_flagged(&self) -> bool {
        self.mismatch || self.has_unknown_volume || self.has_negative_composition
    }
}

/// Reconciliation result for a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Tenant
    pub tenant: TenantId,
    /// Tolerance applied, liters
    pub tolerance: Decimal,
    /// Active tanks checked
    pub total_tanks: usize,
    /// Tanks flagged
    pub tanks_with_issues: usize,
    /// Flagged tanks only
    pub issues: Vec<TankIntegrity>,
}

impl IntegrityReport {
    /// No tank flagged
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Reconcile every active tank of a tenant against its stored volume
pub fn reconcile<C: Catalog + ?Sized>(
    storage: &Storage,
    catalog: &C,
    tenant: TenantId,
    tolerance: Decimal,
) -> Result<IntegrityReport> {
    let tanks: Vec<_> = catalog.tanks(tenant).into_iter().filter(|t| t.active).collect();

    let mut issues = Vec::new();
    for tank in &tanks {
        let entries = storage.entries_for_tank(tank.id, None)?;
        let snapshot = CompositionSnapshot::build(tank.id, None, &entries, catalog);
        let check =
            TankIntegrity::from_snapshot(tank.code.clone(), tank.current_volume, &snapshot, tolerance);

        if check.is_flagged() {
            tracing::warn!(
                tank = %tank.id,
                code = %tank.code,
                ledger = %check.ledger_volume,
                stored = %check.tank_volume,
                unknown = %check.unknown_volume,
                negative = check.has_negative_composition,
                "Tank failed reconciliation"
            );
            issues.push(check);
        }
    }

    Ok(IntegrityReport {
        tenant,
        tolerance,
        total_tanks: tanks.len(),
        tanks_with_issues: issues.len(),
        issues,
    })
}

/// Entry counts for a tenant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Tenant
    pub tenant: TenantId,
    /// All entries
    pub total_entries: usize,
    /// Entries attributed to a named batch
    pub explicit: usize,
    /// Entries split from a source tank
    pub inherited: usize,
    /// Entries of unknown origin
    pub unknown: usize,
    /// Tanks with at least one entry
    pub tanks_with_data: usize,
    /// Tanks holding any unknown entry
    pub tanks_with_unknown: usize,
}

/// Count a tenant's entries
pub fn stats(storage: &Storage, tenant: TenantId) -> Result<LedgerStats> {
    Ok(count_entries(tenant, &storage.entries_for_tenant(tenant)?))
}

fn count_entries(tenant: TenantId, entries: &[LedgerEntry]) -> LedgerStats {
    let mut stats = LedgerStats {
        tenant,
        total_entries: entries.len(),
        ..Default::default()
    };
    let mut tanks = HashSet::new();
    let mut tanks_with_unknown = HashSet::new();

    for entry in entries {
        match entry.derivation {
            Derivation::Explicit => stats.explicit += 1,
            Derivation::Inherited => stats.inherited += 1,
            Derivation::Unknown => stats.unknown += 1,
        }
        tanks.insert(entry.tank);
        if entry.composition_key.is_unknown() {
            tanks_with_unknown.insert(entry.tank);
        }
    }

    stats.tanks_with_data = tanks.len();
    stats.tanks_with_unknown = tanks_with_unknown.len();
    stats
}
