//! Event derivation engine
//!
//! Decomposes a transfer or intake into ledger entries.
//!
//! # Rules
//!
//! Applied to the outflow side (source tank) and then the inflow side
//! (destination tank) of a transfer:
//!
//! - **Explicit**: the event names a batch; one entry per side carrying the
//!   full signed volume.
//! - **Inherited**: no batch but a source tank; the volume is split across
//!   the source tank's composition as of the event. The composition is read
//!   once, before any of the event's own entries exist, so both sides split
//!   against the same state.
//! - **Unknown**: the source tank has no positive volume on record, or the
//!   wine comes from outside (destination only, no batch).
//!
//! Shares are allocated cumulatively (`volume * running_total / total`
//! minus the previous allocation), so one side's shares add up to the
//! side's signed volume exactly, less any shares dropped by the
//! materiality threshold.

use crate::catalog::{BatchLookup, Catalog, TankLookup};
use crate::composition::Aggregate;
use crate::storage::UnitOfWork;
use crate::types::{
    BatchId, CompositionKey, Derivation, IntakeEvent, LedgerEntry, SourceEvent, SourceEventRecord,
    TankId, TenantId, TransferEvent,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Turns events into ledger entries
#[derive(Debug, Clone)]
pub struct Deriver {
    materiality_threshold: Decimal,
}

impl Deriver {
    /// Create a deriver that drops inherited shares below `materiality_threshold` liters
    pub fn new(materiality_threshold: Decimal) -> Self {
        Self {
            materiality_threshold,
        }
    }

    /// Materiality threshold in liters
    pub fn materiality_threshold(&self) -> Decimal {
        self.materiality_threshold
    }

    /// Compute the entries for an event against the state visible in `uow`.
    /// Nothing is staged; the caller appends the result.
    pub fn derive(&self, uow: &UnitOfWork<'_>, event: &SourceEventRecord) -> Result<Vec<LedgerEntry>> {
        match event {
            SourceEventRecord::Transfer(transfer) => self.derive_transfer(uow, transfer),
            SourceEventRecord::Intake(intake) => Ok(vec![derive_intake(intake)]),
        }
    }

    fn derive_transfer(
        &self,
        uow: &UnitOfWork<'_>,
        transfer: &TransferEvent,
    ) -> Result<Vec<LedgerEntry>> {
        let side = Side {
            tenant: transfer.tenant,
            source: SourceEvent::Transfer(transfer.id),
            at: transfer.event_timestamp,
        };

        // Read once so the outflow entries don't shrink what the inflow inherits
        let attribution = match (&transfer.batch, transfer.source_tank) {
            (Some(batch), _) => {
                Attribution::Explicit(CompositionKey::batch(batch.id, batch.code.clone()))
            }
            (None, Some(source_tank)) => Attribution::Inherited(Aggregate::from_entries(
                &uow.entries_for_tank(source_tank, Some(transfer.event_timestamp))?,
            )),
            (None, None) => Attribution::External,
        };

        let mut entries = Vec::new();
        if let Some(source_tank) = transfer.source_tank {
            entries.extend(self.side_entries(&side, source_tank, -transfer.volume.abs(), &attribution));
        }
        if let Some(destination_tank) = transfer.destination_tank {
            entries.extend(self.side_entries(
                &side,
                destination_tank,
                transfer.volume.abs(),
                &attribution,
            ));
        }
        Ok(entries)
    }

    fn side_entries(
        &self,
        side: &Side,
        tank: TankId,
        signed_volume: Decimal,
        attribution: &Attribution,
    ) -> Vec<LedgerEntry> {
        match attribution {
            Attribution::Explicit(key) => {
                vec![side.entry(tank, signed_volume, key.clone(), Derivation::Explicit)]
            }
            Attribution::Inherited(composition) => {
                self.inherit(side, tank, signed_volume, composition)
            }
            Attribution::External => vec![side.entry(
                tank,
                signed_volume,
                CompositionKey::unknown(CompositionKey::LABEL_EXTERNAL),
                Derivation::Unknown,
            )],
        }
    }

    fn inherit(
        &self,
        side: &Side,
        tank: TankId,
        signed_volume: Decimal,
        composition: &Aggregate,
    ) -> Vec<LedgerEntry> {
        let total = composition.total;

        if total <= Decimal::ZERO {
            return vec![side.entry(
                tank,
                signed_volume,
                CompositionKey::unknown(CompositionKey::LABEL_NO_SOURCE),
                Derivation::Unknown,
            )];
        }

        if composition.has_negative {
            tracing::warn!(
                tank = %tank,
                "Source composition has negative groups; inherited shares will not sum to the transfer volume"
            );
        }

        let mut parts: Vec<(CompositionKey, Decimal)> = Vec::new();
        if composition.unknown > Decimal::ZERO {
            parts.push((
                CompositionKey::unknown(CompositionKey::LABEL_INHERITED),
                composition.unknown,
            ));
        }
        parts.extend(
            composition
                .positive_groups()
                .map(|g| (g.key.clone(), g.volume)),
        );

        let mut entries = Vec::with_capacity(parts.len());
        let mut running = Decimal::ZERO;
        let mut allocated = Decimal::ZERO;

        for (key, group_volume) in parts {
            running += group_volume;
            let cumulative = signed_volume * running / total;
            let share = cumulative - allocated;
            allocated = cumulative;

            if share.abs() < self.materiality_threshold {
                tracing::debug!(tank = %tank, key = %key, share = %share, "Immaterial share skipped");
                continue;
            }
            entries.push(side.entry(tank, share, key, Derivation::Inherited));
        }

        entries
    }
}

/// How a transfer's volume is attributed on both sides
enum Attribution {
    /// The event names a batch
    Explicit(CompositionKey),
    /// Split across the source tank's composition
    Inherited(Aggregate),
    /// Wine from outside the winery
    External,
}

/// Shared fields of every entry one event produces
struct Side {
    tenant: TenantId,
    source: SourceEvent,
    at: DateTime<Utc>,
}

impl Side {
    fn entry(
        &self,
        tank: TankId,
        volume: Decimal,
        key: CompositionKey,
        derivation: Derivation,
    ) -> LedgerEntry {
        LedgerEntry::new(
            self.tenant,
            Some(self.source),
            self.at,
            tank,
            volume,
            key,
            derivation,
        )
    }
}

fn derive_intake(intake: &IntakeEvent) -> LedgerEntry {
    LedgerEntry::new(
        intake.tenant,
        Some(SourceEvent::Intake(intake.id)),
        intake.event_timestamp,
        intake.destination_tank,
        intake.volume.abs(),
        CompositionKey::batch(intake.batch.id, intake.batch.code.clone()),
        Derivation::Explicit,
    )
}

/// Check an event before anything is derived from it
pub fn validate_event<C: Catalog + ?Sized>(event: &SourceEventRecord, catalog: &C) -> Result<()> {
    match event {
        SourceEventRecord::Transfer(transfer) => {
            require_positive(transfer.volume)?;
            match (transfer.source_tank, transfer.destination_tank) {
                (None, None) => {
                    return Err(Error::Validation(
                        "Transfer needs a source or destination tank".to_string(),
                    ))
                }
                (Some(source), Some(destination)) if source == destination => {
                    return Err(Error::Validation(
                        "Source and destination tank must differ".to_string(),
                    ))
                }
                _ => {}
            }
            for tank in transfer.source_tank.iter().chain(transfer.destination_tank.iter()) {
                require_tank(catalog, *tank, transfer.tenant)?;
            }
            if let Some(batch) = &transfer.batch {
                require_batch_tenant(catalog, batch.id, transfer.tenant)?;
            }
        }
        SourceEventRecord::Intake(intake) => {
            require_positive(intake.volume)?;
            require_tank(catalog, intake.destination_tank, intake.tenant)?;
            require_batch_tenant(catalog, intake.batch.id, intake.tenant)?;
        }
    }
    Ok(())
}

/// Check a hand-built entry before it is appended
pub fn validate_entry<C: Catalog + ?Sized>(
    entry: &LedgerEntry,
    catalog: &C,
    uow: &UnitOfWork<'_>,
) -> Result<()> {
    require_tank(catalog, entry.tank, entry.tenant)?;
    if let CompositionKey::Batch { batch_id, .. } = &entry.composition_key {
        require_batch_tenant(catalog, *batch_id, entry.tenant)?;
    }

    if let Some(source) = entry.source_event {
        if let Some(logged) = uow.find_event(source.id())? {
            if logged.event.tenant() != entry.tenant {
                return Err(Error::Validation(format!(
                    "Event {} belongs to another tenant",
                    source.id()
                )));
            }
        }
    }
    Ok(())
}

fn require_positive(volume: Decimal) -> Result<()> {
    if volume <= Decimal::ZERO {
        return Err(Error::Validation("Volume must be positive".to_string()));
    }
    Ok(())
}

fn require_tank<T: TankLookup + ?Sized>(tanks: &T, tank: TankId, tenant: TenantId) -> Result<()> {
    let record = tanks
        .tank(tank)
        .ok_or_else(|| Error::TankNotFound(tank.to_string()))?;
    if record.tenant != tenant {
        return Err(Error::Validation(format!(
            "Tank {} does not belong to tenant {}",
            tank, tenant
        )));
    }
    Ok(())
}

/// A batch the catalog doesn't know is accepted; one owned by another winery is not
fn require_batch_tenant<B: BatchLookup + ?Sized>(
    batches: &B,
    batch: BatchId,
    tenant: TenantId,
) -> Result<()> {
    match batches.batch(batch) {
        Some(record) if record.tenant != tenant => Err(Error::Validation(format!(
            "Batch {} belongs to another tenant",
            batch
        ))),
        _ => Ok(()),
    }
}
