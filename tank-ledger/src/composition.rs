//! Composition query engine
//!
//! Folds a tank's ledger entries into a point-in-time snapshot: volume by
//! batch, by grape variety, by vineyard block and the unknown fraction.
//!
//! # Algorithm
//!
//! 1. Sum `delta_volume` per [`GroupKey`]; the total is the sum of all groups.
//! 2. Any negative group flags an integrity issue (kept, never clamped).
//! 3. Batch groups are decomposed across the batch's grape sources by
//!    weight fraction. Weight stands in for volume here; juice yield per
//!    variety is not modelled.
//! 4. Any unknown volume also flags an integrity issue.

use crate::catalog::BatchLookup;
use crate::types::{BatchId, CompositionKey, GroupKey, LedgerEntry, LotId, TankId};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const UNKNOWN_NAME: &str = "Unknown";

/// Summed volume for one composition key
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    /// Key as first seen in the tank's history
    pub key: CompositionKey,
    /// Net liters
    pub volume: Decimal,
}

/// Entries summed by composition key, without any catalog lookups
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregate {
    /// Net liters across all groups
    pub total: Decimal,
    /// Net liters of unknown origin
    pub unknown: Decimal,
    /// Batch and wine-lot groups, largest first
    pub groups: Vec<Group>,
    /// Some group (unknown included) is below zero
    pub has_negative: bool,
}

impl Aggregate {
    /// Sum entries by group
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Self {
        let mut index: HashMap<GroupKey, usize> = HashMap::new();
        let mut groups: Vec<Group> = Vec::new();
        let mut unknown = Decimal::ZERO;
        let mut unknown_seen = false;

        for entry in entries {
            match entry.composition_key.group() {
                GroupKey::Unknown => {
                    unknown += entry.delta_volume;
                    unknown_seen = true;
                }
                group => {
                    let slot = *index.entry(group).or_insert_with(|| {
                        groups.push(Group {
                            key: entry.composition_key.clone(),
                            volume: Decimal::ZERO,
                        });
                        groups.len() - 1
                    });
                    groups[slot].volume += entry.delta_volume;
                }
            }
        }

        let total = groups.iter().map(|g| g.volume).sum::<Decimal>() + unknown;
        let has_negative =
            (unknown_seen && unknown < Decimal::ZERO) || groups.iter().any(|g| g.volume < Decimal::ZERO);

        groups.sort_by(|a, b| {
            b.volume
                .cmp(&a.volume)
                .then_with(|| a.key.label().cmp(b.key.label()))
        });

        Self {
            total,
            unknown,
            groups,
            has_negative,
        }
    }

    /// Groups a transfer can inherit from: positive volume only
    pub fn positive_groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter().filter(|g| g.volume > Decimal::ZERO)
    }
}

/// Batch share of a tank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchShare {
    /// Batch ID
    pub batch_id: BatchId,
    /// Batch code
    pub label: String,
    /// Net liters
    pub volume: Decimal,
    /// Share of total volume, 2 dp
    pub percentage: Decimal,
}

/// Wine-lot share of a tank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotShare {
    /// Lot ID
    pub lot_id: LotId,
    /// Lot label
    pub label: String,
    /// Net liters
    pub volume: Decimal,
    /// Share of total volume, 2 dp
    pub percentage: Decimal,
}

/// Grape variety share of a tank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarietyShare {
    /// Variety name
    pub variety: String,
    /// Liters attributed by weight fraction
    pub volume: Decimal,
    /// Share of total volume, 2 dp
    pub percentage: Decimal,
}

/// Vineyard block share of a tank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VineyardShare {
    /// Vineyard block name
    pub vineyard: String,
    /// Grower name
    pub grower: String,
    /// Liters attributed by weight fraction
    pub volume: Decimal,
    /// Share of total volume, 2 dp
    pub percentage: Decimal,
}

/// What sits in a tank at a point in time. Computed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionSnapshot {
    /// Tank
    pub tank: TankId,
    /// Cut-off, None for the full history
    pub as_of: Option<DateTime<Utc>>,
    /// Net liters according to the ledger
    pub total_volume: Decimal,
    /// Liters of unknown origin
    pub unknown_volume: Decimal,
    /// Unknown share, 2 dp
    pub unknown_percentage: Decimal,
    /// Negative group or unknown volume present
    pub has_integrity_issues: bool,
    /// Some group is below zero
    pub has_negative_composition: bool,
    /// By batch, largest first
    pub by_batch: Vec<BatchShare>,
    /// By wine lot, largest first
    pub by_wine_lot: Vec<LotShare>,
    /// By grape variety, largest first
    pub by_variety: Vec<VarietyShare>,
    /// By vineyard block and grower, largest first
    pub by_vineyard: Vec<VineyardShare>,
}

impl CompositionSnapshot {
    /// Build a snapshot from a tank's entries (already cut at `as_of`)
    pub fn build<B: BatchLookup + ?Sized>(
        tank: TankId,
        as_of: Option<DateTime<Utc>>,
        entries: &[LedgerEntry],
        batches: &B,
    ) -> Self {
        let aggregate = Aggregate::from_entries(entries);
        let total = aggregate.total;

        let mut by_batch = Vec::new();
        let mut by_wine_lot = Vec::new();
        let mut varieties: HashMap<String, Decimal> = HashMap::new();
        let mut vineyards: HashMap<(String, String), Decimal> = HashMap::new();

        // Drained groups stay listed at 0%
        for group in &aggregate.groups {
            match &group.key {
                CompositionKey::Batch { batch_id, label } => {
                    by_batch.push(BatchShare {
                        batch_id: *batch_id,
                        label: label.clone(),
                        volume: group.volume,
                        percentage: group_percentage(group.volume, total),
                    });
                    if group.volume.is_zero() {
                        continue;
                    }
                    decompose_batch(
                        *batch_id,
                        group.volume,
                        batches,
                        &mut varieties,
                        &mut vineyards,
                    );
                }
                CompositionKey::WineLot { lot_id, label } => {
                    by_wine_lot.push(LotShare {
                        lot_id: *lot_id,
                        label: label.clone(),
                        volume: group.volume,
                        percentage: group_percentage(group.volume, total),
                    });
                }
                CompositionKey::Unknown { .. } => {}
            }
        }

        let mut by_variety: Vec<VarietyShare> = varieties
            .into_iter()
            .map(|(variety, volume)| VarietyShare {
                variety,
                volume,
                percentage: percentage(volume, total),
            })
            .collect();
        by_variety.sort_by(|a, b| b.volume.cmp(&a.volume).then_with(|| a.variety.cmp(&b.variety)));

        let mut by_vineyard: Vec<VineyardShare> = vineyards
            .into_iter()
            .map(|((vineyard, grower), volume)| VineyardShare {
                vineyard,
                grower,
                volume,
                percentage: percentage(volume, total),
            })
            .collect();
        by_vineyard.sort_by(|a, b| {
            b.volume
                .cmp(&a.volume)
                .then_with(|| a.vineyard.cmp(&b.vineyard))
                .then_with(|| a.grower.cmp(&b.grower))
        });

        Self {
            tank,
            as_of,
            total_volume: total,
            unknown_volume: aggregate.unknown,
            unknown_percentage: percentage(aggregate.unknown, total),
            has_integrity_issues: aggregate.has_negative || aggregate.unknown > Decimal::ZERO,
            has_negative_composition: aggregate.has_negative,
            by_batch,
            by_wine_lot,
            by_variety,
            by_vineyard,
        }
    }

    /// Total minus the sum of all reported groups. Zero unless something is broken.
    pub fn conservation_residual(&self) -> Decimal {
        let batches: Decimal = self.by_batch.iter().map(|b| b.volume).sum();
        let lots: Decimal = self.by_wine_lot.iter().map(|l| l.volume).sum();
        self.total_volume - batches - lots - self.unknown_volume
    }
}

fn decompose_batch<B: BatchLookup + ?Sized>(
    batch_id: BatchId,
    volume: Decimal,
    batches: &B,
    varieties: &mut HashMap<String, Decimal>,
    vineyards: &mut HashMap<(String, String), Decimal>,
) {
    let Some(batch) = batches.batch(batch_id) else {
        tracing::debug!(batch = %batch_id, "Batch missing, left out of variety/vineyard breakdown");
        return;
    };
    if batch.sources.is_empty() {
        return;
    }

    let total_weight = batch.total_weight();
    let source_count = Decimal::from(batch.sources.len());

    for source in &batch.sources {
        let share = if total_weight > Decimal::ZERO {
            volume * source.weight_kg / total_weight
        } else {
            volume / source_count
        };

        let variety = source
            .variety
            .clone()
            .unwrap_or_else(|| UNKNOWN_NAME.to_string());
        *varieties.entry(variety).or_insert(Decimal::ZERO) += share;

        if let Some(block) = &source.vineyard {
            let grower = block
                .grower
                .clone()
                .unwrap_or_else(|| UNKNOWN_NAME.to_string());
            *vineyards
                .entry((block.name.clone(), grower))
                .or_insert(Decimal::ZERO) += share;
        }
    }
}

/// `part / total * 100` rounded half-up to 2 dp; 0 when the total is not positive
pub fn percentage(part: Decimal, total: Decimal) -> Decimal {
    if total <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (part / total * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn group_percentage(volume: Decimal, total: Decimal) -> Decimal {
    if volume > Decimal::ZERO {
        percentage(volume, total)
    } else {
        Decimal::ZERO
    }
}
