//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify:
//! - Conservation: a snapshot matches its tank's entries summed directly
//! - Explicit exactness: a named batch moves exactly the transfer volume
//! - Proportional split: inherited shares follow the source composition
//! - Idempotent rebuild: replaying twice changes nothing

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use tank_ledger::{
    derivation::Deriver, BatchId, BatchRef, CompositionKey, Config, Derivation, EventId,
    InMemoryCatalog, IntakeEvent, Ledger, LedgerEntry, RebuildOptions, SourceEventRecord, Storage,
    TankId, TankRecord, TenantId, TransferEvent,
};

const TANKS: usize = 3;

/// Strategy for generating valid volumes (positive, centiliter precision)
fn volume_strategy() -> impl Strategy<Value = Decimal> {
    (1u64..500_000u64).prop_map(|cl| Decimal::new(cl as i64, 2))
}

#[derive(Debug, Clone)]
enum Op {
    Intake { tank: usize, batch: usize, volume: Decimal },
    Move { from: usize, offset: usize, volume: Decimal },
    External { to: usize, volume: Decimal },
    Drain { from: usize, volume: Decimal },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..TANKS, 0..4usize, volume_strategy())
            .prop_map(|(tank, batch, volume)| Op::Intake { tank, batch, volume }),
        (0..TANKS, 1..TANKS, volume_strategy())
            .prop_map(|(from, offset, volume)| Op::Move { from, offset, volume }),
        (0..TANKS, volume_strategy()).prop_map(|(to, volume)| Op::External { to, volume }),
        (0..TANKS, volume_strategy()).prop_map(|(from, volume)| Op::Drain { from, volume }),
    ]
}

struct Winery {
    ledger: Ledger,
    tenant: TenantId,
    tanks: Vec<TankId>,
    batches: Vec<BatchRef>,
    _temp: tempfile::TempDir,
}

/// Create test ledger with temp directory
async fn create_winery() -> Winery {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();

    let tenant = TenantId::new();
    let catalog = InMemoryCatalog::new();
    let tanks: Vec<TankId> = (0..TANKS).map(|_| TankId::new()).collect();
    for (i, id) in tanks.iter().enumerate() {
        catalog.upsert_tank(TankRecord {
            id: *id,
            tenant,
            code: format!("T{}", i),
            name: String::new(),
            capacity: Decimal::from(100_000),
            current_volume: Decimal::ZERO,
            active: true,
        });
    }
    let batches = (0..4)
        .map(|i| BatchRef::new(BatchId::new(), format!("24-B{}", i)))
        .collect();

    Winery {
        ledger: Ledger::open(config, Arc::new(catalog)).await.unwrap(),
        tenant,
        tanks,
        batches,
        _temp: temp_dir,
    }
}

fn at(step: usize) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap() + Duration::minutes(step as i64)
}

fn transfer(
    w: &Winery,
    source: Option<usize>,
    destination: Option<usize>,
    batch: Option<BatchRef>,
    volume: Decimal,
    step: usize,
) -> TransferEvent {
    TransferEvent {
        id: EventId::new(),
        tenant: w.tenant,
        source_tank: source.map(|i| w.tanks[i]),
        destination_tank: destination.map(|i| w.tanks[i]),
        batch,
        volume,
        event_timestamp: at(step),
    }
}

async fn apply(w: &Winery, op: &Op, step: usize) -> Vec<LedgerEntry> {
    match op.clone() {
        Op::Intake { tank, batch, volume } => w
            .ledger
            .record_intake(IntakeEvent {
                id: EventId::new(),
                tenant: w.tenant,
                destination_tank: w.tanks[tank],
                batch: w.batches[batch].clone(),
                volume,
                event_timestamp: at(step),
            })
            .await
            .unwrap(),
        Op::Move { from, offset, volume } => {
            let to = (from + offset) % TANKS;
            w.ledger
                .record_transfer(transfer(w, Some(from), Some(to), None, volume, step))
                .await
                .unwrap()
        }
        Op::External { to, volume } => w
            .ledger
            .record_transfer(transfer(w, None, Some(to), None, volume, step))
            .await
            .unwrap(),
        Op::Drain { from, volume } => w
            .ledger
            .record_transfer(transfer(w, Some(from), None, None, volume, step))
            .await
            .unwrap(),
    }
}

fn side_sum(entries: &[LedgerEntry], tank: TankId) -> Decimal {
    entries
        .iter()
        .filter(|e| e.tank == tank)
        .map(|e| e.delta_volume)
        .sum()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: at every point in time a snapshot agrees with the raw entries
    /// summed independently, in total and per batch
    #[test]
    fn prop_conservation(ops in prop::collection::vec(op_strategy(), 1..25)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let w = create_winery().await;
            for (step, op) in ops.iter().enumerate() {
                apply(&w, op, step).await;
            }

            let epsilon = Decimal::new(1, 9);
            for tank in &w.tanks {
                let history = w.ledger.entry_history(*tank, Some(usize::MAX)).unwrap();
                for step in [0, ops.len() / 2, ops.len()] {
                    let visible: Vec<&LedgerEntry> = history
                        .iter()
                        .filter(|e| e.event_timestamp <= at(step))
                        .collect();
                    let snapshot = w.ledger.composition(*tank, Some(at(step))).unwrap();

                    let ledger_total: Decimal = visible.iter().map(|e| e.delta_volume).sum();
                    prop_assert!((snapshot.total_volume - ledger_total).abs() <= epsilon);

                    let unknown: Decimal = visible
                        .iter()
                        .filter(|e| e.composition_key.is_unknown())
                        .map(|e| e.delta_volume)
                        .sum();
                    prop_assert!((snapshot.unknown_volume - unknown).abs() <= epsilon);

                    for share in &snapshot.by_batch {
                        let batch: Decimal = visible
                            .iter()
                            .filter(|e| matches!(
                                &e.composition_key,
                                CompositionKey::Batch { batch_id, .. } if *batch_id == share.batch_id
                            ))
                            .map(|e| e.delta_volume)
                            .sum();
                        prop_assert!((share.volume - batch).abs() <= epsilon);
                    }
                    prop_assert!(snapshot.conservation_residual().abs() <= epsilon);
                }
            }

            w.ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: inherited sides lose at most one materiality threshold per dropped share
    #[test]
    fn prop_inherited_sides_balance(ops in prop::collection::vec(op_strategy(), 1..25)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let w = create_winery().await;
            let threshold = Decimal::new(1, 2);

            for (step, op) in ops.iter().enumerate() {
                // Composition the transfer will split against
                let negative_source = match op {
                    Op::Move { from, .. } => w
                        .ledger
                        .composition(w.tanks[*from], Some(at(step)))
                        .unwrap()
                        .has_negative_composition,
                    _ => false,
                };

                let entries = apply(&w, op, step).await;
                if let Op::Move { from, offset, volume } = op {
                    let to = (from + offset) % TANKS;
                    let out = side_sum(&entries, w.tanks[*from]);
                    let inflow = side_sum(&entries, w.tanks[to]);
                    prop_assert_eq!(out, -inflow);

                    // At most four batches plus the unknown group can be dropped
                    if !negative_source {
                        prop_assert!(inflow <= *volume);
                        prop_assert!(*volume - inflow < threshold * Decimal::from(5));
                    }
                }
            }

            w.ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: a transfer naming a batch moves exactly its volume on both sides
    #[test]
    fn prop_explicit_exactness(volume in volume_strategy()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let w = create_winery().await;
            let batch = w.batches[0].clone();

            let entries = w
                .ledger
                .record_transfer(transfer(&w, Some(0), Some(1), Some(batch.clone()), volume, 1))
                .await
                .unwrap();

            prop_assert_eq!(entries.len(), 2);
            prop_assert_eq!(side_sum(&entries, w.tanks[0]), -volume);
            prop_assert_eq!(side_sum(&entries, w.tanks[1]), volume);
            for entry in &entries {
                prop_assert_eq!(entry.derivation, Derivation::Explicit);
                prop_assert_eq!(&entry.composition_key, &CompositionKey::batch(batch.id, batch.code.clone()));
            }

            w.ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: replaying the event log a second time creates nothing
    #[test]
    fn prop_rebuild_idempotent(ops in prop::collection::vec(op_strategy(), 1..15)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let w = create_winery().await;
            for (step, op) in ops.iter().enumerate() {
                apply(&w, op, step).await;
            }
            let before: Vec<_> = w
                .tanks
                .iter()
                .map(|t| w.ledger.composition(*t, None).unwrap())
                .collect();

            let summary = w.ledger.rebuild(RebuildOptions::default()).await.unwrap();
            prop_assert_eq!(summary.entries_created, 0);
            prop_assert_eq!(summary.events_skipped + summary.events_processed, ops.len());

            let after: Vec<_> = w
                .tanks
                .iter()
                .map(|t| w.ledger.composition(*t, None).unwrap())
                .collect();
            prop_assert_eq!(before, after);

            w.ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: each inherited share is the source group's fraction of the volume
    #[test]
    fn prop_proportional_split(
        groups in prop::collection::vec(1u64..100_000u64, 1..6),
        percent in 1u64..=100u64,
    ) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.composition.materiality_threshold_l = Decimal::ZERO;
        let storage = Storage::open(&config).unwrap();
        let deriver = Deriver::new(config.composition.materiality_threshold_l);

        let tenant = TenantId::new();
        let (source, dest) = (TankId::new(), TankId::new());
        let volumes: Vec<Decimal> = groups.iter().map(|v| Decimal::from(*v)).collect();
        let total: Decimal = volumes.iter().sum();

        let mut uow = storage.begin();
        for (i, volume) in volumes.iter().enumerate() {
            uow.append_entry(LedgerEntry::new(
                tenant,
                None,
                at(0),
                source,
                *volume,
                CompositionKey::batch(BatchId::new(), format!("G{}", i)),
                Derivation::Explicit,
            ))
            .unwrap();
        }
        uow.commit().unwrap();

        let moved = total * Decimal::from(percent) / Decimal::ONE_HUNDRED;
        let event = SourceEventRecord::Transfer(TransferEvent {
            id: EventId::new(),
            tenant,
            source_tank: Some(source),
            destination_tank: Some(dest),
            batch: None,
            volume: moved,
            event_timestamp: at(1),
        });
        let entries = deriver.derive(&storage.begin(), &event).unwrap();

        prop_assert_eq!(side_sum(&entries, source), -moved);
        prop_assert_eq!(side_sum(&entries, dest), moved);

        let epsilon = Decimal::new(1, 9);
        let source_entries = storage.entries_for_tank(source, None).unwrap();
        for entry in entries.iter().filter(|e| e.tank == dest) {
            let group: Decimal = source_entries
                .iter()
                .filter(|s| s.composition_key == entry.composition_key)
                .map(|s| s.delta_volume)
                .sum();
            let expected = moved * group / total;
            prop_assert!((entry.delta_volume - expected).abs() <= epsilon);
        }
    }
}
