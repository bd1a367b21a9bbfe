//! Tank Composition Ledger
//!
//! Append-only record of what wine sits in which tank, derived from
//! transfer and intake events, for a multi-tenant winery backend.
//!
//! # Architecture
//!
//! - **Event Derivation**: Every recorded event becomes signed ledger entries
//! - **Single Writer**: One actor task serializes derive-and-append
//! - **Unit of Work**: Event, entries and indices commit in one RocksDB batch
//! - **Rebuild**: The event log can be replayed into entries at any time
//!
//! # Invariants
//!
//! - Conservation: a tank's volume is the sum of its entries, and the sum
//!   of its composition groups
//! - Explicit exactness: a transfer naming a batch moves exactly its volume
//!   under that batch on both sides
//! - Entries are never updated; they go away only with their event or a
//!   cleared rebuild
//! - Point-in-time: a composition as of `t` sees only entries with
//!   `event_timestamp <= t`

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod storage;
pub mod catalog;
pub mod composition;
pub mod derivation;
pub mod integrity;
pub mod ledger;
pub mod error;
pub mod actor;
pub mod config;
pub mod metrics;

// Re-exports
pub use error::{Error, Result};
pub use types::{
    BatchId, BatchRef, CompositionKey, Derivation, EntryId, EventId, IntakeEvent, LedgerEntry,
    LotId, SourceEvent, SourceEventRecord, TankId, TenantId, TransferEvent,
};
pub use catalog::{
    BatchLookup, BatchRecord, Catalog, GrapeSource, InMemoryCatalog, TankLookup, TankRecord,
    VineyardBlock,
};
pub use composition::CompositionSnapshot;
pub use integrity::{
    CancelFlag, IntegrityReport, LedgerStats, RebuildOptions, RebuildSummary, TankIntegrity,
};
pub use ledger::Ledger;
pub use storage::Storage;
pub use config::Config;
