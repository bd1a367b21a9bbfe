//! Core types for the tank ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for liters)
//! - Tenant scoping (every record names its winery)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new time-ordered identifier
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Wrap an existing UUID
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Underlying UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Raw bytes, used in storage keys
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Winery (tenant) identifier
    TenantId
);
uuid_id!(
    /// Tank identifier
    TankId
);
uuid_id!(
    /// Harvest batch identifier
    BatchId
);
uuid_id!(
    /// Wine lot identifier
    LotId
);
uuid_id!(
    /// Transfer or intake event identifier
    EventId
);
uuid_id!(
    /// Ledger entry identifier
    EntryId
);

/// What a ledger entry's volume is attributed to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompositionKey {
    /// Volume from a harvest batch
    Batch {
        /// Batch reference
        batch_id: BatchId,
        /// Batch code at the time of attribution
        label: String,
    },
    /// Volume from a wine lot. Never produced by derivation, but legal in stored data.
    WineLot {
        /// Lot reference
        lot_id: LotId,
        /// Lot label
        label: String,
    },
    /// Volume of unknown origin
    Unknown {
        /// Why the origin is unknown
        label: String,
    },
}

impl CompositionKey {
    /// Label for external wine entering with no source tank and no batch
    pub const LABEL_EXTERNAL: &'static str = "Unknown (External)";
    /// Label used when the source tank had nothing recorded
    pub const LABEL_NO_SOURCE: &'static str = "Unknown (No Source Composition)";
    /// Label for the unknown fraction carried over from a source tank
    pub const LABEL_INHERITED: &'static str = "Unknown (Inherited)";

    /// Batch key
    pub fn batch(batch_id: BatchId, label: impl Into<String>) -> Self {
        CompositionKey::Batch {
            batch_id,
            label: label.into(),
        }
    }

    /// Unknown key
    pub fn unknown(label: impl Into<String>) -> Self {
        CompositionKey::Unknown {
            label: label.into(),
        }
    }

    /// Human-readable label
    pub fn label(&self) -> &str {
        match self {
            CompositionKey::Batch { label, .. }
            | CompositionKey::WineLot { label, .. }
            | CompositionKey::Unknown { label } => label,
        }
    }

    /// Aggregation identity. Labels are display-only, so all unknown
    /// volume folds into a single group.
    pub fn group(&self) -> GroupKey {
        match self {
            CompositionKey::Batch { batch_id, .. } => GroupKey::Batch(*batch_id),
            CompositionKey::WineLot { lot_id, .. } => GroupKey::WineLot(*lot_id),
            CompositionKey::Unknown { .. } => GroupKey::Unknown,
        }
    }

    /// Whether this key is of unknown origin
    pub fn is_unknown(&self) -> bool {
        matches!(self, CompositionKey::Unknown { .. })
    }
}

impl fmt::Display for CompositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompositionKey::Batch { label, .. } => write!(f, "batch:{}", label),
            CompositionKey::WineLot { label, .. } => write!(f, "lot:{}", label),
            CompositionKey::Unknown { label } => write!(f, "{}", label),
        }
    }
}

/// Identity used when summing entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupKey {
    /// All entries for one batch
    Batch(BatchId),
    /// All entries for one wine lot
    WineLot(LotId),
    /// All entries of unknown origin
    Unknown,
}

/// Provenance of an entry's attribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Derivation {
    /// The event named the batch directly
    Explicit = 1,
    /// Split proportionally from the source tank's composition
    Inherited = 2,
    /// No attribution could be made
    Unknown = 3,
}

/// Event that produced a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceEvent {
    /// Volume movement between vessels
    Transfer(EventId),
    /// Harvest batch intake into a tank
    Intake(EventId),
}

impl SourceEvent {
    /// Event identifier regardless of kind
    pub fn id(&self) -> EventId {
        match self {
            SourceEvent::Transfer(id) | SourceEvent::Intake(id) => *id,
        }
    }
}

/// Immutable, append-only attribution of a volume delta to a tank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entry ID
    pub id: EntryId,

    /// Owning winery
    pub tenant: TenantId,

    /// Triggering transfer or intake (None for manual entries)
    pub source_event: Option<SourceEvent>,

    /// Timestamp of the original event, not insertion time
    pub event_timestamp: DateTime<Utc>,

    /// Insertion order, assigned on append. Breaks timestamp ties.
    pub sequence: u64,

    /// Affected tank
    pub tank: TankId,

    /// Signed liters: positive = inflow, negative = outflow
    pub delta_volume: Decimal,

    /// What the volume is attributed to
    pub composition_key: CompositionKey,

    /// How the attribution was made
    pub derivation: Derivation,

    /// Wall-clock insertion time
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Create an unsequenced entry; the store assigns `sequence` on append
    pub fn new(
        tenant: TenantId,
        source_event: Option<SourceEvent>,
        event_timestamp: DateTime<Utc>,
        tank: TankId,
        delta_volume: Decimal,
        composition_key: CompositionKey,
        derivation: Derivation,
    ) -> Self {
        Self {
            id: EntryId::new(),
            tenant,
            source_event,
            event_timestamp,
            sequence: 0,
            tank,
            delta_volume,
            composition_key,
            derivation,
            created_at: Utc::now(),
        }
    }

    /// Ordering key within a tank
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.event_timestamp, self.sequence)
    }
}

impl fmt::Display for LedgerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.delta_volume > Decimal::ZERO { "+" } else { "" };
        write!(
            f,
            "{}: {}{}L [{}]",
            self.tank, sign, self.delta_volume, self.composition_key
        )
    }
}

/// Explicit batch reference carried by an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRef {
    /// Batch ID
    pub id: BatchId,
    /// Batch code, used as the entry label
    pub code: String,
}

impl BatchRef {
    /// Create a batch reference
    pub fn new(id: BatchId, code: impl Into<String>) -> Self {
        Self {
            id,
            code: code.into(),
        }
    }
}

/// Volume movement between tanks, or to/from the outside
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferEvent {
    /// Event ID
    pub id: EventId,
    /// Owning winery
    pub tenant: TenantId,
    /// Tank volume leaves (None for external inflow)
    pub source_tank: Option<TankId>,
    /// Tank volume enters (None for bottling, drains, etc.)
    pub destination_tank: Option<TankId>,
    /// Explicit attribution, if the operator named the batch
    pub batch: Option<BatchRef>,
    /// Liters moved, strictly positive
    pub volume: Decimal,
    /// When the transfer happened
    pub event_timestamp: DateTime<Utc>,
}

/// Harvest batch entering its initial tank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeEvent {
    /// Event ID
    pub id: EventId,
    /// Owning winery
    pub tenant: TenantId,
    /// Tank receiving the must
    pub destination_tank: TankId,
    /// Batch being taken in
    pub batch: BatchRef,
    /// Must volume in liters, strictly positive
    pub volume: Decimal,
    /// Intake time
    pub event_timestamp: DateTime<Utc>,
}

/// Any event the ledger derives entries from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceEventRecord {
    /// Transfer
    Transfer(TransferEvent),
    /// Intake
    Intake(IntakeEvent),
}

impl SourceEventRecord {
    /// Event ID
    pub fn id(&self) -> EventId {
        match self {
            SourceEventRecord::Transfer(t) => t.id,
            SourceEventRecord::Intake(i) => i.id,
        }
    }

    /// Owning tenant
    pub fn tenant(&self) -> TenantId {
        match self {
            SourceEventRecord::Transfer(t) => t.tenant,
            SourceEventRecord::Intake(i) => i.tenant,
        }
    }

    /// Event timestamp
    pub fn event_timestamp(&self) -> DateTime<Utc> {
        match self {
            SourceEventRecord::Transfer(t) => t.event_timestamp,
            SourceEventRecord::Intake(i) => i.event_timestamp,
        }
    }

    /// Reference stamped onto derived entries
    pub fn source_ref(&self) -> SourceEvent {
        match self {
            SourceEventRecord::Transfer(t) => SourceEvent::Transfer(t.id),
            SourceEventRecord::Intake(i) => SourceEvent::Intake(i.id),
        }
    }

    /// Short kind name for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SourceEventRecord::Transfer(_) => "transfer",
            SourceEventRecord::Intake(_) => "intake",
        }
    }
}

/// Event as kept in the event log, with its creation order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent {
    /// Creation order, shared counter with entry sequences
    pub sequence: u64,
    /// The event itself
    pub event: SourceEventRecord,
}
