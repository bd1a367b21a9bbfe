//! Read-only lookups into the surrounding winery system
//!
//! The ledger never owns tanks or batches. It reads a tank's authoritative
//! volume for reconciliation and a batch's grape sources for the
//! variety/vineyard breakdown through these traits.

use crate::types::{BatchId, TankId, TenantId};
use crate::{Error, Result};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Tank as seen by the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TankRecord {
    /// Tank ID
    pub id: TankId,
    /// Owning winery
    pub tenant: TenantId,
    /// Short code painted on the tank (e.g. A01)
    pub code: String,
    /// Optional display name
    #[serde(default)]
    pub name: String,
    /// Capacity in liters
    pub capacity: Decimal,
    /// Authoritative current volume in liters
    pub current_volume: Decimal,
    /// Inactive tanks are left out of reconciliation
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Vineyard block a grape source came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VineyardBlock {
    /// Block name
    pub name: String,
    /// Grower name, if recorded
    #[serde(default)]
    pub grower: Option<String>,
}

/// One weighted grape source of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrapeSource {
    /// Weight in kg
    pub weight_kg: Decimal,
    /// Grape variety name
    #[serde(default)]
    pub variety: Option<String>,
    /// Vineyard block
    #[serde(default)]
    pub vineyard: Option<VineyardBlock>,
}

/// Harvest batch with its grape sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    /// Batch ID
    pub id: BatchId,
    /// Owning winery
    pub tenant: TenantId,
    /// Batch code
    pub code: String,
    /// Grape sources
    #[serde(default)]
    pub sources: Vec<GrapeSource>,
}

impl BatchRecord {
    /// Sum of source weights
    pub fn total_weight(&self) -> Decimal {
        self.sources.iter().map(|s| s.weight_kg).sum()
    }
}

/// Tank lookup
pub trait TankLookup: Send + Sync {
    /// Find a tank by ID
    fn tank(&self, id: TankId) -> Option<TankRecord>;

    /// All tanks of a tenant, active or not
    fn tanks(&self, tenant: TenantId) -> Vec<TankRecord>;
}

/// Batch lookup
pub trait BatchLookup: Send + Sync {
    /// Find a batch by ID
    fn batch(&self, id: BatchId) -> Option<BatchRecord>;
}

/// Everything the ledger reads from the outside
pub trait Catalog: TankLookup + BatchLookup {}

impl<T: TankLookup + BatchLookup> Catalog for T {}

/// Catalog file layout
#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    tanks: Vec<TankRecord>,
    #[serde(default)]
    batches: Vec<BatchRecord>,
}

/// In-process catalog, used by tests and the admin CLI
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    tanks: RwLock<HashMap<TankId, TankRecord>>,
    batches: RwLock<HashMap<BatchId, BatchRecord>>,
}

impl InMemoryCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML catalog (`[[tanks]]` and `[[batches]]` tables)
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse catalog: {}", e)))?;

        let catalog = Self::new();
        for tank in file.tanks {
            catalog.upsert_tank(tank);
        }
        for batch in file.batches {
            catalog.upsert_batch(batch);
        }
        Ok(catalog)
    }

    /// Load a TOML catalog from disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Insert or replace a tank
    pub fn upsert_tank(&self, tank: TankRecord) {
        self.tanks.write().insert(tank.id, tank);
    }

    /// Insert or replace a batch
    pub fn upsert_batch(&self, batch: BatchRecord) {
        self.batches.write().insert(batch.id, batch);
    }

    /// Remove a batch, returning it if present
    pub fn remove_batch(&self, id: BatchId) -> Option<BatchRecord> {
        self.batches.write().remove(&id)
    }

    /// Overwrite a tank's authoritative volume
    pub fn set_current_volume(&self, id: TankId, volume: Decimal) -> Result<()> {
        let mut tanks = self.tanks.write();
        let tank = tanks
            .get_mut(&id)
            .ok_or_else(|| Error::TankNotFound(id.to_string()))?;
        tank.current_volume = volume;
        Ok(())
    }
}

impl TankLookup for InMemoryCatalog {
    fn tank(&self, id: TankId) -> Option<TankRecord> {
        self.tanks.read().get(&id).cloned()
    }

    fn tanks(&self, tenant: TenantId) -> Vec<TankRecord> {
        let mut tanks: Vec<TankRecord> = self
            .tanks
            .read()
            .values()
            .filter(|t| t.tenant == tenant)
            .cloned()
            .collect();
        tanks.sort_by(|a, b| a.code.cmp(&b.code));
        tanks
    }
}

impl BatchLookup for InMemoryCatalog {
    fn batch(&self, id: BatchId) -> Option<BatchRecord> {
        self.batches.read().get(&id).cloned()
    }
}
