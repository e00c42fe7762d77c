use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::models::{
    ActivityRecord, MealEntry, MealTemplate, Portion, Product, Settings, WeightEntry, parse_date,
    validate_activity, validate_meal_entry, validate_nutrients, validate_settings, validate_weight,
};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Object name of the encrypted backup in cloud storage.
pub const BACKUP_OBJECT_NAME: &str = "nutrilog-backup.json";

/// Everything the journal holds, serialized as one document for backup and sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub version: u32,
    pub exported_at: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub entries: Vec<MealEntry>,
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub weights: Vec<WeightEntry>,
    #[serde(default)]
    pub activities: Vec<ActivityRecord>,
    #[serde(default)]
    pub portions: Vec<Portion>,
    #[serde(default)]
    pub templates: Vec<MealTemplate>,
    #[serde(default)]
    pub settings: Option<Settings>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotCounts {
    pub entries: usize,
    pub products: usize,
    pub weights: usize,
    pub activities: usize,
    pub portions: usize,
    pub templates: usize,
}

impl SnapshotCounts {
    #[must_use]
    pub fn total(&self) -> usize {
        self.entries + self.products + self.weights + self.activities + self.portions + self.templates
    }
}

impl SyncSnapshot {
    #[must_use]
    pub fn new(device_id: Option<String>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            exported_at: chrono::Utc::now().to_rfc3339(),
            device_id,
            ..Self::default()
        }
    }

    /// Sort every collection by its record key so equal data serializes to equal bytes.
    pub fn canonicalize(&mut self) {
        self.entries.sort_by(|a, b| a.id.cmp(&b.id));
        self.products.sort_by(|a, b| a.id.cmp(&b.id));
        self.weights.sort_by(|a, b| a.date.cmp(&b.date));
        self.activities.sort_by(|a, b| a.date.cmp(&b.date));
        self.portions.sort_by(|a, b| a.id.cmp(&b.id));
        self.templates.sort_by(|a, b| a.id.cmp(&b.id));
    }

    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        let mut canonical = self.clone();
        canonical.canonicalize();
        serde_json::to_vec(&canonical).context("Failed to serialize snapshot")
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let snapshot: Self = serde_json::from_slice(bytes).context("Invalid snapshot JSON")?;
        if snapshot.version == 0 || snapshot.version > SNAPSHOT_VERSION {
            bail!(
                "Unsupported snapshot version {} (this build reads up to {SNAPSHOT_VERSION})",
                snapshot.version
            );
        }
        Ok(snapshot)
    }

    /// Remove records that would not pass local validation. Returns how many were dropped.
    pub fn drop_invalid(&mut self) -> usize {
        let before = self.counts().total();
        self.entries.retain(|e| validate_meal_entry(e).is_ok());
        self.products.retain(|p| {
            !p.id.is_empty() && !p.name.trim().is_empty() && validate_nutrients(&p.per_100g).is_ok()
        });
        self.weights
            .retain(|w| parse_date(&w.date).is_ok() && validate_weight(w.weight_kg).is_ok());
        self.activities.retain(|a| validate_activity(a).is_ok());
        self.portions.retain(|p| p.grams > 0.0 && !p.product_id.is_empty());
        self.templates
            .retain(|t| !t.items.is_empty() && t.items.iter().all(|i| i.amount_g > 0.0));
        let mut dropped = before - self.counts().total();
        if self.settings.as_ref().is_some_and(|s| validate_settings(s).is_err()) {
            self.settings = None;
            dropped += 1;
        }
        dropped
    }

    #[must_use]
    pub fn counts(&self) -> SnapshotCounts {
        SnapshotCounts {
            entries: self.entries.len(),
            products: self.products.len(),
            weights: self.weights.len(),
            activities: self.activities.len(),
            portions: self.portions.len(),
            templates: self.templates.len(),
        }
    }
}
