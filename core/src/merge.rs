//! Last-write-wins merge of a remote snapshot into local data.
//!
//! Records are matched by key. A remote record replaces the local one only when
//! its `updated_at` is strictly newer; records that exist only locally are always
//! kept. Nothing is ever deleted, so merging the same remote twice is a no-op.

use std::collections::HashMap;

use serde::Serialize;

use crate::models::{ActivityRecord, MealEntry, MealTemplate, Portion, Product, Settings, WeightEntry};
use crate::snapshot::SyncSnapshot;

pub trait Mergeable: Clone {
    fn merge_key(&self) -> &str;
    fn updated_at(&self) -> i64;
}

impl Mergeable for MealEntry {
    fn merge_key(&self) -> &str {
        &self.id
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
}

impl Mergeable for Product {
    fn merge_key(&self) -> &str {
        &self.id
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
}

impl Mergeable for WeightEntry {
    fn merge_key(&self) -> &str {
        &self.date
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
}

impl Mergeable for ActivityRecord {
    fn merge_key(&self) -> &str {
        &self.date
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
}

impl Mergeable for Portion {
    fn merge_key(&self) -> &str {
        &self.id
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
}

impl Mergeable for MealTemplate {
    fn merge_key(&self) -> &str {
        &self.id
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeCounts {
    pub inserted: usize,
    pub updated: usize,
    /// Remote records ignored because the local copy was as new or newer.
    pub kept: usize,
}

impl MergeCounts {
    #[must_use]
    pub fn changed(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone)]
pub struct CollectionMerge<T> {
    pub merged: Vec<T>,
    pub upserts: Vec<T>,
    pub counts: MergeCounts,
}

/// Merge one collection. Local order is preserved and remote-only records are
/// appended in remote order. When the remote holds several records with the same
/// key, the newest one wins.
pub fn merge_collection<T: Mergeable>(local: &[T], remote: &[T]) -> CollectionMerge<T> {
    let mut merged: Vec<T> = Vec::with_capacity(local.len() + remote.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for record in local {
        match index.get(record.merge_key()) {
            Some(&i) => {
                if record.updated_at() > merged[i].updated_at() {
                    merged[i] = record.clone();
                }
            }
            None => {
                index.insert(record.merge_key().to_string(), merged.len());
                merged.push(record.clone());
            }
        }
    }

    let mut newest_remote: Vec<&T> = Vec::new();
    let mut remote_index: HashMap<&str, usize> = HashMap::new();
    for record in remote {
        if record.merge_key().is_empty() {
            continue;
        }
        match remote_index.get(record.merge_key()) {
            Some(&i) => {
                if record.updated_at() > newest_remote[i].updated_at() {
                    newest_remote[i] = record;
                }
            }
            None => {
                remote_index.insert(record.merge_key(), newest_remote.len());
                newest_remote.push(record);
            }
        }
    }

    let mut upserts = Vec::new();
    let mut counts = MergeCounts::default();
    for record in newest_remote {
        match index.get(record.merge_key()) {
            Some(&i) if record.updated_at() > merged[i].updated_at() => {
                merged[i] = record.clone();
                upserts.push(record.clone());
                counts.updated += 1;
            }
            Some(_) => counts.kept += 1,
            None => {
                index.insert(record.merge_key().to_string(), merged.len());
                merged.push(record.clone());
                upserts.push(record.clone());
                counts.inserted += 1;
            }
        }
    }

    CollectionMerge {
        merged,
        upserts,
        counts,
    }
}

/// Records to write to the local store to bring it in line with a merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    pub entries: Vec<MealEntry>,
    pub products: Vec<Product>,
    pub weights: Vec<WeightEntry>,
    pub activities: Vec<ActivityRecord>,
    pub portions: Vec<Portion>,
    pub templates: Vec<MealTemplate>,
    pub settings: Option<Settings>,
}

impl MergePlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
            && self.products.is_empty()
            && self.weights.is_empty()
            && self.activities.is_empty()
            && self.portions.is_empty()
            && self.templates.is_empty()
            && self.settings.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub entries: MergeCounts,
    pub products: MergeCounts,
    pub weights: MergeCounts,
    pub activities: MergeCounts,
    pub portions: MergeCounts,
    pub templates: MergeCounts,
    pub settings_updated: bool,
}

impl MergeReport {
    #[must_use]
    pub fn changed(&self) -> usize {
        self.entries.changed()
            + self.products.changed()
            + self.weights.changed()
            + self.activities.changed()
            + self.portions.changed()
            + self.templates.changed()
            + usize::from(self.settings_updated)
    }
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub merged: SyncSnapshot,
    pub plan: MergePlan,
    pub report: MergeReport,
}

fn merge_settings(local: Option<&Settings>, remote: Option<&Settings>) -> Option<Settings> {
    match (local, remote) {
        (None, Some(remote)) => Some(remote.clone()),
        (Some(local), Some(remote)) if remote.updated_at > local.updated_at => Some(remote.clone()),
        _ => None,
    }
}

pub fn merge_snapshots(local: &SyncSnapshot, remote: &SyncSnapshot) -> MergeOutcome {
    let entries = merge_collection(&local.entries, &remote.entries);
    let products = merge_collection(&local.products, &remote.products);
    let weights = merge_collection(&local.weights, &remote.weights);
    let activities = merge_collection(&local.activities, &remote.activities);
    let portions = merge_collection(&local.portions, &remote.portions);
    let templates = merge_collection(&local.templates, &remote.templates);
    let settings = merge_settings(local.settings.as_ref(), remote.settings.as_ref());

    let report = MergeReport {
        entries: entries.counts,
        products: products.counts,
        weights: weights.counts,
        activities: activities.counts,
        portions: portions.counts,
        templates: templates.counts,
        settings_updated: settings.is_some(),
    };

    let merged = SyncSnapshot {
        version: local.version,
        exported_at: local.exported_at.clone(),
        device_id: local.device_id.clone(),
        entries: entries.merged,
        products: products.merged,
        weights: weights.merged,
        activities: activities.merged,
        portions: portions.merged,
        templates: templates.merged,
        settings: settings.clone().or_else(|| local.settings.clone()),
    };

    let plan = MergePlan {
        entries: entries.upserts,
        products: products.upserts,
        weights: weights.upserts,
        activities: activities.upserts,
        portions: portions.upserts,
        templates: templates.upserts,
        settings,
    };

    MergeOutcome {
        merged,
        plan,
        report,
    }
}
