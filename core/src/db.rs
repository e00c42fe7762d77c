use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, bail};
use chrono::{Duration, NaiveDate};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::merge::{MergePlan, MergeReport, merge_snapshots};
use crate::models::{
    ActivityRecord, DailySummary, MEAL_TYPES, MealEntry, MealGroup, MealTemplate, NewMealEntry,
    NewProduct, NewWeightEntry, Nutrients, Portion, Product, Settings, TemplateItem,
    UpdateMealEntry, WeightEntry, now_millis, validate_activity, validate_amount,
    validate_meal_type, validate_product, validate_settings, validate_weight,
};
use crate::snapshot::SyncSnapshot;
use crate::sync::{SnapshotStore, SyncKind};

const PRODUCT_COLUMNS: &str = "id, name, brand, barcode, calories, protein, carbs, sugar, fat,
    saturated_fat, fiber, sodium, default_serving_g, source, created_at, updated_at";

const ENTRY_COLUMNS: &str = "id, date, meal_type, product_id, name, amount_g, calories, protein,
    carbs, sugar, fat, saturated_fat, fiber, sodium, created_at, updated_at";

const ACTIVITY_COLUMNS: &str =
    "date, steps, active_calories, intensity_minutes, sleep_seconds, heart_rate, updated_at";

const WEIGHT_COLUMNS: &str = "id, date, weight_kg, notes, created_at, updated_at";

pub const SETTING_DEVICE_ID: &str = "device_id";
pub const SETTING_LAST_PUSH: &str = "sync.last_push_at";
pub const SETTING_LAST_PULL: &str = "sync.last_pull_at";
pub const SETTING_AUTO_SYNC: &str = "sync.auto";

pub struct Database {
    conn: Connection,
}

fn date_str(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            tracing::debug!("creating schema version 1");
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS products (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    brand TEXT,
                    barcode TEXT,
                    calories REAL,
                    protein REAL,
                    carbs REAL,
                    sugar REAL,
                    fat REAL,
                    saturated_fat REAL,
                    fiber REAL,
                    sodium REAL,
                    default_serving_g REAL,
                    source TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS meal_entries (
                    id TEXT PRIMARY KEY,
                    date TEXT NOT NULL,
                    meal_type TEXT NOT NULL,
                    product_id TEXT,
                    name TEXT NOT NULL,
                    amount_g REAL,
                    calories REAL,
                    protein REAL,
                    carbs REAL,
                    sugar REAL,
                    fat REAL,
                    saturated_fat REAL,
                    fiber REAL,
                    sodium REAL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS activities (
                    date TEXT PRIMARY KEY,
                    steps INTEGER,
                    active_calories REAL,
                    intensity_minutes INTEGER,
                    sleep_seconds INTEGER,
                    heart_rate REAL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS weights (
                    id TEXT NOT NULL,
                    date TEXT PRIMARY KEY,
                    weight_kg REAL NOT NULL,
                    notes TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS portions (
                    id TEXT PRIMARY KEY,
                    product_id TEXT NOT NULL,
                    label TEXT NOT NULL,
                    grams REAL NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS templates (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    meal_type TEXT,
                    items TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS settings (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    calorie_target REAL,
                    tolerance_pct REAL NOT NULL,
                    protein_target_g REAL,
                    carbs_target_g REAL,
                    fat_target_g REAL,
                    goal_weight_kg REAL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS user_settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_meal_entries_date ON meal_entries(date);
                CREATE INDEX IF NOT EXISTS idx_products_barcode ON products(barcode);
                CREATE INDEX IF NOT EXISTS idx_products_name ON products(name);
                CREATE INDEX IF NOT EXISTS idx_portions_product ON portions(product_id);

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    // --- Row mapping helpers ---

    fn nutrients_from_row(row: &rusqlite::Row, start: usize) -> rusqlite::Result<Nutrients> {
        Ok(Nutrients {
            calories: row.get(start)?,
            protein: row.get(start + 1)?,
            carbs: row.get(start + 2)?,
            sugar: row.get(start + 3)?,
            fat: row.get(start + 4)?,
            saturated_fat: row.get(start + 5)?,
            fiber: row.get(start + 6)?,
            sodium: row.get(start + 7)?,
        })
    }

    fn product_from_row(row: &rusqlite::Row) -> rusqlite::Result<Product> {
        Ok(Product {
            id: row.get(0)?,
            name: row.get(1)?,
            brand: row.get(2)?,
            barcode: row.get(3)?,
            per_100g: Self::nutrients_from_row(row, 4)?,
            default_serving_g: row.get(12)?,
            source: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    fn entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<MealEntry> {
        Ok(MealEntry {
            id: row.get(0)?,
            date: row.get(1)?,
            meal_type: row.get(2)?,
            product_id: row.get(3)?,
            name: row.get(4)?,
            amount_g: row.get(5)?,
            nutrients: Self::nutrients_from_row(row, 6)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    fn activity_from_row(row: &rusqlite::Row) -> rusqlite::Result<ActivityRecord> {
        Ok(ActivityRecord {
            date: row.get(0)?,
            steps: row.get(1)?,
            active_calories: row.get(2)?,
            intensity_minutes: row.get(3)?,
            sleep_seconds: row.get(4)?,
            heart_rate: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn weight_from_row(row: &rusqlite::Row) -> rusqlite::Result<WeightEntry> {
        Ok(WeightEntry {
            id: row.get(0)?,
            date: row.get(1)?,
            weight_kg: row.get(2)?,
            notes: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn portion_from_row(row: &rusqlite::Row) -> rusqlite::Result<Portion> {
        Ok(Portion {
            id: row.get(0)?,
            product_id: row.get(1)?,
            label: row.get(2)?,
            grams: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn template_from_row(row: &rusqlite::Row) -> rusqlite::Result<MealTemplate> {
        let items_json: String = row.get(3)?;
        let items: Vec<TemplateItem> = serde_json::from_str(&items_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(MealTemplate {
            id: row.get(0)?,
            name: row.get(1)?,
            meal_type: row.get(2)?,
            items,
            updated_at: row.get(4)?,
        })
    }

    // --- Row writers, shared by local edits and merges ---

    fn write_product(&self, p: &Product) -> Result<()> {
        let n = &p.per_100g;
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO products ({PRODUCT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                p.id,
                p.name,
                p.brand,
                p.barcode,
                n.calories,
                n.protein,
                n.carbs,
                n.sugar,
                n.fat,
                n.saturated_fat,
                n.fiber,
                n.sodium,
                p.default_serving_g,
                p.source,
                p.created_at,
                p.updated_at,
            ],
        )?;
        Ok(())
    }

    fn write_entry(&self, e: &MealEntry) -> Result<()> {
        let n = &e.nutrients;
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO meal_entries ({ENTRY_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                e.id,
                e.date,
                e.meal_type,
                e.product_id,
                e.name,
                e.amount_g,
                n.calories,
                n.protein,
                n.carbs,
                n.sugar,
                n.fat,
                n.saturated_fat,
                n.fiber,
                n.sodium,
                e.created_at,
                e.updated_at,
            ],
        )?;
        Ok(())
    }

    fn write_activity(&self, a: &ActivityRecord) -> Result<()> {
        self.conn.execute(
            &format!("INSERT OR REPLACE INTO activities ({ACTIVITY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                a.date,
                a.steps,
                a.active_calories,
                a.intensity_minutes,
                a.sleep_seconds,
                a.heart_rate,
                a.updated_at,
            ],
        )?;
        Ok(())
    }

    fn write_weight(&self, w: &WeightEntry) -> Result<()> {
        self.conn.execute(
            &format!("INSERT OR REPLACE INTO weights ({WEIGHT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
            params![w.id, w.date, w.weight_kg, w.notes, w.created_at, w.updated_at],
        )?;
        Ok(())
    }

    fn write_portion(&self, p: &Portion) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO portions (id, product_id, label, grams, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![p.id, p.product_id, p.label, p.grams, p.updated_at],
        )?;
        Ok(())
    }

    fn write_template(&self, t: &MealTemplate) -> Result<()> {
        let items = serde_json::to_string(&t.items)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO templates (id, name, meal_type, items, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![t.id, t.name, t.meal_type, items, t.updated_at],
        )?;
        Ok(())
    }

    fn write_settings(&self, s: &Settings) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (id, calorie_target, tolerance_pct, protein_target_g,
                carbs_target_g, fat_target_g, goal_weight_kg, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                s.calorie_target,
                s.tolerance_pct,
                s.protein_target_g,
                s.carbs_target_g,
                s.fat_target_g,
                s.goal_weight_kg,
                s.updated_at,
            ],
        )?;
        Ok(())
    }

    // --- Products ---

    pub fn insert_product(&self, product: &NewProduct) -> Result<Product> {
        validate_product(product)?;
        let now = now_millis();
        let record = Product {
            id: Uuid::new_v4().to_string(),
            name: product.name.trim().to_string(),
            brand: product.brand.clone(),
            barcode: product.barcode.clone(),
            per_100g: product.per_100g,
            default_serving_g: product.default_serving_g,
            source: product.source.clone(),
            created_at: now,
            updated_at: now,
        };
        self.write_product(&record)?;
        Ok(record)
    }

    /// Return the cached product for this barcode, inserting it on first sight.
    pub fn upsert_product_by_barcode(&self, product: &NewProduct) -> Result<Product> {
        if let Some(barcode) = &product.barcode {
            if let Some(existing) = self.get_product_by_barcode(barcode)? {
                return Ok(existing);
            }
        }
        self.insert_product(product)
    }

    pub fn get_product(&self, id: &str) -> Result<Product> {
        self.conn
            .query_row(
                &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1"),
                params![id],
                Self::product_from_row,
            )
            .optional()?
            .with_context(|| format!("Product not found: {id}"))
    }

    pub fn get_product_by_barcode(&self, barcode: &str) -> Result<Option<Product>> {
        let product = self
            .conn
            .query_row(
                &format!(
                    "SELECT {PRODUCT_COLUMNS} FROM products WHERE barcode = ?1
                     ORDER BY updated_at DESC LIMIT 1"
                ),
                params![barcode],
                Self::product_from_row,
            )
            .optional()?;
        Ok(product)
    }

    pub fn search_products(&self, query: &str) -> Result<Vec<Product>> {
        let escaped = query
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let pattern = format!("%{escaped}%");
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products
             WHERE name LIKE ?1 ESCAPE '\\' OR brand LIKE ?1 ESCAPE '\\'
             ORDER BY name LIMIT 20"
        ))?;
        let products = stmt
            .query_map(params![pattern], Self::product_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(products)
    }

    pub fn list_products(&self, search: Option<&str>) -> Result<Vec<Product>> {
        if let Some(query) = search {
            return self.search_products(query);
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products ORDER BY name LIMIT 100"
        ))?;
        let products = stmt
            .query_map([], Self::product_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(products)
    }

    // --- Portions ---

    pub fn add_portion(&self, product_id: &str, label: &str, grams: f64) -> Result<Portion> {
        self.get_product(product_id)?;
        validate_amount(grams)?;
        if label.trim().is_empty() {
            bail!("Portion label must not be empty");
        }
        let portion = Portion {
            id: Uuid::new_v4().to_string(),
            product_id: product_id.to_string(),
            label: label.trim().to_string(),
            grams,
            updated_at: now_millis(),
        };
        self.write_portion(&portion)?;
        Ok(portion)
    }

    pub fn get_portions(&self, product_id: &str) -> Result<Vec<Portion>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, product_id, label, grams, updated_at FROM portions
             WHERE product_id = ?1 ORDER BY label",
        )?;
        let portions = stmt
            .query_map(params![product_id], Self::portion_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(portions)
    }

    /// Resolve a portion label ("slice") for a product to grams.
    pub fn find_portion(&self, product_id: &str, label: &str) -> Result<Option<Portion>> {
        let portion = self
            .conn
            .query_row(
                "SELECT id, product_id, label, grams, updated_at FROM portions
                 WHERE product_id = ?1 AND label = ?2 COLLATE NOCASE",
                params![product_id, label],
                Self::portion_from_row,
            )
            .optional()?;
        Ok(portion)
    }

    // --- Meal entries ---

    pub fn insert_entry(&self, entry: &NewMealEntry) -> Result<MealEntry> {
        let meal_type = validate_meal_type(&entry.meal_type)?;
        if entry.name.trim().is_empty() {
            bail!("Entry name must not be empty");
        }
        if let Some(amount) = entry.amount_g {
            validate_amount(amount)?;
        }
        crate::models::validate_nutrients(&entry.nutrients)?;
        let now = now_millis();
        let record = MealEntry {
            id: Uuid::new_v4().to_string(),
            date: date_str(entry.date),
            meal_type,
            product_id: entry.product_id.clone(),
            name: entry.name.trim().to_string(),
            amount_g: entry.amount_g,
            nutrients: entry.nutrients,
            created_at: now,
            updated_at: now,
        };
        self.write_entry(&record)?;
        Ok(record)
    }

    /// Log an amount of a stored product, scaling its per-100 g nutrients.
    pub fn log_product(
        &self,
        product_id: &str,
        amount_g: f64,
        date: NaiveDate,
        meal_type: &str,
    ) -> Result<MealEntry> {
        let product = self.get_product(product_id)?;
        self.insert_entry(&NewMealEntry::from_product(&product, amount_g, date, meal_type))
    }

    pub fn get_entry(&self, id: &str) -> Result<MealEntry> {
        self.conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM meal_entries WHERE id = ?1"),
                params![id],
                Self::entry_from_row,
            )
            .optional()?
            .with_context(|| format!("Meal entry not found: {id}"))
    }

    pub fn delete_entry(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM meal_entries WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    /// Apply an edit and bump `updated_at` so the change wins the next merge.
    pub fn update_entry(&self, id: &str, update: &UpdateMealEntry) -> Result<MealEntry> {
        let mut entry = self.get_entry(id)?;
        if let Some(amount) = update.amount_g {
            validate_amount(amount)?;
            if let Some(old) = entry.amount_g.filter(|old| *old > 0.0) {
                let factor = amount / old;
                entry.nutrients = entry.nutrients.map(|v| v * factor);
            }
            entry.amount_g = Some(amount);
        }
        if let Some(meal_type) = &update.meal_type {
            entry.meal_type = validate_meal_type(meal_type)?;
        }
        if let Some(date) = update.date {
            entry.date = date_str(date);
        }
        entry.updated_at = now_millis().max(entry.updated_at + 1);
        self.write_entry(&entry)?;
        Ok(entry)
    }

    pub fn get_entries_for_date(&self, date: NaiveDate) -> Result<Vec<MealEntry>> {
        self.entries_between(date, date)
    }

    pub fn get_entries_for_date_and_meal(
        &self,
        date: NaiveDate,
        meal_type: &str,
    ) -> Result<Vec<MealEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM meal_entries
             WHERE date = ?1 AND meal_type = ?2 ORDER BY created_at, id"
        ))?;
        let entries = stmt
            .query_map(params![date_str(date), meal_type], Self::entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn entries_between(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<MealEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM meal_entries
             WHERE date >= ?1 AND date <= ?2 ORDER BY date, created_at, id"
        ))?;
        let entries = stmt
            .query_map(params![date_str(start), date_str(end)], Self::entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Copy every entry of one meal to another date/meal as fresh records.
    pub fn copy_meal(
        &self,
        from: NaiveDate,
        from_meal: &str,
        to: NaiveDate,
        to_meal: &str,
    ) -> Result<Vec<MealEntry>> {
        let source = self.get_entries_for_date_and_meal(from, from_meal)?;
        if source.is_empty() {
            bail!("No entries for {from_meal} on {}", date_str(from));
        }
        source
            .iter()
            .map(|e| {
                self.insert_entry(&NewMealEntry {
                    date: to,
                    meal_type: to_meal.to_string(),
                    product_id: e.product_id.clone(),
                    name: e.name.clone(),
                    amount_g: e.amount_g,
                    nutrients: e.nutrients,
                })
            })
            .collect()
    }

    // --- Activity ---

    pub fn upsert_activity(&self, activity: &ActivityRecord) -> Result<ActivityRecord> {
        validate_activity(activity)?;
        let mut record = activity.clone();
        record.updated_at = now_millis();
        self.write_activity(&record)?;
        Ok(record)
    }

    pub fn get_activity(&self, date: NaiveDate) -> Result<Option<ActivityRecord>> {
        let activity = self
            .conn
            .query_row(
                &format!("SELECT {ACTIVITY_COLUMNS} FROM activities WHERE date = ?1"),
                params![date_str(date)],
                Self::activity_from_row,
            )
            .optional()?;
        Ok(activity)
    }

    pub fn activities_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ActivityRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE date >= ?1 AND date <= ?2 ORDER BY date"
        ))?;
        let activities = stmt
            .query_map(params![date_str(start), date_str(end)], Self::activity_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(activities)
    }

    // --- Weight ---

    pub fn upsert_weight(&self, entry: &NewWeightEntry) -> Result<WeightEntry> {
        validate_weight(entry.weight_kg)?;
        let now = now_millis();
        let existing = self.get_weight(entry.date)?;
        let record = WeightEntry {
            id: existing
                .as_ref()
                .map_or_else(|| Uuid::new_v4().to_string(), |w| w.id.clone()),
            date: date_str(entry.date),
            weight_kg: entry.weight_kg,
            notes: entry.notes.clone(),
            created_at: existing.as_ref().map_or(now, |w| w.created_at),
            updated_at: now,
        };
        self.write_weight(&record)?;
        Ok(record)
    }

    pub fn get_weight(&self, date: NaiveDate) -> Result<Option<WeightEntry>> {
        let weight = self
            .conn
            .query_row(
                &format!("SELECT {WEIGHT_COLUMNS} FROM weights WHERE date = ?1"),
                params![date_str(date)],
                Self::weight_from_row,
            )
            .optional()?;
        Ok(weight)
    }

    pub fn get_weight_history(&self, days: Option<i64>) -> Result<Vec<WeightEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {WEIGHT_COLUMNS} FROM weights ORDER BY date DESC LIMIT ?1"
        ))?;
        let entries = stmt
            .query_map(params![days.unwrap_or(-1)], Self::weight_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn delete_weight(&self, id: &str) -> Result<()> {
        let rows = self
            .conn
            .execute("DELETE FROM weights WHERE id = ?1", params![id])?;
        if rows == 0 {
            bail!("Weight entry not found");
        }
        Ok(())
    }

    // --- Templates ---

    /// Save the entries of one logged meal as a reusable template. Entries
    /// without a product or amount cannot be replayed and are left out.
    pub fn save_template_from_meal(
        &self,
        name: &str,
        date: NaiveDate,
        meal_type: &str,
    ) -> Result<MealTemplate> {
        if name.trim().is_empty() {
            bail!("Template name must not be empty");
        }
        let items: Vec<TemplateItem> = self
            .get_entries_for_date_and_meal(date, meal_type)?
            .into_iter()
            .filter_map(|e| {
                Some(TemplateItem {
                    product_id: e.product_id?,
                    amount_g: e.amount_g?,
                })
            })
            .collect();
        if items.is_empty() {
            bail!(
                "No product entries for {meal_type} on {} to save as a template",
                date_str(date)
            );
        }
        let template = MealTemplate {
            id: self
                .find_template(name)?
                .map_or_else(|| Uuid::new_v4().to_string(), |t| t.id),
            name: name.trim().to_string(),
            meal_type: Some(meal_type.to_string()),
            items,
            updated_at: now_millis(),
        };
        self.write_template(&template)?;
        Ok(template)
    }

    pub fn list_templates(&self) -> Result<Vec<MealTemplate>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, meal_type, items, updated_at FROM templates ORDER BY name")?;
        let templates = stmt
            .query_map([], Self::template_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(templates)
    }

    pub fn find_template(&self, name: &str) -> Result<Option<MealTemplate>> {
        let template = self
            .conn
            .query_row(
                "SELECT id, name, meal_type, items, updated_at FROM templates
                 WHERE name = ?1 COLLATE NOCASE",
                params![name.trim()],
                Self::template_from_row,
            )
            .optional()?;
        Ok(template)
    }

    /// Log every item of a template on `date`. The meal defaults to the one the
    /// template was saved from.
    pub fn apply_template(
        &self,
        name: &str,
        date: NaiveDate,
        meal_type: Option<&str>,
    ) -> Result<Vec<MealEntry>> {
        let template = self
            .find_template(name)?
            .with_context(|| format!("Template not found: {name}"))?;
        let meal = meal_type
            .map(str::to_string)
            .or(template.meal_type.clone())
            .context("Template has no meal type; pass one explicitly")?;
        template
            .items
            .iter()
            .map(|item| self.log_product(&item.product_id, item.amount_g, date, &meal))
            .collect()
    }

    // --- Settings ---

    pub fn get_settings(&self) -> Result<Settings> {
        let settings = self
            .conn
            .query_row(
                "SELECT calorie_target, tolerance_pct, protein_target_g, carbs_target_g,
                        fat_target_g, goal_weight_kg, updated_at
                 FROM settings WHERE id = 1",
                [],
                |row| {
                    Ok(Settings {
                        calorie_target: row.get(0)?,
                        tolerance_pct: row.get(1)?,
                        protein_target_g: row.get(2)?,
                        carbs_target_g: row.get(3)?,
                        fat_target_g: row.get(4)?,
                        goal_weight_kg: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(settings.unwrap_or_default())
    }

    fn stored_settings(&self) -> Result<Option<Settings>> {
        let exists: bool = self
            .conn
            .query_row("SELECT EXISTS(SELECT 1 FROM settings WHERE id = 1)", [], |row| {
                row.get(0)
            })?;
        if exists {
            Ok(Some(self.get_settings()?))
        } else {
            Ok(None)
        }
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<Settings> {
        validate_settings(settings)?;
        let mut record = settings.clone();
        record.updated_at = now_millis();
        self.write_settings(&record)?;
        Ok(record)
    }

    // --- User settings (device-local key/value, never synced) ---

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO user_settings (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_millis()],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM user_settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM user_settings WHERE key = ?1", params![key])?;
        Ok(rows > 0)
    }

    pub fn get_or_create_device_id(&self) -> Result<String> {
        if let Some(id) = self.get_setting(SETTING_DEVICE_ID)? {
            return Ok(id);
        }
        let device_id = Uuid::new_v4().to_string();
        self.set_setting(SETTING_DEVICE_ID, &device_id)?;
        Ok(device_id)
    }

    pub fn auto_sync_enabled(&self) -> Result<bool> {
        Ok(self.get_setting(SETTING_AUTO_SYNC)?.as_deref() == Some("true"))
    }

    pub fn set_auto_sync(&self, enabled: bool) -> Result<()> {
        self.set_setting(SETTING_AUTO_SYNC, if enabled { "true" } else { "false" })
    }

    pub fn last_sync_at(&self, kind: SyncKind) -> Result<Option<i64>> {
        let key = match kind {
            SyncKind::Push => SETTING_LAST_PUSH,
            SyncKind::Pull => SETTING_LAST_PULL,
        };
        self.get_setting(key)?
            .map(|v| v.parse::<i64>().context("Corrupt sync timestamp"))
            .transpose()
    }

    pub fn record_sync_at(&self, kind: SyncKind, at: i64) -> Result<()> {
        let key = match kind {
            SyncKind::Push => SETTING_LAST_PUSH,
            SyncKind::Pull => SETTING_LAST_PULL,
        };
        self.set_setting(key, &at.to_string())
    }

    // --- Summaries ---

    pub fn build_daily_summary(&self, date: NaiveDate) -> Result<DailySummary> {
        let entries = self.get_entries_for_date(date)?;
        let mut meals: Vec<MealGroup> = Vec::new();
        let mut totals = Nutrients::default();

        for meal_type in MEAL_TYPES {
            let meal_entries: Vec<MealEntry> = entries
                .iter()
                .filter(|e| e.meal_type == *meal_type)
                .cloned()
                .collect();
            if meal_entries.is_empty() {
                continue;
            }
            let mut subtotal = Nutrients::default();
            for entry in &meal_entries {
                subtotal.accumulate(&entry.nutrients);
            }
            totals.accumulate(&subtotal);
            meals.push(MealGroup {
                meal_type: (*meal_type).to_string(),
                entries: meal_entries,
                subtotal,
            });
        }

        Ok(DailySummary {
            date: date_str(date),
            meals,
            totals,
            activity: self.get_activity(date)?,
            calorie_target: self.get_settings()?.calorie_target,
        })
    }

    /// Days (most recent first) that have at least one entry, within the last `days` days.
    pub fn logged_dates(&self, today: NaiveDate, days: i64) -> Result<Vec<NaiveDate>> {
        let start = today - Duration::days(days.max(1) - 1);
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT date FROM meal_entries WHERE date >= ?1 AND date <= ?2 ORDER BY date DESC",
        )?;
        let dates = stmt
            .query_map(params![date_str(start), date_str(today)], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(dates
            .iter()
            .filter_map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .collect())
    }

    // --- Snapshot export / merge ---

    pub fn export_snapshot(&self) -> Result<SyncSnapshot> {
        let mut snapshot = SyncSnapshot::new(Some(self.get_or_create_device_id()?));

        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ENTRY_COLUMNS} FROM meal_entries"))?;
        snapshot.entries = stmt
            .query_map([], Self::entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {PRODUCT_COLUMNS} FROM products"))?;
        snapshot.products = stmt
            .query_map([], Self::product_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {WEIGHT_COLUMNS} FROM weights"))?;
        snapshot.weights = stmt
            .query_map([], Self::weight_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ACTIVITY_COLUMNS} FROM activities"))?;
        snapshot.activities = stmt
            .query_map([], Self::activity_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self
            .conn
            .prepare("SELECT id, product_id, label, grams, updated_at FROM portions")?;
        snapshot.portions = stmt
            .query_map([], Self::portion_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        snapshot.templates = self.list_templates()?;
        snapshot.settings = self.stored_settings()?;
        snapshot.canonicalize();
        Ok(snapshot)
    }

    /// Whether a record stamped `updated_at` beats the stored row under `key`.
    /// A missing row always loses; ties keep the stored row.
    fn newer_than_stored(
        &self,
        table: &str,
        key_column: &str,
        key: impl rusqlite::ToSql,
        updated_at: i64,
    ) -> Result<bool> {
        let stored: Option<i64> = self
            .conn
            .query_row(
                &format!("SELECT updated_at FROM {table} WHERE {key_column} = ?1"),
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stored.is_none_or(|stored| updated_at > stored))
    }

    /// Write every record of a merge plan in one transaction. Either the whole
    /// plan lands or nothing does. Rows edited locally since the plan was built
    /// keep their newer version.
    pub fn apply_merge_plan(&self, plan: &MergePlan) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for product in &plan.products {
            if self.newer_than_stored("products", "id", &product.id, product.updated_at)? {
                self.write_product(product)?;
            }
        }
        for entry in &plan.entries {
            if self.newer_than_stored("meal_entries", "id", &entry.id, entry.updated_at)? {
                self.write_entry(entry)?;
            }
        }
        for weight in &plan.weights {
            if self.newer_than_stored("weights", "date", &weight.date, weight.updated_at)? {
                self.write_weight(weight)?;
            }
        }
        for activity in &plan.activities {
            if self.newer_than_stored("activities", "date", &activity.date, activity.updated_at)? {
                self.write_activity(activity)?;
            }
        }
        for portion in &plan.portions {
            if self.newer_than_stored("portions", "id", &portion.id, portion.updated_at)? {
                self.write_portion(portion)?;
            }
        }
        for template in &plan.templates {
            if self.newer_than_stored("templates", "id", &template.id, template.updated_at)? {
                self.write_template(template)?;
            }
        }
        if let Some(settings) = &plan.settings {
            if self.newer_than_stored("settings", "id", 1, settings.updated_at)? {
                self.write_settings(settings)?;
            }
        }
        tx.commit().context("Failed to commit merge")?;
        Ok(())
    }

    /// Merge a remote snapshot into this database.
    pub fn merge_snapshot(&self, remote: &SyncSnapshot) -> Result<MergeReport> {
        let mut remote = remote.clone();
        let dropped = remote.drop_invalid();
        if dropped > 0 {
            tracing::warn!(dropped, "skipped invalid records in remote snapshot");
        }
        let local = self.export_snapshot()?;
        let outcome = merge_snapshots(&local, &remote);
        self.apply_merge_plan(&outcome.plan)?;
        Ok(outcome.report)
    }
}

impl SnapshotStore for Mutex<Database> {
    fn load_snapshot(&self) -> Result<SyncSnapshot> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .export_snapshot()
    }

    fn merge_remote(&self, remote: &SyncSnapshot) -> Result<MergeReport> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .merge_snapshot(remote)
    }

    fn record_sync(&self, kind: SyncKind, at: i64) -> Result<()> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_sync_at(kind, at)
    }

    fn last_sync(&self, kind: SyncKind) -> Result<Option<i64>> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_sync_at(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SOURCE_MANUAL;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn sample_product() -> NewProduct {
        NewProduct {
            name: "Oat Flakes".to_string(),
            brand: Some("Acme".to_string()),
            barcode: Some("4000000000001".to_string()),
            per_100g: Nutrients {
                calories: Some(370.0),
                protein: Some(13.0),
                carbs: Some(59.0),
                sugar: Some(1.0),
                fat: Some(7.0),
                saturated_fat: Some(1.2),
                fiber: Some(10.0),
                sodium: Some(0.01),
            },
            default_serving_g: Some(50.0),
            source: SOURCE_MANUAL.to_string(),
        }
    }

    fn manual_entry(date: &str, meal: &str, calories: f64) -> NewMealEntry {
        NewMealEntry {
            date: d(date),
            meal_type: meal.to_string(),
            product_id: None,
            name: "Quick add".to_string(),
            amount_g: None,
            nutrients: Nutrients::calories(calories),
        }
    }

    #[test]
    fn test_insert_and_get_product() {
        let db = Database::open_in_memory().unwrap();
        let product = db.insert_product(&sample_product()).unwrap();
        let loaded = db.get_product(&product.id).unwrap();
        assert_eq!(loaded, product);
        assert_eq!(loaded.per_100g.fiber, Some(10.0));
    }

    #[test]
    fn test_get_missing_product_errors() {
        let db = Database::open_in_memory().unwrap();
        let err = db.get_product("nope").unwrap_err();
        assert!(err.to_string().contains("Product not found"));
    }

    #[test]
    fn test_upsert_product_by_barcode_reuses_existing() {
        let db = Database::open_in_memory().unwrap();
        let first = db.upsert_product_by_barcode(&sample_product()).unwrap();
        let second = db.upsert_product_by_barcode(&sample_product()).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(db.list_products(None).unwrap().len(), 1);
    }

    #[test]
    fn test_search_products_escapes_wildcards() {
        let db = Database::open_in_memory().unwrap();
        db.insert_product(&sample_product()).unwrap();
        assert_eq!(db.search_products("oat").unwrap().len(), 1);
        assert_eq!(db.search_products("acme").unwrap().len(), 1);
        assert!(db.search_products("%").unwrap().is_empty());
    }

    #[test]
    fn test_log_product_scales_nutrients() {
        let db = Database::open_in_memory().unwrap();
        let product = db.insert_product(&sample_product()).unwrap();
        let entry = db
            .log_product(&product.id, 50.0, d("2024-01-10"), "breakfast")
            .unwrap();
        assert_eq!(entry.name, "Oat Flakes");
        assert!((entry.nutrients.calories.unwrap() - 185.0).abs() < 1e-9);
        assert!((entry.nutrients.fiber.unwrap() - 5.0).abs() < 1e-9);
        assert_eq!(entry.product_id.as_deref(), Some(product.id.as_str()));
    }

    #[test]
    fn test_insert_entry_rejects_bad_meal() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.insert_entry(&manual_entry("2024-01-10", "brunch", 100.0)).is_err());
    }

    #[test]
    fn test_update_entry_rescales_and_bumps_timestamp() {
        let db = Database::open_in_memory().unwrap();
        let product = db.insert_product(&sample_product()).unwrap();
        let entry = db
            .log_product(&product.id, 50.0, d("2024-01-10"), "breakfast")
            .unwrap();
        let updated = db
            .update_entry(
                &entry.id,
                &UpdateMealEntry {
                    amount_g: Some(100.0),
                    meal_type: Some("Snack".to_string()),
                    date: None,
                },
            )
            .unwrap();
        assert!((updated.nutrients.calories.unwrap() - 370.0).abs() < 1e-9);
        assert_eq!(updated.meal_type, "snack");
        assert!(updated.updated_at > entry.updated_at);
        assert_eq!(db.get_entry(&entry.id).unwrap(), updated);
    }

    #[test]
    fn test_delete_entry() {
        let db = Database::open_in_memory().unwrap();
        let entry = db.insert_entry(&manual_entry("2024-01-10", "lunch", 500.0)).unwrap();
        assert!(db.delete_entry(&entry.id).unwrap());
        assert!(!db.delete_entry(&entry.id).unwrap());
    }

    #[test]
    fn test_entries_between_is_inclusive() {
        let db = Database::open_in_memory().unwrap();
        for date in ["2024-01-09", "2024-01-10", "2024-01-11", "2024-01-12"] {
            db.insert_entry(&manual_entry(date, "lunch", 100.0)).unwrap();
        }
        let entries = db.entries_between(d("2024-01-10"), d("2024-01-11")).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].date, "2024-01-10");
    }

    #[test]
    fn test_copy_meal() {
        let db = Database::open_in_memory().unwrap();
        db.insert_entry(&manual_entry("2024-01-10", "lunch", 400.0)).unwrap();
        db.insert_entry(&manual_entry("2024-01-10", "lunch", 150.0)).unwrap();
        let copied = db
            .copy_meal(d("2024-01-10"), "lunch", d("2024-01-11"), "dinner")
            .unwrap();
        assert_eq!(copied.len(), 2);
        assert_eq!(
            db.get_entries_for_date_and_meal(d("2024-01-11"), "dinner").unwrap().len(),
            2
        );
        assert!(db.copy_meal(d("2024-01-12"), "lunch", d("2024-01-13"), "lunch").is_err());
    }

    #[test]
    fn test_daily_summary_groups_meals() {
        let db = Database::open_in_memory().unwrap();
        db.insert_entry(&manual_entry("2024-01-10", "dinner", 700.0)).unwrap();
        db.insert_entry(&manual_entry("2024-01-10", "breakfast", 300.0)).unwrap();
        db.insert_entry(&manual_entry("2024-01-10", "breakfast", 100.0)).unwrap();
        db.save_settings(&Settings {
            calorie_target: Some(2000.0),
            ..Settings::default()
        })
        .unwrap();

        let summary = db.build_daily_summary(d("2024-01-10")).unwrap();
        assert_eq!(summary.meals.len(), 2);
        assert_eq!(summary.meals[0].meal_type, "breakfast");
        assert_eq!(summary.meals[0].subtotal.calories, Some(400.0));
        assert_eq!(summary.totals.calories, Some(1100.0));
        assert_eq!(summary.calorie_target, Some(2000.0));
        assert!(summary.activity.is_none());
    }

    #[test]
    fn test_activity_upsert_replaces_day() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_activity(&ActivityRecord {
            date: "2024-01-10".to_string(),
            steps: Some(4000),
            ..ActivityRecord::default()
        })
        .unwrap();
        db.upsert_activity(&ActivityRecord {
            date: "2024-01-10".to_string(),
            steps: Some(9000),
            sleep_seconds: Some(25_200),
            ..ActivityRecord::default()
        })
        .unwrap();
        let activity = db.get_activity(d("2024-01-10")).unwrap().unwrap();
        assert_eq!(activity.steps, Some(9000));
        assert_eq!(activity.sleep_seconds, Some(25_200));
        assert!(activity.updated_at > 0);
        assert_eq!(
            db.activities_between(d("2024-01-01"), d("2024-01-31")).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_weight_upsert_keeps_id_per_date() {
        let db = Database::open_in_memory().unwrap();
        let first = db
            .upsert_weight(&NewWeightEntry {
                date: d("2024-01-10"),
                weight_kg: 80.0,
                notes: None,
            })
            .unwrap();
        let second = db
            .upsert_weight(&NewWeightEntry {
                date: d("2024-01-10"),
                weight_kg: 79.5,
                notes: Some("after run".to_string()),
            })
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(db.get_weight_history(None).unwrap().len(), 1);
        assert!((db.get_weight(d("2024-01-10")).unwrap().unwrap().weight_kg - 79.5).abs() < 1e-9);
        db.delete_weight(&second.id).unwrap();
        assert!(db.delete_weight(&second.id).is_err());
    }

    #[test]
    fn test_weight_history_limit() {
        let db = Database::open_in_memory().unwrap();
        for day in 1..=5 {
            db.upsert_weight(&NewWeightEntry {
                date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
                weight_kg: 80.0,
                notes: None,
            })
            .unwrap();
        }
        let recent = db.get_weight_history(Some(2)).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].date, "2024-01-05");
    }

    #[test]
    fn test_portions() {
        let db = Database::open_in_memory().unwrap();
        let product = db.insert_product(&sample_product()).unwrap();
        db.add_portion(&product.id, "cup", 80.0).unwrap();
        assert!(db.add_portion(&product.id, "cup", 0.0).is_err());
        assert!(db.add_portion("missing", "cup", 10.0).is_err());
        let portion = db.find_portion(&product.id, "CUP").unwrap().unwrap();
        assert!((portion.grams - 80.0).abs() < 1e-9);
        assert_eq!(db.get_portions(&product.id).unwrap().len(), 1);
    }

    #[test]
    fn test_templates_save_and_apply() {
        let db = Database::open_in_memory().unwrap();
        let product = db.insert_product(&sample_product()).unwrap();
        db.log_product(&product.id, 60.0, d("2024-01-10"), "breakfast").unwrap();
        db.insert_entry(&manual_entry("2024-01-10", "breakfast", 90.0)).unwrap();

        let template = db
            .save_template_from_meal("porridge", d("2024-01-10"), "breakfast")
            .unwrap();
        assert_eq!(template.items.len(), 1);

        let logged = db.apply_template("Porridge", d("2024-01-11"), None).unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].meal_type, "breakfast");
        assert_eq!(logged[0].date, "2024-01-11");

        let again = db
            .save_template_from_meal("porridge", d("2024-01-10"), "breakfast")
            .unwrap();
        assert_eq!(again.id, template.id);
        assert_eq!(db.list_templates().unwrap().len(), 1);
        assert!(db.apply_template("missing", d("2024-01-11"), None).is_err());
    }

    #[test]
    fn test_settings_default_and_save() {
        let db = Database::open_in_memory().unwrap();
        let settings = db.get_settings().unwrap();
        assert!(settings.calorie_target.is_none());
        assert!(db.stored_settings().unwrap().is_none());

        let saved = db
            .save_settings(&Settings {
                calorie_target: Some(2200.0),
                tolerance_pct: 5.0,
                ..Settings::default()
            })
            .unwrap();
        assert!(saved.updated_at > 0);
        assert_eq!(db.get_settings().unwrap(), saved);
        assert!(
            db.save_settings(&Settings {
                tolerance_pct: -1.0,
                ..Settings::default()
            })
            .is_err()
        );
    }

    #[test]
    fn test_user_settings_and_sync_state() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.auto_sync_enabled().unwrap());
        db.set_auto_sync(true).unwrap();
        assert!(db.auto_sync_enabled().unwrap());

        assert!(db.last_sync_at(SyncKind::Push).unwrap().is_none());
        db.record_sync_at(SyncKind::Push, 1234).unwrap();
        assert_eq!(db.last_sync_at(SyncKind::Push).unwrap(), Some(1234));
        assert!(db.last_sync_at(SyncKind::Pull).unwrap().is_none());

        let device = db.get_or_create_device_id().unwrap();
        assert_eq!(db.get_or_create_device_id().unwrap(), device);
        assert!(db.delete_setting(SETTING_AUTO_SYNC).unwrap());
    }

    #[test]
    fn test_export_snapshot_contains_everything() {
        let db = Database::open_in_memory().unwrap();
        let product = db.insert_product(&sample_product()).unwrap();
        db.add_portion(&product.id, "cup", 80.0).unwrap();
        db.log_product(&product.id, 60.0, d("2024-01-10"), "breakfast").unwrap();
        db.save_template_from_meal("porridge", d("2024-01-10"), "breakfast")
            .unwrap();
        db.upsert_activity(&ActivityRecord {
            date: "2024-01-10".to_string(),
            steps: Some(100),
            ..ActivityRecord::default()
        })
        .unwrap();
        db.upsert_weight(&NewWeightEntry {
            date: d("2024-01-10"),
            weight_kg: 70.0,
            notes: None,
        })
        .unwrap();
        db.save_settings(&Settings::default()).unwrap();

        let snapshot = db.export_snapshot().unwrap();
        let counts = snapshot.counts();
        assert_eq!(counts.products, 1);
        assert_eq!(counts.portions, 1);
        assert_eq!(counts.entries, 1);
        assert_eq!(counts.templates, 1);
        assert_eq!(counts.activities, 1);
        assert_eq!(counts.weights, 1);
        assert!(snapshot.settings.is_some());
        assert!(snapshot.device_id.is_some());
    }

    #[test]
    fn test_merge_snapshot_between_databases() {
        let phone = Database::open_in_memory().unwrap();
        let laptop = Database::open_in_memory().unwrap();
        let product = phone.insert_product(&sample_product()).unwrap();
        phone.log_product(&product.id, 40.0, d("2024-01-10"), "breakfast").unwrap();
        laptop.insert_entry(&manual_entry("2024-01-10", "dinner", 800.0)).unwrap();

        let report = laptop.merge_snapshot(&phone.export_snapshot().unwrap()).unwrap();
        assert_eq!(report.entries.inserted, 1);
        assert_eq!(report.products.inserted, 1);
        assert_eq!(laptop.get_entries_for_date(d("2024-01-10")).unwrap().len(), 2);

        let again = laptop.merge_snapshot(&phone.export_snapshot().unwrap()).unwrap();
        assert_eq!(again.changed(), 0);
    }

    #[test]
    fn test_merge_snapshot_remote_newer_overwrites() {
        let db = Database::open_in_memory().unwrap();
        let entry = db.insert_entry(&manual_entry("2024-01-10", "lunch", 2000.0)).unwrap();
        let mut remote = db.export_snapshot().unwrap();
        remote.entries[0].nutrients.calories = Some(2200.0);
        remote.entries[0].updated_at = entry.updated_at + 100;

        let report = db.merge_snapshot(&remote).unwrap();
        assert_eq!(report.entries.updated, 1);
        assert_eq!(db.get_entry(&entry.id).unwrap().nutrients.calories, Some(2200.0));
    }

    #[test]
    fn test_merge_snapshot_skips_invalid_remote_records() {
        let db = Database::open_in_memory().unwrap();
        let mut remote = SyncSnapshot::new(None);
        remote.entries.push(MealEntry {
            id: "bad".to_string(),
            date: "not-a-date".to_string(),
            meal_type: "lunch".to_string(),
            product_id: None,
            name: "Ghost".to_string(),
            amount_g: None,
            nutrients: Nutrients::default(),
            created_at: 1,
            updated_at: 1,
        });
        let report = db.merge_snapshot(&remote).unwrap();
        assert_eq!(report.changed(), 0);
        assert!(db.export_snapshot().unwrap().entries.is_empty());
    }

    #[test]
    fn test_merge_plan_keeps_newer_local_row() {
        let db = Database::open_in_memory().unwrap();
        let local = db
            .insert_entry(&manual_entry("2024-01-10", "lunch", 500.0))
            .unwrap();

        // Plan built before a local edit landed: older and equal stamps lose.
        for updated_at in [local.updated_at - 1, local.updated_at] {
            let mut remote = local.clone();
            remote.name = "Remote".to_string();
            remote.updated_at = updated_at;
            db.apply_merge_plan(&MergePlan {
                entries: vec![remote],
                ..MergePlan::default()
            })
            .unwrap();
            let stored = db.get_entry(&local.id).unwrap();
            assert_eq!(stored.name, "Quick add");
            assert_eq!(stored.updated_at, local.updated_at);
        }

        let mut newer = local.clone();
        newer.name = "Remote".to_string();
        newer.updated_at = local.updated_at + 1;
        db.apply_merge_plan(&MergePlan {
            entries: vec![newer],
            ..MergePlan::default()
        })
        .unwrap();
        assert_eq!(db.get_entry(&local.id).unwrap().name, "Remote");
    }

    #[test]
    fn test_merge_plan_settings_respect_timestamps() {
        let db = Database::open_in_memory().unwrap();
        let mut settings = Settings {
            calorie_target: Some(2000.0),
            updated_at: 100,
            ..Settings::default()
        };
        db.apply_merge_plan(&MergePlan {
            settings: Some(settings.clone()),
            ..MergePlan::default()
        })
        .unwrap();

        settings.calorie_target = Some(1500.0);
        settings.updated_at = 50;
        db.apply_merge_plan(&MergePlan {
            settings: Some(settings),
            ..MergePlan::default()
        })
        .unwrap();
        let stored = db.export_snapshot().unwrap().settings.unwrap();
        assert_eq!(stored.calorie_target, Some(2000.0));
        assert_eq!(stored.updated_at, 100);
    }

    #[test]
    fn test_snapshot_store_for_mutex_database() {
        let store = Mutex::new(Database::open_in_memory().unwrap());
        store.record_sync(SyncKind::Pull, 42).unwrap();
        assert_eq!(store.last_sync(SyncKind::Pull).unwrap(), Some(42));
        assert!(store.load_snapshot().unwrap().entries.is_empty());
        let report = store.merge_remote(&SyncSnapshot::default()).unwrap();
        assert_eq!(report.changed(), 0);
    }

    #[test]
    fn test_logged_dates() {
        let db = Database::open_in_memory().unwrap();
        db.insert_entry(&manual_entry("2024-01-08", "lunch", 1.0)).unwrap();
        db.insert_entry(&manual_entry("2024-01-10", "lunch", 1.0)).unwrap();
        db.insert_entry(&manual_entry("2024-01-10", "dinner", 1.0)).unwrap();
        let dates = db.logged_dates(d("2024-01-10"), 7).unwrap();
        assert_eq!(dates, vec![d("2024-01-10"), d("2024-01-08")]);
    }
}
