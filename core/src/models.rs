use anyhow::{Result, bail};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const MEAL_TYPES: &[&str] = &["breakfast", "lunch", "dinner", "snack"];

pub const DEFAULT_TOLERANCE_PCT: f64 = 10.0;

pub const SOURCE_MANUAL: &str = "manual";
pub const SOURCE_OPENFOODFACTS: &str = "openfoodfacts";

/// Current wall-clock time in epoch milliseconds, the unit of every `updated_at`.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn parse_date(date: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| anyhow::anyhow!("Invalid date '{date}'. Must be YYYY-MM-DD"))
}

/// Nutrient amounts. On a product these are per 100 g, on an entry they are
/// the amounts actually eaten.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Nutrients {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protein: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carbs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sugar: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saturated_fat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fiber: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sodium: Option<f64>,
}

impl Nutrients {
    #[must_use]
    pub fn calories(calories: f64) -> Self {
        Self {
            calories: Some(calories),
            ..Self::default()
        }
    }

    /// Scale per-100 g values to an eaten amount.
    #[must_use]
    pub fn scaled(&self, amount_g: f64) -> Self {
        self.map(|v| v * amount_g / 100.0)
    }

    #[must_use]
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            calories: self.calories.map(&f),
            protein: self.protein.map(&f),
            carbs: self.carbs.map(&f),
            sugar: self.sugar.map(&f),
            fat: self.fat.map(&f),
            saturated_fat: self.saturated_fat.map(&f),
            fiber: self.fiber.map(&f),
            sodium: self.sodium.map(&f),
        }
    }

    /// Field-wise sum. A field stays `None` only if both sides lack it.
    pub fn accumulate(&mut self, other: &Self) {
        fn sum(a: Option<f64>, b: Option<f64>) -> Option<f64> {
            match (a, b) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
            }
        }
        self.calories = sum(self.calories, other.calories);
        self.protein = sum(self.protein, other.protein);
        self.carbs = sum(self.carbs, other.carbs);
        self.sugar = sum(self.sugar, other.sugar);
        self.fat = sum(self.fat, other.fat);
        self.saturated_fat = sum(self.saturated_fat, other.saturated_fat);
        self.fiber = sum(self.fiber, other.fiber);
        self.sodium = sum(self.sodium, other.sodium);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values().iter().all(|(_, v)| v.is_none())
    }

    #[must_use]
    pub fn values(&self) -> [(&'static str, Option<f64>); 8] {
        [
            ("calories", self.calories),
            ("protein", self.protein),
            ("carbs", self.carbs),
            ("sugar", self.sugar),
            ("fat", self.fat),
            ("saturated_fat", self.saturated_fat),
            ("fiber", self.fiber),
            ("sodium", self.sodium),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(flatten)]
    pub per_100g: Nutrients,
    #[serde(default)]
    pub default_serving_g: Option<f64>,
    pub source: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewProduct {
    pub name: String,
    pub brand: Option<String>,
    pub barcode: Option<String>,
    pub per_100g: Nutrients,
    pub default_serving_g: Option<f64>,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealEntry {
    pub id: String,
    pub date: String,
    pub meal_type: String,
    #[serde(default)]
    pub product_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub amount_g: Option<f64>,
    #[serde(flatten)]
    pub nutrients: Nutrients,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewMealEntry {
    pub date: NaiveDate,
    pub meal_type: String,
    pub product_id: Option<String>,
    pub name: String,
    pub amount_g: Option<f64>,
    pub nutrients: Nutrients,
}

impl NewMealEntry {
    #[must_use]
    pub fn from_product(product: &Product, amount_g: f64, date: NaiveDate, meal_type: &str) -> Self {
        Self {
            date,
            meal_type: meal_type.to_string(),
            product_id: Some(product.id.clone()),
            name: product.name.clone(),
            amount_g: Some(amount_g),
            nutrients: product.per_100g.scaled(amount_g),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateMealEntry {
    pub amount_g: Option<f64>,
    pub meal_type: Option<String>,
    pub date: Option<NaiveDate>,
}

/// One day of activity, keyed by date.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub date: String,
    #[serde(default)]
    pub steps: Option<u32>,
    #[serde(default)]
    pub active_calories: Option<f64>,
    #[serde(default)]
    pub intensity_minutes: Option<u32>,
    #[serde(default)]
    pub sleep_seconds: Option<u32>,
    #[serde(default)]
    pub heart_rate: Option<f64>,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightEntry {
    pub id: String,
    pub date: String,
    pub weight_kg: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub notes: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewWeightEntry {
    pub date: NaiveDate,
    pub weight_kg: f64,
    pub notes: Option<String>,
}

/// A named serving size for a product ("slice", "cup").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portion {
    pub id: String,
    pub product_id: String,
    pub label: String,
    pub grams: f64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateItem {
    pub product_id: String,
    pub amount_g: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub meal_type: Option<String>,
    pub items: Vec<TemplateItem>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub calorie_target: Option<f64>,
    #[serde(default = "default_tolerance")]
    pub tolerance_pct: f64,
    #[serde(default)]
    pub protein_target_g: Option<f64>,
    #[serde(default)]
    pub carbs_target_g: Option<f64>,
    #[serde(default)]
    pub fat_target_g: Option<f64>,
    #[serde(default)]
    pub goal_weight_kg: Option<f64>,
    #[serde(default)]
    pub updated_at: i64,
}

fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE_PCT
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            calorie_target: None,
            tolerance_pct: DEFAULT_TOLERANCE_PCT,
            protein_target_g: None,
            carbs_target_g: None,
            fat_target_g: None,
            goal_weight_kg: None,
            updated_at: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DailySummary {
    pub date: String,
    pub meals: Vec<MealGroup>,
    pub totals: Nutrients,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<ActivityRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calorie_target: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MealGroup {
    pub meal_type: String,
    pub entries: Vec<MealEntry>,
    pub subtotal: Nutrients,
}

pub fn validate_meal_type(meal: &str) -> Result<String> {
    let lower = meal.to_lowercase();
    if MEAL_TYPES.contains(&lower.as_str()) {
        Ok(lower)
    } else {
        bail!(
            "Invalid meal type '{meal}'. Must be one of: {}",
            MEAL_TYPES.join(", ")
        )
    }
}

pub fn validate_nutrients(nutrients: &Nutrients) -> Result<()> {
    for (name, value) in nutrients.values() {
        if value.is_some_and(|v| v < 0.0 || !v.is_finite()) {
            bail!("{name} must be a non-negative number");
        }
    }
    Ok(())
}

pub fn validate_product(product: &NewProduct) -> Result<()> {
    if product.name.trim().is_empty() {
        bail!("Product name must not be empty");
    }
    validate_nutrients(&product.per_100g)?;
    if product.default_serving_g.is_some_and(|g| g <= 0.0) {
        bail!("default_serving_g must be greater than 0");
    }
    Ok(())
}

pub fn validate_amount(amount_g: f64) -> Result<()> {
    if amount_g <= 0.0 || !amount_g.is_finite() {
        bail!("Amount must be greater than 0 grams");
    }
    Ok(())
}

/// Validate a synced or imported entry before it is written.
pub fn validate_meal_entry(entry: &MealEntry) -> Result<()> {
    validate_meal_type(&entry.meal_type)?;
    parse_date(&entry.date)?;
    if entry.name.trim().is_empty() {
        bail!("Entry name must not be empty");
    }
    if let Some(amount) = entry.amount_g {
        validate_amount(amount)?;
    }
    validate_nutrients(&entry.nutrients)
}

pub fn validate_weight(weight_kg: f64) -> Result<()> {
    if weight_kg <= 0.0 || !weight_kg.is_finite() {
        bail!("weight_kg must be greater than 0");
    }
    Ok(())
}

pub fn validate_activity(activity: &ActivityRecord) -> Result<()> {
    parse_date(&activity.date)?;
    if activity.active_calories.is_some_and(|v| v < 0.0) {
        bail!("active_calories must not be negative");
    }
    if activity.heart_rate.is_some_and(|v| v <= 0.0) {
        bail!("heart_rate must be greater than 0");
    }
    if activity.sleep_seconds.is_some_and(|s| s > 24 * 3600) {
        bail!("sleep_seconds cannot exceed one day");
    }
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.calorie_target.is_some_and(|c| c <= 0.0) {
        bail!("Calorie target must be greater than 0");
    }
    if !(0.0..=100.0).contains(&settings.tolerance_pct) {
        bail!("Tolerance must be between 0 and 100 percent");
    }
    for (name, value) in [
        ("protein_target_g", settings.protein_target_g),
        ("carbs_target_g", settings.carbs_target_g),
        ("fat_target_g", settings.fat_target_g),
    ] {
        if value.is_some_and(|v| v < 0.0) {
            bail!("{name} must not be negative");
        }
    }
    if let Some(goal) = settings.goal_weight_kg {
        validate_weight(goal)?;
    }
    Ok(())
}
