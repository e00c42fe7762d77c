use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;

use crate::aggregate::{
    CalorieBand, DailyRecord, DateRange, MonthAggregate, Period, WeekAggregate, daily_records,
    monthly, weekly,
};
use crate::db::Database;
use crate::models::{NewProduct, Product};

/// Remote product database. The CLI implements this against `OpenFoodFacts`.
#[async_trait]
pub trait ProductLookupProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<NewProduct>>;
    async fn lookup_barcode(&self, barcode: &str) -> Result<Option<NewProduct>>;
}

/// Search local products, then the provider. Remote hits are cached locally and
/// the combined list is deduplicated. When the provider fails but local results
/// exist, the local results are returned.
pub async fn search_and_cache(
    db: &Database,
    provider: &dyn ProductLookupProvider,
    query: &str,
) -> Result<Vec<Product>> {
    let local = db.search_products(query)?;
    let remote = match provider.search(query).await {
        Ok(remote) => remote,
        Err(e) if !local.is_empty() => {
            tracing::warn!("product search offline, using local results: {e:#}");
            return Ok(local);
        }
        Err(e) => return Err(e),
    };

    let mut cached_remote = Vec::new();
    for product in &remote {
        match db.upsert_product_by_barcode(product) {
            Ok(p) => cached_remote.push(p),
            Err(e) => tracing::debug!(name = %product.name, "skipping remote product: {e:#}"),
        }
    }

    let mut all = local;
    let mut seen: HashSet<String> = all.iter().map(|p| p.id.clone()).collect();
    for p in cached_remote {
        if seen.insert(p.id.clone()) {
            all.push(p);
        }
    }
    Ok(all)
}

/// Look up a barcode in the local cache first, then the provider.
pub async fn barcode_lookup(
    db: &Database,
    provider: &dyn ProductLookupProvider,
    code: &str,
) -> Result<Option<Product>> {
    if let Some(cached) = db.get_product_by_barcode(code)? {
        return Ok(Some(cached));
    }
    match provider.lookup_barcode(code).await? {
        Some(new_product) => Ok(Some(db.upsert_product_by_barcode(&new_product)?)),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WeeklyReport {
    pub range: DateRange,
    pub calorie_band: Option<CalorieBand>,
    pub weeks: Vec<WeekAggregate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthlyReport {
    pub range: DateRange,
    pub calorie_band: Option<CalorieBand>,
    pub months: Vec<MonthAggregate>,
}

/// Daily records for every tracked day in `range`.
pub fn records_in_range(db: &Database, range: DateRange) -> Result<Vec<DailyRecord>> {
    let entries = db.entries_between(range.start, range.end)?;
    let activities = db.activities_between(range.start, range.end)?;
    Ok(daily_records(&entries, &activities))
}

pub fn weekly_report(db: &Database, weeks: u32, today: NaiveDate) -> Result<WeeklyReport> {
    let range = Period::Weeks(weeks).range(today);
    let settings = db.get_settings()?;
    let records = records_in_range(db, range)?;
    Ok(WeeklyReport {
        range,
        calorie_band: CalorieBand::from_settings(&settings),
        weeks: weekly(&records, range, &settings),
    })
}

pub fn monthly_report(db: &Database, months: u32, today: NaiveDate) -> Result<MonthlyReport> {
    let range = Period::Months(months).range(today);
    let settings = db.get_settings()?;
    let records = records_in_range(db, range)?;
    Ok(MonthlyReport {
        range,
        calorie_band: CalorieBand::from_settings(&settings),
        months: monthly(&records, range, &settings),
    })
}
