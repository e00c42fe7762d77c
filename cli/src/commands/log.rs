use anyhow::Result;
use std::process;

use nutrilog_core::db::Database;
use nutrilog_core::models::{MealEntry, NewMealEntry, Nutrients, validate_meal_type};
use nutrilog_core::service::{ProductLookupProvider, barcode_lookup};

use super::helpers::{amount_in_grams, parse_amount, parse_date, report_missing};
use super::resolve_product;

const FALLBACK_SERVING_G: f64 = 100.0;

pub(crate) fn describe_entry(entry: &MealEntry) -> String {
    let name = &entry.name;
    let meal = &entry.meal_type;
    let cal = entry.nutrients.calories.unwrap_or(0.0);
    match entry.amount_g {
        Some(g) => format!("{name} {g:.0}g for {meal} ({cal:.0} kcal)"),
        None => format!("{name} for {meal} ({cal:.0} kcal)"),
    }
}

fn print_logged(entry: &MealEntry, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entry)?);
    } else {
        println!("Logged: {}", describe_entry(entry));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn cmd_log(
    db: &Database,
    provider: &dyn ProductLookupProvider,
    query: &str,
    amount: &str,
    meal: &str,
    product_id: Option<String>,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let meal_type = validate_meal_type(meal)?;
    let amount = parse_amount(amount)?;
    let date = parse_date(date)?;

    let product = if let Some(id) = product_id {
        db.get_product(&id)?
    } else if let Some(product) = resolve_product(db, provider, query).await? {
        product
    } else {
        report_missing(&format!("No product found for '{query}'"), json);
        process::exit(2);
    };

    let grams = amount_in_grams(db, &product, &amount)?;
    let entry = db.log_product(&product.id, grams, date, &meal_type)?;
    print_logged(&entry, json)
}

/// Log an entry by its nutrient values, without a product.
pub(crate) fn cmd_quick(
    db: &Database,
    name: &str,
    nutrients: Nutrients,
    meal: &str,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let entry = db.insert_entry(&NewMealEntry {
        date: parse_date(date)?,
        meal_type: validate_meal_type(meal)?,
        product_id: None,
        name: name.trim().to_string(),
        amount_g: None,
        nutrients,
    })?;
    print_logged(&entry, json)
}

pub(crate) async fn cmd_barcode(
    db: &Database,
    provider: &dyn ProductLookupProvider,
    code: &str,
    amount: Option<String>,
    meal: &str,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let meal_type = validate_meal_type(meal)?;
    let date = parse_date(date)?;

    let Some(product) = barcode_lookup(db, provider, code).await? else {
        report_missing(&format!("No product found for barcode '{code}'"), json);
        process::exit(2);
    };

    let grams = match amount {
        Some(s) => amount_in_grams(db, &product, &parse_amount(&s)?)?,
        None => product.default_serving_g.unwrap_or(FALLBACK_SERVING_G),
    };
    let entry = db.log_product(&product.id, grams, date, &meal_type)?;
    print_logged(&entry, json)
}
