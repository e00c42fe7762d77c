use anyhow::{Result, bail};
use std::process;

use nutrilog_core::db::Database;
use nutrilog_core::models::{UpdateMealEntry, validate_meal_type};

use super::helpers::{
    Amount, amount_in_grams, parse_amount, parse_date, parse_meal_ref, report_missing,
};
use super::log::describe_entry;

pub(crate) fn cmd_delete(db: &Database, entry_id: &str, json: bool) -> Result<()> {
    if db.delete_entry(entry_id)? {
        if json {
            println!("{}", serde_json::json!({ "deleted": entry_id }));
        } else {
            println!("Deleted entry {entry_id}");
        }
        Ok(())
    } else {
        report_missing(&format!("Entry {entry_id} not found"), json);
        process::exit(2);
    }
}

pub(crate) fn cmd_update(
    db: &Database,
    entry_id: &str,
    amount: Option<&str>,
    meal: Option<&str>,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    if amount.is_none() && meal.is_none() && date.is_none() {
        bail!("Nothing to update. Provide at least one of --amount, --meal, or --date");
    }

    let Ok(existing) = db.get_entry(entry_id) else {
        report_missing(&format!("Entry {entry_id} not found"), json);
        process::exit(2);
    };

    let amount_g = match amount.map(parse_amount).transpose()? {
        None => None,
        Some(Amount::Grams(g)) => Some(g),
        Some(portion) => {
            let Some(product_id) = &existing.product_id else {
                bail!("Entry {entry_id} has no product; give the amount in grams");
            };
            let product = db.get_product(product_id)?;
            Some(amount_in_grams(db, &product, &portion)?)
        }
    };
    if amount_g.is_some() && existing.amount_g.is_none() {
        bail!("Entry {entry_id} was logged without an amount and cannot be rescaled");
    }

    let update = UpdateMealEntry {
        amount_g,
        meal_type: meal.map(validate_meal_type).transpose()?,
        date: date.map(Some).map(parse_date).transpose()?,
    };
    let entry = db.update_entry(entry_id, &update)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entry)?);
    } else {
        println!("Updated entry {entry_id}: {}", describe_entry(&entry));
    }
    Ok(())
}

pub(crate) fn cmd_copy(db: &Database, from: &str, to: &str, json: bool) -> Result<()> {
    let (from_date, from_meal) = parse_meal_ref(from)?;
    let (to_date, to_meal) = parse_meal_ref(to)?;

    if db
        .get_entries_for_date_and_meal(from_date, &from_meal)?
        .is_empty()
    {
        report_missing(
            &format!("No entries found for {from_date}:{from_meal}"),
            json,
        );
        process::exit(2);
    }

    let copied = db.copy_meal(from_date, &from_meal, to_date, &to_meal)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&copied)?);
    } else {
        let count = copied.len();
        println!("Copied {count} entries from {from_date}:{from_meal} to {to_date}:{to_meal}");
    }

    Ok(())
}
