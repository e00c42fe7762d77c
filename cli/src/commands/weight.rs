use anyhow::{Result, bail};
use std::process;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use nutrilog_core::db::Database;
use nutrilog_core::models::NewWeightEntry;

use super::helpers::{no_neg_zero, parse_date, report_missing, short_id};

const LBS_PER_KG: f64 = 2.20462;
const KG_PER_LB: f64 = 0.453_592;

fn to_kg(value: f64, unit: &str) -> Result<f64> {
    if value <= 0.0 {
        bail!("Weight must be greater than 0");
    }
    match unit.to_lowercase().as_str() {
        "kg" => Ok(value),
        "lbs" | "lb" => Ok(no_neg_zero(value * KG_PER_LB)),
        _ => bail!("Invalid unit '{unit}'. Use 'kg' or 'lbs'"),
    }
}

pub(crate) fn cmd_weight_log(
    db: &Database,
    value: f64,
    unit: &str,
    date: Option<String>,
    notes: Option<String>,
    json: bool,
) -> Result<()> {
    let weight_kg = to_kg(value, unit)?;
    if !unit.eq_ignore_ascii_case("kg") {
        eprintln!("Converting {value:.1} lbs to {weight_kg:.2} kg");
    }

    let result = db.upsert_weight(&NewWeightEntry {
        date: parse_date(date)?,
        weight_kg,
        notes,
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        let lbs = result.weight_kg * LBS_PER_KG;
        println!(
            "Logged {:.1} kg ({lbs:.1} lbs) for {}",
            result.weight_kg, result.date
        );
        if let Some(goal) = db.get_settings()?.goal_weight_kg {
            let to_go = result.weight_kg - goal;
            println!("  {:.1} kg from goal ({goal:.1} kg)", no_neg_zero(to_go.abs()));
        }
        if let Some(ref n) = result.notes {
            println!("  Notes: {n}");
        }
    }

    Ok(())
}

pub(crate) fn cmd_weight_show(db: &Database, date: Option<String>, json: bool) -> Result<()> {
    let date = parse_date(date)?;

    let Some(e) = db.get_weight(date)? else {
        report_missing(&format!("No weight entry for {date}"), json);
        process::exit(2);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&e)?);
    } else {
        let lbs = e.weight_kg * LBS_PER_KG;
        println!("{}: {:.1} kg ({lbs:.1} lbs)", e.date, e.weight_kg);
        if let Some(ref n) = e.notes {
            println!("  Notes: {n}");
        }
    }

    Ok(())
}

pub(crate) fn cmd_weight_history(db: &Database, days: Option<u32>, json: bool) -> Result<()> {
    let entries = db.get_weight_history(days.map(i64::from))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        eprintln!("No weight entries found. Use `nutrilog weight log` to record your weight.");
    } else {
        #[derive(Tabled)]
        struct WeightRow {
            #[tabled(rename = "ID")]
            id: String,
            #[tabled(rename = "Date")]
            date: String,
            #[tabled(rename = "Weight (kg)")]
            kg: String,
            #[tabled(rename = "Weight (lbs)")]
            lbs: String,
            #[tabled(rename = "Notes")]
            notes: String,
        }

        let rows: Vec<WeightRow> = entries
            .iter()
            .map(|e| WeightRow {
                id: short_id(&e.id).to_string(),
                date: e.date.clone(),
                kg: format!("{:.1}", e.weight_kg),
                lbs: format!("{:.1}", e.weight_kg * LBS_PER_KG),
                notes: e.notes.clone().unwrap_or_default(),
            })
            .collect();

        let table = Table::new(&rows)
            .with(Style::rounded())
            .with(Modify::new(Columns::new(2..4)).with(Alignment::right()))
            .to_string();
        println!("{table}");
    }

    Ok(())
}

/// Delete by full id, or by the short id shown in `weight history`.
pub(crate) fn cmd_weight_delete(db: &Database, id: &str, json: bool) -> Result<()> {
    let matches: Vec<String> = db
        .get_weight_history(None)?
        .into_iter()
        .filter(|e| e.id == id || short_id(&e.id) == id)
        .map(|e| e.id)
        .collect();

    let full_id = match matches.as_slice() {
        [one] => one.clone(),
        [] => {
            report_missing(&format!("Weight entry {id} not found"), json);
            process::exit(2);
        }
        _ => bail!("Weight id '{id}' is ambiguous; use the full id"),
    };
    db.delete_weight(&full_id)?;

    if json {
        println!("{}", serde_json::json!({ "deleted": full_id }));
    } else {
        println!("Deleted weight entry {full_id}");
    }

    Ok(())
}
