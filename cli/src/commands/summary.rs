use anyhow::Result;
use chrono::Local;
use std::process;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use nutrilog_core::db::Database;
use nutrilog_core::models::{ActivityRecord, Nutrients};

use super::helpers::{no_neg_zero, parse_date, short_id};

fn macro_line(n: &Nutrients) -> String {
    let cal = no_neg_zero(n.calories.unwrap_or(0.0));
    let p = no_neg_zero(n.protein.unwrap_or(0.0));
    let c = no_neg_zero(n.carbs.unwrap_or(0.0));
    let f = no_neg_zero(n.fat.unwrap_or(0.0));
    format!("{cal:.0} kcal | P:{p:.0}g C:{c:.0}g F:{f:.0}g")
}

fn activity_line(a: &ActivityRecord) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(steps) = a.steps {
        parts.push(format!("{steps} steps"));
    }
    if let Some(kcal) = a.active_calories {
        parts.push(format!("{kcal:.0} active kcal"));
    }
    if let Some(min) = a.intensity_minutes {
        parts.push(format!("{min} intensity min"));
    }
    if let Some(secs) = a.sleep_seconds {
        parts.push(format!("{:.1}h sleep", f64::from(secs) / 3600.0));
    }
    if let Some(hr) = a.heart_rate {
        parts.push(format!("{hr:.0} bpm"));
    }
    (!parts.is_empty()).then(|| parts.join(", "))
}

pub(crate) fn cmd_summary(db: &Database, date: Option<String>, json: bool) -> Result<()> {
    let date = parse_date(date)?;
    let summary = db.build_daily_summary(date)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    if summary.meals.is_empty() && summary.activity.is_none() {
        let date = &summary.date;
        eprintln!("No entries for {date}");
        process::exit(2);
    }

    let date = &summary.date;
    println!("=== {date} ===\n");

    for meal in &summary.meals {
        let meal_label = meal.meal_type.to_uppercase();
        let sub_cal = meal.subtotal.calories.unwrap_or(0.0);
        println!("  {meal_label} ({sub_cal:.0} kcal)");
        for e in &meal.entries {
            let amount = e.amount_g.map(|g| format!(" {g:.0}g")).unwrap_or_default();
            println!(
                "    [{}] {}{amount}: {}",
                short_id(&e.id),
                e.name,
                macro_line(&e.nutrients)
            );
        }
        println!();
    }

    println!("  TOTAL: {}", macro_line(&summary.totals));

    if let Some(target) = summary.calorie_target {
        let remaining = target - summary.totals.calories.unwrap_or(0.0);
        println!("  TARGET: {target:.0} kcal");
        println!("  REMAINING: {:.0} kcal", no_neg_zero(remaining));
    }

    if let Some(line) = summary.activity.as_ref().and_then(activity_line) {
        println!("  ACTIVITY: {line}");
    }

    Ok(())
}

pub(crate) fn cmd_history(db: &Database, days: u32, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct HistoryRow {
        #[tabled(rename = "Date")]
        date: String,
        #[tabled(rename = "Calories")]
        calories: String,
        #[tabled(rename = "Protein")]
        protein: String,
        #[tabled(rename = "Carbs")]
        carbs: String,
        #[tabled(rename = "Fat")]
        fat: String,
        #[tabled(rename = "Steps")]
        steps: String,
    }

    let today = Local::now().date_naive();
    let mut summaries = Vec::new();
    for i in 0..days {
        let date = today - chrono::Duration::days(i64::from(i));
        summaries.push(db.build_daily_summary(date)?);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    let logged = db.logged_dates(today, i64::from(days))?;
    if logged.is_empty() {
        eprintln!("No entries in the last {days} days");
        process::exit(2);
    }

    let rows: Vec<HistoryRow> = summaries
        .iter()
        .map(|s| {
            let t = &s.totals;
            HistoryRow {
                date: s.date.clone(),
                calories: format!("{:.0}", no_neg_zero(t.calories.unwrap_or(0.0))),
                protein: format!("{:.0}g", no_neg_zero(t.protein.unwrap_or(0.0))),
                carbs: format!("{:.0}g", no_neg_zero(t.carbs.unwrap_or(0.0))),
                fat: format!("{:.0}g", no_neg_zero(t.fat.unwrap_or(0.0))),
                steps: s
                    .activity
                    .as_ref()
                    .and_then(|a| a.steps)
                    .map_or_else(|| "-".to_string(), |v| v.to_string()),
            }
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macro_line_defaults_missing_to_zero() {
        let n = Nutrients {
            calories: Some(512.4),
            protein: Some(30.0),
            ..Nutrients::default()
        };
        assert_eq!(macro_line(&n), "512 kcal | P:30g C:0g F:0g");
    }

    #[test]
    fn test_activity_line() {
        let a = ActivityRecord {
            date: "2024-01-10".to_string(),
            steps: Some(9000),
            sleep_seconds: Some(27_000),
            ..ActivityRecord::default()
        };
        assert_eq!(activity_line(&a).unwrap(), "9000 steps, 7.5h sleep");
        assert!(activity_line(&ActivityRecord::default()).is_none());
    }
}
