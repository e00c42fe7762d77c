use anyhow::Result;
use std::process;
use tabled::{Table, Tabled, settings::Style};

use nutrilog_core::db::Database;
use nutrilog_core::models::validate_meal_type;

use super::helpers::{parse_date, parse_meal_ref, report_missing, truncate};

pub(crate) fn cmd_template_save(db: &Database, name: &str, meal_ref: &str, json: bool) -> Result<()> {
    let (date, meal) = parse_meal_ref(meal_ref)?;
    let template = db.save_template_from_meal(name, date, &meal)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&template)?);
    } else {
        println!(
            "Saved template '{}' with {} items from {date}:{meal}",
            template.name,
            template.items.len()
        );
    }
    Ok(())
}

pub(crate) fn cmd_template_list(db: &Database, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct TemplateRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Meal")]
        meal: String,
        #[tabled(rename = "Items")]
        items: String,
    }

    let templates = db.list_templates()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&templates)?);
        return Ok(());
    }
    if templates.is_empty() {
        eprintln!("No templates. Use `nutrilog template save <name> <date:meal>` to create one.");
        process::exit(2);
    }

    let mut rows = Vec::with_capacity(templates.len());
    for t in &templates {
        let names: Vec<String> = t
            .items
            .iter()
            .map(|item| {
                let name = db
                    .get_product(&item.product_id)
                    .map_or_else(|_| "?".to_string(), |p| p.name);
                format!("{name} {:.0}g", item.amount_g)
            })
            .collect();
        rows.push(TemplateRow {
            name: t.name.clone(),
            meal: t.meal_type.clone().unwrap_or_default(),
            items: truncate(&names.join(", "), 60),
        });
    }
    println!("{}", Table::new(&rows).with(Style::rounded()));
    Ok(())
}

pub(crate) fn cmd_template_apply(
    db: &Database,
    name: &str,
    date: Option<String>,
    meal: Option<&str>,
    json: bool,
) -> Result<()> {
    if db.find_template(name)?.is_none() {
        report_missing(&format!("Template '{name}' not found"), json);
        process::exit(2);
    }
    let date = parse_date(date)?;
    let meal = meal.map(validate_meal_type).transpose()?;
    let entries = db.apply_template(name, date, meal.as_deref())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        let kcal: f64 = entries
            .iter()
            .filter_map(|e| e.nutrients.calories)
            .sum();
        let meal = entries.first().map_or("", |e| e.meal_type.as_str());
        println!(
            "Logged {} items from '{name}' for {meal} on {date} ({kcal:.0} kcal)",
            entries.len()
        );
    }
    Ok(())
}
