use anyhow::{Result, bail};

use nutrilog_core::aggregate::CalorieBand;
use nutrilog_core::db::Database;
use nutrilog_core::models::Settings;

/// Fields of `target set`; `None` leaves the stored value alone.
#[derive(Debug, Default)]
pub(crate) struct TargetInput {
    pub calories: Option<f64>,
    pub tolerance_pct: Option<f64>,
    pub protein_g: Option<f64>,
    pub carbs_g: Option<f64>,
    pub fat_g: Option<f64>,
    pub goal_weight_kg: Option<f64>,
}

impl TargetInput {
    fn is_empty(&self) -> bool {
        self.calories.is_none()
            && self.tolerance_pct.is_none()
            && self.protein_g.is_none()
            && self.carbs_g.is_none()
            && self.fat_g.is_none()
            && self.goal_weight_kg.is_none()
    }

    fn apply(&self, settings: &mut Settings) {
        if let Some(v) = self.calories {
            settings.calorie_target = Some(v);
        }
        if let Some(v) = self.tolerance_pct {
            settings.tolerance_pct = v;
        }
        if let Some(v) = self.protein_g {
            settings.protein_target_g = Some(v);
        }
        if let Some(v) = self.carbs_g {
            settings.carbs_target_g = Some(v);
        }
        if let Some(v) = self.fat_g {
            settings.fat_target_g = Some(v);
        }
        if let Some(v) = self.goal_weight_kg {
            settings.goal_weight_kg = Some(v);
        }
    }
}

fn print_settings(settings: &Settings) {
    match CalorieBand::from_settings(settings) {
        Some(band) => println!(
            "Calories: {:.0} kcal/day (on target between {:.0} and {:.0}, ±{}%)",
            band.target, band.low, band.high, settings.tolerance_pct
        ),
        None => println!("Calories: not set"),
    }
    let macros: Vec<String> = [
        ("Protein", settings.protein_target_g),
        ("Carbs", settings.carbs_target_g),
        ("Fat", settings.fat_target_g),
    ]
    .iter()
    .filter_map(|(name, v)| v.map(|g| format!("{name}: {g:.0}g")))
    .collect();
    if !macros.is_empty() {
        println!("{}", macros.join("  "));
    }
    if let Some(goal) = settings.goal_weight_kg {
        println!("Goal weight: {goal:.1} kg");
    }
}

pub(crate) fn cmd_target_set(db: &Database, input: &TargetInput, json: bool) -> Result<()> {
    if input.is_empty() {
        bail!(
            "Nothing to set. Provide at least one of --calories, --tolerance, --protein, --carbs, --fat, or --goal-weight"
        );
    }

    let mut settings = db.get_settings()?;
    input.apply(&mut settings);
    let saved = db.save_settings(&settings)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&saved)?);
    } else {
        print_settings(&saved);
    }
    Ok(())
}

pub(crate) fn cmd_target_show(db: &Database, json: bool) -> Result<()> {
    let settings = db.get_settings()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&settings)?);
    } else if settings.calorie_target.is_none()
        && settings.protein_target_g.is_none()
        && settings.goal_weight_kg.is_none()
    {
        eprintln!("No targets set. Use `nutrilog target set --calories <kcal>` to set one.");
    } else {
        print_settings(&settings);
    }
    Ok(())
}

pub(crate) fn cmd_target_clear(db: &Database, json: bool) -> Result<()> {
    let saved = db.save_settings(&Settings::default())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&saved)?);
    } else {
        println!("Targets cleared");
    }
    Ok(())
}
