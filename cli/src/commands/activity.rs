use anyhow::{Result, bail};
use std::process;

use nutrilog_core::db::Database;
use nutrilog_core::models::ActivityRecord;

use super::helpers::{parse_date, report_missing};

/// Fields of `activity set`; `None` keeps what is already recorded for the day.
#[derive(Debug, Default)]
pub(crate) struct ActivityInput {
    pub steps: Option<u32>,
    pub active_calories: Option<f64>,
    pub intensity_minutes: Option<u32>,
    pub sleep_hours: Option<f64>,
    pub heart_rate: Option<f64>,
}

impl ActivityInput {
    fn merge_into(&self, record: &mut ActivityRecord) -> Result<()> {
        if let Some(hours) = self.sleep_hours {
            if !(0.0..=24.0).contains(&hours) {
                bail!("Sleep must be between 0 and 24 hours");
            }
            #[allow(clippy::cast_sign_loss)]
            let secs = (hours * 3600.0).round() as u32;
            record.sleep_seconds = Some(secs);
        }
        if self.steps.is_some() {
            record.steps = self.steps;
        }
        if self.active_calories.is_some() {
            record.active_calories = self.active_calories;
        }
        if self.intensity_minutes.is_some() {
            record.intensity_minutes = self.intensity_minutes;
        }
        if self.heart_rate.is_some() {
            record.heart_rate = self.heart_rate;
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.steps.is_none()
            && self.active_calories.is_none()
            && self.intensity_minutes.is_none()
            && self.sleep_hours.is_none()
            && self.heart_rate.is_none()
    }
}

fn print_activity(a: &ActivityRecord) {
    println!("{}", a.date);
    if let Some(v) = a.steps {
        println!("  Steps:             {v}");
    }
    if let Some(v) = a.active_calories {
        println!("  Active calories:   {v:.0} kcal");
    }
    if let Some(v) = a.intensity_minutes {
        println!("  Intensity minutes: {v}");
    }
    if let Some(v) = a.sleep_seconds {
        println!("  Sleep:             {:.1} h", f64::from(v) / 3600.0);
    }
    if let Some(v) = a.heart_rate {
        println!("  Resting HR:        {v:.0} bpm");
    }
}

pub(crate) fn cmd_activity_set(
    db: &Database,
    date: Option<String>,
    input: &ActivityInput,
    json: bool,
) -> Result<()> {
    if input.is_empty() {
        bail!(
            "Nothing to set. Provide at least one of --steps, --active-calories, --intensity-minutes, --sleep, or --heart-rate"
        );
    }
    let date = parse_date(date)?;
    let mut record = db.get_activity(date)?.unwrap_or_else(|| ActivityRecord {
        date: date.format("%Y-%m-%d").to_string(),
        ..ActivityRecord::default()
    });
    input.merge_into(&mut record)?;
    let saved = db.upsert_activity(&record)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&saved)?);
    } else {
        print_activity(&saved);
    }
    Ok(())
}

pub(crate) fn cmd_activity_show(db: &Database, date: Option<String>, json: bool) -> Result<()> {
    let date = parse_date(date)?;
    let Some(activity) = db.get_activity(date)? else {
        report_missing(&format!("No activity recorded for {date}"), json);
        process::exit(2);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&activity)?);
    } else {
        print_activity(&activity);
    }
    Ok(())
}
