use anyhow::{Result, bail};
use chrono::Local;
use std::process;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use nutrilog_core::aggregate::{
    Adherence, MAX_REPORT_PERIODS, Metric, MetricStats, PeriodMetrics,
};
use nutrilog_core::db::Database;
use nutrilog_core::service::{monthly_report, weekly_report};

fn avg(stats: MetricStats, decimals: usize) -> String {
    if stats.days == 0 {
        "-".to_string()
    } else {
        format!("{:.*}", decimals, stats.average)
    }
}

fn sleep_hours(metrics: &PeriodMetrics) -> String {
    let stats = metrics.get(Metric::SleepSeconds);
    if stats.days == 0 {
        "-".to_string()
    } else {
        format!("{:.1}h", stats.average / 3600.0)
    }
}

fn calorie_range(stats: MetricStats) -> String {
    match (stats.min, stats.max) {
        (Some(min), Some(max)) => format!("{min:.0}-{max:.0}"),
        _ => "-".to_string(),
    }
}

fn check_count(count: u32, unit: &str) -> Result<()> {
    if count == 0 || count > MAX_REPORT_PERIODS {
        bail!("Number of {unit} must be between 1 and {MAX_REPORT_PERIODS}");
    }
    Ok(())
}

fn adherence_cell(adherence: &Adherence) -> String {
    match adherence.rate {
        Some(rate) => {
            let classified = adherence.under + adherence.within + adherence.over;
            format!("{}/{classified} ({:.0}%)", adherence.within, rate * 100.0)
        }
        None => "-".to_string(),
    }
}

pub(crate) fn cmd_report_weekly(db: &Database, weeks: u32, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct WeekRow {
        #[tabled(rename = "Week")]
        label: String,
        #[tabled(rename = "Dates")]
        dates: String,
        #[tabled(rename = "Days")]
        days: u32,
        #[tabled(rename = "Avg kcal")]
        calories: String,
        #[tabled(rename = "Range")]
        range: String,
        #[tabled(rename = "Protein")]
        protein: String,
        #[tabled(rename = "Steps")]
        steps: String,
        #[tabled(rename = "Sleep")]
        sleep: String,
        #[tabled(rename = "On target")]
        adherence: String,
    }

    check_count(weeks, "weeks")?;
    let report = weekly_report(db, weeks, Local::now().date_naive())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if report.weeks.is_empty() {
        eprintln!("Nothing tracked in the last {weeks} weeks");
        process::exit(2);
    }

    let rows: Vec<WeekRow> = report
        .weeks
        .iter()
        .map(|w| WeekRow {
            label: w.label.clone(),
            dates: format!("{} to {}", w.start.format("%b %d"), w.end.format("%b %d")),
            days: w.days_tracked,
            calories: avg(w.metrics.get(Metric::Calories), 0),
            range: calorie_range(w.metrics.get(Metric::Calories)),
            protein: avg(w.metrics.get(Metric::Protein), 0),
            steps: avg(w.metrics.get(Metric::Steps), 0),
            sleep: sleep_hours(&w.metrics),
            adherence: adherence_cell(&w.adherence),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    if let Some(band) = report.calorie_band {
        println!(
            "Target {:.0} kcal, on target between {:.0} and {:.0}",
            band.target, band.low, band.high
        );
    }
    Ok(())
}

pub(crate) fn cmd_report_monthly(db: &Database, months: u32, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct MonthRow {
        #[tabled(rename = "Month")]
        label: String,
        #[tabled(rename = "Days")]
        days: u32,
        #[tabled(rename = "Avg kcal")]
        calories: String,
        #[tabled(rename = "Protein")]
        protein: String,
        #[tabled(rename = "Steps")]
        steps: String,
        #[tabled(rename = "Sleep")]
        sleep: String,
        #[tabled(rename = "On target")]
        adherence: String,
        #[tabled(rename = "Best week")]
        best: String,
        #[tabled(rename = "Worst week")]
        worst: String,
    }

    check_count(months, "months")?;
    let report = monthly_report(db, months, Local::now().date_naive())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if report.months.is_empty() {
        eprintln!("Nothing tracked in the last {months} months");
        process::exit(2);
    }

    let rows: Vec<MonthRow> = report
        .months
        .iter()
        .map(|m| MonthRow {
            label: m.label.clone(),
            days: m.days_tracked,
            calories: avg(m.metrics.get(Metric::Calories), 0),
            protein: avg(m.metrics.get(Metric::Protein), 0),
            steps: avg(m.metrics.get(Metric::Steps), 0),
            sleep: sleep_hours(&m.metrics),
            adherence: adherence_cell(&m.adherence),
            best: m.best_week.clone().unwrap_or_else(|| "-".to_string()),
            worst: m.worst_week.clone().unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..7)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    Ok(())
}
