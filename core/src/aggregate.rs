//! Weekly and monthly rollups of daily nutrition and activity.
//!
//! Everything here is a pure function of the records passed in. Aggregates are
//! never stored; recomputing them from the same records gives the same result.

use std::collections::BTreeMap;

use chrono::{Datelike, Duration, Months, NaiveDate};
use serde::Serialize;

use crate::models::{ActivityRecord, MealEntry, Nutrients, Settings, parse_date};

/// One day's totals. `nutrition` is the sum of that day's entries.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyRecord {
    pub date: NaiveDate,
    pub nutrition: Option<Nutrients>,
    pub activity: Option<ActivityRecord>,
}

impl DailyRecord {
    #[must_use]
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            nutrition: None,
            activity: None,
        }
    }
}

/// Build one record per date from journal entries and activity rows.
/// Rows with unparseable dates are skipped.
pub fn daily_records(entries: &[MealEntry], activities: &[ActivityRecord]) -> Vec<DailyRecord> {
    let mut by_date: BTreeMap<NaiveDate, DailyRecord> = BTreeMap::new();
    for entry in entries {
        let Ok(date) = parse_date(&entry.date) else {
            tracing::debug!(id = %entry.id, date = %entry.date, "skipping entry with bad date");
            continue;
        };
        by_date
            .entry(date)
            .or_insert_with(|| DailyRecord::empty(date))
            .nutrition
            .get_or_insert_with(Nutrients::default)
            .accumulate(&entry.nutrients);
    }
    for activity in activities {
        let Ok(date) = parse_date(&activity.date) else {
            tracing::debug!(date = %activity.date, "skipping activity with bad date");
            continue;
        };
        by_date
            .entry(date)
            .or_insert_with(|| DailyRecord::empty(date))
            .activity = Some(activity.clone());
    }
    by_date.into_values().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Calories,
    Protein,
    Carbs,
    Sugar,
    Fat,
    SaturatedFat,
    Fiber,
    Sodium,
    Steps,
    ActiveCalories,
    IntensityMinutes,
    SleepSeconds,
    HeartRate,
}

impl Metric {
    pub const ALL: [Metric; 13] = [
        Metric::Calories,
        Metric::Protein,
        Metric::Carbs,
        Metric::Sugar,
        Metric::Fat,
        Metric::SaturatedFat,
        Metric::Fiber,
        Metric::Sodium,
        Metric::Steps,
        Metric::ActiveCalories,
        Metric::IntensityMinutes,
        Metric::SleepSeconds,
        Metric::HeartRate,
    ];

    #[must_use]
    pub fn value(self, record: &DailyRecord) -> Option<f64> {
        let nutrition = record.nutrition.unwrap_or_default();
        let activity = record.activity.as_ref();
        match self {
            Metric::Calories => nutrition.calories,
            Metric::Protein => nutrition.protein,
            Metric::Carbs => nutrition.carbs,
            Metric::Sugar => nutrition.sugar,
            Metric::Fat => nutrition.fat,
            Metric::SaturatedFat => nutrition.saturated_fat,
            Metric::Fiber => nutrition.fiber,
            Metric::Sodium => nutrition.sodium,
            Metric::Steps => activity.and_then(|a| a.steps).map(f64::from),
            Metric::ActiveCalories => activity.and_then(|a| a.active_calories),
            Metric::IntensityMinutes => activity.and_then(|a| a.intensity_minutes).map(f64::from),
            Metric::SleepSeconds => activity.and_then(|a| a.sleep_seconds).map(f64::from),
            Metric::HeartRate => activity.and_then(|a| a.heart_rate),
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Metric::Calories => "calories",
            Metric::Protein => "protein",
            Metric::Carbs => "carbs",
            Metric::Sugar => "sugar",
            Metric::Fat => "fat",
            Metric::SaturatedFat => "saturated fat",
            Metric::Fiber => "fiber",
            Metric::Sodium => "sodium",
            Metric::Steps => "steps",
            Metric::ActiveCalories => "active calories",
            Metric::IntensityMinutes => "intensity minutes",
            Metric::SleepSeconds => "sleep",
            Metric::HeartRate => "heart rate",
        }
    }
}

/// Mean/min/max over the days that have a value. Days without a value are
/// skipped, not counted as zero. With no values the average is 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricStats {
    pub average: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub days: u32,
}

impl MetricStats {
    fn from_values(values: impl IntoIterator<Item = f64>) -> Self {
        let mut stats = MetricStats::default();
        let mut sum = 0.0;
        for v in values {
            sum += v;
            stats.days += 1;
            stats.min = Some(stats.min.map_or(v, |m| m.min(v)));
            stats.max = Some(stats.max.map_or(v, |m| m.max(v)));
        }
        if stats.days > 0 {
            stats.average = sum / f64::from(stats.days);
        }
        stats
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeriodMetrics(BTreeMap<Metric, MetricStats>);

impl PeriodMetrics {
    fn compute(days: &[&DailyRecord]) -> Self {
        PeriodMetrics(
            Metric::ALL
                .iter()
                .map(|&m| (m, MetricStats::from_values(days.iter().filter_map(|d| m.value(d)))))
                .collect(),
        )
    }

    #[must_use]
    pub fn get(&self, metric: Metric) -> MetricStats {
        self.0.get(&metric).copied().unwrap_or_default()
    }
}

/// Inclusive calorie range a day must land in to count as on target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalorieBand {
    pub target: f64,
    pub low: f64,
    pub high: f64,
}

impl CalorieBand {
    #[must_use]
    pub fn new(target: f64, tolerance_pct: f64) -> Self {
        let delta = target * tolerance_pct / 100.0;
        Self {
            target,
            low: target - delta,
            high: target + delta,
        }
    }

    #[must_use]
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        settings
            .calorie_target
            .filter(|t| *t > 0.0)
            .map(|t| Self::new(t, settings.tolerance_pct))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DayClass {
    Under,
    Within,
    Over,
}

#[must_use]
pub fn classify(calories: f64, band: CalorieBand) -> DayClass {
    if calories < band.low {
        DayClass::Under
    } else if calories > band.high {
        DayClass::Over
    } else {
        DayClass::Within
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Adherence {
    pub under: u32,
    pub within: u32,
    pub over: u32,
    /// Share of classified days that landed within the band.
    pub rate: Option<f64>,
}

impl Adherence {
    fn compute(days: &[&DailyRecord], band: Option<CalorieBand>) -> Self {
        let mut adherence = Adherence::default();
        let Some(band) = band else {
            return adherence;
        };
        for calories in days.iter().filter_map(|d| Metric::Calories.value(d)) {
            match classify(calories, band) {
                DayClass::Under => adherence.under += 1,
                DayClass::Within => adherence.within += 1,
                DayClass::Over => adherence.over += 1,
            }
        }
        let classified = adherence.under + adherence.within + adherence.over;
        if classified > 0 {
            adherence.rate = Some(f64::from(adherence.within) / f64::from(classified));
        }
        adherence
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    #[must_use]
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Most weeks or months a report covers through the CLI or the API.
pub const MAX_REPORT_PERIODS: u32 = 120;

/// Report periods, always whole calendar weeks or months ending with the one
/// that contains "today".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Weeks(u32),
    Months(u32),
}

impl Period {
    /// Counts reaching past the calendar start at the earliest whole week or
    /// month chrono can represent.
    #[must_use]
    pub fn range(self, today: NaiveDate) -> DateRange {
        match self {
            Period::Weeks(n) => {
                let current = week_start(today);
                let start = Duration::try_weeks(i64::from(n.max(1) - 1))
                    .and_then(|back| current.checked_sub_signed(back))
                    .unwrap_or_else(earliest_week_start);
                DateRange::new(start, current + Duration::days(6))
            }
            Period::Months(n) => {
                let current = first_of_month(today);
                let start = current
                    .checked_sub_months(Months::new(n.max(1) - 1))
                    .unwrap_or_else(|| first_of_month(NaiveDate::MIN));
                DateRange::new(start, last_of_month(current))
            }
        }
    }
}

fn earliest_week_start() -> NaiveDate {
    week_start(NaiveDate::MIN + Duration::days(6))
}

#[must_use]
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

#[must_use]
pub fn week_label(date: NaiveDate) -> String {
    let iso = date.iso_week();
    format!("{}-W{:02}", iso.year(), iso.week())
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.day0()))
}

fn last_of_month(date: NaiveDate) -> NaiveDate {
    first_of_month(date)
        .checked_add_months(Months::new(1))
        .map_or(NaiveDate::MAX, |next| next - Duration::days(1))
}

/// The month a week belongs to: the one holding at least four of its days,
/// which is always the month of its Thursday.
#[must_use]
pub fn attributed_month(week_start: NaiveDate) -> (i32, u32) {
    let thursday = week_start + Duration::days(3);
    (thursday.year(), thursday.month())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeekAggregate {
    pub label: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub days_tracked: u32,
    pub metrics: PeriodMetrics,
    pub adherence: Adherence,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthAggregate {
    pub label: String,
    pub year: i32,
    pub month: u32,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub days_tracked: u32,
    /// Computed over the month's own days, never averaged from the weeks.
    pub metrics: PeriodMetrics,
    pub adherence: Adherence,
    pub weeks: Vec<WeekAggregate>,
    pub best_week: Option<String>,
    pub worst_week: Option<String>,
}

type DayIndex<'a> = BTreeMap<NaiveDate, &'a DailyRecord>;

fn index_in_range(records: &[DailyRecord], range: DateRange) -> DayIndex<'_> {
    records
        .iter()
        .filter(|r| range.contains(r.date))
        .map(|r| (r.date, r))
        .collect()
}

fn days_between<'a>(days: &DayIndex<'a>, lo: NaiveDate, hi: NaiveDate) -> Vec<&'a DailyRecord> {
    if lo > hi {
        return Vec::new();
    }
    days.range(lo..=hi).map(|(_, r)| *r).collect()
}

fn days_tracked(days: &[&DailyRecord]) -> u32 {
    days.len() as u32
}

fn build_weeks(days: &DayIndex<'_>, range: DateRange, band: Option<CalorieBand>) -> Vec<WeekAggregate> {
    let mut weeks = Vec::new();
    let mut start = week_start(range.start);
    while start <= range.end {
        let end = start + Duration::days(6);
        let in_week = days_between(days, start.max(range.start), end.min(range.end));
        weeks.push(WeekAggregate {
            label: week_label(start),
            start,
            end,
            days_tracked: days_tracked(&in_week),
            metrics: PeriodMetrics::compute(&in_week),
            adherence: Adherence::compute(&in_week, band),
        });
        start += Duration::weeks(1);
    }
    weeks
}

/// Week aggregates for every ISO week overlapping `range`, empty weeks included.
/// Returns nothing when no record falls inside the range.
pub fn weekly(records: &[DailyRecord], range: DateRange, settings: &Settings) -> Vec<WeekAggregate> {
    let days = index_in_range(records, range);
    if days.is_empty() {
        return Vec::new();
    }
    build_weeks(&days, range, CalorieBand::from_settings(settings))
}

fn best_and_worst(weeks: &[WeekAggregate]) -> (Option<String>, Option<String>) {
    let mut best: Option<(&WeekAggregate, f64)> = None;
    let mut worst: Option<(&WeekAggregate, f64)> = None;
    for week in weeks {
        let Some(rate) = week.adherence.rate else {
            continue;
        };
        if best.is_none_or(|(_, r)| rate > r) {
            best = Some((week, rate));
        }
        if worst.is_none_or(|(_, r)| rate < r) {
            worst = Some((week, rate));
        }
    }
    (
        best.map(|(w, _)| w.label.clone()),
        worst.map(|(w, _)| w.label.clone()),
    )
}

/// Month aggregates for every calendar month overlapping `range`. Each month
/// lists the weeks attributed to it. A boundary week attributed to a month
/// outside `range` is listed under no month, though its in-month days still
/// count toward that month's own metrics.
pub fn monthly(records: &[DailyRecord], range: DateRange, settings: &Settings) -> Vec<MonthAggregate> {
    let days = index_in_range(records, range);
    if days.is_empty() {
        return Vec::new();
    }
    let band = CalorieBand::from_settings(settings);
    let weeks = build_weeks(&days, range, band);

    let mut months = Vec::new();
    let mut first = first_of_month(range.start);
    while first <= range.end {
        let last = last_of_month(first);
        let in_month = days_between(&days, first.max(range.start), last.min(range.end));
        let month_weeks: Vec<WeekAggregate> = weeks
            .iter()
            .filter(|w| attributed_month(w.start) == (first.year(), first.month()))
            .cloned()
            .collect();
        let (best_week, worst_week) = best_and_worst(&month_weeks);
        months.push(MonthAggregate {
            label: format!("{}-{:02}", first.year(), first.month()),
            year: first.year(),
            month: first.month(),
            start: first,
            end: last,
            days_tracked: days_tracked(&in_month),
            metrics: PeriodMetrics::compute(&in_month),
            adherence: Adherence::compute(&in_month, band),
            weeks: month_weeks,
            best_week,
            worst_week,
        });
        let Some(next) = first.checked_add_months(Months::new(1)) else {
            break;
        };
        first = next;
    }
    months
}
