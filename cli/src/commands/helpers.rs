use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use std::io::{self, BufRead, Write};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use nutrilog_core::db::Database;
use nutrilog_core::merge::MergeReport;
use nutrilog_core::models::{Product, validate_meal_type};

const GRAMS_PER_OZ: f64 = 28.349_523;
const GRAMS_PER_LB: f64 = 453.592_37;

/// An amount typed on the command line.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Amount {
    Grams(f64),
    /// "2 slice": a multiple of a named portion of the product.
    Portion { quantity: f64, label: String },
}

/// Accepts "200", "200g", "1.5 kg", "4oz", "1 lb", "2 slice" or a bare portion label.
pub(crate) fn parse_amount(s: &str) -> Result<Amount> {
    let s = s.trim();
    if s.is_empty() {
        bail!("Amount must not be empty");
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num_part, unit_part) = s.split_at(split);
    let unit = unit_part.trim().to_lowercase();

    if num_part.is_empty() {
        return Ok(Amount::Portion {
            quantity: 1.0,
            label: unit,
        });
    }

    let quantity: f64 = num_part
        .parse()
        .with_context(|| format!("Invalid amount: '{s}'"))?;
    if quantity <= 0.0 {
        bail!("Amount must be greater than 0");
    }

    let grams = match unit.as_str() {
        "" | "g" | "gram" | "grams" => quantity,
        "kg" => quantity * 1000.0,
        "oz" => quantity * GRAMS_PER_OZ,
        "lb" | "lbs" => quantity * GRAMS_PER_LB,
        _ => {
            return Ok(Amount::Portion {
                quantity,
                label: unit,
            });
        }
    };
    Ok(Amount::Grams(grams))
}

/// Resolve an amount to grams, looking up named portions for `product`.
pub(crate) fn amount_in_grams(db: &Database, product: &Product, amount: &Amount) -> Result<f64> {
    match amount {
        Amount::Grams(g) => Ok(*g),
        Amount::Portion { quantity, label } => {
            let singular = label.strip_suffix('s').unwrap_or(label);
            let portion = match db.find_portion(&product.id, label)? {
                Some(p) => Some(p),
                None => db.find_portion(&product.id, singular)?,
            };
            match portion {
                Some(p) => Ok(quantity * p.grams),
                None if label == "serving" || singular == "serving" => product
                    .default_serving_g
                    .map(|g| quantity * g)
                    .with_context(|| format!("{} has no default serving size", product.name)),
                None => bail!(
                    "Unknown unit '{label}' for {}. Use g, kg, oz, lb or add a portion with `nutrilog product portion-add`",
                    product.name
                ),
            }
        }
    }
}

pub(crate) fn parse_date(date_str: Option<String>) -> Result<NaiveDate> {
    match date_str {
        None => Ok(Local::now().date_naive()),
        Some(s) => match s.as_str() {
            "today" => Ok(Local::now().date_naive()),
            "yesterday" => Ok(Local::now().date_naive() - chrono::Duration::days(1)),
            "tomorrow" => Ok(Local::now().date_naive() + chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d").with_context(|| {
                format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday/tomorrow")
            }),
        },
    }
}

pub(crate) fn parse_meal_ref(s: &str) -> Result<(NaiveDate, String)> {
    let Some((date, meal)) = s.split_once(':') else {
        bail!("Invalid meal reference '{s}'. Use format 'date:meal' (e.g. 'today:lunch')");
    };
    let date = parse_date(Some(date.to_string()))?;
    let meal = validate_meal_type(meal)?;
    Ok((date, meal))
}

pub(crate) fn prompt_choice(count: usize) -> Result<usize> {
    eprint!("\nSelect a product (1-{count}): ");
    io::stderr().flush()?;
    let stdin = io::stdin();
    let line = stdin.lock().lines().next().context("No input")??;
    let n: usize = line.trim().parse().context("Invalid number")?;
    if n < 1 || n > count {
        bail!("Selection out of range");
    }
    Ok(n - 1)
}

/// Pick one product, prompting when there is more than one candidate.
pub(crate) fn choose_product(mut products: Vec<Product>) -> Result<Option<Product>> {
    match products.len() {
        0 => Ok(None),
        1 => Ok(products.pop()),
        n => {
            let refs: Vec<&Product> = products.iter().collect();
            print_product_table(&refs);
            let idx = prompt_choice(n)?;
            Ok(Some(products.swap_remove(idx)))
        }
    }
}

pub(crate) fn print_product_table(products: &[&Product]) {
    #[derive(Tabled)]
    struct ProductRow {
        #[tabled(rename = "#")]
        idx: usize,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Brand")]
        brand: String,
        #[tabled(rename = "Cal/100g")]
        calories: String,
        #[tabled(rename = "P/100g")]
        protein: String,
        #[tabled(rename = "C/100g")]
        carbs: String,
        #[tabled(rename = "F/100g")]
        fat: String,
        #[tabled(rename = "Source")]
        source: String,
        #[tabled(rename = "ID")]
        id: String,
    }

    let rows: Vec<ProductRow> = products
        .iter()
        .enumerate()
        .map(|(i, p)| ProductRow {
            idx: i + 1,
            name: truncate(&p.name, 35),
            brand: p
                .brand
                .as_deref()
                .map(|b| truncate(b, 20))
                .unwrap_or_default(),
            calories: fmt_opt(p.per_100g.calories, 0),
            protein: fmt_opt(p.per_100g.protein, 1),
            carbs: fmt_opt(p.per_100g.carbs, 1),
            fat: fmt_opt(p.per_100g.fat, 1),
            source: p.source.clone(),
            id: short_id(&p.id).to_string(),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..7)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

/// Print a not-found message in the requested format.
pub(crate) fn report_missing(message: &str, json: bool) {
    if json {
        println!("{}", json_error(message));
    } else {
        eprintln!("{message}");
    }
}

/// One line per collection that changed, e.g. "entries: 3 new, 1 updated".
pub(crate) fn describe_merge(report: &MergeReport) -> Vec<String> {
    let mut lines: Vec<String> = [
        ("entries", report.entries),
        ("products", report.products),
        ("weights", report.weights),
        ("activities", report.activities),
        ("portions", report.portions),
        ("templates", report.templates),
    ]
    .iter()
    .filter(|(_, c)| c.changed() > 0)
    .map(|(name, c)| format!("{name}: {} new, {} updated", c.inserted, c.updated))
    .collect();
    if report.settings_updated {
        lines.push("settings: updated".to_string());
    }
    lines
}

pub(crate) fn no_neg_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

pub(crate) fn fmt_opt(v: Option<f64>, decimals: usize) -> String {
    v.map_or_else(|| "-".to_string(), |v| format!("{:.*}", decimals, no_neg_zero(v)))
}

/// First block of a UUID, enough to tell records apart in a table.
pub(crate) fn short_id(id: &str) -> &str {
    id.split('-').next().unwrap_or(id)
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutrilog_core::models::{NewProduct, Nutrients, SOURCE_MANUAL};

    fn bread(db: &Database) -> Product {
        db.insert_product(&NewProduct {
            name: "Rye Bread".to_string(),
            brand: None,
            barcode: None,
            per_100g: Nutrients::calories(250.0),
            default_serving_g: Some(80.0),
            source: SOURCE_MANUAL.to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_parse_amount_grams() {
        assert_eq!(parse_amount("200").unwrap(), Amount::Grams(200.0));
        assert_eq!(parse_amount("200g").unwrap(), Amount::Grams(200.0));
        assert_eq!(parse_amount("1.5 kg").unwrap(), Amount::Grams(1500.0));
        assert_eq!(parse_amount("2lb").unwrap(), Amount::Grams(2.0 * GRAMS_PER_LB));
    }

    #[test]
    fn test_parse_amount_portion() {
        assert_eq!(
            parse_amount("2 slices").unwrap(),
            Amount::Portion {
                quantity: 2.0,
                label: "slices".to_string()
            }
        );
        assert_eq!(
            parse_amount("Cup").unwrap(),
            Amount::Portion {
                quantity: 1.0,
                label: "cup".to_string()
            }
        );
    }

    #[test]
    fn test_parse_amount_invalid() {
        assert!(parse_amount("").is_err());
        assert!(parse_amount("0").is_err());
        assert!(parse_amount("1.2.3g").is_err());
    }

    #[test]
    fn test_amount_in_grams_uses_portions() {
        let db = Database::open_in_memory().unwrap();
        let product = bread(&db);
        db.add_portion(&product.id, "slice", 35.0).unwrap();

        let grams = amount_in_grams(&db, &product, &parse_amount("2 slices").unwrap()).unwrap();
        assert_eq!(grams, 70.0);
        let grams = amount_in_grams(&db, &product, &parse_amount("serving").unwrap()).unwrap();
        assert_eq!(grams, 80.0);
        assert!(amount_in_grams(&db, &product, &parse_amount("1 cup").unwrap()).is_err());
    }

    #[test]
    fn test_parse_date_none() {
        let today = Local::now().date_naive();
        assert_eq!(parse_date(None).unwrap(), today);
    }

    #[test]
    fn test_parse_date_keywords() {
        let today = Local::now().date_naive();
        assert_eq!(parse_date(Some("today".to_string())).unwrap(), today);
        assert_eq!(
            parse_date(Some("yesterday".to_string())).unwrap(),
            today - chrono::Duration::days(1)
        );
    }

    #[test]
    fn test_parse_date_iso_and_invalid() {
        let date = parse_date(Some("2024-01-15".to_string())).unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        assert!(parse_date(Some("nope".to_string())).is_err());
    }

    #[test]
    fn test_parse_meal_ref() {
        let (date, meal) = parse_meal_ref("2024-01-15:lunch").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        assert_eq!(meal, "lunch");
        assert!(parse_meal_ref("nocolon").is_err());
        assert!(parse_meal_ref("today:brunch").is_err());
    }

    #[test]
    fn test_choose_product_single() {
        let db = Database::open_in_memory().unwrap();
        let product = bread(&db);
        assert!(choose_product(vec![]).unwrap().is_none());
        assert_eq!(choose_product(vec![product.clone()]).unwrap(), Some(product));
    }

    #[test]
    fn test_describe_merge() {
        let mut report = MergeReport::default();
        assert!(describe_merge(&report).is_empty());
        report.entries.inserted = 3;
        report.entries.updated = 1;
        report.weights.kept = 4;
        report.settings_updated = true;
        assert_eq!(
            describe_merge(&report),
            vec!["entries: 3 new, 1 updated", "settings: updated"]
        );
    }

    #[test]
    fn test_truncate_utf8() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("Crème fraîche", 10), "Crème f...");
        assert_eq!(truncate("日清カップヌードル", 8), "日清カップ...");
    }

    #[test]
    fn test_formatting_helpers() {
        assert_eq!(no_neg_zero(-0.0).to_bits(), 0.0_f64.to_bits());
        assert_eq!(fmt_opt(None, 1), "-");
        assert_eq!(fmt_opt(Some(12.345), 1), "12.3");
        assert_eq!(short_id("1b9d6bcd-bbfd-4b2d"), "1b9d6bcd");
    }
}
