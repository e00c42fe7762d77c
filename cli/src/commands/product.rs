use anyhow::Result;
use std::process;
use tabled::{Table, Tabled, settings::Style};

use nutrilog_core::db::Database;
use nutrilog_core::models::{NewProduct, Nutrients, Product, SOURCE_MANUAL};
use nutrilog_core::service::{ProductLookupProvider, search_and_cache};

use super::helpers::print_product_table;

pub(crate) async fn cmd_search(
    db: &Database,
    provider: &dyn ProductLookupProvider,
    query: &str,
    json: bool,
) -> Result<()> {
    let all = search_and_cache(db, provider, query).await?;

    if all.is_empty() {
        if json {
            println!("[]");
        } else {
            eprintln!("No results found for '{query}'");
        }
        process::exit(2);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&all)?);
    } else {
        let refs: Vec<&Product> = all.iter().collect();
        print_product_table(&refs);
    }

    Ok(())
}

pub(crate) fn cmd_product_add(
    db: &Database,
    name: &str,
    brand: Option<String>,
    barcode: Option<String>,
    per_100g: Nutrients,
    serving: Option<f64>,
    json: bool,
) -> Result<()> {
    let product = db.insert_product(&NewProduct {
        name: name.trim().to_string(),
        brand,
        barcode,
        per_100g,
        default_serving_g: serving,
        source: SOURCE_MANUAL.to_string(),
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&product)?);
    } else {
        let name = &product.name;
        let id = &product.id;
        println!("Added product: {name} (id: {id})");
    }

    Ok(())
}

pub(crate) fn cmd_product_list(db: &Database, search: Option<&str>, json: bool) -> Result<()> {
    let products = db.list_products(search)?;

    if products.is_empty() {
        if json {
            println!("[]");
        } else {
            eprintln!("No products found");
        }
        process::exit(2);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&products)?);
    } else {
        let refs: Vec<&Product> = products.iter().collect();
        print_product_table(&refs);
    }

    Ok(())
}

pub(crate) fn cmd_portion_add(
    db: &Database,
    product_id: &str,
    label: &str,
    grams: f64,
    json: bool,
) -> Result<()> {
    let portion = db.add_portion(product_id, label, grams)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&portion)?);
    } else {
        let product = db.get_product(product_id)?;
        println!(
            "Added portion '{}' ({:.0}g) to {}",
            portion.label, portion.grams, product.name
        );
    }
    Ok(())
}

pub(crate) fn cmd_portions(db: &Database, product_id: &str, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct PortionRow {
        #[tabled(rename = "Portion")]
        label: String,
        #[tabled(rename = "Grams")]
        grams: String,
    }

    let product = db.get_product(product_id)?;
    let portions = db.get_portions(product_id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&portions)?);
        return Ok(());
    }

    let mut rows: Vec<PortionRow> = portions
        .iter()
        .map(|p| PortionRow {
            label: p.label.clone(),
            grams: format!("{:.0}", p.grams),
        })
        .collect();
    if let Some(serving) = product.default_serving_g {
        rows.push(PortionRow {
            label: "serving".to_string(),
            grams: format!("{serving:.0}"),
        });
    }

    if rows.is_empty() {
        eprintln!("No portions for {}", product.name);
        process::exit(2);
    }

    println!("{}", product.name);
    println!("{}", Table::new(&rows).with(Style::rounded()));
    Ok(())
}
