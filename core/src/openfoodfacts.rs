use serde::Deserialize;

use crate::models::{NewProduct, Nutrients, SOURCE_OPENFOODFACTS};

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub products: Vec<ProductData>,
}

#[derive(Debug, Deserialize)]
pub struct ProductResponse {
    pub status: i32,
    pub product: Option<ProductData>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProductData {
    pub product_name: Option<String>,
    pub brands: Option<String>,
    pub code: Option<String>,
    /// e.g. "30 g" or "1 bar (45g)".
    pub serving_size: Option<String>,
    pub nutriments: Option<Nutriments>,
}

#[derive(Debug, Default, Deserialize)]
#[allow(clippy::struct_field_names)]
pub struct Nutriments {
    #[serde(rename = "energy-kcal_100g")]
    pub energy_kcal_100g: Option<f64>,
    pub proteins_100g: Option<f64>,
    pub carbohydrates_100g: Option<f64>,
    pub sugars_100g: Option<f64>,
    pub fat_100g: Option<f64>,
    #[serde(rename = "saturated-fat_100g")]
    pub saturated_fat_100g: Option<f64>,
    pub fiber_100g: Option<f64>,
    pub sodium_100g: Option<f64>,
}

/// Pull the gram amount out of a free-form serving size string.
fn parse_serving_grams(serving: &str) -> Option<f64> {
    let lower = serving.to_ascii_lowercase();
    let idx = lower.find('g')?;
    let digits: String = lower[..idx]
        .chars()
        .rev()
        .skip_while(|c| c.is_whitespace())
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let grams: f64 = digits.replace(',', ".").parse().ok()?;
    (grams > 0.0).then_some(grams)
}

#[must_use]
pub fn product_to_new_product(p: ProductData) -> Option<NewProduct> {
    let name = p.product_name.filter(|n| !n.trim().is_empty())?;
    let n = p.nutriments?;
    let calories = n.energy_kcal_100g?;

    Some(NewProduct {
        name,
        brand: p.brands.filter(|b| !b.is_empty()),
        barcode: p.code.filter(|c| !c.is_empty()),
        per_100g: Nutrients {
            calories: Some(calories),
            protein: n.proteins_100g,
            carbs: n.carbohydrates_100g,
            sugar: n.sugars_100g,
            fat: n.fat_100g,
            saturated_fat: n.saturated_fat_100g,
            fiber: n.fiber_100g,
            sodium: n.sodium_100g,
        },
        default_serving_g: p.serving_size.as_deref().and_then(parse_serving_grams),
        source: SOURCE_OPENFOODFACTS.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_product() -> ProductData {
        ProductData {
            product_name: Some("Nutella".to_string()),
            brands: Some("Ferrero".to_string()),
            code: Some("3017620422003".to_string()),
            serving_size: Some("15 g".to_string()),
            nutriments: Some(Nutriments {
                energy_kcal_100g: Some(539.0),
                proteins_100g: Some(6.3),
                carbohydrates_100g: Some(57.5),
                sugars_100g: Some(56.3),
                fat_100g: Some(30.9),
                saturated_fat_100g: Some(10.6),
                fiber_100g: None,
                sodium_100g: Some(0.0428),
            }),
        }
    }

    #[test]
    fn test_product_complete() {
        let product = product_to_new_product(full_product()).unwrap();
        assert_eq!(product.name, "Nutella");
        assert_eq!(product.brand.as_deref(), Some("Ferrero"));
        assert_eq!(product.barcode.as_deref(), Some("3017620422003"));
        assert_eq!(product.per_100g.calories, Some(539.0));
        assert_eq!(product.per_100g.sugar, Some(56.3));
        assert_eq!(product.per_100g.saturated_fat, Some(10.6));
        assert!(product.per_100g.fiber.is_none());
        assert_eq!(product.default_serving_g, Some(15.0));
        assert_eq!(product.source, SOURCE_OPENFOODFACTS);
    }

    #[test]
    fn test_product_missing_name_or_calories() {
        let mut p = full_product();
        p.product_name = Some("  ".to_string());
        assert!(product_to_new_product(p).is_none());

        let mut p = full_product();
        p.nutriments.as_mut().unwrap().energy_kcal_100g = None;
        assert!(product_to_new_product(p).is_none());

        let mut p = full_product();
        p.nutriments = None;
        assert!(product_to_new_product(p).is_none());
    }

    #[test]
    fn test_parse_serving_grams() {
        assert_eq!(parse_serving_grams("30 g"), Some(30.0));
        assert_eq!(parse_serving_grams("1 bar (45g)"), Some(45.0));
        assert_eq!(parse_serving_grams("12,5g"), Some(12.5));
        assert_eq!(parse_serving_grams("1 cup"), None);
        assert_eq!(parse_serving_grams("250 ml"), None);
    }

    #[test]
    fn test_search_response_parses_off_json() {
        let json = r#"{"count": 1, "products": [{
            "product_name": "Skyr",
            "code": "123",
            "nutriments": {"energy-kcal_100g": 63, "proteins_100g": 11, "saturated-fat_100g": 0.1}
        }]}"#;
        let data: SearchResponse = serde_json::from_str(json).unwrap();
        let products: Vec<NewProduct> = data
            .products
            .into_iter()
            .filter_map(product_to_new_product)
            .collect();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].per_100g.protein, Some(11.0));
        assert_eq!(products[0].per_100g.saturated_fat, Some(0.1));
    }
}
