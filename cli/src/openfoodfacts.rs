use anyhow::{Context, Result};
use async_trait::async_trait;

use nutrilog_core::models::NewProduct;
use nutrilog_core::openfoodfacts::{ProductResponse, SearchResponse, product_to_new_product};
use nutrilog_core::service::ProductLookupProvider;

const DEFAULT_BASE_URL: &str = "https://world.openfoodfacts.org";
const PAGE_SIZE: &str = "10";

pub struct OpenFoodFactsClient {
    client: reqwest::Client,
    base_url: String,
}

impl OpenFoodFactsClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "nutrilog/{} (nutrition journal)",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(std::time::Duration::from_secs(10))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ProductLookupProvider for OpenFoodFactsClient {
    async fn search(&self, query: &str) -> Result<Vec<NewProduct>> {
        let resp = self
            .client
            .get(format!("{}/cgi/search.pl", self.base_url))
            .query(&[
                ("search_terms", query),
                ("json", "1"),
                ("page_size", PAGE_SIZE),
            ])
            .send()
            .await
            .context("Failed to reach OpenFoodFacts API")?
            .error_for_status()
            .context("OpenFoodFacts search failed")?;

        let data: SearchResponse = resp
            .json()
            .await
            .context("Failed to parse OpenFoodFacts search response")?;

        Ok(data
            .products
            .into_iter()
            .filter_map(product_to_new_product)
            .collect())
    }

    async fn lookup_barcode(&self, barcode: &str) -> Result<Option<NewProduct>> {
        let resp = self
            .client
            .get(format!("{}/api/v0/product/{barcode}.json", self.base_url))
            .send()
            .await
            .context("Failed to reach OpenFoodFacts API")?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let data: ProductResponse = resp
            .error_for_status()
            .context("OpenFoodFacts barcode lookup failed")?
            .json()
            .await
            .context("Failed to parse OpenFoodFacts barcode response")?;

        if data.status != 1 {
            return Ok(None);
        }

        Ok(data.product.and_then(product_to_new_product))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_search_maps_products() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi/search.pl"))
            .and(query_param("search_terms", "skyr"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "products": [
                    {
                        "product_name": "Skyr",
                        "brands": "Siggi's",
                        "code": "0898248001015",
                        "serving_size": "150 g",
                        "nutriments": {"energy-kcal_100g": 63, "proteins_100g": 11}
                    },
                    {"product_name": "No nutrition data"}
                ]
            })))
            .mount(&server)
            .await;

        let client = OpenFoodFactsClient::with_base_url(&server.uri()).unwrap();
        let products = client.search("skyr").await.unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].name, "Skyr");
        assert_eq!(products[0].default_serving_g, Some(150.0));
        assert_eq!(products[0].per_100g.protein, Some(11.0));
    }

    #[tokio::test]
    async fn test_search_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi/search.pl"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = OpenFoodFactsClient::with_base_url(&server.uri()).unwrap();
        assert!(client.search("anything").await.is_err());
    }

    #[tokio::test]
    async fn test_lookup_barcode_found_and_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v0/product/3017620422003.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": 1,
                "product": {
                    "product_name": "Nutella",
                    "code": "3017620422003",
                    "nutriments": {"energy-kcal_100g": 539}
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v0/product/0000000000000.json"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": 0})),
            )
            .mount(&server)
            .await;

        let client = OpenFoodFactsClient::with_base_url(&server.uri()).unwrap();
        let found = client.lookup_barcode("3017620422003").await.unwrap().unwrap();
        assert_eq!(found.name, "Nutella");
        assert_eq!(found.per_100g.calories, Some(539.0));
        assert!(client.lookup_barcode("0000000000000").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "hits OpenFoodFacts API"]
    async fn test_lookup_barcode_live() {
        let client = OpenFoodFactsClient::new().unwrap();
        let product = client
            .lookup_barcode("3017620422003")
            .await
            .unwrap()
            .expect("Nutella should exist in OpenFoodFacts");
        assert!(product.name.to_lowercase().contains("nutella"));
    }
}
