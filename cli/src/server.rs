use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tower_http::limit::RequestBodyLimitLayer;

use crate::commands::apply_event;
use nutrilog_core::aggregate::MAX_REPORT_PERIODS;
use nutrilog_core::db::Database;
use nutrilog_core::error::{SyncError, SyncErrorKind};
use nutrilog_core::models::{
    ActivityRecord, MealEntry, NewMealEntry, NewProduct, NewWeightEntry, Nutrients, Product,
    SOURCE_MANUAL, Settings, UpdateMealEntry, WeightEntry, validate_activity, validate_amount,
    validate_meal_type, validate_nutrients, validate_product, validate_settings, validate_weight,
};
use nutrilog_core::service::{ProductLookupProvider, monthly_report, weekly_report};
use nutrilog_core::sync::SyncCoordinator;

const BODY_LIMIT: usize = 10 * 1024 * 1024; // 10 MB

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    lookup: Arc<dyn ProductLookupProvider>,
    api_key: Option<String>,
    sync: Option<SyncCoordinator>,
}

impl AppState {
    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Let the auto-sync worker know the journal changed.
    fn changed(&self) {
        if let Some(sync) = &self.sync {
            sync.notify_local_change();
        }
    }

    fn coordinator(&self) -> Result<&SyncCoordinator, ApiError> {
        self.sync
            .as_ref()
            .ok_or_else(|| ApiError::Unavailable("Sync is not configured".to_string()))
    }
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct CreateEntryRequest {
    date: String,
    meal_type: String,
    product_id: Option<String>,
    amount_g: Option<f64>,
    name: Option<String>,
    #[serde(flatten)]
    nutrients: Nutrients,
}

#[derive(Deserialize)]
struct UpdateEntryRequest {
    amount_g: Option<f64>,
    meal_type: Option<String>,
    date: Option<String>,
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
}

#[derive(Deserialize)]
struct CreateProductRequest {
    name: String,
    brand: Option<String>,
    barcode: Option<String>,
    #[serde(flatten)]
    per_100g: Nutrients,
    default_serving_g: Option<f64>,
}

#[derive(Deserialize)]
struct ActivityRequest {
    steps: Option<u32>,
    active_calories: Option<f64>,
    intensity_minutes: Option<u32>,
    sleep_seconds: Option<u32>,
    heart_rate: Option<f64>,
}

#[derive(Deserialize)]
struct CreateWeightRequest {
    date: String,
    weight_kg: f64,
    notes: Option<String>,
}

#[derive(Deserialize)]
struct WeightHistoryQuery {
    days: Option<i64>,
}

#[derive(Deserialize)]
struct WeeksQuery {
    #[serde(default = "default_weeks")]
    weeks: u32,
}

fn default_weeks() -> u32 {
    4
}

#[derive(Deserialize)]
struct MonthsQuery {
    #[serde(default = "default_months")]
    months: u32,
}

fn default_months() -> u32 {
    3
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            Self::Internal(err) => {
                tracing::error!("internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err.kind() {
            SyncErrorKind::Transient => Self::Unavailable(err.to_string()),
            SyncErrorKind::AuthExpired
            | SyncErrorKind::Decryption
            | SyncErrorKind::Incompatible
            | SyncErrorKind::Configuration => {
                Self::Conflict(err.to_string())
            }
            SyncErrorKind::Local => Self::Internal(err.into()),
        }
    }
}

fn bad_request(err: &anyhow::Error) -> ApiError {
    ApiError::BadRequest(format!("{err:#}"))
}

fn parse_date(s: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest(format!("Invalid date '{s}'. Use YYYY-MM-DD")))
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Journal ---

async fn get_daily_summary(
    State(state): State<AppState>,
    Path(date_str): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let date = parse_date(&date_str)?;
    let summary = state.db().build_daily_summary(date).context("database error")?;
    let value = serde_json::to_value(summary).context("failed to serialize summary")?;
    Ok(Json(value))
}

async fn create_entry(
    State(state): State<AppState>,
    Json(req): Json<CreateEntryRequest>,
) -> Result<(StatusCode, Json<MealEntry>), ApiError> {
    let date = parse_date(&req.date)?;
    let meal_type = validate_meal_type(&req.meal_type).map_err(|e| bad_request(&e))?;

    let entry = if let Some(product_id) = &req.product_id {
        let amount = req
            .amount_g
            .ok_or_else(|| ApiError::BadRequest("amount_g is required with product_id".to_string()))?;
        validate_amount(amount).map_err(|e| bad_request(&e))?;
        let db = state.db();
        let product = db
            .get_product(product_id)
            .map_err(|_| ApiError::BadRequest(format!("Product {product_id} not found")))?;
        db.insert_entry(&NewMealEntry::from_product(&product, amount, date, &meal_type))
            .context("failed to insert meal entry")?
    } else {
        let name = req
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| ApiError::BadRequest("name or product_id is required".to_string()))?;
        validate_nutrients(&req.nutrients).map_err(|e| bad_request(&e))?;
        if let Some(amount) = req.amount_g {
            validate_amount(amount).map_err(|e| bad_request(&e))?;
        }
        state
            .db()
            .insert_entry(&NewMealEntry {
                date,
                meal_type,
                product_id: None,
                name,
                amount_g: req.amount_g,
                nutrients: req.nutrients,
            })
            .context("failed to insert meal entry")?
    };

    state.changed();
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn update_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateEntryRequest>,
) -> Result<Json<MealEntry>, ApiError> {
    if req.amount_g.is_none() && req.meal_type.is_none() && req.date.is_none() {
        return Err(ApiError::BadRequest(
            "At least one field must be provided".to_string(),
        ));
    }

    let meal_type = req
        .meal_type
        .as_deref()
        .map(validate_meal_type)
        .transpose()
        .map_err(|e| bad_request(&e))?;
    let date = req.date.as_deref().map(parse_date).transpose()?;
    if let Some(amount) = req.amount_g {
        validate_amount(amount).map_err(|e| bad_request(&e))?;
    }

    let entry = {
        let db = state.db();
        db.get_entry(&id)
            .map_err(|_| ApiError::NotFound(format!("Meal entry {id} not found")))?;
        db.update_entry(
            &id,
            &UpdateMealEntry {
                amount_g: req.amount_g,
                meal_type,
                date,
            },
        )
        .context("failed to update meal entry")?
    };

    state.changed();
    Ok(Json(entry))
}

async fn delete_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let deleted = state.db().delete_entry(&id).context("database error")?;
    if deleted {
        state.changed();
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Meal entry {id} not found")))
    }
}

// --- Products ---

async fn search_products(
    State(state): State<AppState>,
    Query(params): Query<SearchQuery>,
) -> Result<Json<Vec<Product>>, ApiError> {
    let query = params.q.trim();
    if query.is_empty() {
        return Err(ApiError::BadRequest("Query must not be empty".to_string()));
    }
    let products = state.db().search_products(query).context("database error")?;
    Ok(Json(products))
}

async fn create_product(
    State(state): State<AppState>,
    Json(req): Json<CreateProductRequest>,
) -> Result<(StatusCode, Json<Product>), ApiError> {
    let product = NewProduct {
        name: req.name.trim().to_string(),
        brand: req.brand,
        barcode: req.barcode,
        per_100g: req.per_100g,
        default_serving_g: req.default_serving_g,
        source: SOURCE_MANUAL.to_string(),
    };
    validate_product(&product).map_err(|e| bad_request(&e))?;

    let created = {
        let db = state.db();
        if product.barcode.is_some() {
            db.upsert_product_by_barcode(&product)
        } else {
            db.insert_product(&product)
        }
        .context("failed to save product")?
    };

    state.changed();
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_product_by_barcode(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Product>, ApiError> {
    let cached = state
        .db()
        .get_product_by_barcode(&code)
        .context("database error")?;
    if let Some(product) = cached {
        return Ok(Json(product));
    }

    // The lock is not held across the remote lookup.
    let remote = state
        .lookup
        .lookup_barcode(&code)
        .await
        .context("product lookup failed")?
        .ok_or_else(|| ApiError::NotFound(format!("No product found for barcode '{code}'")))?;

    let product = state
        .db()
        .upsert_product_by_barcode(&remote)
        .context("database error")?;
    state.changed();
    Ok(Json(product))
}

// --- Activity ---

async fn get_activity(
    State(state): State<AppState>,
    Path(date_str): Path<String>,
) -> Result<Json<ActivityRecord>, ApiError> {
    let date = parse_date(&date_str)?;
    let activity = state
        .db()
        .get_activity(date)
        .context("database error")?
        .ok_or_else(|| ApiError::NotFound(format!("No activity recorded for {date_str}")))?;
    Ok(Json(activity))
}

async fn put_activity(
    State(state): State<AppState>,
    Path(date_str): Path<String>,
    Json(req): Json<ActivityRequest>,
) -> Result<Json<ActivityRecord>, ApiError> {
    parse_date(&date_str)?;
    let record = ActivityRecord {
        date: date_str,
        steps: req.steps,
        active_calories: req.active_calories,
        intensity_minutes: req.intensity_minutes,
        sleep_seconds: req.sleep_seconds,
        heart_rate: req.heart_rate,
        updated_at: 0,
    };
    validate_activity(&record).map_err(|e| bad_request(&e))?;

    let saved = state
        .db()
        .upsert_activity(&record)
        .context("failed to save activity")?;
    state.changed();
    Ok(Json(saved))
}

// --- Weight ---

async fn create_weight(
    State(state): State<AppState>,
    Json(req): Json<CreateWeightRequest>,
) -> Result<(StatusCode, Json<WeightEntry>), ApiError> {
    let date = parse_date(&req.date)?;
    validate_weight(req.weight_kg).map_err(|e| bad_request(&e))?;

    let entry = state
        .db()
        .upsert_weight(&NewWeightEntry {
            date,
            weight_kg: req.weight_kg,
            notes: req.notes,
        })
        .context("failed to save weight")?;
    state.changed();
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn get_weight_history(
    State(state): State<AppState>,
    Query(params): Query<WeightHistoryQuery>,
) -> Result<Json<Vec<WeightEntry>>, ApiError> {
    if params.days.is_some_and(|d| d < 1) {
        return Err(ApiError::BadRequest("days must be at least 1".to_string()));
    }
    let entries = state
        .db()
        .get_weight_history(params.days)
        .context("database error")?;
    Ok(Json(entries))
}

async fn delete_weight(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .db()
        .delete_weight(&id)
        .map_err(|_| ApiError::NotFound(format!("Weight entry {id} not found")))?;
    state.changed();
    Ok(StatusCode::NO_CONTENT)
}

// --- Settings & reports ---

async fn get_settings(State(state): State<AppState>) -> Result<Json<Settings>, ApiError> {
    let settings = state.db().get_settings().context("database error")?;
    Ok(Json(settings))
}

async fn put_settings(
    State(state): State<AppState>,
    Json(req): Json<Settings>,
) -> Result<Json<Settings>, ApiError> {
    validate_settings(&req).map_err(|e| bad_request(&e))?;
    let saved = state.db().save_settings(&req).context("failed to save settings")?;
    state.changed();
    Ok(Json(saved))
}

fn check_periods(n: u32, what: &str) -> Result<(), ApiError> {
    if n == 0 || n > MAX_REPORT_PERIODS {
        return Err(ApiError::BadRequest(format!(
            "{what} must be between 1 and {MAX_REPORT_PERIODS}"
        )));
    }
    Ok(())
}

async fn get_weekly_report(
    State(state): State<AppState>,
    Query(params): Query<WeeksQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_periods(params.weeks, "weeks")?;
    let report = weekly_report(&state.db(), params.weeks, Local::now().date_naive())
        .context("failed to build weekly report")?;
    let value = serde_json::to_value(report).context("failed to serialize report")?;
    Ok(Json(value))
}

async fn get_monthly_report(
    State(state): State<AppState>,
    Query(params): Query<MonthsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_periods(params.months, "months")?;
    let report = monthly_report(&state.db(), params.months, Local::now().date_naive())
        .context("failed to build monthly report")?;
    let value = serde_json::to_value(report).context("failed to serialize report")?;
    Ok(Json(value))
}

// --- Export & sync ---

async fn export_data(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let snapshot = state.db().export_snapshot().context("failed to export data")?;
    let value = serde_json::to_value(snapshot).context("failed to serialize export")?;
    Ok(Json(value))
}

async fn run_sync(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state.coordinator()?.sync().await?;
    let value = serde_json::to_value(outcome).context("failed to serialize sync outcome")?;
    Ok(Json(value))
}

async fn get_sync_status(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state.coordinator()?.status()?;
    let value = serde_json::to_value(status).context("failed to serialize sync status")?;
    Ok(Json(value))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/summary/{date}", get(get_daily_summary))
        .route("/api/entries", post(create_entry))
        .route("/api/entries/{id}", put(update_entry).delete(delete_entry))
        .route("/api/products", post(create_product))
        .route("/api/products/search", get(search_products))
        .route("/api/products/barcode/{code}", get(get_product_by_barcode))
        .route("/api/activity/{date}", get(get_activity).put(put_activity))
        .route("/api/weight", post(create_weight).get(get_weight_history))
        .route("/api/weight/{id}", delete(delete_weight))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/reports/weekly", get(get_weekly_report))
        .route("/api/reports/monthly", get(get_monthly_report))
        .route("/api/export", get(export_data))
        .route("/api/sync", post(run_sync))
        .route("/api/sync/status", get(get_sync_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

/// Persist the effects of coordinator events (auto-sync being switched off)
/// for as long as the server runs.
fn spawn_event_listener(db: Arc<Mutex<Database>>, coordinator: &SyncCoordinator) {
    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    tracing::debug!(?event, "sync event");
                    let guard = db.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Err(e) = apply_event(&guard, &event) {
                        tracing::warn!("failed to record sync event: {e:#}");
                    }
                }
                Err(RecvError::Lagged(missed)) => tracing::debug!(missed, "sync events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}

// --- Server startup ---

pub async fn start_server(
    db: Arc<Mutex<Database>>,
    sync: Option<SyncCoordinator>,
    lookup: Arc<dyn ProductLookupProvider>,
    port: u16,
    bind: &str,
    api_key: Option<String>,
) -> anyhow::Result<()> {
    if let Some(coordinator) = &sync {
        coordinator.start()?;
        spawn_event_listener(db.clone(), coordinator);
    } else {
        eprintln!("Sync disabled for this session; /api/sync will return 503");
    }

    let state = AppState {
        db,
        lookup,
        api_key: api_key.clone(),
        sync: sync.clone(),
    };
    let app = build_router(state);

    if let Some(ref key) = api_key {
        eprintln!(
            "API key: {}...{} (see api_key file in data directory)",
            &key[..4],
            &key[key.len() - 4..],
        );
    } else {
        eprintln!("Warning: Authentication disabled (--no-auth). API is open to anyone.");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        eprintln!(
            "Warning: Listening on {bind} with no authentication. Any device on your network can access this API."
        );
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("failed to bind {bind}:{port}"))?;
    eprintln!("Listening on http://{bind}:{port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(coordinator) = sync {
        coordinator.stop();
        // The debounce worker may have had a sync pending.
        if coordinator.status().is_ok_and(|s| s.auto_sync && s.passphrase_set) {
            eprintln!("Syncing before exit...");
            if let Err(e) = coordinator.sync().await {
                eprintln!("Warning: final sync failed: {e}");
            }
        }
    }
    Ok(())
}
