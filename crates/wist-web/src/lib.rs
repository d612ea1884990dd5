//! Axum JSON API for WIST: scan triggers, the review queue, per-user
//! analytics, and the role-gated business analytics surface.
//!
//! Identity is out of scope; callers pass `x-user-id` and unknown users get
//! 404. Business endpoints additionally require the `business` role and only
//! ever return anonymized consumer identifiers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use uuid::Uuid;

use wist_core::{
    AnalyticsRecord, ApproveOverrides, ItemSource, ReviewQueueItem, ReviewStatus, User,
};
use wist_scan::{ScanError, ScanMode, ScanPipeline};
use wist_storage::{ReviewStore, StoreError};

pub const CRATE_NAME: &str = "wist-web";

/// Consumers older than this on their last purchase count as churn risk.
const CHURN_THRESHOLD_DAYS: i64 = 60;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ReviewStore>,
    pub pipeline: Arc<ScanPipeline>,
}

impl AppState {
    pub fn new(store: Arc<dyn ReviewStore>, pipeline: Arc<ScanPipeline>) -> Self {
        Self { store, pipeline }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/scan/initial", post(scan_initial_handler))
        .route("/scan/new", post(scan_new_handler))
        .route(
            "/review-items",
            get(list_review_items_handler).post(create_manual_item_handler),
        )
        .route("/review-items/{id}/approve", post(approve_handler))
        .route("/review-items/{id}/reject", post(reject_handler))
        .route("/analytics", get(analytics_handler))
        .route("/business/analytics/table", get(business_table_handler))
        .route(
            "/business/analytics/filter-options",
            get(business_filter_options_handler),
        )
        .route("/business/analytics/kpi", get(business_kpi_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("WIST_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "serving API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Error shaping
// ---------------------------------------------------------------------------

fn error_response(status: StatusCode, detail: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "detail": detail.into() }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    tracing::error!(error = %err, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
}

fn store_error_response(err: StoreError) -> Response {
    match err {
        StoreError::NotFound => error_response(StatusCode::NOT_FOUND, "Review item not found."),
        StoreError::Conflict(status) => error_response(
            StatusCode::CONFLICT,
            format!("Item is already {status}."),
        ),
        StoreError::PriceRequired => error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "price_cents is required. Pass edited_price_cents in the request body.",
        ),
        StoreError::ConstraintViolation => {
            error_response(StatusCode::CONFLICT, "Duplicate review item.")
        }
        StoreError::Backend(err) => server_error(err),
    }
}

fn scan_error_response(err: ScanError) -> Response {
    match err {
        ScanError::InvalidWindow(_) | ScanError::PreconditionFailed => {
            error_response(StatusCode::BAD_REQUEST, err.to_string())
        }
        ScanError::Mailbox(err) => error_response(
            StatusCode::BAD_GATEWAY,
            format!("mailbox provider error: {err}"),
        ),
        ScanError::Store(err) => store_error_response(err),
    }
}

// ---------------------------------------------------------------------------
// Caller resolution
// ---------------------------------------------------------------------------

async fn current_user(state: &AppState, headers: &HeaderMap) -> Result<User, Response> {
    let Some(raw) = headers.get("x-user-id").and_then(|v| v.to_str().ok()) else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "x-user-id header is required",
        ));
    };
    let Ok(user_id) = Uuid::parse_str(raw) else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "x-user-id must be a UUID",
        ));
    };
    match state.store.get_user(user_id).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(error_response(
            StatusCode::NOT_FOUND,
            format!("User {user_id} not found."),
        )),
        Err(err) => Err(store_error_response(err)),
    }
}

/// Consumer data never leaves the business surface under a real id.
async fn business_user(state: &AppState, headers: &HeaderMap) -> Result<User, Response> {
    let user = current_user(state, headers).await?;
    if !user.is_business() {
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "Access denied. Business account required.",
        ));
    }
    Ok(user)
}

fn anonymize_user_id(user_id: Uuid) -> String {
    let digest = Sha256::digest(user_id.to_string().as_bytes());
    hex::encode(digest)[..12].to_string()
}

// ---------------------------------------------------------------------------
// Scan endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ScanInitialRequest {
    initial_scan_days: i32,
}

async fn run_scan_for(state: &AppState, headers: &HeaderMap, mode: ScanMode) -> Response {
    let user = match current_user(state, headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    if user.mailbox_refresh_token.is_none() {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "No mailbox credential. Complete OAuth first.",
        );
    }
    match state.pipeline.run_scan(&user, mode).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => scan_error_response(err),
    }
}

async fn scan_initial_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(body) = serde_json::from_slice::<ScanInitialRequest>(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "initial_scan_days is required");
    };
    run_scan_for(
        &state,
        &headers,
        ScanMode::Initial {
            window_days: body.initial_scan_days,
        },
    )
    .await
}

async fn scan_new_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    run_scan_for(&state, &headers, ScanMode::Incremental).await
}

// ---------------------------------------------------------------------------
// Review queue endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ReviewItemView {
    id: Uuid,
    source: &'static str,
    status: &'static str,
    merchant: Option<String>,
    item_name: String,
    category: Option<String>,
    size: Option<String>,
    price_cents: Option<i64>,
    /// True when the caller must supply a price before approving.
    price_missing: bool,
    currency: String,
    purchased_at: Option<DateTime<Utc>>,
    image_url: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<ReviewQueueItem> for ReviewItemView {
    fn from(item: ReviewQueueItem) -> Self {
        Self {
            id: item.id,
            source: item.source.as_str(),
            status: item.status.as_str(),
            price_missing: item.price_missing(),
            merchant: item.merchant,
            item_name: item.item_name,
            category: item.category,
            size: item.size,
            price_cents: item.price_cents,
            currency: item.currency,
            purchased_at: item.purchased_at,
            image_url: item.image_url,
            created_at: item.created_at,
        }
    }
}

async fn list_review_items_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let user = match current_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state.store.list_pending(user.id).await {
        Ok(items) => {
            let views: Vec<ReviewItemView> = items.into_iter().map(Into::into).collect();
            Json(views).into_response()
        }
        Err(err) => store_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct ManualItemRequest {
    item_name: String,
    #[serde(default)]
    merchant: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    price_cents: Option<i64>,
    #[serde(default)]
    purchased_at: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
}

async fn create_manual_item_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let user = match current_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    let Ok(body) = serde_json::from_slice::<ManualItemRequest>(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "item_name is required");
    };
    if body.item_name.trim().is_empty() {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, "item_name must not be empty");
    }

    let item = ReviewQueueItem {
        id: Uuid::new_v4(),
        user_id: user.id,
        source: ItemSource::Manual,
        status: ReviewStatus::Pending,
        merchant: body.merchant,
        item_name: body.item_name,
        category: body.category,
        size: body.size,
        price_cents: body.price_cents,
        currency: "USD".to_string(),
        purchased_at: body
            .purchased_at
            .as_deref()
            .and_then(wist_scan::parse_purchased_at),
        email_message_id: None,
        email_thread_id: None,
        image_url: body.image_url,
        extracted_json: None,
        created_at: Utc::now(),
    };

    match state.store.insert_pending(&item).await {
        Ok(()) => (StatusCode::CREATED, Json(ReviewItemView::from(item))).into_response(),
        Err(err) => store_error_response(err),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ApproveRequest {
    #[serde(default)]
    edited_item_name: Option<String>,
    #[serde(default)]
    edited_price_cents: Option<i64>,
    #[serde(default)]
    edited_category: Option<String>,
}

async fn approve_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(item_id): AxumPath<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let user = match current_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    // The body is optional: a plain swipe sends nothing to override.
    let body = if body.is_empty() {
        ApproveRequest::default()
    } else {
        match serde_json::from_slice::<ApproveRequest>(&body) {
            Ok(body) => body,
            Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid request body"),
        }
    };
    let overrides = ApproveOverrides {
        item_name: body.edited_item_name,
        price_cents: body.edited_price_cents,
        category: body.edited_category,
    };

    match state.store.approve(user.id, item_id, &overrides).await {
        Ok(wardrobe) => Json(serde_json::json!({
            "success": true,
            "wardrobe_item_id": wardrobe.id,
            "item_name": wardrobe.item_name,
            "category": wardrobe.category,
            "price_cents": wardrobe.price_cents,
            "image_url": wardrobe.image_url,
            "merchant": wardrobe.merchant,
        }))
        .into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn reject_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(item_id): AxumPath<Uuid>,
    headers: HeaderMap,
) -> Response {
    let user = match current_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state.store.reject(user.id, item_id).await {
        Ok(()) => Json(serde_json::json!({ "success": true })).into_response(),
        Err(err) => store_error_response(err),
    }
}

// ---------------------------------------------------------------------------
// Analytics endpoints
// ---------------------------------------------------------------------------

async fn analytics_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let user = match current_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state.store.get_analytics(user.id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "No analytics yet. Run a scan first.",
        ),
        Err(err) => store_error_response(err),
    }
}

#[derive(Debug, Default, Deserialize)]
struct BusinessTableQuery {
    #[serde(default)]
    merchant: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    min_spending_cents: Option<i64>,
    #[serde(default)]
    min_purchases: Option<i64>,
    #[serde(default)]
    page: Option<usize>,
    #[serde(default)]
    page_size: Option<usize>,
}

/// Business-safe projection: the consumer id is a one-way hash, stable
/// across calls but not reversible, and no other identity fields exist.
#[derive(Debug, Serialize)]
struct BusinessAnalyticsRow {
    consumer_id: String,
    total_spending_cents: i64,
    total_purchases: i64,
    average_purchase_cents: i64,
    frequent_merchant: Option<String>,
    frequent_merchant_count: Option<i64>,
    most_spent_merchant: Option<String>,
    most_spent_merchant_cents: Option<i64>,
    frequent_category: Option<String>,
    frequent_category_count: Option<i64>,
    most_spent_category: Option<String>,
    most_spent_category_cents: Option<i64>,
    merchant_freq: BTreeMap<String, i64>,
    merchant_spend: BTreeMap<String, i64>,
    category_freq: BTreeMap<String, i64>,
    category_spend: BTreeMap<String, i64>,
    first_purchase_at: Option<DateTime<Utc>>,
    last_purchase_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl From<AnalyticsRecord> for BusinessAnalyticsRow {
    fn from(record: AnalyticsRecord) -> Self {
        Self {
            consumer_id: anonymize_user_id(record.user_id),
            total_spending_cents: record.total_spending_cents,
            total_purchases: record.total_purchases,
            average_purchase_cents: record.average_purchase_cents,
            frequent_merchant: record.frequent_merchant,
            frequent_merchant_count: record.frequent_merchant_count,
            most_spent_merchant: record.most_spent_merchant,
            most_spent_merchant_cents: record.most_spent_merchant_cents,
            frequent_category: record.frequent_category,
            frequent_category_count: record.frequent_category_count,
            most_spent_category: record.most_spent_category,
            most_spent_category_cents: record.most_spent_category_cents,
            merchant_freq: record.merchant_freq,
            merchant_spend: record.merchant_spend,
            category_freq: record.category_freq,
            category_spend: record.category_spend,
            first_purchase_at: record.first_purchase_at,
            last_purchase_at: record.last_purchase_at,
            updated_at: record.updated_at,
        }
    }
}

fn matches_filters(record: &AnalyticsRecord, query: &BusinessTableQuery) -> bool {
    if let Some(merchant) = &query.merchant {
        if record.frequent_merchant.as_deref() != Some(merchant.as_str()) {
            return false;
        }
    }
    if let Some(category) = &query.category {
        if record.frequent_category.as_deref() != Some(category.as_str()) {
            return false;
        }
    }
    if let Some(min_spending) = query.min_spending_cents {
        if record.total_spending_cents < min_spending {
            return false;
        }
    }
    if let Some(min_purchases) = query.min_purchases {
        if record.total_purchases < min_purchases {
            return false;
        }
    }
    true
}

async fn business_table_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<BusinessTableQuery>,
) -> Response {
    if let Err(response) = business_user(&state, &headers).await {
        return response;
    }
    let records = match state.store.list_analytics().await {
        Ok(records) => records,
        Err(err) => return store_error_response(err),
    };

    let filtered: Vec<AnalyticsRecord> = records
        .into_iter()
        .filter(|record| matches_filters(record, &query))
        .collect();
    let total = filtered.len();

    let page_size = query.page_size.unwrap_or(50).clamp(1, 200);
    let page = query.page.unwrap_or(1).max(1);
    let rows: Vec<BusinessAnalyticsRow> = filtered
        .into_iter()
        .skip((page - 1) * page_size)
        .take(page_size)
        .map(Into::into)
        .collect();

    Json(serde_json::json!({
        "total": total,
        "page": page,
        "page_size": page_size,
        "rows": rows,
    }))
    .into_response()
}

async fn business_filter_options_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = business_user(&state, &headers).await {
        return response;
    }
    let records = match state.store.list_analytics().await {
        Ok(records) => records,
        Err(err) => return store_error_response(err),
    };

    let merchants: BTreeSet<String> = records
        .iter()
        .filter_map(|r| r.frequent_merchant.clone())
        .collect();
    let categories: BTreeSet<String> = records
        .iter()
        .filter_map(|r| r.frequent_category.clone())
        .collect();

    Json(serde_json::json!({
        "merchants": merchants,
        "categories": categories,
    }))
    .into_response()
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn merge_maps(into: &mut BTreeMap<String, i64>, from: &BTreeMap<String, i64>) {
    for (key, value) in from {
        *into.entry(key.clone()).or_insert(0) += value;
    }
}

fn top_by_value(map: &BTreeMap<String, i64>) -> Option<(&String, i64)> {
    map.iter()
        .max_by_key(|(_, value)| **value)
        .map(|(key, value)| (key, *value))
}

async fn business_kpi_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(response) = business_user(&state, &headers).await {
        return response;
    }
    let records = match state.store.list_analytics().await {
        Ok(records) => records,
        Err(err) => return store_error_response(err),
    };

    if records.is_empty() {
        return Json(serde_json::json!({
            "consumer_count": 0,
            "executive": {},
            "behavioral": {},
            "predictive": {},
        }))
        .into_response();
    }

    let n = records.len();
    let total_spending_cents: i64 = records.iter().map(|r| r.total_spending_cents).sum();
    let avg_spending_cents = total_spending_cents / n as i64;

    let mut all_merchant_spend = BTreeMap::new();
    let mut all_category_spend = BTreeMap::new();
    let mut all_merchant_freq = BTreeMap::new();
    let mut multi_brand_count = 0usize;
    for record in &records {
        merge_maps(&mut all_merchant_spend, &record.merchant_spend);
        merge_maps(&mut all_category_spend, &record.category_spend);
        merge_maps(&mut all_merchant_freq, &record.merchant_freq);
        if record.merchant_freq.len() > 1 {
            multi_brand_count += 1;
        }
    }

    let concentration = |top: i64| {
        if total_spending_cents > 0 {
            round1(top as f64 / total_spending_cents as f64 * 100.0)
        } else {
            0.0
        }
    };
    let (top_merchant, top_merchant_spend) = top_by_value(&all_merchant_spend)
        .map(|(k, v)| (Some(k.clone()), v))
        .unwrap_or((None, 0));
    let (top_category, top_category_spend) = top_by_value(&all_category_spend)
        .map(|(k, v)| (Some(k.clone()), v))
        .unwrap_or((None, 0));

    let mut merchants_by_freq: Vec<(&String, i64)> = all_merchant_freq
        .iter()
        .map(|(k, v)| (k, *v))
        .collect();
    merchants_by_freq.sort_by_key(|(_, count)| std::cmp::Reverse(*count));
    let top_merchants_freq: Vec<serde_json::Value> = merchants_by_freq
        .iter()
        .take(5)
        .map(|(merchant, count)| serde_json::json!({ "merchant": merchant, "count": count }))
        .collect();

    let mut categories_by_spend: Vec<(&String, i64)> = all_category_spend
        .iter()
        .map(|(k, v)| (k, *v))
        .collect();
    categories_by_spend.sort_by_key(|(_, spend)| std::cmp::Reverse(*spend));
    let top_categories_spend: Vec<serde_json::Value> = categories_by_spend
        .iter()
        .take(5)
        .map(|(category, spend)| serde_json::json!({ "category": category, "spend_cents": spend }))
        .collect();

    // Churn risk: consumers whose last purchase is older than the threshold.
    // Velocity: purchases per 30 days over each consumer's active span.
    let churn_threshold = Utc::now() - Duration::days(CHURN_THRESHOLD_DAYS);
    let mut churn_count = 0usize;
    let mut velocities: Vec<f64> = Vec::new();
    for record in &records {
        if record
            .last_purchase_at
            .is_some_and(|last| last < churn_threshold)
        {
            churn_count += 1;
        }
        if let (Some(first), Some(last)) = (record.first_purchase_at, record.last_purchase_at) {
            if record.total_purchases > 0 {
                let days_active = (last - first).num_days().max(1);
                velocities.push(round2(
                    record.total_purchases as f64 / days_active as f64 * 30.0,
                ));
            }
        }
    }
    let churn_risk_pct = round1(churn_count as f64 / n as f64 * 100.0);
    let avg_velocity = if velocities.is_empty() {
        0.0
    } else {
        round2(velocities.iter().sum::<f64>() / velocities.len() as f64)
    };
    let mut velocity_buckets = BTreeMap::from([("low", 0u32), ("medium", 0u32), ("high", 0u32)]);
    for velocity in &velocities {
        let bucket = if *velocity < 1.0 {
            "low"
        } else if *velocity < 3.0 {
            "medium"
        } else {
            "high"
        };
        *velocity_buckets.entry(bucket).or_insert(0) += 1;
    }

    Json(serde_json::json!({
        "consumer_count": n,
        "executive": {
            "total_spending_cents": total_spending_cents,
            "avg_spending_cents": avg_spending_cents,
            "top_merchant": top_merchant,
            "merchant_concentration_pct": concentration(top_merchant_spend),
            "top_category": top_category,
            "category_concentration_pct": concentration(top_category_spend),
        },
        "behavioral": {
            "multi_brand_pct": round1(multi_brand_count as f64 / n as f64 * 100.0),
            "top_merchants_by_frequency": top_merchants_freq,
            "top_categories_by_spend": top_categories_spend,
        },
        "predictive": {
            "churn_risk_pct": churn_risk_pct,
            "avg_purchase_velocity_per_30d": avg_velocity,
            "velocity_buckets": velocity_buckets,
        },
    }))
    .into_response()
}
