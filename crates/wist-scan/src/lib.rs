//! Scan pipeline orchestration: candidate filtering, deduplication, queue
//! insertion, and the rolling per-user analytics recompute.
//!
//! One [`ScanPipeline::run_scan`] call covers one user and one time window:
//! resolve the window from the stored cursor, fetch candidate emails, run
//! each through extraction → filter → dedup → insert, then recompute the
//! analytics rollup and advance the cursor. Same-user runs are serialized by
//! a per-user lock; distinct users do not contend.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use wist_core::{
    normalized_item_name, AnalyticsRecord, Category, ExtractionResult, FetchedEmail, ItemSource,
    ReviewQueueItem, ReviewStatus, User,
};
use wist_extract::{ExtractionService, MailboxProvider};
use wist_storage::{ReviewStore, StoreError};

pub const CRATE_NAME: &str = "wist-scan";

/// Minimum extraction confidence to enqueue a candidate, boundary inclusive.
/// Trades recall for queue cleanliness; tuned, not derived.
pub const CONFIDENCE_THRESHOLD: f64 = 0.65;

pub const ALLOWED_INITIAL_WINDOWS: [i32; 3] = [30, 90, 180];

const UNKNOWN_MERCHANT: &str = "Unknown";

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("initial_scan_days must be one of 30, 90, or 180 (got {0})")]
    InvalidWindow(i32),
    #[error("run an initial scan first")]
    PreconditionFailed,
    #[error("mailbox fetch failed: {0}")]
    Mailbox(#[source] wist_extract::ExtractError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Initial { window_days: i32 },
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub queued_count: u32,
    pub scanned_messages: u32,
    pub errors: u32,
    pub skipped_duplicates: u32,
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub max_results: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self { max_results: 50 }
    }
}

impl ScanConfig {
    pub fn from_env() -> Self {
        Self {
            max_results: std::env::var("WIST_SCAN_MAX_RESULTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),
        }
    }
}

// ---------------------------------------------------------------------------
// Item filter & normalizer
// ---------------------------------------------------------------------------

/// Decimal price to integer minor units, rounding half to even.
pub fn price_to_cents(price: f64) -> i64 {
    (price * 100.0).round_ties_even() as i64
}

/// Defensive ISO-8601 parse: RFC 3339, bare datetime, or bare date.
/// Anything else degrades to `None` rather than failing the email.
pub fn parse_purchased_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(Utc.from_utc_datetime(&ndt));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

/// One gate-surviving candidate, normalized and ready for dedup + insert.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRow {
    pub item_name: String,
    pub name_key: String,
    pub category: Option<String>,
    pub size: Option<String>,
    pub price_cents: Option<i64>,
    pub purchased_at: Option<DateTime<Utc>>,
    pub image_url: Option<String>,
}

/// Pure filter + normalizer. Applies the clothing and confidence gates,
/// converts prices and dates, and assigns side-channel image hints in
/// encounter order to surviving candidates without one, each hint used at
/// most once per email.
pub fn normalize_candidates(
    extraction: &ExtractionResult,
    image_hints: &[String],
) -> Vec<CandidateRow> {
    let mut hint_idx = 0usize;
    let mut out = Vec::new();

    for item in &extraction.items {
        if !item.is_clothing {
            continue;
        }
        if item.confidence < CONFIDENCE_THRESHOLD {
            continue;
        }

        let image_url = match &item.image_url {
            Some(url) => Some(url.clone()),
            None => {
                let hint = image_hints.get(hint_idx).cloned();
                if hint.is_some() {
                    hint_idx += 1;
                }
                hint
            }
        };

        out.push(CandidateRow {
            name_key: normalized_item_name(&item.item_name),
            item_name: item.item_name.clone(),
            category: item.category_guess.map(|c| c.as_str().to_string()),
            size: item.size.clone(),
            price_cents: item.price.map(price_to_cents),
            purchased_at: item
                .purchased_at
                .as_deref()
                .and_then(parse_purchased_at),
            image_url,
        });
    }

    out
}

// ---------------------------------------------------------------------------
// Scan orchestrator + deduplication engine
// ---------------------------------------------------------------------------

pub struct ScanPipeline {
    store: Arc<dyn ReviewStore>,
    mailbox: Arc<dyn MailboxProvider>,
    extractor: Arc<dyn ExtractionService>,
    config: ScanConfig,
    scan_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ScanPipeline {
    pub fn new(
        store: Arc<dyn ReviewStore>,
        mailbox: Arc<dyn MailboxProvider>,
        extractor: Arc<dyn ExtractionService>,
        config: ScanConfig,
    ) -> Self {
        Self {
            store,
            mailbox,
            extractor,
            config,
            scan_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ReviewStore> {
        &self.store
    }

    async fn scan_lock(&self, user_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.scan_locks.lock().await;
        locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs one scan for one user. Concurrent same-user invocations queue
    /// behind the per-user lock; the email-level dedup check and the cursor
    /// update are not safe to race against themselves.
    pub async fn run_scan(&self, user: &User, mode: ScanMode) -> Result<ScanSummary, ScanError> {
        let lock = self.scan_lock(user.id).await;
        let _guard = lock.lock().await;

        // The cursor records the scan's start time, not its completion time:
        // mail landing mid-scan stays inside the next run's window.
        let started_at = Utc::now();

        let (after, window_days) = match mode {
            ScanMode::Initial { window_days } => {
                if !ALLOWED_INITIAL_WINDOWS.contains(&window_days) {
                    return Err(ScanError::InvalidWindow(window_days));
                }
                (started_at - Duration::days(i64::from(window_days)), Some(window_days))
            }
            ScanMode::Incremental => {
                let last_scan_at = self
                    .store
                    .get_cursor(user.id)
                    .await?
                    .and_then(|cursor| cursor.last_scan_at)
                    .ok_or(ScanError::PreconditionFailed)?;
                (last_scan_at, None)
            }
        };

        let emails = self
            .mailbox
            .fetch_since(user, after, self.config.max_results)
            .await
            .map_err(ScanError::Mailbox)?;
        info!(user_id = %user.id, after = %after, count = emails.len(), "fetched candidate emails");

        let summary = self.process_emails(user, &emails).await?;

        // Queue rows are already durably committed; analytics staleness must
        // not turn a completed scan into a failure.
        if let Err(err) = recompute_analytics(self.store.as_ref(), user.id).await {
            warn!(user_id = %user.id, error = %err, "analytics recompute failed after scan");
        }

        self.store
            .upsert_cursor(user.id, window_days, started_at)
            .await?;

        info!(
            user_id = %user.id,
            queued = summary.queued_count,
            errors = summary.errors,
            duplicates = summary.skipped_duplicates,
            "scan complete"
        );
        Ok(summary)
    }

    async fn process_emails(
        &self,
        user: &User,
        emails: &[FetchedEmail],
    ) -> Result<ScanSummary, ScanError> {
        let mut queued = 0u32;
        let mut errors = 0u32;
        let mut skipped = 0u32;

        for email in emails {
            // Email-level short-circuit: anything already queued for this
            // message id means the email was fully handled by an earlier
            // scan. Bounds extraction calls to once per email ever.
            if self.store.message_seen(user.id, &email.message_id).await? {
                skipped += 1;
                continue;
            }

            let extraction = match self.extractor.extract(email).await {
                Ok(extraction) => extraction,
                Err(err) => {
                    warn!(message_id = %email.message_id, error = %err, "extraction failed");
                    errors += 1;
                    continue;
                }
            };
            let extracted_json = serde_json::to_value(&extraction).ok();

            // Item-level dedup within the email batch. First seen wins; a
            // name only enters the set once its insert has committed, and a
            // storage-level collision is a counted skip, never a failure.
            let mut seen_names: HashSet<String> = HashSet::new();

            for candidate in normalize_candidates(&extraction, &email.image_urls) {
                if seen_names.contains(&candidate.name_key) {
                    skipped += 1;
                    continue;
                }

                let item = ReviewQueueItem {
                    id: Uuid::new_v4(),
                    user_id: user.id,
                    source: ItemSource::Mailbox,
                    status: ReviewStatus::Pending,
                    merchant: extraction.merchant.clone(),
                    item_name: candidate.item_name,
                    category: candidate.category,
                    size: candidate.size,
                    price_cents: candidate.price_cents,
                    currency: "USD".to_string(),
                    purchased_at: candidate.purchased_at,
                    email_message_id: Some(email.message_id.clone()),
                    email_thread_id: Some(email.thread_id.clone()),
                    image_url: candidate.image_url,
                    extracted_json: extracted_json.clone(),
                    created_at: Utc::now(),
                };

                match self.store.insert_pending(&item).await {
                    Ok(()) => {
                        queued += 1;
                        seen_names.insert(candidate.name_key);
                    }
                    Err(StoreError::ConstraintViolation) => {
                        debug!(message_id = %email.message_id, "duplicate insert skipped");
                        skipped += 1;
                    }
                    Err(other) => return Err(other.into()),
                }
            }
        }

        Ok(ScanSummary {
            queued_count: queued,
            scanned_messages: emails.len() as u32,
            errors,
            skipped_duplicates: skipped,
        })
    }
}

// ---------------------------------------------------------------------------
// Analytics aggregator
// ---------------------------------------------------------------------------

fn top_entry(map: &IndexMap<String, i64>) -> Option<(String, i64)> {
    let mut best: Option<(&String, i64)> = None;
    for (key, value) in map {
        // Strict comparison: ties keep the first-encountered entry, which is
        // insertion order here. Observable and intentionally so.
        if best.map_or(true, |(_, best_value)| *value > best_value) {
            best = Some((key, *value));
        }
    }
    best.map(|(key, value)| (key.clone(), value))
}

fn to_btree(map: IndexMap<String, i64>) -> BTreeMap<String, i64> {
    map.into_iter().collect()
}

/// Full recompute of the per-user rollup from every non-rejected queue row.
/// Zero rows is a no-op: an aggregate over nothing is not meaningful, so no
/// zero-row record is ever written. Otherwise the stored record is replaced
/// wholesale; recomputation is idempotent and reads nothing it writes.
pub async fn recompute_analytics(
    store: &dyn ReviewStore,
    user_id: Uuid,
) -> Result<(), StoreError> {
    let items = store.list_non_rejected(user_id).await?;
    if items.is_empty() {
        return Ok(());
    }

    let mut merchant_freq: IndexMap<String, i64> = IndexMap::new();
    let mut merchant_spend: IndexMap<String, i64> = IndexMap::new();
    let mut category_freq: IndexMap<String, i64> = IndexMap::new();
    let mut category_spend: IndexMap<String, i64> = IndexMap::new();
    let mut total_cents = 0i64;
    let mut count = 0i64;
    let mut purchase_dates: Vec<DateTime<Utc>> = Vec::new();

    for item in &items {
        let merchant = item
            .merchant
            .clone()
            .unwrap_or_else(|| UNKNOWN_MERCHANT.to_string());
        let category = item
            .category
            .clone()
            .unwrap_or_else(|| Category::Other.as_str().to_string());
        // An unpriced item still counts as a purchase; it just adds no spend.
        let cents = item.price_cents.unwrap_or(0);

        *merchant_freq.entry(merchant.clone()).or_insert(0) += 1;
        *merchant_spend.entry(merchant).or_insert(0) += cents;
        *category_freq.entry(category.clone()).or_insert(0) += 1;
        *category_spend.entry(category).or_insert(0) += cents;

        total_cents += cents;
        count += 1;

        if let Some(purchased_at) = item.purchased_at {
            purchase_dates.push(purchased_at);
        }
    }

    let (frequent_merchant, frequent_merchant_count) = top_entry(&merchant_freq).unzip();
    let (most_spent_merchant, most_spent_merchant_cents) = top_entry(&merchant_spend).unzip();
    let (frequent_category, frequent_category_count) = top_entry(&category_freq).unzip();
    let (most_spent_category, most_spent_category_cents) = top_entry(&category_spend).unzip();

    let record = AnalyticsRecord {
        user_id,
        total_spending_cents: total_cents,
        total_purchases: count,
        average_purchase_cents: total_cents / count,
        frequent_merchant,
        frequent_merchant_count,
        merchant_freq: to_btree(merchant_freq),
        most_spent_merchant,
        most_spent_merchant_cents,
        merchant_spend: to_btree(merchant_spend),
        frequent_category,
        frequent_category_count,
        category_freq: to_btree(category_freq),
        most_spent_category,
        most_spent_category_cents,
        category_spend: to_btree(category_spend),
        first_purchase_at: purchase_dates.iter().min().copied(),
        last_purchase_at: purchase_dates.iter().max().copied(),
        updated_at: Utc::now(),
    };

    store.upsert_analytics(&record).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use wist_core::{ApproveOverrides, ExtractedItem, UserRole};
    use wist_extract::{FixtureMailbox, ScriptedExtractor};
    use wist_storage::MemoryStore;

    fn email(id: &str) -> FetchedEmail {
        FetchedEmail {
            message_id: id.to_string(),
            thread_id: format!("thr-{id}"),
            subject: format!("Order {id}"),
            snippet: String::new(),
            plain_text: "order body".to_string(),
            html_text: String::new(),
            prices_found: vec![],
            image_urls: vec![],
            date_header: None,
        }
    }

    fn clothing(name: &str, price: Option<f64>, confidence: f64) -> ExtractedItem {
        ExtractedItem {
            item_name: name.to_string(),
            price,
            purchased_at: None,
            image_url: None,
            category_guess: Some(Category::Tops),
            size: None,
            confidence,
            is_clothing: true,
        }
    }

    fn extraction(merchant: &str, items: Vec<ExtractedItem>) -> ExtractionResult {
        ExtractionResult {
            merchant: Some(merchant.to_string()),
            items,
        }
    }

    async fn new_user(store: &MemoryStore) -> User {
        let user = User::new(format!("{}@example.com", Uuid::new_v4()), UserRole::Consumer);
        store.create_user(&user).await.unwrap();
        user
    }

    fn pipeline(
        store: Arc<MemoryStore>,
        emails: Vec<FetchedEmail>,
        extractor: ScriptedExtractor,
    ) -> ScanPipeline {
        ScanPipeline::new(
            store,
            Arc::new(FixtureMailbox::new(emails)),
            Arc::new(extractor),
            ScanConfig::default(),
        )
    }

    #[test]
    fn price_conversion_rounds_half_to_even() {
        assert_eq!(price_to_cents(49.99), 4999);
        assert_eq!(price_to_cents(0.125), 12);
        assert_eq!(price_to_cents(0.375), 38);
        assert_eq!(price_to_cents(100.0), 10000);
    }

    #[test]
    fn dates_parse_defensively() {
        assert!(parse_purchased_at("2026-07-15").is_some());
        assert!(parse_purchased_at("2026-07-15T10:30:00").is_some());
        assert!(parse_purchased_at("2026-07-15T10:30:00Z").is_some());
        assert!(parse_purchased_at("last Tuesday").is_none());
        assert!(parse_purchased_at("").is_none());
    }

    #[test]
    fn confidence_gate_is_boundary_inclusive() {
        let extraction = extraction(
            "Quince",
            vec![
                clothing("Borderline Shirt", None, 0.65),
                clothing("Doubtful Shirt", None, 0.64),
            ],
        );
        let candidates = normalize_candidates(&extraction, &[]);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].item_name, "Borderline Shirt");
    }

    #[test]
    fn non_clothing_candidates_are_dropped() {
        let mut gift_card = clothing("Gift Card", Some(50.0), 0.99);
        gift_card.is_clothing = false;
        let extraction = extraction("Quince", vec![gift_card, clothing("Shirt", None, 0.9)]);
        let candidates = normalize_candidates(&extraction, &[]);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].item_name, "Shirt");
    }

    #[test]
    fn missing_price_stays_unknown_not_zero() {
        let extraction = extraction(
            "Quince",
            vec![clothing("Shirt", Some(49.99), 0.9), clothing("Scarf", None, 0.9)],
        );
        let candidates = normalize_candidates(&extraction, &[]);
        assert_eq!(candidates[0].price_cents, Some(4999));
        assert_eq!(candidates[1].price_cents, None);
    }

    #[test]
    fn image_hints_assigned_in_order_and_consumed_once() {
        let mut with_image = clothing("Coat", None, 0.9);
        with_image.image_url = Some("https://cdn.example.com/own.jpg".to_string());
        let extraction = extraction(
            "Quince",
            vec![
                clothing("Shirt", None, 0.9),
                with_image,
                clothing("Scarf", None, 0.9),
                clothing("Belt", None, 0.9),
            ],
        );
        let hints = vec![
            "https://cdn.example.com/h1.jpg".to_string(),
            "https://cdn.example.com/h2.jpg".to_string(),
        ];
        let candidates = normalize_candidates(&extraction, &hints);
        assert_eq!(candidates[0].image_url.as_deref(), Some("https://cdn.example.com/h1.jpg"));
        assert_eq!(candidates[1].image_url.as_deref(), Some("https://cdn.example.com/own.jpg"));
        assert_eq!(candidates[2].image_url.as_deref(), Some("https://cdn.example.com/h2.jpg"));
        assert_eq!(candidates[3].image_url, None);
    }

    #[tokio::test]
    async fn initial_scan_queues_items_and_sets_cursor() {
        let store = Arc::new(MemoryStore::new());
        let user = new_user(&store).await;
        let extractor = ScriptedExtractor::new()
            .with_result("m1", extraction("Quince", vec![clothing("Shirt", Some(49.99), 0.9)]))
            .with_result("m2", extraction("Everlane", vec![clothing("Jeans", Some(79.0), 0.9)]));
        let pipeline = pipeline(store.clone(), vec![email("m1"), email("m2")], extractor);

        let before = Utc::now();
        let summary = pipeline
            .run_scan(&user, ScanMode::Initial { window_days: 90 })
            .await
            .unwrap();
        assert_eq!(
            summary,
            ScanSummary {
                queued_count: 2,
                scanned_messages: 2,
                errors: 0,
                skipped_duplicates: 0
            }
        );

        let cursor = store.get_cursor(user.id).await.unwrap().unwrap();
        assert_eq!(cursor.initial_window_days, 90);
        let last_scan_at = cursor.last_scan_at.unwrap();
        assert!(last_scan_at >= before && last_scan_at <= Utc::now());

        let pending = store.list_pending(user.id).await.unwrap();
        assert_eq!(pending.len(), 2);
        let shirt = pending.iter().find(|i| i.item_name == "Shirt").unwrap();
        assert_eq!(shirt.price_cents, Some(4999));
        assert_eq!(shirt.merchant.as_deref(), Some("Quince"));
        assert_eq!(shirt.email_message_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn rescan_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let user = new_user(&store).await;
        let extractor = ScriptedExtractor::new()
            .with_result("m1", extraction("Quince", vec![clothing("Shirt", Some(49.99), 0.9)]))
            .with_result("m2", extraction("Everlane", vec![clothing("Jeans", Some(79.0), 0.9)]));
        let pipeline = pipeline(store.clone(), vec![email("m1"), email("m2")], extractor);

        let first = pipeline
            .run_scan(&user, ScanMode::Initial { window_days: 90 })
            .await
            .unwrap();
        let second = pipeline
            .run_scan(&user, ScanMode::Initial { window_days: 90 })
            .await
            .unwrap();

        assert_eq!(second.queued_count, 0);
        assert_eq!(second.skipped_duplicates, first.queued_count);
        assert_eq!(store.list_pending(user.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_names_within_one_email_collapse_to_one_row() {
        let store = Arc::new(MemoryStore::new());
        let user = new_user(&store).await;
        let extractor = ScriptedExtractor::new().with_result(
            "m1",
            extraction(
                "Quince",
                vec![
                    clothing("Linen Shirt", Some(49.99), 0.9),
                    clothing("  LINEN SHIRT ", None, 0.8),
                ],
            ),
        );
        let pipeline = pipeline(store.clone(), vec![email("m1")], extractor);

        let summary = pipeline
            .run_scan(&user, ScanMode::Initial { window_days: 30 })
            .await
            .unwrap();
        assert_eq!(summary.queued_count, 1);
        assert_eq!(summary.skipped_duplicates, 1);

        let pending = store.list_pending(user.id).await.unwrap();
        assert_eq!(pending.len(), 1);
        // First seen wins: the priced candidate came first and is kept.
        assert_eq!(pending[0].price_cents, Some(4999));
    }

    #[tokio::test]
    async fn extraction_failure_is_counted_and_does_not_abort() {
        let store = Arc::new(MemoryStore::new());
        let user = new_user(&store).await;
        let extractor = ScriptedExtractor::new()
            .with_failure("m1")
            .with_result("m2", extraction("Everlane", vec![clothing("Jeans", Some(79.0), 0.9)]));
        let pipeline = pipeline(store.clone(), vec![email("m1"), email("m2")], extractor);

        let summary = pipeline
            .run_scan(&user, ScanMode::Initial { window_days: 30 })
            .await
            .unwrap();
        assert_eq!(
            summary,
            ScanSummary {
                queued_count: 1,
                scanned_messages: 2,
                errors: 1,
                skipped_duplicates: 0
            }
        );
    }

    #[tokio::test]
    async fn failed_email_is_retried_on_the_next_scan() {
        let store = Arc::new(MemoryStore::new());
        let user = new_user(&store).await;

        let failing = ScriptedExtractor::new().with_failure("m1");
        let first = pipeline(store.clone(), vec![email("m1")], failing);
        first
            .run_scan(&user, ScanMode::Initial { window_days: 30 })
            .await
            .unwrap();

        // Nothing was queued, so the email is not short-circuited next time.
        let recovering = ScriptedExtractor::new()
            .with_result("m1", extraction("Quince", vec![clothing("Shirt", Some(49.99), 0.9)]));
        let second = pipeline(store.clone(), vec![email("m1")], recovering);
        let summary = second
            .run_scan(&user, ScanMode::Initial { window_days: 30 })
            .await
            .unwrap();
        assert_eq!(summary.queued_count, 1);
    }

    #[tokio::test]
    async fn incremental_scan_requires_prior_initial_scan() {
        let store = Arc::new(MemoryStore::new());
        let user = new_user(&store).await;
        let pipeline = pipeline(store.clone(), vec![], ScriptedExtractor::new());

        let err = pipeline
            .run_scan(&user, ScanMode::Incremental)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::PreconditionFailed));
    }

    #[tokio::test]
    async fn invalid_window_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let user = new_user(&store).await;
        let pipeline = pipeline(store.clone(), vec![], ScriptedExtractor::new());

        let err = pipeline
            .run_scan(&user, ScanMode::Initial { window_days: 45 })
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidWindow(45)));
    }

    #[tokio::test]
    async fn incremental_scan_with_no_new_mail_returns_zeros() {
        let store = Arc::new(MemoryStore::new());
        let user = new_user(&store).await;
        let extractor = ScriptedExtractor::new()
            .with_result("m1", extraction("Quince", vec![clothing("Shirt", Some(49.99), 0.9)]));
        let initial = pipeline(store.clone(), vec![email("m1")], extractor);
        initial
            .run_scan(&user, ScanMode::Initial { window_days: 30 })
            .await
            .unwrap();

        let incremental = pipeline(store.clone(), vec![], ScriptedExtractor::new());
        let summary = incremental
            .run_scan(&user, ScanMode::Incremental)
            .await
            .unwrap();
        assert_eq!(
            summary,
            ScanSummary {
                queued_count: 0,
                scanned_messages: 0,
                errors: 0,
                skipped_duplicates: 0
            }
        );

        let cursor = store.get_cursor(user.id).await.unwrap().unwrap();
        assert_eq!(cursor.initial_window_days, 30);
    }

    #[tokio::test]
    async fn rejected_rows_still_short_circuit_their_email() {
        let store = Arc::new(MemoryStore::new());
        let user = new_user(&store).await;
        let extractor = ScriptedExtractor::new()
            .with_result("m1", extraction("Quince", vec![clothing("Shirt", Some(49.99), 0.9)]));
        let pipeline = pipeline(store.clone(), vec![email("m1")], extractor);
        pipeline
            .run_scan(&user, ScanMode::Initial { window_days: 30 })
            .await
            .unwrap();

        let pending = store.list_pending(user.id).await.unwrap();
        store.reject(user.id, pending[0].id).await.unwrap();

        let summary = pipeline
            .run_scan(&user, ScanMode::Initial { window_days: 30 })
            .await
            .unwrap();
        assert_eq!(summary.queued_count, 0);
        assert_eq!(summary.skipped_duplicates, 1);
    }

    fn dated(day: u32) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2026, 6, day, 12, 0, 0).single().unwrap())
    }

    async fn seed_approved(
        store: &MemoryStore,
        user: &User,
        message_id: &str,
        name: &str,
        merchant: &str,
        category: &str,
        price_cents: i64,
        purchased_at: Option<DateTime<Utc>>,
    ) {
        let item = ReviewQueueItem {
            id: Uuid::new_v4(),
            user_id: user.id,
            source: ItemSource::Mailbox,
            status: ReviewStatus::Pending,
            merchant: Some(merchant.to_string()),
            item_name: name.to_string(),
            category: Some(category.to_string()),
            size: None,
            price_cents: Some(price_cents),
            currency: "USD".to_string(),
            purchased_at,
            email_message_id: Some(message_id.to_string()),
            email_thread_id: Some(format!("thr-{message_id}")),
            image_url: None,
            extracted_json: None,
            created_at: Utc::now(),
        };
        store.insert_pending(&item).await.unwrap();
        store
            .approve(user.id, item.id, &ApproveOverrides::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn analytics_rollup_matches_the_three_item_scenario() {
        let store = MemoryStore::new();
        let user = User::new("rollup@example.com", UserRole::Consumer);
        store.create_user(&user).await.unwrap();

        seed_approved(&store, &user, "m1", "Tee", "MerchantA", "Tops", 5000, dated(1)).await;
        seed_approved(&store, &user, "m2", "Jeans", "MerchantA", "Bottoms", 3000, dated(15)).await;
        seed_approved(&store, &user, "m3", "Blouse", "MerchantB", "Tops", 2000, dated(20)).await;

        recompute_analytics(&store, user.id).await.unwrap();
        let record = store.get_analytics(user.id).await.unwrap().unwrap();

        assert_eq!(record.total_spending_cents, 10000);
        assert_eq!(record.total_purchases, 3);
        assert_eq!(record.average_purchase_cents, 3333);
        assert_eq!(record.frequent_merchant.as_deref(), Some("MerchantA"));
        assert_eq!(record.frequent_merchant_count, Some(2));
        assert_eq!(record.most_spent_merchant.as_deref(), Some("MerchantA"));
        assert_eq!(record.most_spent_merchant_cents, Some(8000));
        assert_eq!(record.frequent_category.as_deref(), Some("Tops"));
        assert_eq!(record.frequent_category_count, Some(2));
        assert_eq!(record.most_spent_category.as_deref(), Some("Tops"));
        assert_eq!(record.most_spent_category_cents, Some(7000));
        assert_eq!(record.first_purchase_at, dated(1));
        assert_eq!(record.last_purchase_at, dated(20));
        assert_eq!(record.merchant_spend.get("MerchantB"), Some(&2000));
    }

    #[tokio::test]
    async fn analytics_skips_recompute_when_no_rows_exist() {
        let store = MemoryStore::new();
        let user = User::new("empty@example.com", UserRole::Consumer);
        store.create_user(&user).await.unwrap();

        recompute_analytics(&store, user.id).await.unwrap();
        assert!(store.get_analytics(user.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn approving_a_pending_row_never_double_counts_it() {
        let store = MemoryStore::new();
        let user = User::new("single@example.com", UserRole::Consumer);
        store.create_user(&user).await.unwrap();

        let item = ReviewQueueItem {
            id: Uuid::new_v4(),
            user_id: user.id,
            source: ItemSource::Mailbox,
            status: ReviewStatus::Pending,
            merchant: Some("Quince".to_string()),
            item_name: "Shirt".to_string(),
            category: Some("Tops".to_string()),
            size: None,
            price_cents: None,
            currency: "USD".to_string(),
            purchased_at: None,
            email_message_id: Some("m1".to_string()),
            email_thread_id: None,
            image_url: None,
            extracted_json: None,
            created_at: Utc::now(),
        };
        store.insert_pending(&item).await.unwrap();

        // Pending and unpriced: one purchase, zero spend.
        recompute_analytics(&store, user.id).await.unwrap();
        let record = store.get_analytics(user.id).await.unwrap().unwrap();
        assert_eq!(record.total_purchases, 1);
        assert_eq!(record.total_spending_cents, 0);

        // Approving with a resolved price flips the same row; still one purchase.
        let overrides = ApproveOverrides {
            price_cents: Some(5000),
            ..Default::default()
        };
        store.approve(user.id, item.id, &overrides).await.unwrap();
        recompute_analytics(&store, user.id).await.unwrap();
        let record = store.get_analytics(user.id).await.unwrap().unwrap();
        assert_eq!(record.total_purchases, 1);
        // Spend follows the queue row, which kept its original null price.
        assert_eq!(record.total_spending_cents, 0);
    }

    #[tokio::test]
    async fn analytics_ties_keep_the_first_encountered_entry() {
        let store = MemoryStore::new();
        let user = User::new("tie@example.com", UserRole::Consumer);
        store.create_user(&user).await.unwrap();

        seed_approved(&store, &user, "m1", "Tee", "Zeta", "Tops", 1000, None).await;
        seed_approved(&store, &user, "m2", "Jeans", "Alpha", "Bottoms", 1000, None).await;

        recompute_analytics(&store, user.id).await.unwrap();
        let record = store.get_analytics(user.id).await.unwrap().unwrap();
        // Both merchants tie on count and spend; insertion order wins, not
        // alphabetical order.
        assert_eq!(record.frequent_merchant.as_deref(), Some("Zeta"));
        assert_eq!(record.most_spent_merchant.as_deref(), Some("Zeta"));
    }

    #[tokio::test]
    async fn rejected_rows_are_excluded_from_analytics() {
        let store = MemoryStore::new();
        let user = User::new("reject@example.com", UserRole::Consumer);
        store.create_user(&user).await.unwrap();

        seed_approved(&store, &user, "m1", "Tee", "Quince", "Tops", 5000, None).await;

        let rejected = ReviewQueueItem {
            id: Uuid::new_v4(),
            user_id: user.id,
            source: ItemSource::Mailbox,
            status: ReviewStatus::Pending,
            merchant: Some("Quince".to_string()),
            item_name: "Scarf".to_string(),
            category: Some("Accessories".to_string()),
            size: None,
            price_cents: Some(2500),
            currency: "USD".to_string(),
            purchased_at: None,
            email_message_id: Some("m2".to_string()),
            email_thread_id: None,
            image_url: None,
            extracted_json: None,
            created_at: Utc::now(),
        };
        store.insert_pending(&rejected).await.unwrap();
        store.reject(user.id, rejected.id).await.unwrap();

        recompute_analytics(&store, user.id).await.unwrap();
        let record = store.get_analytics(user.id).await.unwrap().unwrap();
        assert_eq!(record.total_purchases, 1);
        assert_eq!(record.total_spending_cents, 5000);
    }
}
