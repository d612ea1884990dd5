//! Core domain model and adapter handoff contracts for WIST.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "wist-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    Consumer,
    Business,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub role: UserRole,
    pub mailbox_refresh_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(email: impl Into<String>, role: UserRole) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            role,
            mailbox_refresh_token: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_business(&self) -> bool {
        self.role == UserRole::Business
    }
}

/// Per-user scan state. `last_scan_at` stays `None` until the first
/// successful scan and is advanced to each scan's start time afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    pub user_id: Uuid,
    pub initial_window_days: i32,
    pub last_scan_at: Option<DateTime<Utc>>,
}

impl ScanCursor {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            initial_window_days: 90,
            last_scan_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown review status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemSource {
    Mailbox,
    Manual,
}

impl ItemSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mailbox => "mailbox",
            Self::Manual => "manual",
        }
    }
}

impl std::str::FromStr for ItemSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mailbox" => Ok(Self::Mailbox),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown item source: {other}")),
        }
    }
}

/// Category vocabulary used by the extraction contract. Queue rows store the
/// label as free text so manually entered categories survive round-trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Tops,
    Bottoms,
    Outerwear,
    Shoes,
    Accessories,
    Other,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tops => "Tops",
            Self::Bottoms => "Bottoms",
            Self::Outerwear => "Outerwear",
            Self::Shoes => "Shoes",
            Self::Accessories => "Accessories",
            Self::Other => "Other",
        }
    }
}

/// One candidate purchase awaiting human adjudication.
///
/// Rows are never deleted: rejected rows stay behind as analytics signal and
/// keep future scans from re-enqueueing the same purchase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewQueueItem {
    pub id: Uuid,
    pub user_id: Uuid,
    pub source: ItemSource,
    pub status: ReviewStatus,
    pub merchant: Option<String>,
    pub item_name: String,
    pub category: Option<String>,
    pub size: Option<String>,
    pub price_cents: Option<i64>,
    pub currency: String,
    pub purchased_at: Option<DateTime<Utc>>,
    pub email_message_id: Option<String>,
    pub email_thread_id: Option<String>,
    pub image_url: Option<String>,
    pub extracted_json: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ReviewQueueItem {
    /// Computed, never stored: the consumer UI blocks approval until a price
    /// exists, and `approve` enforces the same server-side.
    pub fn price_missing(&self) -> bool {
        self.price_cents.is_none()
    }
}

/// Case-folded, trimmed item name used for duplicate matching within an
/// email batch and in the storage-level uniqueness key.
pub fn normalized_item_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// A confirmed wardrobe entry, created exactly once per approved queue row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WardrobeItem {
    pub id: Uuid,
    pub user_id: Uuid,
    pub merchant: Option<String>,
    pub item_name: String,
    pub category: Option<String>,
    pub size: Option<String>,
    pub color: Option<String>,
    pub price_cents: i64,
    pub currency: String,
    pub purchased_at: Option<DateTime<Utc>>,
    pub wear_count: i64,
    pub source: ItemSource,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Caller-supplied edits overlaid on a queue row at approval time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApproveOverrides {
    pub item_name: Option<String>,
    pub price_cents: Option<i64>,
    pub category: Option<String>,
}

/// Overlays `overrides` on a pending queue row and builds the wardrobe entry
/// the approval will create. Returns `None` when no price can be resolved
/// from either side; approval must not proceed in that case.
pub fn resolve_approval(item: &ReviewQueueItem, overrides: &ApproveOverrides) -> Option<WardrobeItem> {
    let price_cents = overrides.price_cents.or(item.price_cents)?;
    let item_name = overrides
        .item_name
        .clone()
        .unwrap_or_else(|| item.item_name.clone());
    let category = overrides
        .category
        .clone()
        .or_else(|| item.category.clone())
        .or_else(|| Some(Category::Other.as_str().to_string()));

    Some(WardrobeItem {
        id: Uuid::new_v4(),
        user_id: item.user_id,
        merchant: item.merchant.clone(),
        item_name,
        category,
        size: item.size.clone(),
        color: None,
        price_cents,
        currency: item.currency.clone(),
        purchased_at: item.purchased_at,
        wear_count: 0,
        source: item.source,
        image_url: item.image_url.clone(),
        created_at: Utc::now(),
    })
}

/// One fetched mailbox message with its side-channel hints, the handoff
/// contract from the ingestion gateway into the scan pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedEmail {
    pub message_id: String,
    pub thread_id: String,
    pub subject: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub plain_text: String,
    #[serde(default)]
    pub html_text: String,
    #[serde(default)]
    pub prices_found: Vec<f64>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub date_header: Option<String>,
}

/// One candidate item as reported by the extraction service. Field defaults
/// keep a sloppy model response from failing the whole email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedItem {
    pub item_name: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub purchased_at: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub category_guess: Option<Category>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub is_clothing: bool,
}

/// Best-effort structured result for one email.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
    #[serde(default)]
    pub merchant: Option<String>,
    #[serde(default)]
    pub items: Vec<ExtractedItem>,
}

/// Per-user materialized rollup over non-rejected queue rows. Exactly one
/// row per user, fully replaced on every recompute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsRecord {
    pub user_id: Uuid,
    pub total_spending_cents: i64,
    pub total_purchases: i64,
    pub average_purchase_cents: i64,
    pub frequent_merchant: Option<String>,
    pub frequent_merchant_count: Option<i64>,
    pub merchant_freq: std::collections::BTreeMap<String, i64>,
    pub most_spent_merchant: Option<String>,
    pub most_spent_merchant_cents: Option<i64>,
    pub merchant_spend: std::collections::BTreeMap<String, i64>,
    pub frequent_category: Option<String>,
    pub frequent_category_count: Option<i64>,
    pub category_freq: std::collections::BTreeMap<String, i64>,
    pub most_spent_category: Option<String>,
    pub most_spent_category_cents: Option<i64>,
    pub category_spend: std::collections::BTreeMap<String, i64>,
    pub first_purchase_at: Option<DateTime<Utc>>,
    pub last_purchase_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_item(price_cents: Option<i64>) -> ReviewQueueItem {
        ReviewQueueItem {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            source: ItemSource::Mailbox,
            status: ReviewStatus::Pending,
            merchant: Some("Quince".to_string()),
            item_name: "Linen Shirt".to_string(),
            category: None,
            size: Some("M".to_string()),
            price_cents,
            currency: "USD".to_string(),
            purchased_at: None,
            email_message_id: Some("msg-1".to_string()),
            email_thread_id: Some("thr-1".to_string()),
            image_url: None,
            extracted_json: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn approval_blocked_without_any_price() {
        let item = pending_item(None);
        assert!(resolve_approval(&item, &ApproveOverrides::default()).is_none());
    }

    #[test]
    fn override_price_unblocks_approval() {
        let item = pending_item(None);
        let overrides = ApproveOverrides {
            price_cents: Some(4999),
            ..Default::default()
        };
        let wardrobe = resolve_approval(&item, &overrides).unwrap();
        assert_eq!(wardrobe.price_cents, 4999);
        assert_eq!(wardrobe.wear_count, 0);
    }

    #[test]
    fn overrides_win_over_stored_values() {
        let item = pending_item(Some(1200));
        let overrides = ApproveOverrides {
            item_name: Some("Heavy Linen Shirt".to_string()),
            price_cents: Some(1500),
            category: Some("Tops".to_string()),
        };
        let wardrobe = resolve_approval(&item, &overrides).unwrap();
        assert_eq!(wardrobe.item_name, "Heavy Linen Shirt");
        assert_eq!(wardrobe.price_cents, 1500);
        assert_eq!(wardrobe.category.as_deref(), Some("Tops"));
    }

    #[test]
    fn missing_category_defaults_to_other() {
        let item = pending_item(Some(1200));
        let wardrobe = resolve_approval(&item, &ApproveOverrides::default()).unwrap();
        assert_eq!(wardrobe.category.as_deref(), Some("Other"));
    }

    #[test]
    fn name_normalization_folds_case_and_whitespace() {
        assert_eq!(normalized_item_name("  Wool Coat "), "wool coat");
        assert_eq!(
            normalized_item_name("WOOL COAT"),
            normalized_item_name("wool coat")
        );
    }
}
