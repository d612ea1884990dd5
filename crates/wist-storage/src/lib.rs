//! Review queue, cursor, and analytics persistence for WIST.
//!
//! The scan pipeline and the web surface talk to storage exclusively through
//! [`ReviewStore`]. Two implementations ship: [`PgStore`] over sqlx/Postgres
//! and [`MemoryStore`], which enforces the same uniqueness contract without a
//! database and backs the test suites and fixture-driven demo runs.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use wist_core::{
    normalized_item_name, resolve_approval, AnalyticsRecord, ApproveOverrides, ItemSource,
    ReviewQueueItem, ReviewStatus, ScanCursor, User, UserRole, WardrobeItem,
};

pub const CRATE_NAME: &str = "wist-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// No row matched the scoped lookup.
    #[error("not found")]
    NotFound,
    /// The row exists but already left the pending state.
    #[error("item is already {0}")]
    Conflict(ReviewStatus),
    /// Storage-level uniqueness key collision. Callers in the scan pipeline
    /// convert this to a counted skip, never a failure.
    #[error("duplicate review item")]
    ConstraintViolation,
    /// Approval attempted with no resolvable price.
    #[error("price_cents is required; pass edited_price_cents")]
    PriceRequired,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Persistence seam for the whole pipeline. All operations are scoped to a
/// single user's rows; no cross-user mutation exists.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn create_user(&self, user: &User) -> Result<(), StoreError>;
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn get_cursor(&self, user_id: Uuid) -> Result<Option<ScanCursor>, StoreError>;
    /// Creates or updates the cursor. `window_days` is only written when
    /// `Some` (initial scans); `last_scan_at` is written unconditionally.
    async fn upsert_cursor(
        &self,
        user_id: Uuid,
        window_days: Option<i32>,
        last_scan_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// True when any queue row (in any status) exists for this message id.
    async fn message_seen(&self, user_id: Uuid, message_id: &str) -> Result<bool, StoreError>;

    /// Inserts a pending row. Fails with [`StoreError::ConstraintViolation`]
    /// when (user, message id, normalized name) collides; rows without a
    /// message id are exempt from the key so manual entries never collide.
    async fn insert_pending(&self, item: &ReviewQueueItem) -> Result<(), StoreError>;

    /// Pending rows for the user, newest first.
    async fn list_pending(&self, user_id: Uuid) -> Result<Vec<ReviewQueueItem>, StoreError>;

    /// Every non-rejected row (pending and approved), the analytics source set.
    async fn list_non_rejected(&self, user_id: Uuid) -> Result<Vec<ReviewQueueItem>, StoreError>;

    /// Atomically creates the wardrobe entry and flips the row to approved.
    /// Either both happen or neither does.
    async fn approve(
        &self,
        user_id: Uuid,
        item_id: Uuid,
        overrides: &ApproveOverrides,
    ) -> Result<WardrobeItem, StoreError>;

    /// Flips the row to rejected. The row is retained.
    async fn reject(&self, user_id: Uuid, item_id: Uuid) -> Result<(), StoreError>;

    async fn upsert_analytics(&self, record: &AnalyticsRecord) -> Result<(), StoreError>;
    async fn get_analytics(&self, user_id: Uuid) -> Result<Option<AnalyticsRecord>, StoreError>;
    /// All analytics rows, for the business surface.
    async fn list_analytics(&self) -> Result<Vec<AnalyticsRecord>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    cursors: HashMap<Uuid, ScanCursor>,
    queue: Vec<ReviewQueueItem>,
    wardrobe: Vec<WardrobeItem>,
    analytics: HashMap<Uuid, AnalyticsRecord>,
}

/// Single-process store used by tests and fixture scans. Mirrors the
/// Postgres uniqueness semantics, including the message-id-scoped key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReviewStore for MemoryStore {
    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::ConstraintViolation);
        }
        state.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.state.lock().await.users.get(&user_id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn get_cursor(&self, user_id: Uuid) -> Result<Option<ScanCursor>, StoreError> {
        Ok(self.state.lock().await.cursors.get(&user_id).cloned())
    }

    async fn upsert_cursor(
        &self,
        user_id: Uuid,
        window_days: Option<i32>,
        last_scan_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let cursor = state
            .cursors
            .entry(user_id)
            .or_insert_with(|| ScanCursor::new(user_id));
        if let Some(days) = window_days {
            cursor.initial_window_days = days;
        }
        cursor.last_scan_at = Some(last_scan_at);
        Ok(())
    }

    async fn message_seen(&self, user_id: Uuid, message_id: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.queue.iter().any(|item| {
            item.user_id == user_id && item.email_message_id.as_deref() == Some(message_id)
        }))
    }

    async fn insert_pending(&self, item: &ReviewQueueItem) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(message_id) = item.email_message_id.as_deref() {
            let name_key = normalized_item_name(&item.item_name);
            let collides = state.queue.iter().any(|existing| {
                existing.user_id == item.user_id
                    && existing.email_message_id.as_deref() == Some(message_id)
                    && normalized_item_name(&existing.item_name) == name_key
            });
            if collides {
                return Err(StoreError::ConstraintViolation);
            }
        }
        state.queue.push(item.clone());
        Ok(())
    }

    async fn list_pending(&self, user_id: Uuid) -> Result<Vec<ReviewQueueItem>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<ReviewQueueItem> = state
            .queue
            .iter()
            .rev()
            .filter(|item| item.user_id == user_id && item.status == ReviewStatus::Pending)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn list_non_rejected(&self, user_id: Uuid) -> Result<Vec<ReviewQueueItem>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .queue
            .iter()
            .filter(|item| item.user_id == user_id && item.status != ReviewStatus::Rejected)
            .cloned()
            .collect())
    }

    async fn approve(
        &self,
        user_id: Uuid,
        item_id: Uuid,
        overrides: &ApproveOverrides,
    ) -> Result<WardrobeItem, StoreError> {
        let mut state = self.state.lock().await;
        let item = state
            .queue
            .iter_mut()
            .find(|item| item.id == item_id && item.user_id == user_id)
            .ok_or(StoreError::NotFound)?;
        if item.status != ReviewStatus::Pending {
            return Err(StoreError::Conflict(item.status));
        }
        let wardrobe = resolve_approval(item, overrides).ok_or(StoreError::PriceRequired)?;
        item.status = ReviewStatus::Approved;
        state.wardrobe.push(wardrobe.clone());
        Ok(wardrobe)
    }

    async fn reject(&self, user_id: Uuid, item_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let item = state
            .queue
            .iter_mut()
            .find(|item| item.id == item_id && item.user_id == user_id)
            .ok_or(StoreError::NotFound)?;
        if item.status != ReviewStatus::Pending {
            return Err(StoreError::Conflict(item.status));
        }
        item.status = ReviewStatus::Rejected;
        Ok(())
    }

    async fn upsert_analytics(&self, record: &AnalyticsRecord) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .analytics
            .insert(record.user_id, record.clone());
        Ok(())
    }

    async fn get_analytics(&self, user_id: Uuid) -> Result<Option<AnalyticsRecord>, StoreError> {
        Ok(self.state.lock().await.analytics.get(&user_id).cloned())
    }

    async fn list_analytics(&self) -> Result<Vec<AnalyticsRecord>, StoreError> {
        let mut rows: Vec<AnalyticsRecord> =
            self.state.lock().await.analytics.values().cloned().collect();
        rows.sort_by_key(|r| r.user_id);
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

/// Embedded schema, applied statement-by-statement on `migrate`.
///
/// The uniqueness key over (user, message id, normalized name) is a partial
/// index: rows without a message id (manual entries) are exempt, which keeps
/// behavior independent of the engine's NULL-equality semantics. Price is
/// deliberately not part of the key.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        role TEXT NOT NULL DEFAULT 'consumer',
        mailbox_refresh_token TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS scan_cursors (
        user_id UUID PRIMARY KEY REFERENCES users(id),
        initial_window_days INTEGER NOT NULL DEFAULT 90,
        last_scan_at TIMESTAMPTZ
    )",
    "CREATE TABLE IF NOT EXISTS review_queue_items (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id),
        source TEXT NOT NULL,
        status TEXT NOT NULL,
        merchant TEXT,
        item_name TEXT NOT NULL,
        category TEXT,
        size TEXT,
        price_cents BIGINT,
        currency TEXT NOT NULL DEFAULT 'USD',
        purchased_at TIMESTAMPTZ,
        email_message_id TEXT,
        email_thread_id TEXT,
        image_url TEXT,
        extracted_json TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS ix_review_queue_user_status
        ON review_queue_items (user_id, status)",
    "CREATE INDEX IF NOT EXISTS ix_review_queue_user_message
        ON review_queue_items (user_id, email_message_id)",
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_review_queue_user_message_name
        ON review_queue_items (user_id, email_message_id, lower(btrim(item_name)))
        WHERE email_message_id IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS wardrobe_items (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id),
        merchant TEXT,
        item_name TEXT NOT NULL,
        category TEXT,
        size TEXT,
        color TEXT,
        price_cents BIGINT NOT NULL,
        currency TEXT NOT NULL DEFAULT 'USD',
        purchased_at TIMESTAMPTZ,
        wear_count BIGINT NOT NULL DEFAULT 0,
        source TEXT NOT NULL,
        image_url TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS user_analytics (
        user_id UUID PRIMARY KEY,
        total_spending_cents BIGINT NOT NULL DEFAULT 0,
        total_purchases BIGINT NOT NULL DEFAULT 0,
        average_purchase_cents BIGINT NOT NULL DEFAULT 0,
        frequent_merchant TEXT,
        frequent_merchant_count BIGINT,
        merchant_freq_json TEXT,
        most_spent_merchant TEXT,
        most_spent_merchant_cents BIGINT,
        merchant_spending_json TEXT,
        frequent_category TEXT,
        frequent_category_count BIGINT,
        category_freq_json TEXT,
        most_spent_category TEXT,
        most_spent_category_cents BIGINT,
        category_spending_json TEXT,
        first_purchase_at TIMESTAMPTZ,
        last_purchase_at TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
];

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn map_sqlx_err(err: sqlx::Error) -> StoreError {
    if let Some(db_err) = err.as_database_error() {
        if matches!(db_err.kind(), sqlx::error::ErrorKind::UniqueViolation) {
            return StoreError::ConstraintViolation;
        }
    }
    StoreError::Backend(err.into())
}

fn json_map_to_text(map: &std::collections::BTreeMap<String, i64>) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string())
}

fn json_text_to_map(text: Option<String>) -> std::collections::BTreeMap<String, i64> {
    text.as_deref()
        .and_then(|t| serde_json::from_str(t).ok())
        .unwrap_or_default()
}

fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
    let role: String = row.try_get("role").map_err(map_sqlx_err)?;
    Ok(User {
        id: row.try_get("id").map_err(map_sqlx_err)?,
        email: row.try_get("email").map_err(map_sqlx_err)?,
        role: if role == "business" {
            UserRole::Business
        } else {
            UserRole::Consumer
        },
        mailbox_refresh_token: row.try_get("mailbox_refresh_token").map_err(map_sqlx_err)?,
        created_at: row.try_get("created_at").map_err(map_sqlx_err)?,
    })
}

fn review_item_from_row(row: &PgRow) -> Result<ReviewQueueItem, StoreError> {
    let source: String = row.try_get("source").map_err(map_sqlx_err)?;
    let status: String = row.try_get("status").map_err(map_sqlx_err)?;
    let extracted: Option<String> = row.try_get("extracted_json").map_err(map_sqlx_err)?;
    Ok(ReviewQueueItem {
        id: row.try_get("id").map_err(map_sqlx_err)?,
        user_id: row.try_get("user_id").map_err(map_sqlx_err)?,
        source: ItemSource::from_str(&source).map_err(|e| StoreError::Backend(anyhow::anyhow!(e)))?,
        status: ReviewStatus::from_str(&status)
            .map_err(|e| StoreError::Backend(anyhow::anyhow!(e)))?,
        merchant: row.try_get("merchant").map_err(map_sqlx_err)?,
        item_name: row.try_get("item_name").map_err(map_sqlx_err)?,
        category: row.try_get("category").map_err(map_sqlx_err)?,
        size: row.try_get("size").map_err(map_sqlx_err)?,
        price_cents: row.try_get("price_cents").map_err(map_sqlx_err)?,
        currency: row.try_get("currency").map_err(map_sqlx_err)?,
        purchased_at: row.try_get("purchased_at").map_err(map_sqlx_err)?,
        email_message_id: row.try_get("email_message_id").map_err(map_sqlx_err)?,
        email_thread_id: row.try_get("email_thread_id").map_err(map_sqlx_err)?,
        image_url: row.try_get("image_url").map_err(map_sqlx_err)?,
        extracted_json: extracted.and_then(|t| serde_json::from_str(&t).ok()),
        created_at: row.try_get("created_at").map_err(map_sqlx_err)?,
    })
}

fn analytics_from_row(row: &PgRow) -> Result<AnalyticsRecord, StoreError> {
    Ok(AnalyticsRecord {
        user_id: row.try_get("user_id").map_err(map_sqlx_err)?,
        total_spending_cents: row.try_get("total_spending_cents").map_err(map_sqlx_err)?,
        total_purchases: row.try_get("total_purchases").map_err(map_sqlx_err)?,
        average_purchase_cents: row.try_get("average_purchase_cents").map_err(map_sqlx_err)?,
        frequent_merchant: row.try_get("frequent_merchant").map_err(map_sqlx_err)?,
        frequent_merchant_count: row.try_get("frequent_merchant_count").map_err(map_sqlx_err)?,
        merchant_freq: json_text_to_map(row.try_get("merchant_freq_json").map_err(map_sqlx_err)?),
        most_spent_merchant: row.try_get("most_spent_merchant").map_err(map_sqlx_err)?,
        most_spent_merchant_cents: row
            .try_get("most_spent_merchant_cents")
            .map_err(map_sqlx_err)?,
        merchant_spend: json_text_to_map(
            row.try_get("merchant_spending_json").map_err(map_sqlx_err)?,
        ),
        frequent_category: row.try_get("frequent_category").map_err(map_sqlx_err)?,
        frequent_category_count: row
            .try_get("frequent_category_count")
            .map_err(map_sqlx_err)?,
        category_freq: json_text_to_map(row.try_get("category_freq_json").map_err(map_sqlx_err)?),
        most_spent_category: row.try_get("most_spent_category").map_err(map_sqlx_err)?,
        most_spent_category_cents: row
            .try_get("most_spent_category_cents")
            .map_err(map_sqlx_err)?,
        category_spend: json_text_to_map(
            row.try_get("category_spending_json").map_err(map_sqlx_err)?,
        ),
        first_purchase_at: row.try_get("first_purchase_at").map_err(map_sqlx_err)?,
        last_purchase_at: row.try_get("last_purchase_at").map_err(map_sqlx_err)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx_err)?,
    })
}

#[async_trait]
impl ReviewStore for PgStore {
    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        let role = if user.role == UserRole::Business {
            "business"
        } else {
            "consumer"
        };
        sqlx::query(
            "INSERT INTO users (id, email, role, mailbox_refresh_token, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(role)
        .bind(&user.mailbox_refresh_token)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            "SELECT id, email, role, mailbox_refresh_token, created_at FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            "SELECT id, email, role, mailbox_refresh_token, created_at FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn get_cursor(&self, user_id: Uuid) -> Result<Option<ScanCursor>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, initial_window_days, last_scan_at FROM scan_cursors WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        row.map(|row| {
            Ok(ScanCursor {
                user_id: row.try_get("user_id").map_err(map_sqlx_err)?,
                initial_window_days: row.try_get("initial_window_days").map_err(map_sqlx_err)?,
                last_scan_at: row.try_get("last_scan_at").map_err(map_sqlx_err)?,
            })
        })
        .transpose()
    }

    async fn upsert_cursor(
        &self,
        user_id: Uuid,
        window_days: Option<i32>,
        last_scan_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO scan_cursors (user_id, initial_window_days, last_scan_at)
             VALUES ($1, COALESCE($2, 90), $3)
             ON CONFLICT (user_id) DO UPDATE SET
                 initial_window_days = COALESCE($2, scan_cursors.initial_window_days),
                 last_scan_at = $3",
        )
        .bind(user_id)
        .bind(window_days)
        .bind(last_scan_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn message_seen(&self, user_id: Uuid, message_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM review_queue_items
             WHERE user_id = $1 AND email_message_id = $2 LIMIT 1",
        )
        .bind(user_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(row.is_some())
    }

    async fn insert_pending(&self, item: &ReviewQueueItem) -> Result<(), StoreError> {
        let extracted = item
            .extracted_json
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_else(|_| "null".to_string()));
        sqlx::query(
            "INSERT INTO review_queue_items
                 (id, user_id, source, status, merchant, item_name, category, size,
                  price_cents, currency, purchased_at, email_message_id, email_thread_id,
                  image_url, extracted_json, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(item.id)
        .bind(item.user_id)
        .bind(item.source.as_str())
        .bind(item.status.as_str())
        .bind(&item.merchant)
        .bind(&item.item_name)
        .bind(&item.category)
        .bind(&item.size)
        .bind(item.price_cents)
        .bind(&item.currency)
        .bind(item.purchased_at)
        .bind(&item.email_message_id)
        .bind(&item.email_thread_id)
        .bind(&item.image_url)
        .bind(extracted)
        .bind(item.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn list_pending(&self, user_id: Uuid) -> Result<Vec<ReviewQueueItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM review_queue_items
             WHERE user_id = $1 AND status = 'pending'
             ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.iter().map(review_item_from_row).collect()
    }

    async fn list_non_rejected(&self, user_id: Uuid) -> Result<Vec<ReviewQueueItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM review_queue_items
             WHERE user_id = $1 AND status <> 'rejected'
             ORDER BY created_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.iter().map(review_item_from_row).collect()
    }

    async fn approve(
        &self,
        user_id: Uuid,
        item_id: Uuid,
        overrides: &ApproveOverrides,
    ) -> Result<WardrobeItem, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let row = sqlx::query(
            "SELECT * FROM review_queue_items
             WHERE id = $1 AND user_id = $2 FOR UPDATE",
        )
        .bind(item_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?
        .ok_or(StoreError::NotFound)?;
        let item = review_item_from_row(&row)?;

        if item.status != ReviewStatus::Pending {
            return Err(StoreError::Conflict(item.status));
        }
        let wardrobe = resolve_approval(&item, overrides).ok_or(StoreError::PriceRequired)?;

        sqlx::query(
            "INSERT INTO wardrobe_items
                 (id, user_id, merchant, item_name, category, size, color, price_cents,
                  currency, purchased_at, wear_count, source, image_url, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(wardrobe.id)
        .bind(wardrobe.user_id)
        .bind(&wardrobe.merchant)
        .bind(&wardrobe.item_name)
        .bind(&wardrobe.category)
        .bind(&wardrobe.size)
        .bind(&wardrobe.color)
        .bind(wardrobe.price_cents)
        .bind(&wardrobe.currency)
        .bind(wardrobe.purchased_at)
        .bind(wardrobe.wear_count)
        .bind(wardrobe.source.as_str())
        .bind(&wardrobe.image_url)
        .bind(wardrobe.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        sqlx::query("UPDATE review_queue_items SET status = 'approved' WHERE id = $1")
            .bind(item_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(wardrobe)
    }

    async fn reject(&self, user_id: Uuid, item_id: Uuid) -> Result<(), StoreError> {
        let row = sqlx::query(
            "SELECT status FROM review_queue_items WHERE id = $1 AND user_id = $2",
        )
        .bind(item_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?
        .ok_or(StoreError::NotFound)?;
        let status: String = row.try_get("status").map_err(map_sqlx_err)?;
        let status =
            ReviewStatus::from_str(&status).map_err(|e| StoreError::Backend(anyhow::anyhow!(e)))?;
        if status != ReviewStatus::Pending {
            return Err(StoreError::Conflict(status));
        }

        sqlx::query(
            "UPDATE review_queue_items SET status = 'rejected'
             WHERE id = $1 AND user_id = $2 AND status = 'pending'",
        )
        .bind(item_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn upsert_analytics(&self, record: &AnalyticsRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO user_analytics
                 (user_id, total_spending_cents, total_purchases, average_purchase_cents,
                  frequent_merchant, frequent_merchant_count, merchant_freq_json,
                  most_spent_merchant, most_spent_merchant_cents, merchant_spending_json,
                  frequent_category, frequent_category_count, category_freq_json,
                  most_spent_category, most_spent_category_cents, category_spending_json,
                  first_purchase_at, last_purchase_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                     $11, $12, $13, $14, $15, $16, $17, $18, $19)
             ON CONFLICT (user_id) DO UPDATE SET
                 total_spending_cents = EXCLUDED.total_spending_cents,
                 total_purchases = EXCLUDED.total_purchases,
                 average_purchase_cents = EXCLUDED.average_purchase_cents,
                 frequent_merchant = EXCLUDED.frequent_merchant,
                 frequent_merchant_count = EXCLUDED.frequent_merchant_count,
                 merchant_freq_json = EXCLUDED.merchant_freq_json,
                 most_spent_merchant = EXCLUDED.most_spent_merchant,
                 most_spent_merchant_cents = EXCLUDED.most_spent_merchant_cents,
                 merchant_spending_json = EXCLUDED.merchant_spending_json,
                 frequent_category = EXCLUDED.frequent_category,
                 frequent_category_count = EXCLUDED.frequent_category_count,
                 category_freq_json = EXCLUDED.category_freq_json,
                 most_spent_category = EXCLUDED.most_spent_category,
                 most_spent_category_cents = EXCLUDED.most_spent_category_cents,
                 category_spending_json = EXCLUDED.category_spending_json,
                 first_purchase_at = EXCLUDED.first_purchase_at,
                 last_purchase_at = EXCLUDED.last_purchase_at,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(record.user_id)
        .bind(record.total_spending_cents)
        .bind(record.total_purchases)
        .bind(record.average_purchase_cents)
        .bind(&record.frequent_merchant)
        .bind(record.frequent_merchant_count)
        .bind(json_map_to_text(&record.merchant_freq))
        .bind(&record.most_spent_merchant)
        .bind(record.most_spent_merchant_cents)
        .bind(json_map_to_text(&record.merchant_spend))
        .bind(&record.frequent_category)
        .bind(record.frequent_category_count)
        .bind(json_map_to_text(&record.category_freq))
        .bind(&record.most_spent_category)
        .bind(record.most_spent_category_cents)
        .bind(json_map_to_text(&record.category_spend))
        .bind(record.first_purchase_at)
        .bind(record.last_purchase_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn get_analytics(&self, user_id: Uuid) -> Result<Option<AnalyticsRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM user_analytics WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.as_ref().map(analytics_from_row).transpose()
    }

    async fn list_analytics(&self) -> Result<Vec<AnalyticsRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM user_analytics ORDER BY user_id")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.iter().map(analytics_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn queue_item(
        user_id: Uuid,
        message_id: Option<&str>,
        name: &str,
        price_cents: Option<i64>,
    ) -> ReviewQueueItem {
        ReviewQueueItem {
            id: Uuid::new_v4(),
            user_id,
            source: if message_id.is_some() {
                ItemSource::Mailbox
            } else {
                ItemSource::Manual
            },
            status: ReviewStatus::Pending,
            merchant: Some("Quince".to_string()),
            item_name: name.to_string(),
            category: Some("Tops".to_string()),
            size: None,
            price_cents,
            currency: "USD".to_string(),
            purchased_at: None,
            email_message_id: message_id.map(str::to_string),
            email_thread_id: message_id.map(|m| format!("thr-{m}")),
            image_url: None,
            extracted_json: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_name_in_same_message_collides() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store
            .insert_pending(&queue_item(user, Some("m1"), "Linen Shirt", Some(4999)))
            .await
            .unwrap();
        let err = store
            .insert_pending(&queue_item(user, Some("m1"), "  LINEN SHIRT ", None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation));
    }

    #[tokio::test]
    async fn same_name_different_message_does_not_collide() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store
            .insert_pending(&queue_item(user, Some("m1"), "Linen Shirt", None))
            .await
            .unwrap();
        store
            .insert_pending(&queue_item(user, Some("m2"), "Linen Shirt", None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn manual_rows_without_message_id_never_collide() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store
            .insert_pending(&queue_item(user, None, "Belt", None))
            .await
            .unwrap();
        store
            .insert_pending(&queue_item(user, None, "Belt", None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn approve_creates_wardrobe_entry_and_flips_status() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let item = queue_item(user, Some("m1"), "Linen Shirt", Some(4999));
        store.insert_pending(&item).await.unwrap();

        let wardrobe = store
            .approve(user, item.id, &ApproveOverrides::default())
            .await
            .unwrap();
        assert_eq!(wardrobe.price_cents, 4999);
        assert!(store.list_pending(user).await.unwrap().is_empty());

        let non_rejected = store.list_non_rejected(user).await.unwrap();
        assert_eq!(non_rejected.len(), 1);
        assert_eq!(non_rejected[0].status, ReviewStatus::Approved);
    }

    #[tokio::test]
    async fn approve_requires_resolvable_price() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let item = queue_item(user, Some("m1"), "Mystery Shirt", None);
        store.insert_pending(&item).await.unwrap();

        let err = store
            .approve(user, item.id, &ApproveOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PriceRequired));

        // Still pending after the failed approval.
        assert_eq!(store.list_pending(user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn terminal_rows_conflict_on_further_transitions() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let item = queue_item(user, Some("m1"), "Linen Shirt", Some(4999));
        store.insert_pending(&item).await.unwrap();
        store
            .approve(user, item.id, &ApproveOverrides::default())
            .await
            .unwrap();

        let err = store.reject(user, item.id).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(ReviewStatus::Approved)));

        let rejected = queue_item(user, Some("m2"), "Wool Coat", Some(12000));
        store.insert_pending(&rejected).await.unwrap();
        store.reject(user, rejected.id).await.unwrap();
        let err = store
            .approve(user, rejected.id, &ApproveOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(ReviewStatus::Rejected)));
    }

    #[tokio::test]
    async fn unknown_item_or_wrong_user_is_not_found() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let item = queue_item(user, Some("m1"), "Linen Shirt", Some(4999));
        store.insert_pending(&item).await.unwrap();

        let err = store
            .approve(Uuid::new_v4(), item.id, &ApproveOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));

        let err = store.reject(user, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn list_pending_is_newest_first() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let mut older = queue_item(user, Some("m1"), "Old Shirt", None);
        older.created_at = Utc::now() - Duration::hours(2);
        let newer = queue_item(user, Some("m2"), "New Shirt", None);
        store.insert_pending(&older).await.unwrap();
        store.insert_pending(&newer).await.unwrap();

        let pending = store.list_pending(user).await.unwrap();
        assert_eq!(pending[0].item_name, "New Shirt");
        assert_eq!(pending[1].item_name, "Old Shirt");
    }

    #[tokio::test]
    async fn cursor_upsert_preserves_window_when_incremental() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let t0 = Utc::now();
        store.upsert_cursor(user, Some(30), t0).await.unwrap();
        let t1 = t0 + Duration::hours(1);
        store.upsert_cursor(user, None, t1).await.unwrap();

        let cursor = store.get_cursor(user).await.unwrap().unwrap();
        assert_eq!(cursor.initial_window_days, 30);
        assert_eq!(cursor.last_scan_at, Some(t1));
    }
}
