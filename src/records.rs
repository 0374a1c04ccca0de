//! Receipt records: the corpus behind the index and the data exposed to
//! sandboxed artifacts.
//!
//! The pipeline itself never writes receipts — ingestion lives elsewhere.
//! This module reads them: one record for the append job, the full corpus
//! for rebuilds and for the sandbox's `records` array, plus the canonical
//! text projection that gets embedded.

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

/// Category vocabulary used in receipt rows and index text.
pub const CATEGORIES: &[&str] = &[
    "groceries",
    "apparel",
    "dining out",
    "electronics",
    "supplies",
    "healthcare",
    "home",
    "utilities",
    "transportation",
    "insurance",
    "personal care",
    "subscriptions",
    "entertainment",
    "education",
    "pets",
    "travel",
    "other",
];

/// One stored receipt.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub id: i64,
    pub merchant: String,
    pub category: String,
    /// Purchase date, `YYYY-MM-DD`.
    pub spent_at: String,
    pub subtotal: Option<f64>,
    pub tax: Option<f64>,
    pub tip: Option<f64>,
    pub total: f64,
    pub currency: String,
    pub item_count: i64,
    /// Row creation time (epoch seconds); recency key for search tie-breaks.
    pub created_at: i64,
}

impl Receipt {
    /// Canonical text embedded for this receipt. Merchant, category, date,
    /// and amount are what spending questions mention.
    pub fn index_text(&self) -> String {
        format!(
            "{} {} {} {} {:.2}",
            self.merchant, self.category, self.spent_at, self.currency, self.total
        )
    }

    /// Short excerpt surfaced in search results.
    pub fn snippet(&self) -> String {
        format!(
            "{} — {} on {} ({} {:.2})",
            self.merchant, self.category, self.spent_at, self.currency, self.total
        )
    }

    /// The row handed to sandboxed artifacts.
    pub fn to_row(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "merchant": self.merchant,
            "category": self.category,
            "spent_at": self.spent_at,
            "subtotal": self.subtotal,
            "tax": self.tax,
            "tip": self.tip,
            "total": self.total,
            "currency": self.currency,
            "item_count": self.item_count,
        })
    }
}

fn receipt_from_row(row: &sqlx::sqlite::SqliteRow) -> Receipt {
    Receipt {
        id: row.get("id"),
        merchant: row.get("merchant"),
        category: row.get("category"),
        spent_at: row.get("spent_at"),
        subtotal: row.get("subtotal"),
        tax: row.get("tax"),
        tip: row.get("tip"),
        total: row.get("total"),
        currency: row.get("currency"),
        item_count: row.get("item_count"),
        created_at: row.get("created_at"),
    }
}

const RECEIPT_COLUMNS: &str = "id, merchant, category, spent_at, subtotal, tax, tip, total, \
     currency, item_count, created_at";

/// Fetch one receipt by id.
pub async fn fetch_receipt(pool: &SqlitePool, id: i64) -> Result<Option<Receipt>> {
    let row = sqlx::query(&format!(
        "SELECT {RECEIPT_COLUMNS} FROM receipts WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("Failed to fetch receipt")?;

    Ok(row.as_ref().map(receipt_from_row))
}

/// Fetch the whole corpus, newest first, capped at `limit` rows.
pub async fn fetch_all(pool: &SqlitePool, limit: usize) -> Result<Vec<Receipt>> {
    let rows = sqlx::query(&format!(
        "SELECT {RECEIPT_COLUMNS} FROM receipts ORDER BY created_at DESC, id DESC LIMIT ?"
    ))
    .bind(limit as i64)
    .fetch_all(pool)
    .await
    .context("Failed to fetch receipts")?;

    Ok(rows.iter().map(receipt_from_row).collect())
}

/// Insert a receipt; returns its id. Used by `init --seed` and tests.
pub async fn insert_receipt(
    pool: &SqlitePool,
    merchant: &str,
    category: &str,
    spent_at: &str,
    total: f64,
) -> Result<i64> {
    let created_at = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        r#"
        INSERT INTO receipts (merchant, category, spent_at, total, currency, item_count, created_at)
        VALUES (?, ?, ?, ?, 'USD', 0, ?)
        "#,
    )
    .bind(merchant)
    .bind(category)
    .bind(spent_at)
    .bind(total)
    .bind(created_at)
    .execute(pool)
    .await
    .context("Failed to insert receipt")?;

    Ok(result.last_insert_rowid())
}

/// Seed a handful of demo receipts so `tally ask` has something to answer
/// against on a fresh database.
pub async fn seed_demo_data(pool: &SqlitePool) -> Result<usize> {
    let demo: &[(&str, &str, &str, f64)] = &[
        ("Green Grocer", "groceries", "2025-06-03", 54.20),
        ("Green Grocer", "groceries", "2025-06-17", 61.75),
        ("City Power & Light", "utilities", "2025-06-12", 118.40),
        ("Corner Bistro", "dining out", "2025-06-14", 48.90),
        ("Metro Transit", "transportation", "2025-06-20", 25.00),
        ("Streamflix", "subscriptions", "2025-06-01", 15.99),
    ];

    for (merchant, category, spent_at, total) in demo {
        insert_receipt(pool, merchant, category, spent_at, *total).await?;
    }

    Ok(demo.len())
}
