use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::dedup::Versioned;

/// Label shown for transactions whose category is missing or inactive.
pub const UNKNOWN_CATEGORY: &str = "Unknown";

pub const MAX_CATEGORY_NAME_LEN: usize = 50;
pub const MAX_MEMO_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Income,
    Expense,
}

impl EntryKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Income => "income",
            Self::Expense => "expense",
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_kind(s: &str) -> Result<EntryKind> {
    match s.trim().to_lowercase().as_str() {
        "income" | "in" => Ok(EntryKind::Income),
        "expense" | "out" => Ok(EntryKind::Expense),
        _ => bail!("Invalid type '{s}'. Must be one of: income, expense"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub date: String,
    pub month: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub amount: i64,
    pub category_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    #[serde(default)]
    pub updated_at: String,
}

impl Transaction {
    /// Recompute `month` from `date`. Returns false when `date` is not a valid day.
    pub fn normalize_month(&mut self) -> bool {
        match NaiveDate::parse_from_str(&self.date, "%Y-%m-%d") {
            Ok(date) => {
                self.month = month_of(date);
                true
            }
            Err(_) => false,
        }
    }
}

impl Versioned for Transaction {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> &str {
        &self.updated_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub updated_at: String,
}

fn default_active() -> bool {
    true
}

impl Versioned for Category {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> &str {
        &self.updated_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    #[serde(default)]
    pub sheet_id: Option<String>,
    #[serde(default)]
    pub last_sync_at: Option<String>,
    #[serde(default)]
    pub pending_count: i64,
}

impl SyncMeta {
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.sheet_id.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Everything the local store holds, as returned by a single read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub transactions: Vec<Transaction>,
    pub categories: Vec<Category>,
    pub meta: SyncMeta,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub date: NaiveDate,
    pub kind: EntryKind,
    pub amount: i64,
    pub category_id: String,
    pub memo: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateTransaction {
    pub date: Option<NaiveDate>,
    pub kind: Option<EntryKind>,
    pub amount: Option<i64>,
    pub category_id: Option<String>,
    pub memo: Option<Option<String>>,
}

impl UpdateTransaction {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.date.is_none()
            && self.kind.is_none()
            && self.amount.is_none()
            && self.category_id.is_none()
            && self.memo.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct NewCategory {
    pub name: String,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateCategory {
    pub name: Option<String>,
    pub kind: Option<EntryKind>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CategoryFilter {
    pub include_inactive: bool,
    pub kind: Option<EntryKind>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlySummary {
    pub month: String,
    pub total_income: i64,
    pub total_expense: i64,
    pub balance: i64,
    pub transaction_count: usize,
    pub categories: Vec<CategoryTotal>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryTotal {
    pub category_id: String,
    pub category_name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub total: i64,
    pub count: usize,
}

// --- Outbox types ---

/// A single-entity change waiting to be mirrored to the spreadsheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MirrorOp {
    UpsertTransaction { transaction: Transaction },
    DeleteTransaction { id: String },
    UpsertCategory { category: Category },
}

impl MirrorOp {
    #[must_use]
    pub fn entity(&self) -> &'static str {
        match self {
            Self::UpsertTransaction { .. } | Self::DeleteTransaction { .. } => "transaction",
            Self::UpsertCategory { .. } => "category",
        }
    }

    #[must_use]
    pub fn entity_id(&self) -> &str {
        match self {
            Self::UpsertTransaction { transaction } => &transaction.id,
            Self::DeleteTransaction { id } => id,
            Self::UpsertCategory { category } => &category.id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: i64,
    pub op: MirrorOp,
    pub enqueued_at: String,
    pub attempts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<String>,
}

#[must_use]
pub fn month_of(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

/// Current time as an RFC 3339 UTC timestamp with millisecond precision.
#[must_use]
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{s}'. Use YYYY-MM-DD"))
}

pub fn validate_month(s: &str) -> Result<String> {
    let s = s.trim();
    let first = NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d")
        .with_context(|| format!("Invalid month '{s}'. Use YYYY-MM"))?;
    Ok(month_of(first))
}

pub fn validate_amount(amount: i64) -> Result<()> {
    if amount < 0 {
        bail!("Amount must not be negative (got {amount})");
    }
    Ok(())
}

pub fn validate_category_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        bail!("Category name cannot be empty");
    }
    if name.chars().count() > MAX_CATEGORY_NAME_LEN {
        bail!("Category name must be at most {MAX_CATEGORY_NAME_LEN} characters");
    }
    Ok(name.to_string())
}

/// Trim a memo, mapping blank input to `None`.
pub fn normalize_memo(memo: Option<String>) -> Result<Option<String>> {
    let Some(memo) = memo else {
        return Ok(None);
    };
    let memo = memo.trim();
    if memo.is_empty() {
        return Ok(None);
    }
    if memo.chars().count() > MAX_MEMO_LEN {
        bail!("Memo must be at most {MAX_MEMO_LEN} characters");
    }
    Ok(Some(memo.to_string()))
}

/// Validate a transaction that arrived from outside the local store and
/// repair its derived `month`.
pub fn validate_transaction(tx: &mut Transaction) -> Result<()> {
    if tx.id.trim().is_empty() {
        bail!("Transaction id cannot be empty");
    }
    if !tx.normalize_month() {
        bail!("Transaction {} has an invalid date '{}'", tx.id, tx.date);
    }
    validate_amount(tx.amount)?;
    Ok(())
}

pub fn validate_category(category: &Category) -> Result<()> {
    if category.id.trim().is_empty() {
        bail!("Category id cannot be empty");
    }
    validate_category_name(&category.name)?;
    Ok(())
}
