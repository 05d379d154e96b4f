//! Tabular workbook abstraction, the fixed sheet layout and the row codec.
//!
//! The wire DTOs at the bottom match the Google Sheets v4 REST API; the HTTP
//! client that speaks it lives in the CLI crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MirrorResult;
use crate::models::{Category, EntryKind, Transaction, parse_kind};

/// One spreadsheet row, cells rendered as strings.
pub type Row = Vec<String>;

/// A remote workbook made of titled sheets of string rows.
///
/// Row indexes are zero-based and include the header row.
#[async_trait]
pub trait Workbook: Send + Sync {
    async fn sheet_titles(&self, spreadsheet_id: &str) -> MirrorResult<Vec<String>>;
    async fn add_sheet(&self, spreadsheet_id: &str, title: &str) -> MirrorResult<()>;
    async fn read_rows(&self, spreadsheet_id: &str, title: &str) -> MirrorResult<Vec<Row>>;
    async fn append_rows(&self, spreadsheet_id: &str, title: &str, rows: Vec<Row>)
    -> MirrorResult<()>;
    async fn update_row(
        &self,
        spreadsheet_id: &str,
        title: &str,
        index: usize,
        row: Row,
    ) -> MirrorResult<()>;
    async fn delete_row(&self, spreadsheet_id: &str, title: &str, index: usize)
    -> MirrorResult<()>;
    /// Remove the contents of every row from `from` onwards.
    async fn clear_rows(&self, spreadsheet_id: &str, title: &str, from: usize)
    -> MirrorResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetName {
    Transactions,
    Categories,
    Meta,
}

impl SheetName {
    pub const ALL: [SheetName; 3] = [Self::Transactions, Self::Categories, Self::Meta];

    #[must_use]
    pub fn title(self) -> &'static str {
        match self {
            Self::Transactions => "Transactions",
            Self::Categories => "Categories",
            Self::Meta => "Meta",
        }
    }

    #[must_use]
    pub fn header(self) -> &'static [&'static str] {
        match self {
            Self::Transactions => &TRANSACTION_HEADER,
            Self::Categories => &CATEGORY_HEADER,
            Self::Meta => &META_HEADER,
        }
    }

    #[must_use]
    pub fn header_row(self) -> Row {
        self.header().iter().map(|h| (*h).to_string()).collect()
    }
}

pub const TRANSACTION_HEADER: [&str; 8] = [
    "id",
    "date",
    "month",
    "type",
    "amount",
    "categoryId",
    "memo",
    "updatedAt",
];
pub const CATEGORY_HEADER: [&str; 5] = ["id", "name", "type", "active", "updatedAt"];
pub const META_HEADER: [&str; 2] = ["key", "value"];

pub const LAST_SYNC_AT_KEY: &str = "lastSyncAt";

// --- Row codec ---

#[must_use]
pub fn transaction_to_row(tx: &Transaction) -> Row {
    vec![
        tx.id.clone(),
        tx.date.clone(),
        tx.month.clone(),
        tx.kind.as_str().to_string(),
        tx.amount.to_string(),
        tx.category_id.clone(),
        tx.memo.clone().unwrap_or_default(),
        tx.updated_at.clone(),
    ]
}

/// Decode a transaction row. `month` is always recomputed from `date`.
pub fn transaction_from_row(row: &[String]) -> Result<Transaction, String> {
    let id = required(row, 0, "id")?;
    let date = required(row, 1, "date")?;
    let kind = parse_row_kind(cell(row, 3))?;
    let amount = parse_amount(cell(row, 4))?;
    let memo = Some(cell(row, 6).trim().to_string()).filter(|m| !m.is_empty());

    let mut tx = Transaction {
        id,
        date,
        month: String::new(),
        kind,
        amount,
        category_id: cell(row, 5).trim().to_string(),
        memo,
        updated_at: cell(row, 7).trim().to_string(),
    };
    if !tx.normalize_month() {
        return Err(format!("invalid date '{}'", tx.date));
    }
    Ok(tx)
}

#[must_use]
pub fn category_to_row(category: &Category) -> Row {
    vec![
        category.id.clone(),
        category.name.clone(),
        category.kind.as_str().to_string(),
        if category.active { "TRUE" } else { "FALSE" }.to_string(),
        category.updated_at.clone(),
    ]
}

pub fn category_from_row(row: &[String]) -> Result<Category, String> {
    Ok(Category {
        id: required(row, 0, "id")?,
        name: required(row, 1, "name")?,
        kind: parse_row_kind(cell(row, 2))?,
        active: parse_active(cell(row, 3))?,
        updated_at: cell(row, 4).trim().to_string(),
    })
}

/// Cell at `index`, or "" when the row is shorter (trailing blanks are trimmed remotely).
fn cell(row: &[String], index: usize) -> &str {
    row.get(index).map_or("", String::as_str)
}

fn required(row: &[String], index: usize, column: &str) -> Result<String, String> {
    let value = cell(row, index).trim();
    if value.is_empty() {
        return Err(format!("missing {column}"));
    }
    Ok(value.to_string())
}

fn parse_row_kind(value: &str) -> Result<EntryKind, String> {
    parse_kind(value).map_err(|e| e.to_string())
}

// 2^63, the first float past i64::MAX.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

fn parse_amount(value: &str) -> Result<i64, String> {
    let value = value.trim();
    let amount = match value.parse::<i64>() {
        Ok(n) => n,
        // Sheets may hand numbers back as "1200.0"
        Err(_) => match value.parse::<f64>() {
            Ok(f) if f.fract() == 0.0 && (-I64_BOUND..I64_BOUND).contains(&f) => f as i64,
            Ok(f) if f.is_finite() && f.fract() == 0.0 => {
                return Err(format!("amount '{value}' is out of range"));
            }
            _ => return Err(format!("invalid amount '{value}'")),
        },
    };
    if amount < 0 {
        return Err(format!("negative amount {amount}"));
    }
    Ok(amount)
}

fn parse_active(value: &str) -> Result<bool, String> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(format!("invalid active flag '{other}'")),
    }
}

// --- Google Sheets v4 wire types ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major_dimension: Option<String>,
    #[serde(default)]
    pub values: Vec<Vec<serde_json::Value>>,
}

impl ValueRange {
    #[must_use]
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self {
            range: None,
            major_dimension: Some("ROWS".to_string()),
            values: rows
                .into_iter()
                .map(|row| row.into_iter().map(serde_json::Value::String).collect())
                .collect(),
        }
    }

    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        self.values
            .into_iter()
            .map(|row| row.iter().map(cell_to_string).collect())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct SpreadsheetMeta {
    #[serde(default)]
    pub sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SheetEntry {
    pub properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetProperties {
    pub sheet_id: i64,
    pub title: String,
}

impl SpreadsheetMeta {
    #[must_use]
    pub fn titles(&self) -> Vec<String> {
        self.sheets
            .iter()
            .map(|s| s.properties.title.clone())
            .collect()
    }

    /// Numeric sheet id for a title; structural edits address sheets by it.
    #[must_use]
    pub fn sheet_id(&self, title: &str) -> Option<i64> {
        self.sheets
            .iter()
            .find(|s| s.properties.title == title)
            .map(|s| s.properties.sheet_id)
    }
}

/// Error body returned by Google APIs.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorDetail {
    #[serde(default)]
    pub message: String,
}

#[must_use]
pub fn cell_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        other => other.to_string(),
    }
}

#[must_use]
pub fn add_sheet_request(title: &str) -> serde_json::Value {
    serde_json::json!({
        "requests": [{ "addSheet": { "properties": { "title": title } } }]
    })
}

#[must_use]
pub fn delete_row_request(sheet_id: i64, index: usize) -> serde_json::Value {
    serde_json::json!({
        "requests": [{
            "deleteDimension": {
                "range": {
                    "sheetId": sheet_id,
                    "dimension": "ROWS",
                    "startIndex": index,
                    "endIndex": index + 1
                }
            }
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|c| (*c).to_string()).collect()
    }

    fn sample_transaction() -> Transaction {
        Transaction {
            id: "t1".to_string(),
            date: "2024-03-15".to_string(),
            month: "2024-03".to_string(),
            kind: EntryKind::Income,
            amount: 250_000,
            category_id: "c9".to_string(),
            memo: Some("salary".to_string()),
            updated_at: "2024-03-15T09:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn test_transaction_row_follows_header_order() {
        let r = transaction_to_row(&sample_transaction());
        assert_eq!(r.len(), TRANSACTION_HEADER.len());
        assert_eq!(r[3], "income");
        assert_eq!(r[4], "250000");
        assert_eq!(r[5], "c9");
        assert_eq!(transaction_from_row(&r).unwrap(), sample_transaction());
    }

    #[test]
    fn test_transaction_from_row_recomputes_month() {
        let r = row(&[
            "t1", "2024-05-02", "1999-01", "expense", "300", "c1", "", "ts",
        ]);
        let tx = transaction_from_row(&r).unwrap();
        assert_eq!(tx.month, "2024-05");
        assert_eq!(tx.memo, None);
    }

    #[test]
    fn test_transaction_from_short_row() {
        // trailing empty cells are not returned by the remote
        let tx = transaction_from_row(&row(&["t1", "2024-05-02", "", "expense", "300"])).unwrap();
        assert_eq!(tx.category_id, "");
        assert_eq!(tx.updated_at, "");
    }

    #[test]
    fn test_transaction_from_row_accepts_float_amount() {
        let r = row(&["t1", "2024-05-02", "", "expense", "1200.0"]);
        assert_eq!(transaction_from_row(&r).unwrap().amount, 1200);
    }

    #[test]
    fn test_transaction_from_row_rejects_bad_rows() {
        assert!(transaction_from_row(&row(&["", "2024-05-02", "", "expense", "1"])).is_err());
        assert!(transaction_from_row(&row(&["t1", "May 2", "", "expense", "1"])).is_err());
        assert!(transaction_from_row(&row(&["t1", "2024-05-02", "", "gift", "1"])).is_err());
        assert!(transaction_from_row(&row(&["t1", "2024-05-02", "", "expense", "1.5"])).is_err());
        assert!(transaction_from_row(&row(&["t1", "2024-05-02", "", "expense", "-3"])).is_err());
    }

    #[test]
    fn test_transaction_from_row_rejects_out_of_range_amount() {
        for amount in ["1e30", "9223372036854775808", "9.3e18"] {
            let err = transaction_from_row(&row(&["t1", "2024-05-02", "", "expense", amount]))
                .unwrap_err();
            assert!(err.contains("out of range"), "{amount}: {err}");
        }
        let max = transaction_from_row(&row(&["t1", "2024-05-02", "", "expense", "9.2e18"]));
        assert_eq!(max.unwrap().amount, 9_200_000_000_000_000_000);
    }

    #[test]
    fn test_category_row_codec() {
        let category = Category {
            id: "c1".to_string(),
            name: "Rent".to_string(),
            kind: EntryKind::Expense,
            active: false,
            updated_at: "2024-01-01T00:00:00.000Z".to_string(),
        };
        let r = category_to_row(&category);
        assert_eq!(r[3], "FALSE");
        assert_eq!(category_from_row(&r).unwrap(), category);
    }

    #[test]
    fn test_category_active_parsing() {
        let parse = |flag: &str| category_from_row(&row(&["c1", "Rent", "expense", flag]));
        assert!(parse("true").unwrap().active);
        assert!(parse("TRUE").unwrap().active);
        assert!(parse("").unwrap().active);
        assert!(!parse("false").unwrap().active);
        assert!(parse("maybe").is_err());
    }

    #[test]
    fn test_value_range_cells_to_strings() {
        let body = r#"{"range":"Meta!A1:Z","majorDimension":"ROWS","values":[["key","value"],["count",3,true,null]]}"#;
        let range: ValueRange = serde_json::from_str(body).unwrap();
        let rows = range.into_rows();
        assert_eq!(rows[1], row(&["count", "3", "TRUE", ""]));
    }

    #[test]
    fn test_value_range_without_values() {
        let range: ValueRange = serde_json::from_str(r#"{"range":"Meta!A1:Z"}"#).unwrap();
        assert!(range.into_rows().is_empty());
    }

    #[test]
    fn test_spreadsheet_meta_lookup() {
        let body = r#"{"sheets":[{"properties":{"sheetId":0,"title":"Sheet1"}},{"properties":{"sheetId":42,"title":"Meta","index":1}}]}"#;
        let meta: SpreadsheetMeta = serde_json::from_str(body).unwrap();
        assert_eq!(meta.titles(), vec!["Sheet1", "Meta"]);
        assert_eq!(meta.sheet_id("Meta"), Some(42));
        assert_eq!(meta.sheet_id("Transactions"), None);
    }

    #[test]
    fn test_delete_row_request_shape() {
        let req = delete_row_request(7, 3);
        let range = &req["requests"][0]["deleteDimension"]["range"];
        assert_eq!(range["sheetId"], 7);
        assert_eq!(range["startIndex"], 3);
        assert_eq!(range["endIndex"], 4);
    }
}
