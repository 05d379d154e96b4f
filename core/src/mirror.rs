//! Remote spreadsheet mirror of the ledger.
//!
//! Entity lookups re-read the whole sheet and scan for the id, so every
//! single-entity write costs one full read. That is fine for a personal
//! ledger of a few thousand rows and no further.

use std::sync::Arc;

use crate::dedup::dedupe_latest;
use crate::error::{MirrorError, MirrorResult};
use crate::models::{Category, MirrorOp, Transaction};
use crate::sheets::{
    LAST_SYNC_AT_KEY, Row, SheetName, Workbook, category_from_row, category_to_row,
    transaction_from_row, transaction_to_row,
};

/// Everything read back from the mirror in one pass.
#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    pub transactions: Vec<Transaction>,
    pub categories: Vec<Category>,
    pub last_sync_at: Option<String>,
}

#[derive(Clone)]
pub struct SheetMirror {
    workbook: Arc<dyn Workbook>,
    spreadsheet_id: String,
}

impl SheetMirror {
    pub fn new(workbook: Arc<dyn Workbook>, spreadsheet_id: impl Into<String>) -> Self {
        Self {
            workbook,
            spreadsheet_id: spreadsheet_id.into(),
        }
    }

    /// Create missing sheets and make sure each starts with its header row.
    /// Safe to call repeatedly.
    pub async fn initialize(&self) -> MirrorResult<()> {
        let titles = self.workbook.sheet_titles(&self.spreadsheet_id).await?;
        for sheet in SheetName::ALL {
            if !titles.iter().any(|t| t == sheet.title()) {
                tracing::info!(sheet = sheet.title(), "creating sheet");
                self.workbook
                    .add_sheet(&self.spreadsheet_id, sheet.title())
                    .await?;
            }

            let rows = self.rows(sheet).await?;
            let header = sheet.header_row();
            match rows.first() {
                None => {
                    self.workbook
                        .append_rows(&self.spreadsheet_id, sheet.title(), vec![header])
                        .await?;
                }
                Some(first) if !header_matches(first, &header) => {
                    tracing::warn!(sheet = sheet.title(), "rewriting unexpected header row");
                    self.workbook
                        .update_row(&self.spreadsheet_id, sheet.title(), 0, header)
                        .await?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    // --- Transactions ---

    pub async fn list_transactions(&self) -> MirrorResult<Vec<Transaction>> {
        let rows = self.rows(SheetName::Transactions).await?;
        Ok(decode_rows(SheetName::Transactions, &rows, transaction_from_row))
    }

    pub async fn add_or_update_transaction(&self, tx: &Transaction) -> MirrorResult<()> {
        let row = transaction_to_row(tx);
        match self.find_row(SheetName::Transactions, &tx.id).await? {
            Some(index) => self.write_row(SheetName::Transactions, index, row).await,
            None => self.append(SheetName::Transactions, vec![row]).await,
        }
    }

    pub async fn update_transaction(&self, tx: &Transaction) -> MirrorResult<()> {
        let index = self
            .find_row(SheetName::Transactions, &tx.id)
            .await?
            .ok_or_else(|| not_found("transaction", &tx.id))?;
        self.write_row(SheetName::Transactions, index, transaction_to_row(tx))
            .await
    }

    pub async fn delete_transaction(&self, id: &str) -> MirrorResult<()> {
        let index = self
            .find_row(SheetName::Transactions, id)
            .await?
            .ok_or_else(|| not_found("transaction", id))?;
        self.workbook
            .delete_row(&self.spreadsheet_id, SheetName::Transactions.title(), index)
            .await
    }

    // --- Categories ---

    pub async fn list_categories(&self) -> MirrorResult<Vec<Category>> {
        let rows = self.rows(SheetName::Categories).await?;
        Ok(decode_rows(SheetName::Categories, &rows, category_from_row))
    }

    pub async fn add_or_update_category(&self, category: &Category) -> MirrorResult<()> {
        let row = category_to_row(category);
        match self.find_row(SheetName::Categories, &category.id).await? {
            Some(index) => self.write_row(SheetName::Categories, index, row).await,
            None => self.append(SheetName::Categories, vec![row]).await,
        }
    }

    pub async fn update_category(&self, category: &Category) -> MirrorResult<()> {
        let index = self
            .find_row(SheetName::Categories, &category.id)
            .await?
            .ok_or_else(|| not_found("category", &category.id))?;
        self.write_row(SheetName::Categories, index, category_to_row(category))
            .await
    }

    // --- Meta ---

    pub async fn get_meta(&self, key: &str) -> MirrorResult<Option<String>> {
        let rows = self.rows(SheetName::Meta).await?;
        Ok(rows
            .iter()
            .skip(1)
            .find(|row| row.first().is_some_and(|k| k == key))
            .map(|row| row.get(1).cloned().unwrap_or_default()))
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> MirrorResult<()> {
        let row = vec![key.to_string(), value.to_string()];
        match self.find_row(SheetName::Meta, key).await? {
            Some(index) => self.write_row(SheetName::Meta, index, row).await,
            None => self.append(SheetName::Meta, vec![row]).await,
        }
    }

    // --- Bulk ---

    /// Destructively replace all mirrored data rows with the given collections.
    /// Headers and the meta sheet are left alone.
    pub async fn replace_all(
        &self,
        transactions: &[Transaction],
        categories: &[Category],
    ) -> MirrorResult<()> {
        let tx_rows: Vec<Row> = transactions.iter().map(transaction_to_row).collect();
        let cat_rows: Vec<Row> = categories.iter().map(category_to_row).collect();

        for (sheet, rows) in [
            (SheetName::Transactions, tx_rows),
            (SheetName::Categories, cat_rows),
        ] {
            self.workbook
                .clear_rows(&self.spreadsheet_id, sheet.title(), 1)
                .await?;
            if !rows.is_empty() {
                self.append(sheet, rows).await?;
            }
        }
        Ok(())
    }

    /// Read every mirrored entity, deduplicated by id.
    pub async fn fetch_snapshot(&self) -> MirrorResult<RemoteSnapshot> {
        let transactions = dedupe_latest(self.list_transactions().await?);
        let categories = dedupe_latest(self.list_categories().await?);
        let last_sync_at = self
            .get_meta(LAST_SYNC_AT_KEY)
            .await?
            .filter(|v| !v.is_empty());
        Ok(RemoteSnapshot {
            transactions,
            categories,
            last_sync_at,
        })
    }

    /// Mirror one queued local change.
    pub async fn apply(&self, op: &MirrorOp) -> MirrorResult<()> {
        match op {
            MirrorOp::UpsertTransaction { transaction } => {
                self.add_or_update_transaction(transaction).await
            }
            MirrorOp::DeleteTransaction { id } => self.delete_transaction(id).await,
            MirrorOp::UpsertCategory { category } => self.add_or_update_category(category).await,
        }
    }

    async fn rows(&self, sheet: SheetName) -> MirrorResult<Vec<Row>> {
        self.workbook
            .read_rows(&self.spreadsheet_id, sheet.title())
            .await
    }

    async fn append(&self, sheet: SheetName, rows: Vec<Row>) -> MirrorResult<()> {
        self.workbook
            .append_rows(&self.spreadsheet_id, sheet.title(), rows)
            .await
    }

    async fn write_row(&self, sheet: SheetName, index: usize, row: Row) -> MirrorResult<()> {
        self.workbook
            .update_row(&self.spreadsheet_id, sheet.title(), index, row)
            .await
    }

    /// Row index of the first data row whose first cell equals `key`.
    async fn find_row(&self, sheet: SheetName, key: &str) -> MirrorResult<Option<usize>> {
        let rows = self.rows(sheet).await?;
        Ok(rows
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, row)| row.first().is_some_and(|id| id == key))
            .map(|(index, _)| index))
    }
}

fn header_matches(actual: &Row, expected: &Row) -> bool {
    actual.len() >= expected.len()
        && actual
            .iter()
            .zip(expected)
            .all(|(a, e)| a.trim() == e.as_str())
}

fn not_found(entity: &'static str, id: &str) -> MirrorError {
    MirrorError::NotFound {
        entity,
        id: id.to_string(),
    }
}

/// Decode data rows, skipping blank and malformed ones.
fn decode_rows<T>(
    sheet: SheetName,
    rows: &[Row],
    decode: impl Fn(&[String]) -> Result<T, String>,
) -> Vec<T> {
    rows.iter()
        .enumerate()
        .skip(1)
        .filter(|(_, row)| row.iter().any(|c| !c.trim().is_empty()))
        .filter_map(|(index, row)| match decode(row) {
            Ok(item) => Some(item),
            Err(reason) => {
                let err = MirrorError::MalformedRow {
                    sheet: sheet.title().to_string(),
                    row: index + 1,
                    reason,
                };
                tracing::warn!("skipping {err}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryWorkbook;
    use crate::models::EntryKind;

    const SHEET: &str = "sheet-1";

    fn setup() -> (Arc<MemoryWorkbook>, SheetMirror) {
        let wb = Arc::new(MemoryWorkbook::new());
        let mirror = SheetMirror::new(wb.clone(), SHEET);
        (wb, mirror)
    }

    fn tx(id: &str, amount: i64) -> Transaction {
        Transaction {
            id: id.to_string(),
            date: "2024-02-10".to_string(),
            month: "2024-02".to_string(),
            kind: EntryKind::Expense,
            amount,
            category_id: "c1".to_string(),
            memo: None,
            updated_at: "2024-02-10T00:00:00.000Z".to_string(),
        }
    }

    fn cat(id: &str, name: &str) -> Category {
        Category {
            id: id.to_string(),
            name: name.to_string(),
            kind: EntryKind::Expense,
            active: true,
            updated_at: "2024-02-01T00:00:00.000Z".to_string(),
        }
    }

    #[tokio::test]
    async fn test_initialize_creates_sheets_with_headers() {
        let (wb, mirror) = setup();
        mirror.initialize().await.unwrap();
        for sheet in SheetName::ALL {
            assert_eq!(wb.rows(SHEET, sheet.title()), vec![sheet.header_row()]);
        }
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (wb, mirror) = setup();
        mirror.initialize().await.unwrap();
        mirror.add_or_update_transaction(&tx("t1", 5)).await.unwrap();
        mirror.initialize().await.unwrap();
        assert_eq!(wb.rows(SHEET, "Transactions").len(), 2);
        assert_eq!(wb.rows(SHEET, "Meta").len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_repairs_wrong_header() {
        let (wb, mirror) = setup();
        wb.put_rows(SHEET, "Categories", vec![vec!["junk".to_string()]]);
        mirror.initialize().await.unwrap();
        assert_eq!(
            wb.rows(SHEET, "Categories")[0],
            SheetName::Categories.header_row()
        );
    }

    #[tokio::test]
    async fn test_add_or_update_appends_then_updates() {
        let (wb, mirror) = setup();
        mirror.initialize().await.unwrap();

        mirror.add_or_update_transaction(&tx("t1", 100)).await.unwrap();
        mirror.add_or_update_transaction(&tx("t2", 200)).await.unwrap();
        mirror.add_or_update_transaction(&tx("t1", 150)).await.unwrap();

        let rows = wb.rows(SHEET, "Transactions");
        assert_eq!(rows.len(), 3);
        let listed = mirror.list_transactions().await.unwrap();
        assert_eq!(listed[0].amount, 150);
        assert_eq!(listed[1].amount, 200);
    }

    #[tokio::test]
    async fn test_update_and_delete_report_not_found() {
        let (_wb, mirror) = setup();
        mirror.initialize().await.unwrap();

        let err = mirror.update_transaction(&tx("ghost", 1)).await.unwrap_err();
        assert!(err.is_not_found());
        let err = mirror.delete_transaction("ghost").await.unwrap_err();
        assert!(err.is_not_found());
        let err = mirror.update_category(&cat("ghost", "x")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_transaction_removes_row() {
        let (_wb, mirror) = setup();
        mirror.initialize().await.unwrap();
        mirror.add_or_update_transaction(&tx("t1", 1)).await.unwrap();
        mirror.add_or_update_transaction(&tx("t2", 2)).await.unwrap();

        mirror.delete_transaction("t1").await.unwrap();
        let ids: Vec<String> = mirror
            .list_transactions()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["t2"]);
    }

    #[tokio::test]
    async fn test_list_skips_malformed_rows() {
        let (wb, mirror) = setup();
        mirror.initialize().await.unwrap();
        let mut rows = wb.rows(SHEET, "Transactions");
        rows.push(transaction_to_row(&tx("t1", 1)));
        rows.push(vec!["t2".into(), "not-a-date".into()]);
        rows.push(Vec::new());
        rows.push(transaction_to_row(&tx("t3", 3)));
        wb.put_rows(SHEET, "Transactions", rows);

        let listed = mirror.list_transactions().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].id, "t3");
    }

    #[tokio::test]
    async fn test_meta_get_set() {
        let (wb, mirror) = setup();
        mirror.initialize().await.unwrap();
        assert_eq!(mirror.get_meta(LAST_SYNC_AT_KEY).await.unwrap(), None);

        mirror.set_meta(LAST_SYNC_AT_KEY, "a").await.unwrap();
        mirror.set_meta(LAST_SYNC_AT_KEY, "b").await.unwrap();
        assert_eq!(
            mirror.get_meta(LAST_SYNC_AT_KEY).await.unwrap().as_deref(),
            Some("b")
        );
        assert_eq!(wb.rows(SHEET, "Meta").len(), 2);
    }

    #[tokio::test]
    async fn test_replace_all_and_fetch_snapshot() {
        let (_wb, mirror) = setup();
        mirror.initialize().await.unwrap();
        mirror.add_or_update_transaction(&tx("old", 9)).await.unwrap();
        mirror.set_meta(LAST_SYNC_AT_KEY, "2024-03-01T00:00:00.000Z").await.unwrap();

        mirror
            .replace_all(&[tx("t1", 1), tx("t2", 2)], &[cat("c1", "Food")])
            .await
            .unwrap();

        let snap = mirror.fetch_snapshot().await.unwrap();
        let ids: Vec<&str> = snap.transactions.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
        assert_eq!(snap.categories.len(), 1);
        assert_eq!(snap.last_sync_at.as_deref(), Some("2024-03-01T00:00:00.000Z"));
    }

    #[tokio::test]
    async fn test_replace_all_with_empty_collections() {
        let (wb, mirror) = setup();
        mirror.initialize().await.unwrap();
        mirror.add_or_update_category(&cat("c1", "Food")).await.unwrap();

        mirror.replace_all(&[], &[]).await.unwrap();
        assert_eq!(
            wb.rows(SHEET, "Categories"),
            vec![SheetName::Categories.header_row()]
        );
    }

    #[tokio::test]
    async fn test_fetch_snapshot_dedups_remote_rows() {
        let (wb, mirror) = setup();
        mirror.initialize().await.unwrap();
        let mut newer = tx("t1", 2);
        newer.updated_at = "2024-02-11T00:00:00.000Z".to_string();
        let mut rows = wb.rows(SHEET, "Transactions");
        rows.push(transaction_to_row(&tx("t1", 1)));
        rows.push(transaction_to_row(&newer));
        wb.put_rows(SHEET, "Transactions", rows);

        let snap = mirror.fetch_snapshot().await.unwrap();
        assert_eq!(snap.transactions.len(), 1);
        assert_eq!(snap.transactions[0].amount, 2);
    }

    #[tokio::test]
    async fn test_apply_ops() {
        let (_wb, mirror) = setup();
        mirror.initialize().await.unwrap();

        mirror
            .apply(&MirrorOp::UpsertTransaction {
                transaction: tx("t1", 1),
            })
            .await
            .unwrap();
        mirror
            .apply(&MirrorOp::UpsertCategory {
                category: cat("c1", "Food"),
            })
            .await
            .unwrap();
        mirror
            .apply(&MirrorOp::DeleteTransaction {
                id: "t1".to_string(),
            })
            .await
            .unwrap();

        assert!(mirror.list_transactions().await.unwrap().is_empty());
        assert_eq!(mirror.list_categories().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_surfaces_connectivity_error() {
        let (wb, mirror) = setup();
        wb.set_offline(true);
        let err = mirror.initialize().await.unwrap_err();
        assert!(matches!(err, MirrorError::Connectivity(_)));
    }
}
