//! In-process workbook, used for tests and local experiments.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::{MirrorError, MirrorResult};
use crate::sheets::{Row, Workbook};

type Sheets = BTreeMap<String, Vec<Row>>;

#[derive(Default)]
pub struct MemoryWorkbook {
    spreadsheets: Mutex<BTreeMap<String, Sheets>>,
    offline: AtomicBool,
    requests: AtomicUsize,
}

impl MemoryWorkbook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with a connectivity error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of calls made so far, including failed ones.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Current rows of a sheet, header included; empty when it does not exist.
    #[must_use]
    pub fn rows(&self, spreadsheet_id: &str, title: &str) -> Vec<Row> {
        self.lock()
            .get(spreadsheet_id)
            .and_then(|sheets| sheets.get(title))
            .cloned()
            .unwrap_or_default()
    }

    /// Overwrite a sheet's rows, creating it when missing.
    pub fn put_rows(&self, spreadsheet_id: &str, title: &str, rows: Vec<Row>) {
        self.lock()
            .entry(spreadsheet_id.to_string())
            .or_default()
            .insert(title.to_string(), rows);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Sheets>> {
        self.spreadsheets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check(&self) -> MirrorResult<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(MirrorError::Connectivity("workbook is offline".to_string()));
        }
        Ok(())
    }

    fn with_sheet<T>(
        &self,
        spreadsheet_id: &str,
        title: &str,
        f: impl FnOnce(&mut Vec<Row>) -> MirrorResult<T>,
    ) -> MirrorResult<T> {
        self.check()?;
        let mut guard = self.lock();
        let sheet = guard
            .get_mut(spreadsheet_id)
            .and_then(|sheets| sheets.get_mut(title))
            .ok_or_else(|| MirrorError::Api {
                status: 400,
                message: format!("Unable to parse range: {title}"),
            })?;
        f(sheet)
    }
}

#[async_trait]
impl Workbook for MemoryWorkbook {
    async fn sheet_titles(&self, spreadsheet_id: &str) -> MirrorResult<Vec<String>> {
        self.check()?;
        Ok(self
            .lock()
            .get(spreadsheet_id)
            .map(|sheets| sheets.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_sheet(&self, spreadsheet_id: &str, title: &str) -> MirrorResult<()> {
        self.check()?;
        let mut guard = self.lock();
        let sheets = guard.entry(spreadsheet_id.to_string()).or_default();
        if sheets.contains_key(title) {
            return Err(MirrorError::Api {
                status: 400,
                message: format!("A sheet with the name \"{title}\" already exists"),
            });
        }
        sheets.insert(title.to_string(), Vec::new());
        Ok(())
    }

    async fn read_rows(&self, spreadsheet_id: &str, title: &str) -> MirrorResult<Vec<Row>> {
        self.with_sheet(spreadsheet_id, title, |rows| Ok(rows.clone()))
    }

    async fn append_rows(
        &self,
        spreadsheet_id: &str,
        title: &str,
        new_rows: Vec<Row>,
    ) -> MirrorResult<()> {
        self.with_sheet(spreadsheet_id, title, |rows| {
            rows.extend(new_rows);
            Ok(())
        })
    }

    async fn update_row(
        &self,
        spreadsheet_id: &str,
        title: &str,
        index: usize,
        row: Row,
    ) -> MirrorResult<()> {
        self.with_sheet(spreadsheet_id, title, |rows| {
            if rows.len() <= index {
                rows.resize(index + 1, Vec::new());
            }
            rows[index] = row;
            Ok(())
        })
    }

    async fn delete_row(
        &self,
        spreadsheet_id: &str,
        title: &str,
        index: usize,
    ) -> MirrorResult<()> {
        self.with_sheet(spreadsheet_id, title, |rows| {
            if index >= rows.len() {
                return Err(MirrorError::Api {
                    status: 400,
                    message: format!("row {index} is out of range"),
                });
            }
            rows.remove(index);
            Ok(())
        })
    }

    async fn clear_rows(&self, spreadsheet_id: &str, title: &str, from: usize) -> MirrorResult<()> {
        self.with_sheet(spreadsheet_id, title, |rows| {
            rows.truncate(from);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|c| (*c).to_string()).collect()
    }

    #[tokio::test]
    async fn test_sheet_lifecycle() {
        let wb = MemoryWorkbook::new();
        wb.add_sheet("s1", "Meta").await.unwrap();
        assert!(wb.add_sheet("s1", "Meta").await.is_err());
        assert_eq!(wb.sheet_titles("s1").await.unwrap(), vec!["Meta"]);
        assert!(wb.sheet_titles("other").await.unwrap().is_empty());

        wb.append_rows("s1", "Meta", vec![row(&["key", "value"]), row(&["a", "1"])])
            .await
            .unwrap();
        wb.update_row("s1", "Meta", 1, row(&["a", "2"])).await.unwrap();
        wb.append_rows("s1", "Meta", vec![row(&["b", "3"])])
            .await
            .unwrap();
        wb.delete_row("s1", "Meta", 1).await.unwrap();
        assert_eq!(
            wb.read_rows("s1", "Meta").await.unwrap(),
            vec![row(&["key", "value"]), row(&["b", "3"])]
        );

        wb.clear_rows("s1", "Meta", 1).await.unwrap();
        assert_eq!(wb.rows("s1", "Meta"), vec![row(&["key", "value"])]);
    }

    #[tokio::test]
    async fn test_missing_sheet_is_an_api_error() {
        let wb = MemoryWorkbook::new();
        let err = wb.read_rows("s1", "Nope").await.unwrap_err();
        assert!(matches!(err, MirrorError::Api { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_offline_fails_with_connectivity() {
        let wb = MemoryWorkbook::new();
        wb.set_offline(true);
        let err = wb.sheet_titles("s1").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(wb.request_count(), 1);

        wb.set_offline(false);
        assert!(wb.sheet_titles("s1").await.is_ok());
    }
}
