//! Single read/write gateway over the persisted ledger collections.
//!
//! Each collection is stored as one JSON blob under a fixed key. Reads
//! never fail on bad content: a malformed blob reads as empty. Reads also
//! deduplicate by id and write the repaired collection back.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::db::Database;
use crate::dedup::dedupe_latest;
use crate::models::{Category, Snapshot, SyncMeta, Transaction};

pub const TRANSACTIONS_KEY: &str = "tally:transactions";
pub const CATEGORIES_KEY: &str = "tally:categories";
pub const SYNC_META_KEY: &str = "tally:sync_meta";

pub struct LocalStore {
    db: Database,
}

impl LocalStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            db: Database::open(path)?,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Database::open_in_memory()?,
        })
    }

    /// Underlying database, used for outbox bookkeeping.
    #[must_use]
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn read(&self) -> Result<Snapshot> {
        let raw_transactions: Vec<Transaction> = self.read_collection(TRANSACTIONS_KEY)?;
        let raw_categories: Vec<Category> = self.read_collection(CATEGORIES_KEY)?;

        let (tx_before, cat_before) = (raw_transactions.len(), raw_categories.len());
        let transactions = dedupe_latest(raw_transactions);
        let categories = dedupe_latest(raw_categories);

        let mut repairs: Vec<(&str, String)> = Vec::new();
        if transactions.len() != tx_before {
            tracing::info!(
                before = tx_before,
                after = transactions.len(),
                "removed duplicate transactions from local store"
            );
            repairs.push((TRANSACTIONS_KEY, to_blob(&transactions)?));
        }
        if categories.len() != cat_before {
            tracing::info!(
                before = cat_before,
                after = categories.len(),
                "removed duplicate categories from local store"
            );
            repairs.push((CATEGORIES_KEY, to_blob(&categories)?));
        }
        if !repairs.is_empty() {
            let entries: Vec<(&str, &str)> =
                repairs.iter().map(|(k, v)| (*k, v.as_str())).collect();
            self.db
                .set_values(&entries)
                .context("Failed to persist repaired collections")?;
        }

        let meta = self.read_meta()?;
        Ok(Snapshot {
            transactions,
            categories,
            meta,
        })
    }

    /// Replace both collections in one transaction, stamping `lastSyncAt` when given.
    pub fn write(
        &self,
        transactions: &[Transaction],
        categories: &[Category],
        last_sync_at: Option<&str>,
    ) -> Result<()> {
        let tx_blob = to_blob(transactions)?;
        let cat_blob = to_blob(categories)?;

        let meta_blob = match last_sync_at {
            Some(ts) => {
                let mut meta = self.read_meta()?;
                meta.last_sync_at = Some(ts.to_string());
                Some(to_blob(&meta)?)
            }
            None => None,
        };

        let mut entries = vec![
            (TRANSACTIONS_KEY, tx_blob.as_str()),
            (CATEGORIES_KEY, cat_blob.as_str()),
        ];
        if let Some(meta_blob) = &meta_blob {
            entries.push((SYNC_META_KEY, meta_blob.as_str()));
        }
        self.db.set_values(&entries)
    }

    pub fn read_meta(&self) -> Result<SyncMeta> {
        let mut meta = match self.db.get_value(SYNC_META_KEY)? {
            Some(raw) => serde_json::from_str::<SyncMeta>(&raw).unwrap_or_else(|e| {
                tracing::warn!("ignoring malformed sync metadata: {e}");
                SyncMeta::default()
            }),
            None => SyncMeta::default(),
        };
        meta.pending_count = self.db.outbox_len()?;
        Ok(meta)
    }

    pub fn write_meta(&self, meta: &SyncMeta) -> Result<()> {
        self.db.set_value(SYNC_META_KEY, &to_blob(meta)?)
    }

    fn read_collection<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>> {
        let Some(raw) = self.db.get_value(key)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str::<Vec<T>>(&raw) {
            Ok(items) => Ok(items),
            Err(e) => {
                tracing::warn!(key, "treating malformed stored collection as empty: {e}");
                Ok(Vec::new())
            }
        }
    }
}

fn to_blob<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to serialize stored collection")
}
