use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use crate::models::{
    Category, CategoryFilter, CategoryTotal, EntryKind, MirrorOp, MonthlySummary, NewCategory,
    NewTransaction, Snapshot, SyncMeta, Transaction, UNKNOWN_CATEGORY, UpdateCategory,
    UpdateTransaction, month_of, normalize_memo, now_timestamp, validate_amount,
    validate_category_name, validate_month,
};
use crate::store::LocalStore;

/// Ledger operations over the local store.
///
/// Every mutation is written locally first. While a spreadsheet is
/// connected the change is also queued in the outbox for mirroring; a
/// queueing failure is logged and never fails the local mutation.
pub struct LedgerService {
    store: LocalStore,
}

impl LedgerService {
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self {
            store: LocalStore::open(db_path)?,
        })
    }

    pub fn new_in_memory() -> Result<Self> {
        Ok(Self {
            store: LocalStore::open_in_memory()?,
        })
    }

    #[must_use]
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        self.store.read()
    }

    pub fn sync_meta(&self) -> Result<SyncMeta> {
        self.store.read_meta()
    }

    // --- Transactions ---

    pub fn create_transaction(&self, new: &NewTransaction) -> Result<Transaction> {
        validate_amount(new.amount)?;
        let category_id = new.category_id.trim();
        if category_id.is_empty() {
            bail!("Category is required");
        }

        let tx = Transaction {
            id: Uuid::new_v4().to_string(),
            date: new.date.format("%Y-%m-%d").to_string(),
            month: month_of(new.date),
            kind: new.kind,
            amount: new.amount,
            category_id: category_id.to_string(),
            memo: normalize_memo(new.memo.clone())?,
            updated_at: now_timestamp(),
        };

        let mut snap = self.store.read()?;
        snap.transactions.push(tx.clone());
        self.store.write(&snap.transactions, &snap.categories, None)?;
        tracing::debug!(id = %tx.id, "created transaction");

        self.record(&MirrorOp::UpsertTransaction {
            transaction: tx.clone(),
        });
        Ok(tx)
    }

    pub fn update_transaction(&self, id: &str, update: &UpdateTransaction) -> Result<Transaction> {
        if update.is_empty() {
            bail!("Nothing to update");
        }
        let mut snap = self.store.read()?;
        let tx = snap
            .transactions
            .iter_mut()
            .find(|t| t.id == id)
            .with_context(|| format!("Transaction {id} not found"))?;

        if let Some(date) = update.date {
            tx.date = date.format("%Y-%m-%d").to_string();
        }
        if let Some(kind) = update.kind {
            tx.kind = kind;
        }
        if let Some(amount) = update.amount {
            validate_amount(amount)?;
            tx.amount = amount;
        }
        if let Some(category_id) = &update.category_id {
            let category_id = category_id.trim();
            if category_id.is_empty() {
                bail!("Category is required");
            }
            tx.category_id = category_id.to_string();
        }
        if let Some(memo) = &update.memo {
            tx.memo = normalize_memo(memo.clone())?;
        }
        tx.normalize_month();
        tx.updated_at = now_timestamp();
        let updated = tx.clone();

        self.store.write(&snap.transactions, &snap.categories, None)?;
        self.record(&MirrorOp::UpsertTransaction {
            transaction: updated.clone(),
        });
        Ok(updated)
    }

    /// Hard-delete a transaction. Returns whether it existed.
    pub fn delete_transaction(&self, id: &str) -> Result<bool> {
        let mut snap = self.store.read()?;
        let before = snap.transactions.len();
        snap.transactions.retain(|t| t.id != id);
        if snap.transactions.len() == before {
            return Ok(false);
        }
        self.store.write(&snap.transactions, &snap.categories, None)?;
        self.record(&MirrorOp::DeleteTransaction { id: id.to_string() });
        Ok(true)
    }

    pub fn get_transaction(&self, id: &str) -> Result<Option<Transaction>> {
        Ok(self
            .store
            .read()?
            .transactions
            .into_iter()
            .find(|t| t.id == id))
    }

    /// Transactions, newest date first, optionally limited to one `YYYY-MM` month.
    pub fn list_transactions(&self, month: Option<&str>) -> Result<Vec<Transaction>> {
        let month = month.map(validate_month).transpose()?;
        let mut transactions: Vec<Transaction> = self
            .store
            .read()?
            .transactions
            .into_iter()
            .filter(|t| month.as_ref().is_none_or(|m| &t.month == m))
            .collect();
        transactions.sort_by(|a, b| {
            b.date
                .cmp(&a.date)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        Ok(transactions)
    }

    // --- Categories ---

    pub fn create_category(&self, new: &NewCategory) -> Result<Category> {
        let name = validate_category_name(&new.name)?;
        let mut snap = self.store.read()?;
        ensure_unique_name(&snap.categories, &name, new.kind, None)?;

        let category = Category {
            id: Uuid::new_v4().to_string(),
            name,
            kind: new.kind,
            active: true,
            updated_at: now_timestamp(),
        };
        snap.categories.push(category.clone());
        self.store.write(&snap.transactions, &snap.categories, None)?;

        self.record(&MirrorOp::UpsertCategory {
            category: category.clone(),
        });
        Ok(category)
    }

    pub fn update_category(&self, id: &str, update: &UpdateCategory) -> Result<Category> {
        let mut snap = self.store.read()?;
        let current = snap
            .categories
            .iter()
            .find(|c| c.id == id)
            .with_context(|| format!("Category {id} not found"))?
            .clone();

        let name = match &update.name {
            Some(name) => validate_category_name(name)?,
            None => current.name.clone(),
        };
        let kind = update.kind.unwrap_or(current.kind);
        let active = update.active.unwrap_or(current.active);
        if active {
            ensure_unique_name(&snap.categories, &name, kind, Some(id))?;
        }

        let updated = Category {
            id: current.id,
            name,
            kind,
            active,
            updated_at: now_timestamp(),
        };
        if let Some(slot) = snap.categories.iter_mut().find(|c| c.id == id) {
            *slot = updated.clone();
        }
        self.store.write(&snap.transactions, &snap.categories, None)?;

        self.record(&MirrorOp::UpsertCategory {
            category: updated.clone(),
        });
        Ok(updated)
    }

    /// Soft delete: the category stays stored with `active = false`.
    pub fn deactivate_category(&self, id: &str) -> Result<Category> {
        self.update_category(
            id,
            &UpdateCategory {
                active: Some(false),
                ..UpdateCategory::default()
            },
        )
    }

    pub fn get_category(&self, id: &str) -> Result<Option<Category>> {
        Ok(self
            .store
            .read()?
            .categories
            .into_iter()
            .find(|c| c.id == id))
    }

    pub fn list_categories(&self, filter: CategoryFilter) -> Result<Vec<Category>> {
        let mut categories: Vec<Category> = self
            .store
            .read()?
            .categories
            .into_iter()
            .filter(|c| filter.include_inactive || c.active)
            .filter(|c| filter.kind.is_none_or(|k| c.kind == k))
            .collect();
        categories.sort_by(|a, b| {
            a.kind
                .as_str()
                .cmp(b.kind.as_str())
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        Ok(categories)
    }

    /// Find a category by exact id, or by case-insensitive name among active ones.
    pub fn resolve_category(&self, query: &str, kind: Option<EntryKind>) -> Result<Category> {
        let categories = self.store.read()?.categories;
        if let Some(category) = categories.iter().find(|c| c.id == query) {
            return Ok(category.clone());
        }

        let needle = query.trim().to_lowercase();
        let matches: Vec<&Category> = categories
            .iter()
            .filter(|c| c.active && c.name.to_lowercase() == needle)
            .filter(|c| kind.is_none_or(|k| c.kind == k))
            .collect();
        match matches.as_slice() {
            [] => bail!("No active category named '{query}'"),
            [one] => Ok((*one).clone()),
            _ => bail!("Category name '{query}' is ambiguous; pass --type or use the id"),
        }
    }

    // --- Summary ---

    pub fn monthly_summary(&self, month: &str) -> Result<MonthlySummary> {
        let month = validate_month(month)?;
        let snap = self.store.read()?;
        let names: HashMap<&str, &str> = snap
            .categories
            .iter()
            .filter(|c| c.active)
            .map(|c| (c.id.as_str(), c.name.as_str()))
            .collect();

        let mut total_income = 0_i64;
        let mut total_expense = 0_i64;
        let mut transaction_count = 0_usize;
        let mut by_category: HashMap<(String, EntryKind), CategoryTotal> = HashMap::new();

        for tx in snap.transactions.iter().filter(|t| t.month == month) {
            transaction_count += 1;
            let total = match tx.kind {
                EntryKind::Income => &mut total_income,
                EntryKind::Expense => &mut total_expense,
            };
            *total = checked_total(*total, tx.amount, &month)?;
            let entry = by_category
                .entry((tx.category_id.clone(), tx.kind))
                .or_insert_with(|| CategoryTotal {
                    category_id: tx.category_id.clone(),
                    category_name: names
                        .get(tx.category_id.as_str())
                        .copied()
                        .unwrap_or(UNKNOWN_CATEGORY)
                        .to_string(),
                    kind: tx.kind,
                    total: 0,
                    count: 0,
                });
            entry.total = checked_total(entry.total, tx.amount, &month)?;
            entry.count += 1;
        }

        let mut categories: Vec<CategoryTotal> = by_category.into_values().collect();
        categories.sort_by_key(|c| (c.kind.as_str(), Reverse(c.total), c.category_name.clone()));

        let balance = total_income
            .checked_sub(total_expense)
            .with_context(|| format!("Totals overflow for {month}"))?;
        Ok(MonthlySummary {
            month,
            total_income,
            total_expense,
            balance,
            transaction_count,
            categories,
        })
    }

    // --- Outbox ---

    fn record(&self, op: &MirrorOp) {
        let connected = match self.store.read_meta() {
            Ok(meta) => meta.is_connected(),
            Err(e) => {
                tracing::warn!("could not read sync metadata, change not queued: {e:#}");
                return;
            }
        };
        if !connected {
            return;
        }
        if let Err(e) = self.store.db().enqueue_op(op) {
            tracing::warn!(
                entity = op.entity(),
                id = op.entity_id(),
                "failed to queue change for mirroring: {e:#}"
            );
        }
    }
}

fn checked_total(total: i64, amount: i64, month: &str) -> Result<i64> {
    total
        .checked_add(amount)
        .with_context(|| format!("Totals overflow for {month}"))
}

fn ensure_unique_name(
    categories: &[Category],
    name: &str,
    kind: EntryKind,
    exclude_id: Option<&str>,
) -> Result<()> {
    let lower = name.to_lowercase();
    let clash = categories.iter().any(|c| {
        c.active
            && c.kind == kind
            && Some(c.id.as_str()) != exclude_id
            && c.name.to_lowercase() == lower
    });
    if clash {
        bail!("An active {kind} category named '{name}' already exists");
    }
    Ok(())
}
