mod category;
mod helpers;
mod summary;
mod sync;
mod transaction;

use std::sync::{MutexGuard, PoisonError};

use tally_core::service::LedgerService;
use tally_core::sync::SharedLedger;

pub(crate) use category::{
    cmd_category_add, cmd_category_edit, cmd_category_list, cmd_category_set_active,
};
pub(crate) use summary::cmd_summary;
pub(crate) use sync::{
    cmd_backup, cmd_connect, cmd_disconnect, cmd_restore, cmd_sync_push, cmd_sync_status,
    push_pending,
};
pub(crate) use transaction::{TxArgs, cmd_tx_add, cmd_tx_delete, cmd_tx_edit, cmd_tx_list};

pub(crate) fn lock(ledger: &SharedLedger) -> MutexGuard<'_, LedgerService> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}
