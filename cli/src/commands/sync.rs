use anyhow::Result;
use serde::Serialize;

use tally_core::models::OutboxEntry;
use tally_core::sync::{RestoreMode, RestorePreview, SyncEngine, SyncStatus};

use super::helpers::{print_json, prompt_confirm};

pub(crate) async fn cmd_connect(engine: &SyncEngine, sheet_id: &str, json: bool) -> Result<()> {
    let status = engine.connect(sheet_id).await?;
    if json {
        print_json(&status)?;
    } else {
        println!("Connected to spreadsheet {sheet_id}");
        println!("Run `tally backup` to copy your local ledger into it.");
    }
    Ok(())
}

pub(crate) fn cmd_disconnect(engine: &SyncEngine, json: bool) -> Result<()> {
    let dropped = engine.disconnect()?;
    if json {
        println!("{}", serde_json::json!({ "disconnected": true, "droppedOps": dropped }));
    } else {
        println!("Disconnected. Local data is unchanged.");
        if dropped > 0 {
            println!("Discarded {dropped} pending change(s) that had not been mirrored.");
        }
    }
    Ok(())
}

pub(crate) async fn cmd_backup(engine: &SyncEngine, json: bool) -> Result<()> {
    let report = engine.backup().await?;
    if json {
        print_json(&report)?;
    } else {
        println!(
            "Backed up {} transaction(s) and {} categor{} at {}",
            report.transactions,
            report.categories,
            if report.categories == 1 { "y" } else { "ies" },
            report.synced_at
        );
    }
    Ok(())
}

pub(crate) async fn cmd_restore(
    engine: &SyncEngine,
    yes: bool,
    merge: bool,
    json: bool,
) -> Result<()> {
    let mode = if merge {
        RestoreMode::Merge
    } else {
        RestoreMode::Replace
    };

    let outcome = engine
        .restore(mode, |preview| {
            print_preview(preview);
            if yes {
                return true;
            }
            let question = match preview.mode {
                RestoreMode::Replace => "Overwrite local data with the spreadsheet contents?",
                RestoreMode::Merge => "Merge the spreadsheet contents into local data?",
            };
            prompt_confirm(question).unwrap_or(false)
        })
        .await?;

    if json {
        print_json(&outcome)?;
    } else if outcome.applied {
        println!(
            "Restored: local ledger now has {} transaction(s) and {} categor{}",
            outcome.transactions,
            outcome.categories,
            if outcome.categories == 1 { "y" } else { "ies" }
        );
    } else {
        println!("Restore cancelled. Local data is unchanged.");
    }
    Ok(())
}

fn print_preview(preview: &RestorePreview) {
    eprintln!(
        "Spreadsheet: {} transaction(s), {} category(ies)",
        preview.remote_transactions, preview.remote_categories
    );
    eprintln!(
        "Local:       {} transaction(s), {} category(ies)",
        preview.local_transactions, preview.local_categories
    );
    if let Some(at) = &preview.remote_last_sync_at {
        eprintln!("Last backup: {at}");
    }
}

pub(crate) fn cmd_sync_status(engine: &SyncEngine, json: bool) -> Result<()> {
    let status = engine.status()?;
    if json {
        #[derive(Serialize)]
        struct StatusWithOutbox {
            #[serde(flatten)]
            status: SyncStatus,
            outbox: Vec<OutboxEntry>,
        }
        return print_json(&StatusWithOutbox {
            status,
            outbox: engine.pending_ops()?,
        });
    }

    match &status.sheet_id {
        Some(id) if status.connected => println!("Spreadsheet: {id}"),
        _ => println!("Spreadsheet: not connected (run `tally connect <sheet-id>`)"),
    }
    println!("Last sync:   {}", status.last_sync_at.as_deref().unwrap_or("never"));
    println!("Pending:     {}", status.pending_count);
    if let Some(err) = &status.last_error {
        println!("Last error:  {err}");
    }
    Ok(())
}

pub(crate) async fn cmd_sync_push(engine: &SyncEngine, json: bool) -> Result<()> {
    let report = engine.drain().await?;
    if json {
        print_json(&report)?;
    } else {
        println!(
            "Mirrored {} change(s), dropped {}, retrying {}; {} still pending",
            report.applied, report.dropped, report.deferred, report.remaining
        );
    }
    Ok(())
}

/// Best-effort push after a local change. Failures stay queued for later.
pub(crate) async fn push_pending(engine: &SyncEngine) {
    match engine.drain().await {
        Ok(report) if report.remaining > 0 => {
            eprintln!(
                "Note: {} change(s) not yet mirrored; see `tally sync status`",
                report.remaining
            );
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("could not mirror local changes: {e:#}"),
    }
}
