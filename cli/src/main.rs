mod commands;
mod config;
mod server;
mod sheets_client;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

use crate::commands::{
    TxArgs, cmd_backup, cmd_category_add, cmd_category_edit, cmd_category_list,
    cmd_category_set_active, cmd_connect, cmd_disconnect, cmd_restore, cmd_summary, cmd_sync_push,
    cmd_sync_status, cmd_tx_add, cmd_tx_delete, cmd_tx_edit, cmd_tx_list, lock, push_pending,
};
use crate::config::{Config, DEFAULT_SHEETS_ENDPOINT};
use crate::sheets_client::GoogleSheetsClient;
use tally_core::service::LedgerService;
use tally_core::sync::{RetryPolicy, SharedLedger, SyncEngine};

#[derive(Parser)]
#[command(
    name = "tally",
    version,
    about = "A local-first budget ledger that mirrors to a spreadsheet"
)]
struct Cli {
    /// Directory holding the ledger database and API key
    #[arg(long, global = true, env = "TALLY_DATA_DIR", value_name = "PATH")]
    data_dir: Option<PathBuf>,
    /// OAuth bearer token for the spreadsheet API
    #[arg(long, global = true, env = "TALLY_SHEETS_TOKEN", hide_env_values = true)]
    sheets_token: Option<String>,
    /// Base URL of the spreadsheet API
    #[arg(
        long,
        global = true,
        env = "TALLY_SHEETS_ENDPOINT",
        default_value = DEFAULT_SHEETS_ENDPOINT
    )]
    sheets_endpoint: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record, list, edit and delete transactions
    Tx {
        #[command(subcommand)]
        command: TxCommands,
    },
    /// Manage income and expense categories
    Category {
        #[command(subcommand)]
        command: CategoryCommands,
    },
    /// Show income, expense and per-category totals for a month
    Summary {
        /// Month to show (YYYY-MM, default: current month)
        month: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Connect to a spreadsheet and prepare its sheets
    Connect {
        /// Spreadsheet ID (from its URL)
        sheet_id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Forget the connected spreadsheet (local data is kept)
    Disconnect {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Overwrite the spreadsheet with the full local ledger
    Backup {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load the ledger from the spreadsheet
    Restore {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
        /// Merge with local data instead of replacing it
        #[arg(long)]
        merge: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect or push the queue of changes waiting to be mirrored
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },
    /// Start the REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
    },
}

#[derive(Subcommand)]
enum TxCommands {
    /// Record a transaction
    Add {
        /// Amount in whole currency units
        amount: i64,
        /// Category name or ID
        category: String,
        /// Type: income or expense
        #[arg(short = 't', long = "type", default_value = "expense")]
        kind: String,
        /// Date (YYYY-MM-DD or today/yesterday/tomorrow, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Free-form note
        #[arg(short, long)]
        memo: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List transactions, newest first
    List {
        /// Only show this month (YYYY-MM)
        #[arg(short, long)]
        month: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change fields of a transaction
    Edit {
        /// Transaction ID (or unique prefix)
        id: String,
        /// New amount
        #[arg(long)]
        amount: Option<i64>,
        /// New category name or ID
        #[arg(long)]
        category: Option<String>,
        /// New type: income or expense
        #[arg(short = 't', long = "type")]
        kind: Option<String>,
        /// New date (YYYY-MM-DD or today/yesterday/tomorrow)
        #[arg(long)]
        date: Option<String>,
        /// New memo
        #[arg(short, long, conflicts_with = "clear_memo")]
        memo: Option<String>,
        /// Remove the memo
        #[arg(long)]
        clear_memo: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a transaction
    Delete {
        /// Transaction ID (or unique prefix)
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CategoryCommands {
    /// Add a category
    Add {
        /// Category name
        name: String,
        /// Type: income or expense
        #[arg(short = 't', long = "type", default_value = "expense")]
        kind: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List categories
    List {
        /// Include deactivated categories
        #[arg(short, long)]
        all: bool,
        /// Only show this type: income or expense
        #[arg(short = 't', long = "type")]
        kind: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Rename a category or change its type
    Edit {
        /// Category ID (or unique prefix)
        id: String,
        /// New name
        #[arg(long)]
        name: Option<String>,
        /// New type: income or expense
        #[arg(short = 't', long = "type")]
        kind: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Hide a category from pickers and summaries (its transactions are kept)
    Deactivate {
        /// Category ID (or unique prefix)
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Reactivate a category
    Activate {
        /// Category ID (or unique prefix)
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SyncCommands {
    /// Show connection and queue state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mirror queued changes now
    Push {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("TALLY_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.data_dir)?;
    let ledger: SharedLedger = Arc::new(Mutex::new(LedgerService::open(&config.db_path)?));
    let workbook = Arc::new(GoogleSheetsClient::new(
        &cli.sheets_endpoint,
        cli.sheets_token,
    )?);
    let engine = Arc::new(SyncEngine::new(
        ledger.clone(),
        workbook,
        RetryPolicy::default(),
    ));

    match cli.command {
        Commands::Tx { command } => {
            match command {
                TxCommands::Add {
                    amount,
                    category,
                    kind,
                    date,
                    memo,
                    json,
                } => cmd_tx_add(
                    &lock(&ledger),
                    TxArgs {
                        date,
                        kind: Some(kind),
                        amount: Some(amount),
                        category: Some(category),
                        memo,
                    },
                    json,
                )?,
                TxCommands::List { month, json } => {
                    return cmd_tx_list(&lock(&ledger), month.as_deref(), json);
                }
                TxCommands::Edit {
                    id,
                    amount,
                    category,
                    kind,
                    date,
                    memo,
                    clear_memo,
                    json,
                } => cmd_tx_edit(
                    &lock(&ledger),
                    &id,
                    TxArgs {
                        date,
                        kind,
                        amount,
                        category,
                        memo,
                    },
                    clear_memo,
                    json,
                )?,
                TxCommands::Delete { id, json } => cmd_tx_delete(&lock(&ledger), &id, json)?,
            }
            push_pending(&engine).await;
            Ok(())
        }
        Commands::Category { command } => {
            match command {
                CategoryCommands::Add { name, kind, json } => {
                    cmd_category_add(&lock(&ledger), &name, &kind, json)?;
                }
                CategoryCommands::List { all, kind, json } => {
                    return cmd_category_list(&lock(&ledger), all, kind.as_deref(), json);
                }
                CategoryCommands::Edit {
                    id,
                    name,
                    kind,
                    json,
                } => cmd_category_edit(&lock(&ledger), &id, name, kind.as_deref(), json)?,
                CategoryCommands::Deactivate { id, json } => {
                    cmd_category_set_active(&lock(&ledger), &id, false, json)?;
                }
                CategoryCommands::Activate { id, json } => {
                    cmd_category_set_active(&lock(&ledger), &id, true, json)?;
                }
            }
            push_pending(&engine).await;
            Ok(())
        }
        Commands::Summary { month, json } => cmd_summary(&lock(&ledger), month, json),
        Commands::Connect { sheet_id, json } => cmd_connect(&engine, &sheet_id, json).await,
        Commands::Disconnect { json } => cmd_disconnect(&engine, json),
        Commands::Backup { json } => cmd_backup(&engine, json).await,
        Commands::Restore { yes, merge, json } => cmd_restore(&engine, yes, merge, json).await,
        Commands::Sync { command } => match command {
            SyncCommands::Status { json } => cmd_sync_status(&engine, json),
            SyncCommands::Push { json } => cmd_sync_push(&engine, json).await,
        },
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => {
            let (api_key, new_api_key) = if no_auth {
                (None, false)
            } else {
                let (key, new) = config.load_or_create_api_key()?;
                (Some(key), new)
            };
            server::start_server(ledger, engine, port, &bind, api_key, new_api_key).await
        }
    }
}
