use anyhow::Result;
use std::process;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use tally_core::service::LedgerService;

use super::helpers::{current_month, format_amount, print_json, truncate};

pub(crate) fn cmd_summary(ledger: &LedgerService, month: Option<String>, json: bool) -> Result<()> {
    let month = month.unwrap_or_else(current_month);
    let summary = ledger.monthly_summary(&month)?;

    if json {
        return print_json(&summary);
    }

    if summary.transaction_count == 0 {
        eprintln!("No transactions for {}", summary.month);
        process::exit(2);
    }

    #[derive(Tabled)]
    struct CategoryRow {
        #[tabled(rename = "Category")]
        name: String,
        #[tabled(rename = "Type")]
        kind: String,
        #[tabled(rename = "Count")]
        count: usize,
        #[tabled(rename = "Total")]
        total: String,
    }

    println!("=== {} ===\n", summary.month);
    let rows: Vec<CategoryRow> = summary
        .categories
        .iter()
        .map(|c| CategoryRow {
            name: truncate(&c.category_name, 30),
            kind: c.kind.to_string(),
            count: c.count,
            total: format_amount(c.total),
        })
        .collect();
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..4)).with(Alignment::right()))
        .to_string();
    println!("{table}\n");

    println!("  Income:  {:>12}", format_amount(summary.total_income));
    println!("  Expense: {:>12}", format_amount(summary.total_expense));
    println!("  Balance: {:>12}", format_amount(summary.balance));
    Ok(())
}
