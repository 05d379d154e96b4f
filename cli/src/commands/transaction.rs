use anyhow::{Result, bail};
use std::collections::HashMap;
use std::process;

use tally_core::models::{
    CategoryFilter, NewTransaction, UNKNOWN_CATEGORY, UpdateTransaction, parse_kind,
    validate_month,
};
use tally_core::service::LedgerService;

use super::helpers::{
    format_amount, json_error, parse_date, print_json, print_transaction_table, resolve_id,
    short_id,
};

pub(crate) struct TxArgs {
    pub date: Option<String>,
    pub kind: Option<String>,
    pub amount: Option<i64>,
    pub category: Option<String>,
    pub memo: Option<String>,
}

pub(crate) fn cmd_tx_add(ledger: &LedgerService, args: TxArgs, json: bool) -> Result<()> {
    let kind = parse_kind(args.kind.as_deref().unwrap_or("expense"))?;
    let Some(amount) = args.amount else {
        bail!("Amount is required");
    };
    let Some(category) = args.category else {
        bail!("Category is required (name or id)");
    };
    let category = ledger.resolve_category(&category, Some(kind))?;
    if category.kind != kind {
        bail!(
            "Category '{}' is an {} category, not {kind}",
            category.name,
            category.kind
        );
    }

    let tx = ledger.create_transaction(&NewTransaction {
        date: parse_date(args.date)?,
        kind,
        amount,
        category_id: category.id.clone(),
        memo: args.memo,
    })?;

    if json {
        print_json(&tx)?;
    } else {
        println!(
            "Added {} {} ({}) on {} [{}]",
            tx.kind,
            format_amount(tx.amount),
            category.name,
            tx.date,
            short_id(&tx.id)
        );
    }
    Ok(())
}

pub(crate) fn cmd_tx_list(ledger: &LedgerService, month: Option<&str>, json: bool) -> Result<()> {
    let month = month.map(validate_month).transpose()?;
    let transactions = ledger.list_transactions(month.as_deref())?;

    if json {
        return print_json(&transactions);
    }

    if transactions.is_empty() {
        match &month {
            Some(m) => eprintln!("No transactions for {m}"),
            None => eprintln!("No transactions yet"),
        }
        return Ok(());
    }

    let names: HashMap<String, String> = ledger
        .list_categories(CategoryFilter {
            include_inactive: false,
            kind: None,
        })?
        .into_iter()
        .map(|c| (c.id, c.name))
        .collect();
    let lookup = |id: &str| {
        names
            .get(id)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_CATEGORY.to_string())
    };
    print_transaction_table(&transactions, &lookup);
    Ok(())
}

pub(crate) fn cmd_tx_edit(
    ledger: &LedgerService,
    id: &str,
    args: TxArgs,
    clear_memo: bool,
    json: bool,
) -> Result<()> {
    let id = resolve_transaction_id(ledger, id)?;
    let kind = args.kind.as_deref().map(parse_kind).transpose()?;
    let category_id = match args.category {
        Some(query) => Some(ledger.resolve_category(&query, kind)?.id),
        None => None,
    };
    let memo = if clear_memo {
        Some(None)
    } else {
        args.memo.map(Some)
    };

    let update = UpdateTransaction {
        date: args.date.map(Some).map(parse_date).transpose()?,
        kind,
        amount: args.amount,
        category_id,
        memo,
    };
    if update.is_empty() {
        bail!("Nothing to update. Provide --date, --type, --amount, --category or a memo flag");
    }

    let tx = ledger.update_transaction(&id, &update)?;
    if json {
        print_json(&tx)?;
    } else {
        println!(
            "Updated [{}]: {} {} on {}",
            short_id(&tx.id),
            tx.kind,
            format_amount(tx.amount),
            tx.date
        );
    }
    Ok(())
}

pub(crate) fn cmd_tx_delete(ledger: &LedgerService, id: &str, json: bool) -> Result<()> {
    let Ok(id) = resolve_transaction_id(ledger, id) else {
        not_found(id, json);
    };
    if ledger.delete_transaction(&id)? {
        if json {
            println!("{}", serde_json::json!({ "deleted": id }));
        } else {
            println!("Deleted transaction {}", short_id(&id));
        }
        Ok(())
    } else {
        not_found(&id, json);
    }
}

fn resolve_transaction_id(ledger: &LedgerService, prefix: &str) -> Result<String> {
    let transactions = ledger.list_transactions(None)?;
    resolve_id(prefix, transactions.iter().map(|t| t.id.as_str()))
}

fn not_found(id: &str, json: bool) -> ! {
    if json {
        println!("{}", json_error(&format!("Transaction {id} not found")));
    } else {
        eprintln!("Transaction {id} not found");
    }
    process::exit(2);
}
