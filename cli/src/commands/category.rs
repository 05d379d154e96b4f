use anyhow::{Result, bail};

use tally_core::models::{CategoryFilter, NewCategory, UpdateCategory, parse_kind};
use tally_core::service::LedgerService;

use super::helpers::{print_category_table, print_json, resolve_id, short_id};

pub(crate) fn cmd_category_add(
    ledger: &LedgerService,
    name: &str,
    kind: &str,
    json: bool,
) -> Result<()> {
    let category = ledger.create_category(&NewCategory {
        name: name.to_string(),
        kind: parse_kind(kind)?,
    })?;

    if json {
        print_json(&category)?;
    } else {
        println!(
            "Added {} category '{}' [{}]",
            category.kind,
            category.name,
            short_id(&category.id)
        );
    }
    Ok(())
}

pub(crate) fn cmd_category_list(
    ledger: &LedgerService,
    all: bool,
    kind: Option<&str>,
    json: bool,
) -> Result<()> {
    let categories = ledger.list_categories(CategoryFilter {
        include_inactive: all,
        kind: kind.map(parse_kind).transpose()?,
    })?;

    if json {
        return print_json(&categories);
    }
    if categories.is_empty() {
        eprintln!("No categories. Add one with `tally category add <name> --type expense`");
        return Ok(());
    }
    print_category_table(&categories);
    Ok(())
}

pub(crate) fn cmd_category_edit(
    ledger: &LedgerService,
    id: &str,
    name: Option<String>,
    kind: Option<&str>,
    json: bool,
) -> Result<()> {
    if name.is_none() && kind.is_none() {
        bail!("Nothing to update. Provide --name and/or --type");
    }
    let id = resolve_category_id(ledger, id)?;
    let category = ledger.update_category(
        &id,
        &UpdateCategory {
            name,
            kind: kind.map(parse_kind).transpose()?,
            active: None,
        },
    )?;

    if json {
        print_json(&category)?;
    } else {
        println!(
            "Updated category [{}]: {} ({})",
            short_id(&category.id),
            category.name,
            category.kind
        );
    }
    Ok(())
}

/// Soft delete: the category is hidden from active listings but kept.
pub(crate) fn cmd_category_set_active(
    ledger: &LedgerService,
    id: &str,
    active: bool,
    json: bool,
) -> Result<()> {
    let id = resolve_category_id(ledger, id)?;
    let category = if active {
        ledger.update_category(
            &id,
            &UpdateCategory {
                active: Some(true),
                ..UpdateCategory::default()
            },
        )?
    } else {
        ledger.deactivate_category(&id)?
    };

    if json {
        print_json(&category)?;
    } else {
        let state = if category.active {
            "activated"
        } else {
            "deactivated"
        };
        println!("Category '{}' {state}", category.name);
    }
    Ok(())
}

fn resolve_category_id(ledger: &LedgerService, prefix: &str) -> Result<String> {
    let categories = ledger.list_categories(CategoryFilter {
        include_inactive: true,
        kind: None,
    })?;
    resolve_id(prefix, categories.iter().map(|c| c.id.as_str()))
}
