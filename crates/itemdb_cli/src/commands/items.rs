//! Items command implementation.

use super::{open_store, print_json, CliError, CliResult, OutputFormat};
use itemdb_core::{DbObject, Predicate, Reader};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// One live item and its values.
#[derive(Debug, Serialize)]
pub struct ItemInfo {
    /// Item id.
    pub item: u64,
    /// Rendered values by attribute id.
    pub values: BTreeMap<String, String>,
}

/// Runs the items command.
pub fn run(path: &Path, item_type: &str, format: OutputFormat) -> CliResult<()> {
    let items = list_items(path, item_type)?;
    match format {
        OutputFormat::Json => print_json(&items)?,
        OutputFormat::Text => print_text_output(item_type, &items),
    }
    Ok(())
}

/// Lists the live items of `item_type`, ascending by id.
pub fn list_items(path: &Path, item_type: &str) -> CliResult<Vec<ItemInfo>> {
    let store = open_store(path)?;
    let snapshot = store.snapshot();
    if snapshot.find_materialized_id(item_type).is_none() {
        return Err(CliError::UnknownType(item_type.to_string()));
    }
    let items = snapshot
        .query(Predicate::of_type(&DbObject::item_type(item_type)))
        .copy_items_sorted()
        .into_iter()
        .map(|item| ItemInfo {
            item: item.get(),
            values: snapshot
                .values(item)
                .map(|row| row.iter().map(|(id, value)| (id.to_string(), value.to_string())).collect())
                .unwrap_or_default(),
        })
        .collect();
    Ok(items)
}

fn print_text_output(item_type: &str, items: &[ItemInfo]) {
    println!("{} item(s) of type {item_type}", items.len());
    for info in items {
        println!();
        println!("item {}", info.item);
        for (id, value) in &info.values {
            println!("  {id:<40} {value}");
        }
    }
}
