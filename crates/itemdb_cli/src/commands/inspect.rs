//! Inspect command implementation.

use super::{kind_name, open_store, print_json, CliResult, OutputFormat};
use itemdb_core::{Reader, Snapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store directory.
    pub path: String,
    /// Journal size in bytes.
    pub journal_size: u64,
    /// Change number of the last commit.
    pub last_icn: u64,
    /// Number of live items, schema items included.
    pub item_count: usize,
    /// Live items per type id.
    pub types: BTreeMap<String, usize>,
    /// Every materialized attribute.
    pub attributes: Vec<AttributeInfo>,
}

/// One entry of the attribute catalog.
#[derive(Debug, Serialize)]
pub struct AttributeInfo {
    /// Attribute id.
    pub id: String,
    /// Value kind, e.g. `set<text>`.
    pub kind: String,
    /// Whether the attribute takes part in synchronization.
    pub shadowable: bool,
    /// Number of live items holding a value.
    pub items: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: OutputFormat) -> CliResult<()> {
    let result = inspect(path)?;
    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Text => print_text_output(&result),
    }
    Ok(())
}

/// Collects statistics for the store at `path`.
pub fn inspect(path: &Path) -> CliResult<InspectResult> {
    let store = open_store(path)?;
    let snapshot = store.snapshot();
    let result = InspectResult {
        path: path.display().to_string(),
        journal_size: store.journal_size()?,
        last_icn: snapshot.icn().as_u64(),
        item_count: snapshot.all_items().len(),
        types: type_counts(&snapshot),
        attributes: attribute_catalog(&snapshot),
    };
    drop(snapshot);
    store.close();
    Ok(result)
}

fn type_counts(snapshot: &Snapshot) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for item in snapshot.all_items() {
        let name = snapshot
            .item_type(item)
            .and_then(|t| snapshot.object_id(t))
            .unwrap_or_else(|| "(untyped)".to_string());
        *counts.entry(name).or_insert(0) += 1;
    }
    counts
}

fn attribute_catalog(snapshot: &Snapshot) -> Vec<AttributeInfo> {
    let mut usage: BTreeMap<String, usize> = BTreeMap::new();
    snapshot.for_each_item(&mut |_, row| {
        for id in row.keys() {
            *usage.entry(id.to_string()).or_insert(0) += 1;
        }
    });
    snapshot
        .attributes()
        .into_iter()
        .map(|key| AttributeInfo {
            id: key.id().to_string(),
            kind: kind_name(key.kind()),
            shadowable: key.is_shadowable(),
            items: usage.get(&**key.id()).copied().unwrap_or(0),
        })
        .collect()
}

fn print_text_output(result: &InspectResult) {
    println!("itemdb Store Inspection");
    println!("=======================");
    println!();
    println!("Path:         {}", result.path);
    println!("Journal size: {} bytes", result.journal_size);
    println!("Last ICN:     {}", result.last_icn);
    println!("Live items:   {}", result.item_count);
    println!();
    println!("Types:");
    for (id, count) in &result.types {
        println!("  {id:<40} {count}");
    }
    println!();
    println!("Attributes:");
    for attr in &result.attributes {
        let sync = if attr.shadowable { "" } else { " (local)" };
        println!("  {:<40} {:<14} {} items{sync}", attr.id, attr.kind, attr.items);
    }
}
