//! A small issue-tracker schema.
//!
//! Issues carry a summary, a status, free-form tags, label references, a
//! priority, a component and an assignee. [`tracker_registry`] merges them
//! the way a tracker client would: tag and label sets unite, a priority
//! edit yields to the server, and status and assignee conflict together.
//! Comments hang below their issue through [`PARENT`], a master reference.

use itemdb_core::{Attribute, DbObject, ItemId};
use itemdb_sync::subtree::define_master_reference;
use itemdb_sync::{
    DownloadDrain, EditDrain, MergeOperation, MergeRegistry, MergeRegistryBuilder, MergeReport, MergeStrategy,
    SyncManager, SyncResult,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

/// Identity of the issue type.
pub const ISSUE_TYPE_ID: &str = "tracker:type:issue";

/// The issue type.
pub static ISSUE: LazyLock<DbObject> = LazyLock::new(|| DbObject::item_type(ISSUE_TYPE_ID).with_name("Issue"));
/// The label type.
pub static LABEL: LazyLock<DbObject> = LazyLock::new(|| DbObject::item_type("tracker:type:label").with_name("Label"));

/// The comment type.
pub static COMMENT: LazyLock<DbObject> =
    LazyLock::new(|| DbObject::item_type("tracker:type:comment").with_name("Comment"));
/// The issue a comment belongs to, or the comment a reply answers.
pub static PARENT: LazyLock<Attribute<ItemId>> = LazyLock::new(|| Attribute::new("tracker:parent"));

/// One-line summary.
pub static SUMMARY: LazyLock<Attribute<String>> = LazyLock::new(|| Attribute::new("tracker:summary"));
/// Workflow status.
pub static STATUS: LazyLock<Attribute<String>> = LazyLock::new(|| Attribute::new("tracker:status"));
/// Free-form tags.
pub static TAGS: LazyLock<Attribute<BTreeSet<String>>> = LazyLock::new(|| Attribute::new("tracker:tags"));
/// Label items.
pub static LABEL_IDS: LazyLock<Attribute<BTreeSet<ItemId>>> = LazyLock::new(|| Attribute::new("tracker:labels"));
/// Priority, lower is more urgent.
pub static PRIORITY: LazyLock<Attribute<i64>> = LazyLock::new(|| Attribute::new("tracker:priority"));
/// Component name.
pub static COMPONENT: LazyLock<Attribute<String>> = LazyLock::new(|| Attribute::new("tracker:component"));
/// Assigned user.
pub static ASSIGNEE: LazyLock<Attribute<String>> = LazyLock::new(|| Attribute::new("tracker:assignee"));

/// The merge strategy for issues.
pub fn issue_strategy() -> MergeStrategy {
    MergeStrategy::new()
        .with(MergeOperation::merge_string_set(&[TAGS.key()], true))
        .with(MergeOperation::unite_sets(&[LABEL_IDS.key()]))
        .with(MergeOperation::discard_edit(&[PRIORITY.key()]))
        .with(MergeOperation::conflict_group(&[STATUS.key(), ASSIGNEE.key()]))
}

/// A frozen registry with [`issue_strategy`] for issues on every connection.
pub fn tracker_registry() -> MergeRegistry {
    let mut builder = MergeRegistryBuilder::new();
    builder
        .register(None, &ISSUE, issue_strategy())
        .expect("Fresh builder has no strategies");
    builder.freeze()
}

/// A set of tags.
pub fn tag_set(tags: &[&str]) -> BTreeSet<String> {
    tags.iter().map(|t| t.to_string()).collect()
}

/// Writes server data and returns the merge report.
pub fn download(
    manager: &SyncManager,
    procedure: impl FnOnce(&mut DownloadDrain<'_>) -> SyncResult<()> + Send + 'static,
) -> MergeReport {
    manager.write_downloaded(procedure).wait().expect("Download failed")
}

/// Downloads a new issue.
pub fn download_issue(manager: &SyncManager, summary: &str, tags: &[&str]) -> ItemId {
    let summary = summary.to_string();
    let tags = tag_set(tags);
    let created = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&created);
    download(manager, move |drain| {
        let item = drain.create_item(&ISSUE)?;
        drain.set_value(item, &*SUMMARY, Some(summary))?;
        drain.set_value(item, &*TAGS, Some(tags))?;
        *slot.lock() = Some(item);
        Ok(())
    });
    let item = created.lock().take();
    item.expect("Download created no item")
}

/// Flags [`PARENT`] as a master reference.
pub fn define_comment_tree(manager: &SyncManager) {
    manager
        .store()
        .write(|writer| define_master_reference(writer, &PARENT))
        .wait()
        .expect("Master reference definition failed");
}

/// Downloads a comment below `master`.
pub fn download_comment(manager: &SyncManager, master: ItemId, text: &str) -> ItemId {
    let text = text.to_string();
    let created = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&created);
    download(manager, move |drain| {
        let item = drain.create_item(&COMMENT)?;
        drain.set_value(item, &*PARENT, Some(master))?;
        drain.set_value(item, &*SUMMARY, Some(text))?;
        *slot.lock() = Some(item);
        Ok(())
    });
    let item = created.lock().take();
    item.expect("Download created no comment")
}

/// Commits one local edit without a session. Returns whether anything
/// changed.
pub fn edit(
    manager: &SyncManager,
    procedure: impl FnOnce(&mut EditDrain<'_>) -> SyncResult<()> + Send + 'static,
) -> SyncResult<bool> {
    let mut procedure = Some(procedure);
    manager
        .commit_edit(move |drain: &mut EditDrain<'_>| -> SyncResult<()> {
            match procedure.take() {
                Some(procedure) => procedure(drain),
                None => Ok(()),
            }
        })
        .wait()
}

/// Changes an issue's summary locally.
pub fn edit_summary(manager: &SyncManager, item: ItemId, summary: &str) {
    let summary = summary.to_string();
    edit(manager, move |drain| drain.set_value(item, &*SUMMARY, Some(summary))).expect("Edit failed");
}

/// Creates an issue locally.
pub fn create_issue(manager: &SyncManager, summary: &str) -> ItemId {
    let summary = summary.to_string();
    let created = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&created);
    edit(manager, move |drain| {
        let item = drain.create_item(&ISSUE)?;
        drain.set_value(item, &*SUMMARY, Some(summary))?;
        *slot.lock() = Some(item);
        Ok(())
    })
    .expect("Create failed");
    let item = created.lock().take();
    item.expect("Edit created no item")
}

/// Waits until every queued write has run.
pub fn settle(manager: &SyncManager) {
    edit(manager, |_| Ok(())).expect("Empty commit failed");
}
