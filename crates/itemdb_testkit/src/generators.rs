//! Property-based test generators using proptest.
//!
//! Provides strategies for generating tracker data and edit sequences.

use crate::tracker::{PRIORITY, STATUS, SUMMARY, TAGS};
use itemdb_core::{AttrMap, AttrValue, ItemId, Value};
use itemdb_sync::{EditDrain, SyncResult};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Strategy for generating tag names. Mixed case, so case-insensitive
/// merges see near duplicates.
pub fn tag_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-cA-C][a-c]{0,2}").expect("Invalid regex")
}

/// Strategy for generating tag sets.
pub fn tag_set_strategy() -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set(tag_strategy(), 0..5)
}

/// Strategy for generating set values.
pub fn set_value_strategy() -> impl Strategy<Value = Value> {
    tag_set_strategy().prop_map(AttrValue::into_value)
}

/// Strategy for generating summaries.
pub fn summary_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}( [a-z]{1,8}){0,3}").expect("Invalid regex")
}

/// Strategy for generating statuses.
pub fn status_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["open", "in-progress", "resolved", "closed"]).prop_map(str::to_string)
}

/// Strategy for generating one version of an issue's shadowable values.
pub fn issue_values_strategy() -> impl Strategy<Value = AttrMap> {
    (
        summary_strategy(),
        prop::option::of(status_strategy()),
        tag_set_strategy(),
        prop::option::of(1i64..5),
    )
        .prop_map(|(summary, status, tags, priority)| {
            let mut values = AttrMap::new();
            values.insert(Arc::clone(SUMMARY.key().id()), summary.into_value());
            if let Some(status) = status {
                values.insert(Arc::clone(STATUS.key().id()), status.into_value());
            }
            if let Some(tags) = tags.into_value().normalized() {
                values.insert(Arc::clone(TAGS.key().id()), tags);
            }
            if let Some(priority) = priority {
                values.insert(Arc::clone(PRIORITY.key().id()), priority.into_value());
            }
            values
        })
}

/// A local edit of an issue.
#[derive(Debug, Clone)]
pub enum IssueEdit {
    /// Change the summary.
    Summary(String),
    /// Change or clear the status.
    Status(Option<String>),
    /// Replace the tags.
    Tags(BTreeSet<String>),
    /// Change or clear the priority.
    Priority(Option<i64>),
}

impl IssueEdit {
    /// Applies the edit to an item.
    pub fn apply(&self, drain: &mut EditDrain<'_>, item: ItemId) -> SyncResult<()> {
        match self {
            IssueEdit::Summary(summary) => drain.set_value(item, &*SUMMARY, Some(summary.clone())),
            IssueEdit::Status(status) => drain.set_value(item, &*STATUS, status.clone()),
            IssueEdit::Tags(tags) => drain.set_value(item, &*TAGS, Some(tags.clone())),
            IssueEdit::Priority(priority) => drain.set_value(item, &*PRIORITY, *priority),
        }
    }
}

/// Strategy for generating a single edit.
pub fn issue_edit_strategy() -> impl Strategy<Value = IssueEdit> {
    prop_oneof![
        summary_strategy().prop_map(IssueEdit::Summary),
        prop::option::of(status_strategy()).prop_map(IssueEdit::Status),
        tag_set_strategy().prop_map(IssueEdit::Tags),
        prop::option::of(1i64..5).prop_map(IssueEdit::Priority),
    ]
}

/// Strategy for generating a sequence of edits.
pub fn issue_edits_strategy(max_len: usize) -> impl Strategy<Value = Vec<IssueEdit>> {
    prop::collection::vec(issue_edit_strategy(), 1..=max_len)
}
