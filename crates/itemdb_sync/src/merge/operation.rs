//! Built-in merge operations.

use super::data::MergeData;
use itemdb_core::{AttributeKey, Scalar, ScalarType, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// A type-specific merge rule.
pub type CustomMerge = Arc<dyn Fn(&mut MergeData) + Send + Sync>;

/// One step of a [`super::MergeStrategy`].
#[derive(Clone)]
pub enum MergeOperation {
    /// Resolve to the union of the local and server values.
    UniteSets(Vec<AttributeKey>),
    /// Resolve to the server value, dropping the local edit.
    DiscardEdit(Vec<AttributeKey>),
    /// Union of integer collections.
    MergeLongSet(Vec<AttributeKey>),
    /// Union of text collections, optionally treating values that differ
    /// only in case as duplicates.
    MergeStringSet {
        /// Merged attributes.
        attributes: Vec<AttributeKey>,
        /// Whether `"UI"` and `"ui"` are the same value.
        ignore_case: bool,
    },
    /// Flag the group for manual resolution when local and server disagree
    /// on more than one of its attributes.
    ConflictGroup(Vec<AttributeKey>),
    /// Drop the whole local edit, history included, whenever the server
    /// changed the item.
    DiscardLocal,
    /// A pluggable rule.
    Custom {
        /// Name for logs.
        name: String,
        /// The rule.
        merge: CustomMerge,
    },
}

fn keys(attributes: &[&AttributeKey]) -> Vec<AttributeKey> {
    attributes.iter().map(|key| (*key).clone()).collect()
}

impl MergeOperation {
    /// See [`MergeOperation::UniteSets`].
    pub fn unite_sets(attributes: &[&AttributeKey]) -> Self {
        Self::UniteSets(keys(attributes))
    }

    /// See [`MergeOperation::DiscardEdit`].
    pub fn discard_edit(attributes: &[&AttributeKey]) -> Self {
        Self::DiscardEdit(keys(attributes))
    }

    /// See [`MergeOperation::MergeLongSet`].
    pub fn merge_long_set(attributes: &[&AttributeKey]) -> Self {
        Self::MergeLongSet(keys(attributes))
    }

    /// See [`MergeOperation::MergeStringSet`].
    pub fn merge_string_set(attributes: &[&AttributeKey], ignore_case: bool) -> Self {
        Self::MergeStringSet {
            attributes: keys(attributes),
            ignore_case,
        }
    }

    /// See [`MergeOperation::ConflictGroup`].
    pub fn conflict_group(attributes: &[&AttributeKey]) -> Self {
        Self::ConflictGroup(keys(attributes))
    }

    /// See [`MergeOperation::Custom`].
    pub fn custom(name: impl Into<String>, merge: impl Fn(&mut MergeData) + Send + Sync + 'static) -> Self {
        Self::Custom {
            name: name.into(),
            merge: Arc::new(merge),
        }
    }

    /// Runs the operation.
    pub fn apply(&self, data: &mut MergeData) {
        match self {
            MergeOperation::UniteSets(attributes) => {
                for key in attributes {
                    unite_attribute(data, key, unite);
                }
            }
            MergeOperation::DiscardEdit(attributes) => {
                for key in attributes {
                    let server = data.server().value(key.id()).cloned();
                    data.resolve(key.id(), server);
                }
            }
            MergeOperation::MergeLongSet(attributes) => {
                for key in attributes.iter().filter(|key| holds(key, ScalarType::Long)) {
                    unite_attribute(data, key, unite);
                }
            }
            MergeOperation::MergeStringSet {
                attributes,
                ignore_case,
            } => {
                let ignore_case = *ignore_case;
                for key in attributes.iter().filter(|key| holds(key, ScalarType::Text)) {
                    unite_attribute(data, key, |a, b| unite_text(a, b, ignore_case));
                }
            }
            MergeOperation::ConflictGroup(attributes) => conflict_group(data, attributes),
            MergeOperation::DiscardLocal => {
                if data.has_server_changes() {
                    data.discard_local_edit();
                }
            }
            MergeOperation::Custom { merge, .. } => merge(data),
        }
    }
}

impl fmt::Debug for MergeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = |keys: &[AttributeKey]| keys.iter().map(|k| k.id().to_string()).collect::<Vec<_>>();
        match self {
            MergeOperation::UniteSets(k) => f.debug_tuple("UniteSets").field(&ids(k)).finish(),
            MergeOperation::DiscardEdit(k) => f.debug_tuple("DiscardEdit").field(&ids(k)).finish(),
            MergeOperation::MergeLongSet(k) => f.debug_tuple("MergeLongSet").field(&ids(k)).finish(),
            MergeOperation::MergeStringSet {
                attributes,
                ignore_case,
            } => f
                .debug_struct("MergeStringSet")
                .field("attributes", &ids(attributes))
                .field("ignore_case", ignore_case)
                .finish(),
            MergeOperation::ConflictGroup(k) => f.debug_tuple("ConflictGroup").field(&ids(k)).finish(),
            MergeOperation::DiscardLocal => f.write_str("DiscardLocal"),
            MergeOperation::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
        }
    }
}

fn holds(key: &AttributeKey, scalar: ScalarType) -> bool {
    if key.kind().scalar_type() == Some(scalar) {
        return true;
    }
    warn!(attribute = %key.id(), expected = scalar.name(), "merge operation does not apply to attribute");
    false
}

fn unite_attribute(data: &mut MergeData, key: &AttributeKey, combine: impl Fn(&Value, &Value) -> Option<Value>) {
    let id = key.id();
    if !(data.local_changed(id) && data.server_changed(id)) {
        return;
    }
    let merged = match (data.local_value(id), data.server().value(id)) {
        (Some(local), Some(server)) => match combine(&local, server) {
            Some(merged) => Some(merged),
            None => return,
        },
        // The survivor of a one-sided removal is folded too, so a second
        // pass finds nothing left to change.
        (Some(only), None) => Some(combine(&only, &only).unwrap_or(only)),
        (None, Some(only)) => Some(combine(only, only).unwrap_or_else(|| only.clone())),
        (None, None) => None,
    };
    data.resolve(id, merged);
}

/// Union of two collection values.
///
/// Sets unite as sets. Lists come out sorted and without duplicates, so
/// `unite(a, b) == unite(b, a)`. Returns `None` for scalars, records and
/// mixed compositions.
pub fn unite(a: &Value, b: &Value) -> Option<Value> {
    match (a, b) {
        (Value::Set(a), Value::Set(b)) => Some(Value::Set(a.union(b).cloned().collect())),
        (Value::List(a), Value::List(b)) => {
            let items: BTreeSet<&Scalar> = a.iter().chain(b).collect();
            Some(Value::List(items.into_iter().cloned().collect()))
        }
        _ => None,
    }
}

/// Union of two text collections. With `ignore_case`, values that match up
/// to case are one value, spelled the way that sorts first.
pub fn unite_text(a: &Value, b: &Value, ignore_case: bool) -> Option<Value> {
    if !ignore_case {
        return unite(a, b);
    }
    let (scalars, list): (Vec<&Scalar>, bool) = match (a, b) {
        (Value::Set(a), Value::Set(b)) => (a.iter().chain(b).collect(), false),
        (Value::List(a), Value::List(b)) => (a.iter().chain(b).collect(), true),
        _ => return None,
    };
    let mut spellings: BTreeMap<String, &Scalar> = BTreeMap::new();
    for scalar in scalars {
        let Some(folded) = scalar.as_text().map(str::to_lowercase) else { continue };
        spellings
            .entry(folded)
            .and_modify(|kept| *kept = (*kept).min(scalar))
            .or_insert(scalar);
    }
    let merged: BTreeSet<Scalar> = spellings.into_values().cloned().collect();
    Some(if list {
        Value::List(merged.into_iter().collect())
    } else {
        Value::Set(merged)
    })
}

fn conflict_group(data: &mut MergeData, attributes: &[AttributeKey]) {
    let ids: Vec<&str> = attributes.iter().map(|key| key.id().as_ref()).collect();
    let local = ids.iter().any(|id| data.local_changed(id));
    let server = ids.iter().any(|id| data.server_changed(id));
    if !(local && server) {
        return;
    }
    let disagreeing: Vec<&str> = ids
        .iter()
        .copied()
        .filter(|id| data.local_value(id).as_ref() != data.server().value(id))
        .collect();
    if disagreeing.len() > 1 {
        for id in disagreeing {
            data.mark_conflict(id);
        }
    }
}
