//! Merge strategies: ordered pipelines of merge operations.

use super::data::MergeData;
use super::operation::MergeOperation;

/// An ordered list of merge operations for one item type.
///
/// ```rust
/// use itemdb_core::Attribute;
/// use itemdb_sync::{MergeOperation, MergeStrategy};
/// use std::collections::BTreeSet;
///
/// let tags: Attribute<BTreeSet<String>> = Attribute::new("tracker:tags");
/// let status: Attribute<String> = Attribute::new("tracker:status");
/// let strategy = MergeStrategy::new()
///     .with(MergeOperation::unite_sets(&[tags.key()]))
///     .with(MergeOperation::discard_edit(&[status.key()]));
/// assert_eq!(strategy.operations().len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MergeStrategy {
    operations: Vec<MergeOperation>,
}

impl MergeStrategy {
    /// An empty strategy. It still merges attributes changed on one side
    /// only, and reports everything else as a conflict.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an operation.
    #[must_use]
    pub fn with(mut self, operation: MergeOperation) -> Self {
        self.operations.push(operation);
        self
    }

    /// The operations in order.
    pub fn operations(&self) -> &[MergeOperation] {
        &self.operations
    }

    /// Runs every operation in order.
    pub fn apply(&self, data: &mut MergeData) {
        for operation in &self.operations {
            operation.apply(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::ItemVersion;
    use itemdb_core::{AttrMap, AttrValue, Attribute, ItemId, Value};
    use std::sync::Arc;

    fn version(status: &str) -> ItemVersion {
        let mut values = AttrMap::new();
        values.insert(Arc::from("tracker:status"), status.to_string().into_value());
        ItemVersion::from_values(ItemId::new(4).unwrap(), values)
    }

    #[test]
    fn operations_run_as_a_pipeline() {
        let status: Attribute<String> = Attribute::new("tracker:status");
        let strategy = MergeStrategy::new()
            .with(MergeOperation::discard_edit(&[status.key()]))
            .with(MergeOperation::custom("shout", |data: &mut MergeData| {
                if let Some(Value::Scalar(s)) = data.resolved("tracker:status") {
                    let loud = s.as_text().unwrap_or_default().to_uppercase();
                    data.resolve("tracker:status", Some(loud.into_value()));
                }
            }));

        let mut data = MergeData::new(version("open"), version("done"), version("wontfix"));
        strategy.apply(&mut data);
        assert_eq!(
            data.resolved("tracker:status"),
            Some("WONTFIX".to_string().into_value())
        );
    }
}
