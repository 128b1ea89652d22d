//! Merge strategy registry.
//!
//! Strategies are registered once at startup on a [`MergeRegistryBuilder`]
//! and then frozen into an immutable [`MergeRegistry`] that is shared
//! without locking.

use super::strategy::MergeStrategy;
use crate::error::{SyncError, SyncResult};
use itemdb_core::DbObject;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::error;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StrategyKey {
    connection: Option<String>,
    item_type: String,
}

static GLOBAL: OnceLock<MergeRegistry> = OnceLock::new();

/// Collects merge strategies before they are frozen.
#[derive(Debug, Default)]
pub struct MergeRegistryBuilder {
    strategies: HashMap<StrategyKey, MergeStrategy>,
}

impl MergeRegistryBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the strategy for items of `item_type` on `connection`, or on
    /// every connection without a registration of its own if `connection`
    /// is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::DuplicateMergeStrategy`] if the pair already has
    /// a strategy. The first registration stays in place.
    pub fn register(
        &mut self,
        connection: Option<&str>,
        item_type: &DbObject,
        strategy: MergeStrategy,
    ) -> SyncResult<&mut Self> {
        let key = StrategyKey {
            connection: connection.map(str::to_string),
            item_type: item_type.id().to_string(),
        };
        if self.strategies.contains_key(&key) {
            let connection = connection.unwrap_or("*");
            error!(item_type = item_type.id(), connection, "merge strategy registered twice");
            return Err(SyncError::DuplicateMergeStrategy {
                item_type: key.item_type,
                connection: connection.to_string(),
            });
        }
        self.strategies.insert(key, strategy);
        Ok(self)
    }

    /// Freezes the registrations.
    pub fn freeze(self) -> MergeRegistry {
        MergeRegistry {
            strategies: Arc::new(self.strategies),
        }
    }
}

/// Immutable lookup from (connection, item type) to merge strategy.
#[derive(Debug, Clone, Default)]
pub struct MergeRegistry {
    strategies: Arc<HashMap<StrategyKey, MergeStrategy>>,
}

impl MergeRegistry {
    /// A registry without strategies.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Finds the strategy for an item type on a connection, falling back to
    /// the registration for all connections.
    pub fn find(&self, connection: Option<&str>, item_type: &str) -> Option<&MergeStrategy> {
        let exact = connection.and_then(|connection| {
            self.strategies.get(&StrategyKey {
                connection: Some(connection.to_string()),
                item_type: item_type.to_string(),
            })
        });
        exact.or_else(|| {
            self.strategies.get(&StrategyKey {
                connection: None,
                item_type: item_type.to_string(),
            })
        })
    }

    /// Number of registered strategies.
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Makes this registry the process-wide one.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::RegistryAlreadyInstalled`] on a second call.
    pub fn install_global(self) -> SyncResult<()> {
        GLOBAL.set(self).map_err(|_| {
            error!("merge registry installed twice");
            SyncError::RegistryAlreadyInstalled
        })
    }

    /// The process-wide registry, if one was installed.
    pub fn global() -> Option<&'static MergeRegistry> {
        GLOBAL.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MergeOperation;
    use itemdb_core::Attribute;

    fn issue() -> DbObject {
        DbObject::item_type("tracker:type:issue")
    }

    #[test]
    fn exact_connection_wins_over_wildcard() {
        let status: Attribute<String> = Attribute::new("tracker:status");
        let mut builder = MergeRegistryBuilder::new();
        builder
            .register(None, &issue(), MergeStrategy::new())
            .unwrap()
            .register(
                Some("jira"),
                &issue(),
                MergeStrategy::new().with(MergeOperation::discard_edit(&[status.key()])),
            )
            .unwrap();
        let registry = builder.freeze();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find(Some("jira"), "tracker:type:issue").unwrap().operations().len(), 1);
        assert_eq!(registry.find(Some("bugzilla"), "tracker:type:issue").unwrap().operations().len(), 0);
        assert_eq!(registry.find(None, "tracker:type:issue").unwrap().operations().len(), 0);
        assert!(registry.find(None, "tracker:type:comment").is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut builder = MergeRegistryBuilder::new();
        builder.register(Some("jira"), &issue(), MergeStrategy::new()).unwrap();
        let err = builder
            .register(Some("jira"), &issue(), MergeStrategy::new())
            .unwrap_err();
        assert!(matches!(err, SyncError::DuplicateMergeStrategy { .. }));
        assert!(!err.is_recoverable());
        assert_eq!(builder.freeze().len(), 1);
    }

    #[test]
    fn global_registry_installs_once() {
        let first = MergeRegistryBuilder::new().freeze();
        let outcome = first.install_global();
        // Another test binary may have installed one already.
        if outcome.is_ok() {
            assert!(MergeRegistry::global().is_some());
        }
        assert!(matches!(
            MergeRegistry::empty().install_global(),
            Err(SyncError::RegistryAlreadyInstalled)
        ));
    }
}
