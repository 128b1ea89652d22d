//! Configuration for the sync manager.

/// Configuration for a [`crate::SyncManager`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How often a merge retries locking an item whose edit session is
    /// being released at the same moment.
    pub merge_lock_attempts: usize,
    /// Whether uploads require the item's connection to be ready.
    pub require_ready_connection: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            merge_lock_attempts: 10,
            require_ready_connection: true,
        }
    }
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the merge lock retry count.
    pub fn with_merge_lock_attempts(mut self, attempts: usize) -> Self {
        self.merge_lock_attempts = attempts;
        self
    }

    /// Sets whether uploads require a ready connection.
    pub fn with_require_ready_connection(mut self, required: bool) -> Self {
        self.require_ready_connection = required;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_builders() {
        let config = SyncConfig::new();
        assert_eq!(config.merge_lock_attempts, 10);
        assert!(config.require_ready_connection);

        let config = config
            .with_merge_lock_attempts(3)
            .with_require_ready_connection(false);
        assert_eq!(config.merge_lock_attempts, 3);
        assert!(!config.require_ready_connection);
    }
}
