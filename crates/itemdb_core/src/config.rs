//! Store configuration.

/// Configuration for opening an [`crate::ItemStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to create the store directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to fail if the store directory already holds a journal.
    pub error_if_exists: bool,

    /// Number of threads serving read transactions.
    pub reader_threads: usize,

    /// Maximum rounds of trigger work per write transaction.
    pub max_trigger_rounds: usize,

    /// Whether to sync the journal on every commit.
    pub sync_on_commit: bool,

    /// Number of commit events kept for polling.
    pub change_history: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            reader_threads: 2,
            max_trigger_rounds: 16,
            sync_on_commit: true,
            change_history: 1024,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the store if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to fail if the store exists.
    #[must_use]
    pub const fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Sets the number of read threads. Zero is treated as one.
    #[must_use]
    pub const fn reader_threads(mut self, threads: usize) -> Self {
        self.reader_threads = if threads == 0 { 1 } else { threads };
        self
    }

    /// Sets the trigger cascade bound.
    #[must_use]
    pub const fn max_trigger_rounds(mut self, rounds: usize) -> Self {
        self.max_trigger_rounds = rounds;
        self
    }

    /// Sets whether to sync the journal on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets how many commit events are kept for polling.
    #[must_use]
    pub const fn change_history(mut self, events: usize) -> Self {
        self.change_history = events;
        self
    }
}
