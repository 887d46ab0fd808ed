//! Executor configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`ChangeQueueExecutor`](crate::ChangeQueueExecutor).
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Database file; `None` opens a private in-memory database.
    pub path: Option<PathBuf>,

    /// How long a statement waits on a locked database file.
    pub busy_timeout: Duration,

    /// Longest sleep of the drain loop between passes when idle.
    pub drain_poll_interval: Duration,

    /// How long a synchronous write from a foreign thread waits for its
    /// events to drain before failing with `Timeout`.
    pub sync_timeout: Duration,

    /// Whether to switch the database to WAL journal mode.
    pub wal: bool,

    /// Whether to enforce foreign keys on the connection.
    pub foreign_keys: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout: Duration::from_secs(5),
            drain_poll_interval: Duration::from_millis(50),
            sync_timeout: Duration::from_secs(30),
            wal: false,
            foreign_keys: true,
        }
    }
}

impl ExecutorConfig {
    /// Creates a configuration with default values (in-memory database).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration for a database file.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self::default().path(path)
    }

    /// Sets the database file.
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets the busy timeout.
    #[must_use]
    pub const fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Sets the idle drain poll interval.
    #[must_use]
    pub const fn drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval = interval;
        self
    }

    /// Sets the synchronous-write timeout.
    #[must_use]
    pub const fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Enables or disables WAL journal mode.
    #[must_use]
    pub const fn wal(mut self, value: bool) -> Self {
        self.wal = value;
        self
    }

    /// Enables or disables foreign key enforcement.
    #[must_use]
    pub const fn foreign_keys(mut self, value: bool) -> Self {
        self.foreign_keys = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ExecutorConfig::default();
        assert!(config.path.is_none());
        assert!(!config.wal);
        assert!(config.foreign_keys);
        assert_eq!(config.sync_timeout, Duration::from_secs(30));
    }

    #[test]
    fn builder_pattern() {
        let config = ExecutorConfig::at("/tmp/app.db")
            .wal(true)
            .sync_timeout(Duration::from_millis(250));

        assert_eq!(config.path.as_deref(), Some(std::path::Path::new("/tmp/app.db")));
        assert!(config.wal);
        assert_eq!(config.sync_timeout, Duration::from_millis(250));
    }
}
