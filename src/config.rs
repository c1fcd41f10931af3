use std::time::Duration;

use crate::core::{Result, StoreError};

/// Settings for the session store and the change-feed replicator.
///
/// Validated at construction time by everything that consumes it; a store is
/// never usable in a partially configured state.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Logical database name.
    pub database: String,

    /// Container holding Session/Message/CompletionPrompt records,
    /// partitioned by `/sessionId`.
    pub sessions_container: String,

    /// Container holding the per-user projection, partitioned by `/upn`.
    pub user_sessions_container: String,

    /// Container holding change-feed leases, partitioned by `/id`.
    pub leases_container: String,

    /// How often a replicator instance polls its feed ranges.
    pub feed_poll_interval: Duration,

    /// How long a lease is held before a peer may claim it.
    pub lease_ttl: Duration,

    /// Number of hash ranges the feed is split into; also the maximum number
    /// of instances that can share one subscription.
    pub feed_range_count: u32,

    /// Concurrency limit for per-batch projection fan-out.
    pub projection_concurrency: usize,
}

impl StoreSettings {
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            sessions_container: "sessions".to_string(),
            user_sessions_container: "user-sessions".to_string(),
            leases_container: "leases".to_string(),
            feed_poll_interval: Duration::from_millis(250),
            lease_ttl: Duration::from_secs(30),
            feed_range_count: 4,
            projection_concurrency: 8,
        }
    }

    pub fn sessions_container(mut self, name: &str) -> Self {
        self.sessions_container = name.to_string();
        self
    }

    pub fn user_sessions_container(mut self, name: &str) -> Self {
        self.user_sessions_container = name.to_string();
        self
    }

    pub fn leases_container(mut self, name: &str) -> Self {
        self.leases_container = name.to_string();
        self
    }

    pub fn feed_poll_interval(mut self, interval: Duration) -> Self {
        self.feed_poll_interval = interval;
        self
    }

    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn feed_range_count(mut self, count: u32) -> Self {
        self.feed_range_count = count;
        self
    }

    pub fn projection_concurrency(mut self, limit: usize) -> Self {
        self.projection_concurrency = limit;
        self
    }

    /// Validate required settings. Called by consumers at construction.
    pub fn validate(&self) -> Result<()> {
        fn required(name: &str, value: &str) -> Result<()> {
            if value.trim().is_empty() {
                return Err(StoreError::Configuration(format!(
                    "required setting '{name}' is empty"
                )));
            }
            Ok(())
        }

        required("database", &self.database)?;
        required("sessions_container", &self.sessions_container)?;
        required("user_sessions_container", &self.user_sessions_container)?;
        required("leases_container", &self.leases_container)?;

        if self.feed_range_count == 0 {
            return Err(StoreError::Configuration(
                "feed_range_count must be > 0".into(),
            ));
        }
        if self.projection_concurrency == 0 {
            return Err(StoreError::Configuration(
                "projection_concurrency must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self::new("chat")
    }
}
