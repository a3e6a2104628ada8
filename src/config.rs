//! Configuration for MetadataStore
//!
//! Provides a builder pattern for configuring the store.

use std::time::Duration;

/// Configuration for the metadata store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// PostgreSQL database URL
    pub database_url: String,
    /// Maximum number of pooled connections (default: 10)
    pub max_connections: u32,
    /// Planner row estimate above which estimate counts are trusted (default: 100000)
    pub count_estimate_threshold: u64,
    /// Columns whose name starts with this prefix are stripped from results (default: "_")
    pub private_column_prefix: String,
    /// Statements slower than this are logged as slow queries (default: 500ms)
    pub slow_query_threshold: Duration,
    /// Aggregation depth used when a request does not specify one (default: 0)
    pub default_aggregation_depth: u32,
}

impl StoreConfig {
    /// Create a new configuration builder
    pub fn builder(database_url: impl Into<String>) -> StoreConfigBuilder {
        StoreConfigBuilder::new(database_url)
    }
}

/// Builder for StoreConfig
#[derive(Debug)]
pub struct StoreConfigBuilder {
    database_url: String,
    max_connections: u32,
    count_estimate_threshold: u64,
    private_column_prefix: String,
    slow_query_threshold: Duration,
    default_aggregation_depth: u32,
}

impl StoreConfigBuilder {
    /// Create a new builder with the database URL
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            count_estimate_threshold: 100_000,
            private_column_prefix: "_".to_string(),
            slow_query_threshold: Duration::from_millis(500),
            default_aggregation_depth: 0,
        }
    }

    /// Set the maximum pool size (default: 10)
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the planner estimate threshold for estimate counts (default: 100000)
    pub fn count_estimate_threshold(mut self, threshold: u64) -> Self {
        self.count_estimate_threshold = threshold;
        self
    }

    /// Set the prefix that marks private columns (default: "_")
    pub fn private_column_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.private_column_prefix = prefix.into();
        self
    }

    /// Set the slow query logging threshold (default: 500ms)
    pub fn slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }

    /// Set the default aggregation depth (default: 0)
    pub fn default_aggregation_depth(mut self, depth: u32) -> Self {
        self.default_aggregation_depth = depth;
        self
    }

    /// Build the configuration
    pub fn build(self) -> StoreConfig {
        StoreConfig {
            database_url: self.database_url,
            max_connections: self.max_connections,
            count_estimate_threshold: self.count_estimate_threshold,
            private_column_prefix: self.private_column_prefix,
            slow_query_threshold: self.slow_query_threshold,
            default_aggregation_depth: self.default_aggregation_depth,
        }
    }
}
