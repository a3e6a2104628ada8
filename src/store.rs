//! MetadataStore - main entry point
//!
//! Owns the connection pool, the catalog and the configuration, and hands out
//! one [`Repository`] per catalog entity.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::catalog::Catalog;
use crate::config::StoreConfig;
use crate::error::{MetadataStoreError, Result};
use crate::executor::{PgExecutor, SqlExecutor};
use crate::repository::Repository;

/// Filter and aggregation queries over the entities of a catalog
///
/// Repositories are created once per entity and shared, so each table is
/// checked against the catalog only on first use.
pub struct MetadataStore {
    pool: PgPool,
    config: Arc<StoreConfig>,
    catalog: Arc<Catalog>,
    repositories: HashMap<String, Arc<Repository>>,
}

impl MetadataStore {
    /// Connect to the database and serve `catalog`
    pub async fn new(config: StoreConfig, catalog: Catalog) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await
            .map_err(|e| {
                MetadataStoreError::Connection(format!("Database connection failed: {}", e))
            })?;

        Ok(Self::from_pool(pool, config, catalog))
    }

    /// Create a store over an existing pool
    ///
    /// Use this when the pool is shared with other parts of the application.
    pub fn from_pool(pool: PgPool, config: StoreConfig, catalog: Catalog) -> Self {
        let executor: Arc<dyn SqlExecutor> =
            Arc::new(PgExecutor::new(pool.clone(), config.slow_query_threshold));
        Self::with_executor(pool, config, catalog, executor)
    }

    fn with_executor(
        pool: PgPool,
        config: StoreConfig,
        catalog: Catalog,
        executor: Arc<dyn SqlExecutor>,
    ) -> Self {
        let config = Arc::new(config);
        let catalog = Arc::new(catalog);

        let repositories = catalog
            .entity_names()
            .filter_map(|name| {
                Repository::new(catalog.clone(), config.clone(), executor.clone(), name)
                    .ok()
                    .map(|repo| (name.to_string(), Arc::new(repo)))
            })
            .collect();

        Self {
            pool,
            config,
            catalog,
            repositories,
        }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get a reference to the configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The repository for `entity`
    pub fn repository(&self, entity: &str) -> Result<Arc<Repository>> {
        self.repositories
            .get(entity)
            .cloned()
            .ok_or_else(|| MetadataStoreError::entity_not_found(entity))
    }
}
