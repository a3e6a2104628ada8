//! # metadata-store
//!
//! Dynamic filter compilation and JSON key/value aggregation over PostgreSQL.
//!
//! A fixed [`Catalog`] describes the entities of the metadata API (resources,
//! libraries, signatures, entities and schemas). Clients send a [`Filter`] as
//! JSON: a field projection, a predicate tree, an ordering and a page. The
//! filter is compiled into parameterized SQL against the catalog, with dotted
//! paths reaching into JSON columns. The same filters drive the aggregation
//! engine, which flattens each matching JSON payload into dotted keys and
//! counts keys, values and distinct values.
//!
//! ## Features
//!
//! - **Strict filters**: malformed filters are rejected, never coerced
//! - **Deep paths**: `meta.assay` reads into the `meta` JSONB column
//! - **Joins**: one relationship per query, with its own projection and predicate
//! - **Aggregation**: key, value and distinct-value counts at a chosen depth
//! - **SQL Injection Prevention**: identifiers are quoted and values are always bound
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use metadata_store::{AggregateOptions, Catalog, Filter, MetadataStore, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StoreConfig::builder("postgres://localhost/metadata").build();
//!     let store = MetadataStore::new(config, Catalog::metadata()?).await?;
//!     let libraries = store.repository("libraries")?;
//!
//!     let filter = Filter::from_value(serde_json::json!({
//!         "where": {"meta.assay": {"eq": "RNA-seq"}},
//!         "order": "dataset ASC",
//!         "limit": 10
//!     }))?;
//!     let page = libraries.find_page(&filter, None).await?;
//!     println!("Content-Range: {}", page.range);
//!
//!     let keys = libraries
//!         .key_counts(&Filter::new(), None, &AggregateOptions::depth(1))
//!         .await?;
//!     for key in keys {
//!         println!("{} {}", key.key, key.count);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```rust
//! use std::time::Duration;
//! use metadata_store::StoreConfig;
//!
//! let config = StoreConfig::builder("postgres://localhost/metadata")
//!     .max_connections(20)
//!     .count_estimate_threshold(1_000_000)
//!     .slow_query_threshold(Duration::from_millis(250))
//!     .build();
//! ```

pub mod aggregate;
pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod filter;
pub mod repository;
pub mod sql;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use aggregate::{
    AggregateKind, AggregateOptions, AggregateScope, FlatValue, KeyCount, KeyValueCount,
};
pub use catalog::{Catalog, ColumnDescriptor, EntityDescriptor, RelationDescriptor, RelationKind};
pub use config::{StoreConfig, StoreConfigBuilder};
pub use error::{MetadataStoreError, Result};
pub use executor::{PgExecutor, SqlExecutor};
pub use filter::{
    Condition, FieldPath, Filter, FullTextQuery, JoinSpec, OrderSpec, SortDirection, WhereNode,
    condition_helpers,
};
pub use repository::{ContentRange, CountMode, Page, Repository};
pub use store::MetadataStore;
pub use types::ColumnType;

// Re-export SQL utilities for advanced users
pub use sql::ddl::{DdlGenerator, IndexMethod};
pub use sql::query::{CompiledQuery, QueryCompiler};
pub use sql::sanitize::{quote_identifier, validate_identifier};
