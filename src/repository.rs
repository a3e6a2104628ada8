//! Generic repository over one catalog entity
//!
//! A [`Repository`] compiles filters with [`QueryCompiler`] and runs them
//! through a [`SqlExecutor`]. Rows come back as JSON objects keyed by property
//! name, with private columns removed.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::aggregate::{AggregateKind, AggregateOptions, KeyCount, KeyValueCount, compile_aggregate};
use crate::catalog::{Catalog, EntityDescriptor};
use crate::config::StoreConfig;
use crate::error::{MetadataStoreError, Result};
use crate::executor::SqlExecutor;
use crate::filter::{Condition, FieldPath, Filter, JoinSpec, WhereNode};
use crate::sql::ddl::{DdlGenerator, IndexMethod};
use crate::sql::params::SqlParam;
use crate::sql::query::{CompiledQuery, QueryCompiler};
use crate::types::ColumnType;

const TABLE_COLUMNS_SQL: &str = "SELECT column_name::text AS \"column\" FROM information_schema.columns WHERE table_schema = current_schema() AND table_name = $1";

/// How [`Repository::count`] computes its result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CountMode {
    /// `COUNT(*)` over the matching rows
    #[default]
    Exact,
    /// Planner estimate, falling back to an exact count below the configured
    /// threshold
    Estimate,
}

/// Position of a page within the full result, as sent in `Content-Range`
///
/// `end` is exclusive; the rendered form uses the inclusive last index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ContentRange {
    pub fn new(start: u64, returned: usize, total: u64) -> Self {
        Self {
            start,
            end: start + returned as u64,
            total,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "*/{}", self.total)
        } else {
            write!(f, "{}-{}/{}", self.start, self.end - 1, self.total)
        }
    }
}

/// One page of rows with its range
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub rows: Vec<Value>,
    pub range: ContentRange,
}

/// Data access for one entity
pub struct Repository {
    catalog: Arc<Catalog>,
    config: Arc<StoreConfig>,
    executor: Arc<dyn SqlExecutor>,
    entity: String,
    initialized: OnceCell<()>,
}

impl Repository {
    /// Create a repository for `entity`, failing with `EntityNotFound` when the
    /// catalog does not know it
    pub fn new(
        catalog: Arc<Catalog>,
        config: Arc<StoreConfig>,
        executor: Arc<dyn SqlExecutor>,
        entity: &str,
    ) -> Result<Self> {
        catalog.entity(entity)?;
        Ok(Self {
            catalog,
            config,
            executor,
            entity: entity.to_string(),
            initialized: OnceCell::new(),
        })
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn descriptor(&self) -> Result<&EntityDescriptor> {
        self.catalog.entity(&self.entity)
    }

    fn compiler(&self) -> Result<QueryCompiler<'_>> {
        QueryCompiler::new(&self.catalog, &self.entity)
    }

    /// Check the table against the catalog, once per repository
    ///
    /// A failed check is not cached; the next operation retries it.
    async fn ensure_initialized(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                let descriptor = self.descriptor()?;
                let query = CompiledQuery {
                    sql: TABLE_COLUMNS_SQL.to_string(),
                    params: vec![SqlParam::text(descriptor.table.as_str())],
                };
                let rows = self.executor.fetch_json(&query).await?;
                let existing: HashSet<&str> = rows
                    .iter()
                    .filter_map(|row| row.get("column").and_then(Value::as_str))
                    .collect();

                if existing.is_empty() {
                    return Err(MetadataStoreError::validation(format!(
                        "Table '{}' for entity '{}' does not exist",
                        descriptor.table, descriptor.name
                    )));
                }

                let missing = descriptor
                    .columns()
                    .iter()
                    .filter(|c| !existing.contains(c.database_name.as_str()))
                    .map(|c| c.database_name.as_str())
                    .collect::<Vec<_>>();
                if !missing.is_empty() {
                    return Err(MetadataStoreError::validation(format!(
                        "Table '{}' is missing columns: {}",
                        descriptor.table,
                        missing.join(", ")
                    )));
                }

                tracing::info!(entity = %descriptor.name, table = %descriptor.table, "repository initialized");
                Ok::<(), MetadataStoreError>(())
            })
            .await?;
        Ok(())
    }

    fn strip_private(&self, mut row: Value) -> Value {
        let prefix = self.config.private_column_prefix.as_str();
        if !prefix.is_empty() {
            if let Value::Object(map) = &mut row {
                map.retain(|key, _| !key.starts_with(prefix));
            }
        }
        row
    }

    fn strip_all(&self, rows: Vec<Value>) -> Vec<Value> {
        rows.into_iter().map(|row| self.strip_private(row)).collect()
    }

    /// Turn a payload into an insertable row, generating a missing uuid key
    fn prepare_row(&self, payload: Value) -> Result<Map<String, Value>> {
        let Value::Object(mut row) = payload else {
            return Err(MetadataStoreError::validation(format!(
                "A '{}' payload must be a JSON object",
                self.entity
            )));
        };

        let key = self.descriptor()?.primary_key();
        if key.column_type == ColumnType::Uuid
            && row.get(&key.property_name).is_none_or(Value::is_null)
        {
            row.insert(
                key.property_name.clone(),
                Value::String(Uuid::new_v4().to_string()),
            );
        }
        Ok(row)
    }

    fn id_condition(&self, id: Value) -> Result<WhereNode> {
        let key = self.descriptor()?.primary_key();
        Ok(WhereNode::leaf(
            key.property_name.as_str(),
            Condition::Eq(id),
        ))
    }

    fn values_map(&self, values: Value) -> Result<Map<String, Value>> {
        match values {
            Value::Object(map) => Ok(map),
            _ => Err(MetadataStoreError::validation(format!(
                "Values for '{}' must be a JSON object",
                self.entity
            ))),
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert one row and return it as stored
    pub async fn create(&self, payload: Value) -> Result<Value> {
        self.ensure_initialized().await?;
        let row = self.prepare_row(payload)?;
        let query = self.compiler()?.compile_insert(&row)?;

        let rows = self.executor.fetch_json(&query).await?;
        rows.into_iter()
            .next()
            .map(|row| self.strip_private(row))
            .ok_or(MetadataStoreError::Sql(sqlx::Error::RowNotFound))
    }

    /// Insert several rows in one transaction
    ///
    /// Every payload is validated before anything is sent, so one bad payload
    /// inserts nothing.
    pub async fn create_all(&self, payloads: Vec<Value>) -> Result<Vec<Value>> {
        self.ensure_initialized().await?;
        let compiler = self.compiler()?;
        let queries = payloads
            .into_iter()
            .map(|payload| compiler.compile_insert(&self.prepare_row(payload)?))
            .collect::<Result<Vec<_>>>()?;
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let results = self.executor.fetch_json_in_transaction(&queries).await?;
        Ok(self.strip_all(results.into_iter().flatten().collect()))
    }

    /// Update every row matching `condition`, returning the affected count
    pub async fn update_all(&self, condition: Option<&WhereNode>, values: Value) -> Result<u64> {
        self.ensure_initialized().await?;
        let values = self.values_map(values)?;
        let query = self.compiler()?.compile_update(condition, &values)?;
        self.executor.execute(&query).await
    }

    pub async fn update_by_id(&self, id: Value, values: Value) -> Result<()> {
        let condition = self.id_condition(id.clone())?;
        match self.update_all(Some(&condition), values).await? {
            0 => Err(MetadataStoreError::not_found(format!("{} {}", self.entity, id))),
            _ => Ok(()),
        }
    }

    /// Delete every row matching `condition`, returning the affected count
    pub async fn delete_all(&self, condition: Option<&WhereNode>) -> Result<u64> {
        self.ensure_initialized().await?;
        let query = self.compiler()?.compile_delete(condition)?;
        self.executor.execute(&query).await
    }

    pub async fn delete_by_id(&self, id: Value) -> Result<()> {
        let condition = self.id_condition(id.clone())?;
        match self.delete_all(Some(&condition)).await? {
            0 => Err(MetadataStoreError::not_found(format!("{} {}", self.entity, id))),
            _ => Ok(()),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn find(&self, filter: &Filter, join: Option<&JoinSpec>) -> Result<Vec<Value>> {
        self.ensure_initialized().await?;
        let query = self.compiler()?.compile_select(filter, join)?;
        let rows = self.executor.fetch_json(&query).await?;
        Ok(self.strip_all(rows))
    }

    /// Rows of one page together with their [`ContentRange`]
    ///
    /// A limited page counts the matching rows in the same transaction as the
    /// select. Without a limit the total follows from the rows returned.
    pub async fn find_page(&self, filter: &Filter, join: Option<&JoinSpec>) -> Result<Page> {
        self.ensure_initialized().await?;
        let compiler = self.compiler()?;
        let skip = filter.skip.unwrap_or(0);
        let select = compiler.compile_select(filter, join)?;

        if filter.limit.is_none() {
            let rows = self.executor.fetch_json(&select).await?;
            if !rows.is_empty() || skip == 0 {
                let range = ContentRange::new(skip, rows.len(), skip + rows.len() as u64);
                return Ok(Page {
                    rows: self.strip_all(rows),
                    range,
                });
            }
        }

        let count = compiler.compile_count(filter.condition.as_ref(), join)?;
        let mut results = self
            .executor
            .fetch_json_in_transaction(&[count, select])
            .await?
            .into_iter();
        let (Some(counted), Some(rows)) = (results.next(), results.next()) else {
            return Err(MetadataStoreError::Connection(
                "Paged query returned fewer result sets than statements".to_string(),
            ));
        };
        let total = count_from_rows(&counted)?;

        Ok(Page {
            range: ContentRange::new(skip, rows.len(), total),
            rows: self.strip_all(rows),
        })
    }

    pub async fn find_by_id(&self, id: Value) -> Result<Option<Value>> {
        let filter = Filter::new().with_where(self.id_condition(id)?).with_limit(1);
        Ok(self.find(&filter, None).await?.into_iter().next())
    }

    pub async fn exists_by_id(&self, id: Value) -> Result<bool> {
        let condition = self.id_condition(id)?;
        Ok(self.count(Some(&condition), CountMode::Exact).await? > 0)
    }

    /// Count rows matching `condition`
    ///
    /// In [`CountMode::Estimate`] the planner estimate is returned when it
    /// exceeds `count_estimate_threshold`; smaller tables are counted exactly.
    pub async fn count(&self, condition: Option<&WhereNode>, mode: CountMode) -> Result<u64> {
        self.ensure_initialized().await?;
        let compiler = self.compiler()?;

        if mode == CountMode::Estimate {
            let mut filter = Filter::new();
            filter.condition = condition.cloned();
            let select = compiler.compile_select(&filter, None)?;
            let estimate = self.executor.estimate_rows(&select).await?;
            if estimate > self.config.count_estimate_threshold {
                return Ok(estimate);
            }
        }

        let query = compiler.compile_count(condition, None)?;
        count_from_rows(&self.executor.fetch_json(&query).await?)
    }

    // ========================================================================
    // Aggregation
    // ========================================================================

    async fn aggregate<T: DeserializeOwned>(
        &self,
        kind: AggregateKind,
        filter: &Filter,
        join: Option<&JoinSpec>,
        options: &AggregateOptions,
    ) -> Result<Vec<T>> {
        self.ensure_initialized().await?;
        let query = compile_aggregate(
            &self.compiler()?,
            kind,
            filter,
            join,
            options,
            self.config.default_aggregation_depth,
        )?;
        self.executor
            .fetch_json(&query)
            .await?
            .into_iter()
            .map(|row| serde_json::from_value(row).map_err(Into::into))
            .collect()
    }

    /// How many times each key occurs across the payloads of matching rows
    pub async fn key_counts(
        &self,
        filter: &Filter,
        join: Option<&JoinSpec>,
        options: &AggregateOptions,
    ) -> Result<Vec<KeyCount>> {
        self.aggregate(AggregateKind::KeyCounts, filter, join, options)
            .await
    }

    /// How many times each value occurs under each key
    pub async fn value_counts(
        &self,
        filter: &Filter,
        join: Option<&JoinSpec>,
        options: &AggregateOptions,
    ) -> Result<Vec<KeyValueCount>> {
        self.aggregate(AggregateKind::ValueCounts, filter, join, options)
            .await
    }

    /// Number of distinct values seen under each key
    pub async fn distinct_value_counts(
        &self,
        filter: &Filter,
        join: Option<&JoinSpec>,
        options: &AggregateOptions,
    ) -> Result<Vec<KeyCount>> {
        self.aggregate(AggregateKind::DistinctValueCounts, filter, join, options)
            .await
    }

    // ========================================================================
    // Indexes
    // ========================================================================

    /// Create an index on `field` unless it already exists, returning its name
    ///
    /// `method` must be one of `btree`, `gist`, `gin` or `hash`. The index is
    /// built concurrently, outside any transaction.
    pub async fn ensure_index(&self, field: &str, method: &str) -> Result<String> {
        let method: IndexMethod = method.parse()?;
        self.ensure_initialized().await?;

        let descriptor = self.descriptor()?;
        let (name, sql) =
            DdlGenerator::new(descriptor).generate_create_index(&FieldPath::parse(field)?, method)?;
        self.executor.execute_ddl(&sql).await?;

        tracing::info!(entity = %descriptor.name, index = %name, %method, "index ensured");
        Ok(name)
    }
}

fn count_from_rows(rows: &[Value]) -> Result<u64> {
    rows.first()
        .and_then(|row| row.get("count"))
        .and_then(Value::as_u64)
        .ok_or(MetadataStoreError::Sql(sqlx::Error::RowNotFound))
}
