//! Statement execution
//!
//! [`SqlExecutor`] is the seam between the repositories and the database.
//! Compiled statements come back as JSON documents, one per row, so the
//! repository never has to know the column types of the projection. Rows are
//! decoded column by column from the statement itself, which keeps its
//! `ORDER BY` authoritative.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Map, Number, Value};
use sqlx::postgres::PgRow;
use sqlx::{Column, PgPool, Row, TypeInfo};

use crate::error::{MetadataStoreError, Result};
use crate::sql::params::bind_params;
use crate::sql::query::CompiledQuery;

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run a row-returning statement and collect every row as a JSON object
    async fn fetch_json(&self, query: &CompiledQuery) -> Result<Vec<Value>>;

    /// Run a statement and return the number of affected rows
    async fn execute(&self, query: &CompiledQuery) -> Result<u64>;

    /// Run several row-returning statements in one transaction
    ///
    /// Results are returned in statement order. Any failure rolls back all of
    /// them.
    async fn fetch_json_in_transaction(&self, queries: &[CompiledQuery]) -> Result<Vec<Vec<Value>>>;

    /// Planner row estimate for a statement
    async fn estimate_rows(&self, query: &CompiledQuery) -> Result<u64>;

    /// Run a parameterless DDL statement outside any transaction
    async fn execute_ddl(&self, sql: &str) -> Result<()>;
}

/// Postgres types a result column may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultType {
    Json,
    Text,
    Uuid,
    BigInt,
    Int,
    SmallInt,
    Real,
    Double,
    Numeric,
    Boolean,
    Timestamptz,
    Timestamp,
    Date,
}

impl ResultType {
    /// Map a Postgres type name as reported by the driver
    pub fn from_type_name(name: &str) -> Result<Self> {
        Ok(match name {
            "JSONB" | "JSON" => Self::Json,
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => Self::Text,
            "UUID" => Self::Uuid,
            "INT8" => Self::BigInt,
            "INT4" => Self::Int,
            "INT2" => Self::SmallInt,
            "FLOAT4" => Self::Real,
            "FLOAT8" => Self::Double,
            "NUMERIC" => Self::Numeric,
            "BOOL" => Self::Boolean,
            "TIMESTAMPTZ" => Self::Timestamptz,
            "TIMESTAMP" => Self::Timestamp,
            "DATE" => Self::Date,
            other => {
                return Err(MetadataStoreError::Connection(format!(
                    "Unsupported result column type '{}'",
                    other
                )));
            }
        })
    }
}

fn float(value: Option<f64>) -> Value {
    value
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn decode_column(row: &PgRow, index: usize, kind: ResultType) -> Result<Value> {
    let value = match kind {
        ResultType::Json => row
            .try_get::<Option<Value>, _>(index)?
            .unwrap_or(Value::Null),
        ResultType::Text => row
            .try_get::<Option<String>, _>(index)?
            .map(Value::String)
            .unwrap_or(Value::Null),
        ResultType::Uuid => row
            .try_get::<Option<uuid::Uuid>, _>(index)?
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        ResultType::BigInt => row
            .try_get::<Option<i64>, _>(index)?
            .map(Value::from)
            .unwrap_or(Value::Null),
        ResultType::Int => row
            .try_get::<Option<i32>, _>(index)?
            .map(Value::from)
            .unwrap_or(Value::Null),
        ResultType::SmallInt => row
            .try_get::<Option<i16>, _>(index)?
            .map(Value::from)
            .unwrap_or(Value::Null),
        ResultType::Real => float(row.try_get::<Option<f32>, _>(index)?.map(f64::from)),
        ResultType::Double => float(row.try_get::<Option<f64>, _>(index)?),
        ResultType::Numeric => float(
            row.try_get::<Option<rust_decimal::Decimal>, _>(index)?
                .and_then(|d| d.to_f64()),
        ),
        ResultType::Boolean => row
            .try_get::<Option<bool>, _>(index)?
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        ResultType::Timestamptz => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)?
            .map(|v| Value::String(v.to_rfc3339()))
            .unwrap_or(Value::Null),
        ResultType::Timestamp => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)?
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Null),
        ResultType::Date => row
            .try_get::<Option<chrono::NaiveDate>, _>(index)?
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
    };
    Ok(value)
}

/// Decode one row into a JSON object keyed by column name
pub fn decode_row(row: &PgRow) -> Result<Value> {
    let mut object = Map::with_capacity(row.columns().len());
    for column in row.columns() {
        let kind = ResultType::from_type_name(column.type_info().name())?;
        let value = decode_column(row, column.ordinal(), kind)?;
        object.insert(column.name().to_string(), value);
    }
    Ok(Value::Object(object))
}

/// Extract the planner row count from `EXPLAIN (FORMAT JSON)` output
pub fn plan_rows(plan: &Value) -> Result<u64> {
    plan.get(0)
        .and_then(|p| p.get("Plan"))
        .and_then(|p| p.get("Plan Rows"))
        .and_then(Value::as_f64)
        .map(|rows| rows.max(0.0).round() as u64)
        .ok_or_else(|| {
            MetadataStoreError::Connection(format!("Unexpected EXPLAIN output: {}", plan))
        })
}

/// [`SqlExecutor`] over a sqlx connection pool
#[derive(Clone)]
pub struct PgExecutor {
    pool: PgPool,
    slow_query_threshold: Duration,
}

impl PgExecutor {
    pub fn new(pool: PgPool, slow_query_threshold: Duration) -> Self {
        Self {
            pool,
            slow_query_threshold,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn observe(&self, sql: &str, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed > self.slow_query_threshold {
            tracing::warn!(
                target: "metadata_store::slow_query",
                elapsed_ms = elapsed.as_millis() as u64,
                sql = %sql,
                "slow metadata query"
            );
        }
    }
}

fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<Value>> {
    rows.iter().map(decode_row).collect()
}

#[async_trait]
impl SqlExecutor for PgExecutor {
    async fn fetch_json(&self, query: &CompiledQuery) -> Result<Vec<Value>> {
        tracing::debug!(params = query.params.len(), sql = %query.sql, "fetch");

        let started = Instant::now();
        let rows = bind_params(sqlx::query(&query.sql), &query.params)
            .fetch_all(&self.pool)
            .await;
        self.observe(&query.sql, started);

        decode_rows(rows?)
    }

    async fn execute(&self, query: &CompiledQuery) -> Result<u64> {
        tracing::debug!(params = query.params.len(), sql = %query.sql, "execute");

        let started = Instant::now();
        let result = bind_params(sqlx::query(&query.sql), &query.params)
            .execute(&self.pool)
            .await;
        self.observe(&query.sql, started);

        Ok(result?.rows_affected())
    }

    async fn fetch_json_in_transaction(&self, queries: &[CompiledQuery]) -> Result<Vec<Vec<Value>>> {
        let mut tx = self.pool.begin().await?;
        let mut results = Vec::with_capacity(queries.len());

        for query in queries {
            tracing::debug!(params = query.params.len(), sql = %query.sql, "fetch in transaction");

            let started = Instant::now();
            let rows = bind_params(sqlx::query(&query.sql), &query.params)
                .fetch_all(&mut *tx)
                .await;
            self.observe(&query.sql, started);

            // Dropping the transaction on error rolls it back
            results.push(decode_rows(rows?)?);
        }

        tx.commit().await?;
        Ok(results)
    }

    async fn estimate_rows(&self, query: &CompiledQuery) -> Result<u64> {
        let sql = format!("EXPLAIN (FORMAT JSON) {}", query.sql);
        tracing::debug!(params = query.params.len(), sql = %sql, "estimate");

        let started = Instant::now();
        let row = bind_params(sqlx::query(&sql), &query.params)
            .fetch_one(&self.pool)
            .await;
        self.observe(&sql, started);

        let plan: Value = row?.try_get(0)?;
        plan_rows(&plan)
    }

    async fn execute_ddl(&self, sql: &str) -> Result<()> {
        tracing::debug!(sql = %sql, "ddl");

        let started = Instant::now();
        let result = sqlx::raw_sql(sql).execute(&self.pool).await;
        self.observe(sql, started);

        result?;
        Ok(())
    }
}
