//! Positional parameters for compiled statements
//!
//! Every user-supplied value reaches PostgreSQL as a bound parameter. The
//! compilers push values into a [`ParamAllocator`] and splice only the returned
//! `$n` placeholder into the SQL text.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;
use uuid::Uuid;

use crate::catalog::ColumnDescriptor;
use crate::error::{MetadataStoreError, Result};
use crate::types::ColumnType;

/// A typed value bound to a `$n` placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(Option<String>),
    Integer(Option<i64>),
    Decimal(Option<Decimal>),
    Boolean(Option<bool>),
    Timestamp(Option<DateTime<Utc>>),
    Uuid(Option<Uuid>),
    Json(Option<Value>),
    TextArray(Vec<String>),
}

impl SqlParam {
    pub fn text(value: impl Into<String>) -> Self {
        SqlParam::Text(Some(value.into()))
    }

    pub fn json(value: Value) -> Self {
        SqlParam::Json(Some(value))
    }

    /// Convert a JSON value to the native type of `column`
    ///
    /// JSON `null` becomes a typed SQL `NULL`. Values that cannot be
    /// represented in the column type are rejected with `TypeMismatch`.
    pub fn for_column(column: &ColumnDescriptor, value: &Value) -> Result<Self> {
        let mismatch = |expected: &str| {
            MetadataStoreError::type_mismatch(format!(
                "Column '{}' expected {}, got {}",
                column.property_name, expected, value
            ))
        };

        Ok(match &column.column_type {
            ColumnType::Json => match value {
                Value::Null => SqlParam::Json(None),
                other => SqlParam::Json(Some(other.clone())),
            },
            ColumnType::String | ColumnType::Enum { .. } => match value {
                Value::Null => SqlParam::Text(None),
                Value::String(s) => SqlParam::Text(Some(s.clone())),
                Value::Number(n) => SqlParam::Text(Some(n.to_string())),
                Value::Bool(b) => SqlParam::Text(Some(b.to_string())),
                _ => return Err(mismatch("text")),
            },
            ColumnType::Integer => match value {
                Value::Null => SqlParam::Integer(None),
                _ => SqlParam::Integer(Some(
                    value
                        .as_i64()
                        .or_else(|| value.as_str().and_then(|s| s.parse::<i64>().ok()))
                        .ok_or_else(|| mismatch("integer"))?,
                )),
            },
            ColumnType::Decimal { .. } => match value {
                Value::Null => SqlParam::Decimal(None),
                Value::Number(n) => SqlParam::Decimal(Some(
                    parse_decimal(&n.to_string()).ok_or_else(|| mismatch("decimal"))?,
                )),
                Value::String(s) => {
                    SqlParam::Decimal(Some(parse_decimal(s).ok_or_else(|| mismatch("decimal"))?))
                }
                _ => return Err(mismatch("decimal")),
            },
            ColumnType::Boolean => match value {
                Value::Null => SqlParam::Boolean(None),
                _ => SqlParam::Boolean(Some(
                    value
                        .as_bool()
                        .or_else(|| {
                            value
                                .as_str()
                                .and_then(|s| match s.to_lowercase().as_str() {
                                    "true" | "1" | "yes" => Some(true),
                                    "false" | "0" | "no" => Some(false),
                                    _ => None,
                                })
                        })
                        .ok_or_else(|| mismatch("boolean"))?,
                )),
            },
            ColumnType::Timestamp => match value {
                Value::Null => SqlParam::Timestamp(None),
                Value::String(s) => SqlParam::Timestamp(Some(
                    DateTime::parse_from_rfc3339(s)
                        .map_err(|_| mismatch("an RFC 3339 timestamp"))?
                        .with_timezone(&Utc),
                )),
                _ => return Err(mismatch("an RFC 3339 timestamp")),
            },
            ColumnType::Uuid => match value {
                Value::Null => SqlParam::Uuid(None),
                Value::String(s) => {
                    SqlParam::Uuid(Some(Uuid::parse_str(s).map_err(|_| mismatch("a uuid"))?))
                }
                _ => return Err(mismatch("a uuid")),
            },
        })
    }
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    s.parse::<Decimal>()
        .ok()
        .or_else(|| Decimal::from_scientific(s).ok())
}

/// Hands out `$1, $2, ...` placeholders in push order
///
/// One allocator is shared by every fragment of a statement so placeholders
/// never collide, including the WHERE clauses of joined entities.
#[derive(Debug, Default)]
pub struct ParamAllocator {
    params: Vec<SqlParam>,
}

impl ParamAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter and return its placeholder
    pub fn push(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn into_params(self) -> Vec<SqlParam> {
        self.params
    }
}

/// Bind parameters to a query in placeholder order
pub fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[SqlParam],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Text(v) => query.bind(v.clone()),
            SqlParam::Integer(v) => query.bind(*v),
            SqlParam::Decimal(v) => query.bind(*v),
            SqlParam::Boolean(v) => query.bind(*v),
            SqlParam::Timestamp(v) => query.bind(*v),
            SqlParam::Uuid(v) => query.bind(*v),
            SqlParam::Json(v) => query.bind(v.clone()),
            SqlParam::TextArray(v) => query.bind(v.clone()),
        };
    }
    query
}
