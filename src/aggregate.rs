//! Key/value aggregation over JSON payloads
//!
//! Every row's payload is flattened into key occurrences:
//!
//! - each object property is an occurrence keyed `parent.child` (the root has
//!   an empty parent)
//! - an object value is recorded as `[object]` and expanded only while its key
//!   contains fewer `.` characters than `depth`
//! - under the same cutoff a non-empty array is expanded, its elements
//!   inheriting the array's key; past the cutoff, or when empty, it is recorded
//!   as `[array]`
//! - scalars are recorded as their text, JSON `null` as [`FlatValue::Null`]
//!
//! The same rules are realized twice: in memory by [`flatten`] and in SQL by
//! [`compile_aggregate`], which runs a recursive CTE over the filtered rows.
//! Both produce identical results.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{ColumnDescriptor, EntityDescriptor};
use crate::error::{MetadataStoreError, Result};
use crate::filter::{FieldPath, Filter, JoinSpec};
use crate::sql::params::{ParamAllocator, SqlParam};
use crate::sql::query::{CompiledQuery, QueryCompiler};
use crate::sql::sanitize::quote_identifier;

pub const OBJECT_SENTINEL: &str = "[object]";
pub const ARRAY_SENTINEL: &str = "[array]";

/// Container values that are not expanded further
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Sentinel {
    Object,
    Array,
}

impl Sentinel {
    pub fn as_str(self) -> &'static str {
        match self {
            Sentinel::Object => OBJECT_SENTINEL,
            Sentinel::Array => ARRAY_SENTINEL,
        }
    }
}

/// Value of one flattened occurrence
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlatValue {
    Null,
    Scalar(String),
    Sentinel(Sentinel),
}

impl FlatValue {
    /// Text used in value histograms; `None` for null
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FlatValue::Null => None,
            FlatValue::Scalar(s) => Some(s),
            FlatValue::Sentinel(sentinel) => Some(sentinel.as_str()),
        }
    }
}

/// Number of `.` characters in a key
fn key_depth(key: &str) -> u32 {
    key.bytes().filter(|b| *b == b'.').count() as u32
}

/// Whether a container under `key` is expanded at `depth`
fn expands(key: &str, depth: u32) -> bool {
    key.is_empty() || key_depth(key) < depth
}

/// Flatten one payload into `(key, value)` occurrences
pub fn flatten(payload: &Value, depth: u32) -> Vec<(String, FlatValue)> {
    let mut out = Vec::new();
    visit("", payload, depth, &mut out);
    out
}

fn visit(key: &str, value: &Value, depth: u32, out: &mut Vec<(String, FlatValue)>) {
    match value {
        Value::Object(map) => {
            if !key.is_empty() {
                out.push((key.to_string(), FlatValue::Sentinel(Sentinel::Object)));
            }
            if expands(key, depth) {
                for (child, child_value) in map {
                    let child_key = if key.is_empty() {
                        child.clone()
                    } else {
                        format!("{}.{}", key, child)
                    };
                    visit(&child_key, child_value, depth, out);
                }
            }
        }
        Value::Array(items) if items.is_empty() || !expands(key, depth) => {
            if !key.is_empty() {
                out.push((key.to_string(), FlatValue::Sentinel(Sentinel::Array)));
            }
        }
        Value::Array(items) => {
            for item in items {
                visit(key, item, depth, out);
            }
        }
        Value::Null => {
            if !key.is_empty() {
                out.push((key.to_string(), FlatValue::Null));
            }
        }
        Value::String(s) => {
            if !key.is_empty() {
                out.push((key.to_string(), FlatValue::Scalar(s.clone())));
            }
        }
        scalar => {
            if !key.is_empty() {
                out.push((key.to_string(), FlatValue::Scalar(scalar.to_string())));
            }
        }
    }
}

/// Whether `key` is one of `fields` or lies underneath one of them
pub fn key_in_fields(key: &str, fields: &[String]) -> bool {
    fields.iter().any(|field| {
        key == field
            || (key.len() > field.len()
                && key.starts_with(field.as_str())
                && key.as_bytes()[field.len()] == b'.')
    })
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCount {
    pub key: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueCount {
    pub key: String,
    pub value: String,
    pub count: i64,
}

/// `{key: count}` view of key counts
pub fn key_count_map(rows: &[KeyCount]) -> BTreeMap<String, i64> {
    rows.iter().map(|r| (r.key.clone(), r.count)).collect()
}

/// `{key: {value: count}}` view of value counts
pub fn value_count_map(rows: &[KeyValueCount]) -> BTreeMap<String, BTreeMap<String, i64>> {
    let mut map: BTreeMap<String, BTreeMap<String, i64>> = BTreeMap::new();
    for row in rows {
        map.entry(row.key.clone())
            .or_default()
            .insert(row.value.clone(), row.count);
    }
    map
}

fn sort_key_counts(counts: HashMap<String, i64>) -> Vec<KeyCount> {
    let mut rows: Vec<KeyCount> = counts
        .into_iter()
        .map(|(key, count)| KeyCount { key, count })
        .collect();
    rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    rows
}

fn paginate<T>(rows: Vec<T>, skip: Option<u64>, limit: Option<u64>) -> Vec<T> {
    let skip = usize::try_from(skip.unwrap_or(0)).unwrap_or(usize::MAX);
    let limit = limit
        .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
        .unwrap_or(usize::MAX);
    rows.into_iter().skip(skip).take(limit).collect()
}

// ============================================================================
// In-memory realization
// ============================================================================

/// Aggregation parameters after defaults are applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateScope {
    pub depth: u32,
    /// Keys to keep, relative to the payload column; `None` keeps every key
    pub fields: Option<Vec<String>>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

impl AggregateScope {
    pub fn new(depth: u32) -> Self {
        Self {
            depth,
            ..Self::default()
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_pagination(mut self, skip: Option<u64>, limit: Option<u64>) -> Self {
        self.skip = skip;
        self.limit = limit;
        self
    }

    fn keeps(&self, key: &str) -> bool {
        self.fields
            .as_deref()
            .is_none_or(|fields| key_in_fields(key, fields))
    }
}

/// Occurrences per key, nulls included
pub fn key_counts<'v>(payloads: impl IntoIterator<Item = &'v Value>, scope: &AggregateScope) -> Vec<KeyCount> {
    let mut counts: HashMap<String, i64> = HashMap::new();
    for payload in payloads {
        for (key, _) in flatten(payload, scope.depth) {
            if scope.keeps(&key) {
                *counts.entry(key).or_insert(0) += 1;
            }
        }
    }
    paginate(sort_key_counts(counts), scope.skip, scope.limit)
}

/// Occurrences per `(key, value)`, nulls excluded
pub fn value_counts<'v>(
    payloads: impl IntoIterator<Item = &'v Value>,
    scope: &AggregateScope,
) -> Vec<KeyValueCount> {
    let mut counts: HashMap<(String, String), i64> = HashMap::new();
    for payload in payloads {
        for (key, value) in flatten(payload, scope.depth) {
            if let Some(text) = value.as_text() {
                if scope.keeps(&key) {
                    *counts.entry((key, text.to_string())).or_insert(0) += 1;
                }
            }
        }
    }

    let mut rows: Vec<KeyValueCount> = counts
        .into_iter()
        .map(|((key, value), count)| KeyValueCount { key, value, count })
        .collect();
    rows.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.key.cmp(&b.key))
            .then_with(|| a.value.cmp(&b.value))
    });
    paginate(rows, scope.skip, scope.limit)
}

/// Distinct non-null values per key; the `fields` restriction does not apply
pub fn distinct_value_counts<'v>(
    payloads: impl IntoIterator<Item = &'v Value>,
    scope: &AggregateScope,
) -> Vec<KeyCount> {
    let mut values: HashMap<String, BTreeSet<String>> = HashMap::new();
    for payload in payloads {
        for (key, value) in flatten(payload, scope.depth) {
            if let Some(text) = value.as_text() {
                values.entry(key).or_default().insert(text.to_string());
            }
        }
    }
    let counts = values
        .into_iter()
        .map(|(key, set)| (key, set.len() as i64))
        .collect();
    paginate(sort_key_counts(counts), scope.skip, scope.limit)
}

// ============================================================================
// SQL realization
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    KeyCounts,
    ValueCounts,
    DistinctValueCounts,
}

/// Caller-facing aggregation options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateOptions {
    /// Flattening depth; the store's configured default when absent
    #[serde(default)]
    pub depth: Option<u32>,
    /// JSON column to aggregate; the entity's payload column when absent
    #[serde(default)]
    pub column: Option<String>,
}

impl AggregateOptions {
    pub fn depth(depth: u32) -> Self {
        Self {
            depth: Some(depth),
            column: None,
        }
    }

    /// Resolve the aggregated JSON column of `descriptor`
    pub fn payload_column<'d>(&self, descriptor: &'d EntityDescriptor) -> Result<&'d ColumnDescriptor> {
        let column = match &self.column {
            Some(name) => descriptor.column(name).ok_or_else(|| {
                MetadataStoreError::unknown_column(format!("{}.{}", descriptor.name, name))
            })?,
            None => descriptor.payload_column().ok_or_else(|| {
                MetadataStoreError::validation(format!(
                    "Entity '{}' has no JSON column to aggregate",
                    descriptor.name
                ))
            })?,
        };
        if !column.is_json() {
            return Err(MetadataStoreError::type_mismatch(format!(
                "Cannot aggregate '{}': not a JSON column",
                column.property_name
            )));
        }
        Ok(column)
    }
}

/// Translate a field selection into keys relative to the payload column
///
/// Paths rooted at the payload column drop that segment; naming the column
/// itself selects every key.
pub fn relative_fields(column: &ColumnDescriptor, fields: Option<&[FieldPath]>) -> Option<Vec<String>> {
    let fields = fields.filter(|f| !f.is_empty())?;
    let mut relative = Vec::with_capacity(fields.len());
    for field in fields {
        if field.root() == column.property_name {
            if !field.is_nested() {
                return None;
            }
            relative.push(field.subpath().join("."));
        } else {
            relative.push(field.to_string());
        }
    }
    Some(relative)
}

/// Compile an aggregation over the rows selected by `filter`
///
/// `filter.fields` restricts the aggregated keys, `filter.skip` and
/// `filter.limit` page through the aggregated rows.
pub fn compile_aggregate(
    compiler: &QueryCompiler<'_>,
    kind: AggregateKind,
    filter: &Filter,
    join: Option<&JoinSpec>,
    options: &AggregateOptions,
    default_depth: u32,
) -> Result<CompiledQuery> {
    let descriptor = compiler.descriptor();
    let column = options.payload_column(descriptor)?;
    let depth = options.depth.unwrap_or(default_depth);

    let mut params = ParamAllocator::new();
    let base = compiler.compile_base(filter.condition.as_ref(), join, &mut params)?;
    let payload = format!("\"base\".{}", quote_identifier(&column.property_name));
    let depth_param = params.push(SqlParam::Integer(Some(i64::from(depth))));

    let mut occurrence_filter = String::new();
    if kind != AggregateKind::DistinctValueCounts {
        if let Some(fields) = relative_fields(column, filter.fields.as_deref()) {
            let fields_param = params.push(SqlParam::TextArray(fields));
            occurrence_filter = format!(
                " AND EXISTS (SELECT 1 FROM unnest({}::text[]) AS \"p\"(\"path\") WHERE \"flat\".\"key\" = \"p\".\"path\" OR starts_with(\"flat\".\"key\", \"p\".\"path\" || '.'))",
                fields_param
            );
        }
    }

    // Same cutoff as `expands`, over the key of the row being expanded
    let cutoff = |key: &str| {
        format!(
            "{key} = '' OR length({key}) - length(replace({key}, '.', '')) < {depth_param}"
        )
    };
    let expands = cutoff("\"f\".\"key\"");
    let expanded = format!("({})", cutoff("\"flat\".\"key\""));

    let mut sql = format!(
        "WITH RECURSIVE \"base\" AS ({base}), \
\"flat\"(\"key\", \"value\") AS (\
SELECT ''::text, {payload} FROM \"base\" WHERE {payload} IS NOT NULL \
UNION ALL \
SELECT \"c\".\"key\", \"c\".\"value\" FROM \"flat\" \"f\" CROSS JOIN LATERAL (\
SELECT CASE WHEN \"f\".\"key\" = '' THEN \"o\".\"key\" ELSE \"f\".\"key\" || '.' || \"o\".\"key\" END AS \"key\", \"o\".\"value\" \
FROM jsonb_each(CASE WHEN jsonb_typeof(\"f\".\"value\") = 'object' AND ({expands}) THEN \"f\".\"value\" ELSE '{{}}'::jsonb END) AS \"o\" \
UNION ALL \
SELECT \"f\".\"key\", \"a\".\"value\" \
FROM jsonb_array_elements(CASE WHEN jsonb_typeof(\"f\".\"value\") = 'array' AND ({expands}) THEN \"f\".\"value\" ELSE '[]'::jsonb END) AS \"a\"\
) AS \"c\"), \
\"occurrences\" AS (\
SELECT \"flat\".\"key\" AS \"key\", CASE jsonb_typeof(\"flat\".\"value\") WHEN 'object' THEN '{OBJECT_SENTINEL}' WHEN 'array' THEN '{ARRAY_SENTINEL}' WHEN 'null' THEN NULL ELSE \"flat\".\"value\" #>> '{{}}' END AS \"value\" \
FROM \"flat\" WHERE \"flat\".\"key\" <> '' AND NOT (jsonb_typeof(\"flat\".\"value\") = 'array' AND jsonb_array_length(\"flat\".\"value\") > 0 AND {expanded}){occurrence_filter}) "
    );

    sql.push_str(match kind {
        AggregateKind::KeyCounts => {
            "SELECT \"key\", COUNT(*) AS \"count\" FROM \"occurrences\" GROUP BY \"key\" ORDER BY \"count\" DESC, \"key\" COLLATE \"C\" ASC"
        }
        AggregateKind::ValueCounts => {
            "SELECT \"key\", \"value\", COUNT(*) AS \"count\" FROM \"occurrences\" WHERE \"value\" IS NOT NULL GROUP BY \"key\", \"value\" ORDER BY \"count\" DESC, \"key\" COLLATE \"C\" ASC, \"value\" COLLATE \"C\" ASC"
        }
        AggregateKind::DistinctValueCounts => {
            "SELECT \"key\", COUNT(DISTINCT \"value\") AS \"count\" FROM \"occurrences\" WHERE \"value\" IS NOT NULL GROUP BY \"key\" ORDER BY \"count\" DESC, \"key\" COLLATE \"C\" ASC"
        }
    });

    if let Some(limit) = filter.limit {
        let limit = i64::try_from(Filter::check_limit(limit)?)
            .map_err(|_| MetadataStoreError::validation("limit is out of range"))?;
        sql.push_str(&format!(" LIMIT {}", params.push(SqlParam::Integer(Some(limit)))));
    }
    if let Some(skip) = filter.skip {
        let skip = i64::try_from(skip)
            .map_err(|_| MetadataStoreError::validation("skip is out of range"))?;
        sql.push_str(&format!(" OFFSET {}", params.push(SqlParam::Integer(Some(skip)))));
    }

    Ok(CompiledQuery {
        sql,
        params: params.into_params(),
    })
}
