//! Filter types accepted from the controller layer
//!
//! A [`Filter`] is the JSON-serializable query description: field selection,
//! a boolean predicate tree ([`WhereNode`]), ordering and pagination. Parsing
//! is strict: malformed shapes are rejected with a structured error instead of
//! being coerced.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{MetadataStoreError, Result};

// ============================================================================
// Field paths
// ============================================================================

/// A dotted path into an entity: `root[.segment...]`
///
/// The root names a column; the remaining segments walk into a JSON column.
/// Paths read from requests go through [`FieldPath::parse`]; the `From`
/// conversions are for paths written in code and are checked again when the
/// path is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(into = "String")]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    /// Parse a dotted path, rejecting empty paths and empty segments
    pub fn parse(path: &str) -> Result<Self> {
        let parsed = Self::from(path);
        parsed.check()?;
        Ok(parsed)
    }

    /// Fail with `Validation` when the path or one of its segments is empty
    pub fn check(&self) -> Result<()> {
        if self.segments.is_empty() || self.segments.iter().any(String::is_empty) {
            return Err(MetadataStoreError::validation(format!(
                "Malformed field path '{}': empty segment",
                self
            )));
        }
        Ok(())
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn root(&self) -> &str {
        self.segments.first().map(String::as_str).unwrap_or("")
    }

    /// Segments below the root column
    pub fn subpath(&self) -> &[String] {
        self.segments.get(1..).unwrap_or(&[])
    }

    pub fn is_nested(&self) -> bool {
        self.segments.len() > 1
    }

    /// Whether `self` equals `other` or lies underneath it
    pub fn starts_with(&self, other: &FieldPath) -> bool {
        self.segments.starts_with(&other.segments)
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self {
            segments: path.split('.').map(str::to_string).collect(),
        }
    }
}

impl From<String> for FieldPath {
    fn from(path: String) -> Self {
        Self::from(path.as_str())
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let path = String::deserialize(deserializer)?;
        FieldPath::parse(&path).map_err(serde::de::Error::custom)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.to_string()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

// ============================================================================
// Conditions
// ============================================================================

/// Operator applied to a single field
///
/// JSON forms: a single-key operator object (`{"gt": 3}`), a bare scalar or
/// `null` (shorthand for `eq`), or a bare object/array without an operator key
/// (shorthand for `containsJSON`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Condition {
    Eq(Value),
    Neq(Value),
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    Between(Value, Value),
    Inq(Vec<Value>),
    Nin(Vec<Value>),
    Like(String),
    Ilike(String),
    Nlike(String),
    Nilike(String),
    FullTextSearch(FullTextQuery),
    /// The JSON value has at least one of these keys (`?|`)
    Any(Vec<String>),
    /// The JSON value is a superset of this document (`@>`)
    ContainsJson(Value),
}

const CONDITION_OPERATORS: &[&str] = &[
    "eq",
    "neq",
    "lt",
    "lte",
    "gt",
    "gte",
    "between",
    "inq",
    "nin",
    "like",
    "ilike",
    "nlike",
    "nilike",
    "fullTextSearch",
    "any",
    "containsJSON",
];

impl Condition {
    /// Operator name as it appears in JSON
    pub fn operator(&self) -> &'static str {
        match self {
            Condition::Eq(_) => "eq",
            Condition::Neq(_) => "neq",
            Condition::Lt(_) => "lt",
            Condition::Lte(_) => "lte",
            Condition::Gt(_) => "gt",
            Condition::Gte(_) => "gte",
            Condition::Between(_, _) => "between",
            Condition::Inq(_) => "inq",
            Condition::Nin(_) => "nin",
            Condition::Like(_) => "like",
            Condition::Ilike(_) => "ilike",
            Condition::Nlike(_) => "nlike",
            Condition::Nilike(_) => "nilike",
            Condition::FullTextSearch(_) => "fullTextSearch",
            Condition::Any(_) => "any",
            Condition::ContainsJson(_) => "containsJSON",
        }
    }

    fn from_operator(op: &str, payload: Value) -> Result<Self> {
        let pattern = |payload: Value| match payload {
            Value::String(s) => Ok(s),
            other => Err(MetadataStoreError::invalid_predicate(format!(
                "{} requires a string pattern, got {}",
                op, other
            ))),
        };
        let list = |payload: Value| match payload {
            Value::Array(items) => Ok(items),
            other => Err(MetadataStoreError::invalid_predicate(format!(
                "{} requires an array, got {}",
                op, other
            ))),
        };

        Ok(match op {
            "eq" => Condition::Eq(payload),
            "neq" => Condition::Neq(payload),
            "lt" => Condition::Lt(payload),
            "lte" => Condition::Lte(payload),
            "gt" => Condition::Gt(payload),
            "gte" => Condition::Gte(payload),
            "between" => {
                let bounds = list(payload)?;
                match <[Value; 2]>::try_from(bounds) {
                    Ok([low, high]) => Condition::Between(low, high),
                    Err(bounds) => {
                        return Err(MetadataStoreError::invalid_predicate(format!(
                            "between requires exactly two bounds, got {}",
                            bounds.len()
                        )));
                    }
                }
            }
            "inq" => Condition::Inq(list(payload)?),
            "nin" => Condition::Nin(list(payload)?),
            "like" => Condition::Like(pattern(payload)?),
            "ilike" => Condition::Ilike(pattern(payload)?),
            "nlike" => Condition::Nlike(pattern(payload)?),
            "nilike" => Condition::Nilike(pattern(payload)?),
            "fullTextSearch" => Condition::FullTextSearch(FullTextQuery::try_from(payload)?),
            "any" => {
                let keys = match payload {
                    Value::String(key) => vec![key],
                    Value::Array(items) => items
                        .into_iter()
                        .map(|item| match item {
                            Value::String(key) => Ok(key),
                            other => Err(MetadataStoreError::invalid_predicate(format!(
                                "any requires string keys, got {}",
                                other
                            ))),
                        })
                        .collect::<Result<Vec<_>>>()?,
                    other => {
                        return Err(MetadataStoreError::invalid_predicate(format!(
                            "any requires a key or an array of keys, got {}",
                            other
                        )));
                    }
                };
                Condition::Any(keys)
            }
            "containsJSON" => Condition::ContainsJson(payload),
            other => {
                return Err(MetadataStoreError::invalid_predicate(format!(
                    "Unknown operator '{}'",
                    other
                )));
            }
        })
    }
}

impl TryFrom<Value> for Condition {
    type Error = MetadataStoreError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => {
                let operators = map
                    .keys()
                    .filter(|k| CONDITION_OPERATORS.contains(&k.as_str()))
                    .count();
                match (operators, map.len()) {
                    (0, _) => Ok(Condition::ContainsJson(Value::Object(map))),
                    (1, 1) => {
                        let (op, payload) = map.into_iter().next().ok_or_else(|| {
                            MetadataStoreError::invalid_predicate("empty condition")
                        })?;
                        Condition::from_operator(&op, payload)
                    }
                    _ => Err(MetadataStoreError::invalid_predicate(format!(
                        "A condition takes exactly one operator, got {}",
                        Value::Object(map)
                    ))),
                }
            }
            Value::Array(_) => Ok(Condition::ContainsJson(value)),
            scalar => Ok(Condition::Eq(scalar)),
        }
    }
}

impl From<Condition> for Value {
    fn from(condition: Condition) -> Self {
        let op = condition.operator();
        let payload = match condition {
            Condition::Eq(v)
            | Condition::Neq(v)
            | Condition::Lt(v)
            | Condition::Lte(v)
            | Condition::Gt(v)
            | Condition::Gte(v)
            | Condition::ContainsJson(v) => v,
            Condition::Between(low, high) => Value::Array(vec![low, high]),
            Condition::Inq(items) | Condition::Nin(items) => Value::Array(items),
            Condition::Like(s) | Condition::Ilike(s) | Condition::Nlike(s) | Condition::Nilike(s) => {
                Value::String(s)
            }
            Condition::FullTextSearch(query) => query.into(),
            Condition::Any(keys) => Value::Array(keys.into_iter().map(Value::String).collect()),
        };
        let mut map = Map::new();
        map.insert(op.to_string(), payload);
        Value::Object(map)
    }
}

/// Full-text search expression, compiled to a `tsquery`
///
/// JSON forms: a bare string or `{"eq": "..."}` (term), `{"neq": "..."}`
/// (negated term), `{"and": [...]}`, `{"or": [...]}`, `{"not": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum FullTextQuery {
    Term(String),
    Neq(String),
    And(Vec<FullTextQuery>),
    Or(Vec<FullTextQuery>),
    Not(Box<FullTextQuery>),
}

impl TryFrom<Value> for FullTextQuery {
    type Error = MetadataStoreError;

    fn try_from(value: Value) -> Result<Self> {
        let term = |v: Value| match v {
            Value::String(s) => Ok(s),
            other => Err(MetadataStoreError::invalid_predicate(format!(
                "fullTextSearch terms must be strings, got {}",
                other
            ))),
        };
        let group = |v: Value| match v {
            Value::Array(items) if !items.is_empty() => items
                .into_iter()
                .map(FullTextQuery::try_from)
                .collect::<Result<Vec<_>>>(),
            other => Err(MetadataStoreError::invalid_predicate(format!(
                "fullTextSearch groups require a non-empty array, got {}",
                other
            ))),
        };

        match value {
            Value::String(s) => Ok(FullTextQuery::Term(s)),
            Value::Object(map) if map.len() == 1 => {
                let (op, payload) = map
                    .into_iter()
                    .next()
                    .ok_or_else(|| MetadataStoreError::invalid_predicate("empty query"))?;
                match op.as_str() {
                    "eq" => Ok(FullTextQuery::Term(term(payload)?)),
                    "neq" => Ok(FullTextQuery::Neq(term(payload)?)),
                    "and" => Ok(FullTextQuery::And(group(payload)?)),
                    "or" => Ok(FullTextQuery::Or(group(payload)?)),
                    "not" => Ok(FullTextQuery::Not(Box::new(FullTextQuery::try_from(
                        payload,
                    )?))),
                    other => Err(MetadataStoreError::invalid_predicate(format!(
                        "Unknown fullTextSearch operator '{}'",
                        other
                    ))),
                }
            }
            other => Err(MetadataStoreError::invalid_predicate(format!(
                "Malformed fullTextSearch query: {}",
                other
            ))),
        }
    }
}

impl From<FullTextQuery> for Value {
    fn from(query: FullTextQuery) -> Self {
        let (op, payload) = match query {
            FullTextQuery::Term(s) => return Value::String(s),
            FullTextQuery::Neq(s) => ("neq", Value::String(s)),
            FullTextQuery::And(items) => (
                "and",
                Value::Array(items.into_iter().map(Value::from).collect()),
            ),
            FullTextQuery::Or(items) => (
                "or",
                Value::Array(items.into_iter().map(Value::from).collect()),
            ),
            FullTextQuery::Not(inner) => ("not", Value::from(*inner)),
        };
        let mut map = Map::new();
        map.insert(op.to_string(), payload);
        Value::Object(map)
    }
}

// ============================================================================
// Predicate tree
// ============================================================================

/// Boolean predicate tree
///
/// JSON forms: `{"and": [...]}`, `{"or": [...]}`, `{"not": {...}}`,
/// `{"field": "meta.x", "condition": ...}`, or the shorthand
/// `{"meta.x": <condition>, ...}` where several keys are combined with AND.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum WhereNode {
    And(Vec<WhereNode>),
    Or(Vec<WhereNode>),
    Not(Box<WhereNode>),
    Leaf { field: FieldPath, condition: Condition },
}

impl WhereNode {
    pub fn leaf(field: impl Into<FieldPath>, condition: Condition) -> Self {
        WhereNode::Leaf {
            field: field.into(),
            condition,
        }
    }

    fn group(key: &str, payload: Value) -> Result<Vec<WhereNode>> {
        match payload {
            Value::Array(items) if !items.is_empty() => {
                items.into_iter().map(WhereNode::try_from).collect()
            }
            Value::Array(_) => Err(MetadataStoreError::invalid_predicate(format!(
                "'{}' requires at least one condition",
                key
            ))),
            other => Err(MetadataStoreError::invalid_predicate(format!(
                "'{}' requires an array of conditions, got {}",
                key, other
            ))),
        }
    }
}

impl TryFrom<Value> for WhereNode {
    type Error = MetadataStoreError;

    fn try_from(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(MetadataStoreError::invalid_predicate(format!(
                "A where clause must be an object, got {}",
                value
            )));
        };

        if map.is_empty() {
            return Err(MetadataStoreError::invalid_predicate(
                "A where clause requires at least one condition",
            ));
        }

        if map.len() == 2 && map.contains_key("field") && map.contains_key("condition") {
            let field = match map.remove("field") {
                Some(Value::String(field)) => FieldPath::parse(&field)
                    .map_err(|e| MetadataStoreError::invalid_predicate(e.to_string()))?,
                other => {
                    return Err(MetadataStoreError::invalid_predicate(format!(
                        "'field' must be a string, got {}",
                        other.unwrap_or(Value::Null)
                    )));
                }
            };
            let condition = Condition::try_from(map.remove("condition").unwrap_or(Value::Null))?;
            return Ok(WhereNode::Leaf { field, condition });
        }

        let mut nodes = map
            .into_iter()
            .map(|(key, payload)| match key.as_str() {
                "and" => Ok(WhereNode::And(WhereNode::group(&key, payload)?)),
                "or" => Ok(WhereNode::Or(WhereNode::group(&key, payload)?)),
                "not" => Ok(WhereNode::Not(Box::new(WhereNode::try_from(payload)?))),
                _ => Ok(WhereNode::Leaf {
                    field: FieldPath::parse(&key)
                        .map_err(|e| MetadataStoreError::invalid_predicate(e.to_string()))?,
                    condition: Condition::try_from(payload)?,
                }),
            })
            .collect::<Result<Vec<_>>>()?;

        if nodes.len() == 1 {
            Ok(nodes.remove(0))
        } else {
            Ok(WhereNode::And(nodes))
        }
    }
}

impl From<WhereNode> for Value {
    fn from(node: WhereNode) -> Self {
        let mut map = Map::new();
        match node {
            WhereNode::And(children) => {
                map.insert(
                    "and".to_string(),
                    Value::Array(children.into_iter().map(Value::from).collect()),
                );
            }
            WhereNode::Or(children) => {
                map.insert(
                    "or".to_string(),
                    Value::Array(children.into_iter().map(Value::from).collect()),
                );
            }
            WhereNode::Not(inner) => {
                map.insert("not".to_string(), Value::from(*inner));
            }
            WhereNode::Leaf { field, condition } => {
                map.insert("field".to_string(), Value::String(field.to_string()));
                map.insert("condition".to_string(), Value::from(condition));
            }
        }
        Value::Object(map)
    }
}

// ============================================================================
// Ordering
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// One `ORDER BY` term, written `"path [ASC|DESC]"` in JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderSpec {
    pub field: FieldPath,
    pub direction: SortDirection,
}

impl OrderSpec {
    pub fn asc(field: impl Into<FieldPath>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<FieldPath>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

impl TryFrom<String> for OrderSpec {
    type Error = MetadataStoreError;

    fn try_from(spec: String) -> Result<Self> {
        let parts: Vec<&str> = spec.split_whitespace().collect();
        let (field, direction) = match parts.as_slice() {
            [field] => (*field, SortDirection::Asc),
            [field, direction] => {
                let direction = match direction.to_uppercase().as_str() {
                    "ASC" => SortDirection::Asc,
                    "DESC" => SortDirection::Desc,
                    _ => {
                        return Err(MetadataStoreError::invalid_order(format!(
                            "Invalid sort direction '{}'. Must be 'ASC' or 'DESC'.",
                            direction
                        )));
                    }
                };
                (*field, direction)
            }
            _ => {
                return Err(MetadataStoreError::invalid_order(format!(
                    "Malformed order '{}'",
                    spec
                )));
            }
        };
        Ok(Self {
            field: FieldPath::parse(field)
                .map_err(|e| MetadataStoreError::invalid_order(e.to_string()))?,
            direction,
        })
    }
}

impl From<OrderSpec> for String {
    fn from(spec: OrderSpec) -> Self {
        format!("{} {}", spec.field, spec.direction.as_sql())
    }
}

// ============================================================================
// Relationship joins
// ============================================================================

/// A single-hop traversal used to filter by (and project from) a related entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinSpec {
    /// Relationship name in the catalog
    pub relation: String,
    /// SQL alias of the joined entity; also the result key of `select`
    pub alias: String,
    /// Fields of the joined entity projected under `alias`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub select: Vec<FieldPath>,
    /// Predicate evaluated against the joined entity
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<WhereNode>,
}

impl JoinSpec {
    pub fn new(relation: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            relation: relation.into(),
            alias: alias.into(),
            select: Vec::new(),
            condition: None,
        }
    }

    pub fn with_select(mut self, fields: Vec<FieldPath>) -> Self {
        self.select = fields;
        self
    }

    pub fn with_where(mut self, condition: WhereNode) -> Self {
        self.condition = Some(condition);
        self
    }
}

// ============================================================================
// Filter
// ============================================================================

/// Query description: selection, predicate, ordering and pagination
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Filter {
    pub fields: Option<Vec<FieldPath>>,
    pub condition: Option<WhereNode>,
    pub order: Vec<OrderSpec>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a filter received from a request body or query string
    pub fn from_value(value: Value) -> Result<Self> {
        Self::try_from(value)
    }

    pub fn with_fields<P: Into<FieldPath>>(mut self, fields: impl IntoIterator<Item = P>) -> Self {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_where(mut self, condition: WhereNode) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_order(mut self, order: OrderSpec) -> Self {
        self.order.push(order);
        self
    }

    pub fn with_pagination(mut self, skip: u64, limit: u64) -> Self {
        self.skip = Some(skip);
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    fn parse_fields(value: Value) -> Result<Vec<FieldPath>> {
        let fields: Vec<FieldPath> = match value {
            Value::String(path) => vec![FieldPath::parse(&path)?],
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(path) => FieldPath::parse(&path),
                    other => Err(MetadataStoreError::validation(format!(
                        "fields entries must be strings, got {}",
                        other
                    ))),
                })
                .collect::<Result<_>>()?,
            Value::Object(map) => {
                let mut selected = Vec::new();
                for (path, flag) in map {
                    match flag {
                        Value::Bool(true) => selected.push(FieldPath::parse(&path)?),
                        Value::Bool(false) => {}
                        other => {
                            return Err(MetadataStoreError::validation(format!(
                                "fields.{} must be a boolean, got {}",
                                path, other
                            )));
                        }
                    }
                }
                if selected.is_empty() {
                    return Err(MetadataStoreError::validation(
                        "fields must select at least one field",
                    ));
                }
                selected
            }
            other => {
                return Err(MetadataStoreError::validation(format!(
                    "fields must be an array or an object, got {}",
                    other
                )));
            }
        };
        Ok(fields)
    }

    fn parse_order(value: Value) -> Result<Vec<OrderSpec>> {
        match value {
            Value::String(spec) => Ok(vec![OrderSpec::try_from(spec)?]),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(spec) => OrderSpec::try_from(spec),
                    other => Err(MetadataStoreError::invalid_order(format!(
                        "order entries must be strings, got {}",
                        other
                    ))),
                })
                .collect(),
            other => Err(MetadataStoreError::invalid_order(format!(
                "order must be a string or an array, got {}",
                other
            ))),
        }
    }

    fn parse_count(key: &str, value: Value) -> Result<u64> {
        value.as_u64().ok_or_else(|| {
            MetadataStoreError::validation(format!(
                "{} must be a non-negative integer, got {}",
                key, value
            ))
        })
    }

    fn parse_limit(value: Value) -> Result<u64> {
        Filter::check_limit(Filter::parse_count("limit", value)?)
    }

    /// A page limit must be positive
    pub fn check_limit(limit: u64) -> Result<u64> {
        match limit {
            0 => Err(MetadataStoreError::validation(
                "limit must be a positive integer, got 0",
            )),
            limit => Ok(limit),
        }
    }
}

impl TryFrom<Value> for Filter {
    type Error = MetadataStoreError;

    fn try_from(value: Value) -> Result<Self> {
        let map = match value {
            Value::Object(map) => map,
            Value::Null => return Ok(Filter::default()),
            other => {
                return Err(MetadataStoreError::validation(format!(
                    "A filter must be an object, got {}",
                    other
                )));
            }
        };

        let mut filter = Filter::default();
        for (key, value) in map {
            match key.as_str() {
                "fields" => filter.fields = Some(Filter::parse_fields(value)?),
                "where" => filter.condition = Some(WhereNode::try_from(value)?),
                "order" => filter.order = Filter::parse_order(value)?,
                "skip" | "offset" => filter.skip = Some(Filter::parse_count(&key, value)?),
                "limit" => filter.limit = Some(Filter::parse_limit(value)?),
                other => {
                    return Err(MetadataStoreError::validation(format!(
                        "Unknown filter key '{}'",
                        other
                    )));
                }
            }
        }
        Ok(filter)
    }
}

impl From<Filter> for Value {
    fn from(filter: Filter) -> Self {
        let mut map = Map::new();
        if let Some(fields) = filter.fields {
            map.insert(
                "fields".to_string(),
                Value::Array(
                    fields
                        .into_iter()
                        .map(|f| Value::String(f.to_string()))
                        .collect(),
                ),
            );
        }
        if let Some(condition) = filter.condition {
            map.insert("where".to_string(), condition.into());
        }
        if !filter.order.is_empty() {
            map.insert(
                "order".to_string(),
                Value::Array(
                    filter
                        .order
                        .into_iter()
                        .map(|o| Value::String(o.into()))
                        .collect(),
                ),
            );
        }
        if let Some(skip) = filter.skip {
            map.insert("skip".to_string(), skip.into());
        }
        if let Some(limit) = filter.limit {
            map.insert("limit".to_string(), limit.into());
        }
        Value::Object(map)
    }
}

// ============================================================================
// Condition helpers
// ============================================================================

/// Helper functions to build predicate trees in code
pub mod condition_helpers {
    use super::*;

    pub fn eq(field: impl Into<FieldPath>, value: Value) -> WhereNode {
        WhereNode::leaf(field, Condition::Eq(value))
    }

    pub fn neq(field: impl Into<FieldPath>, value: Value) -> WhereNode {
        WhereNode::leaf(field, Condition::Neq(value))
    }

    pub fn gt(field: impl Into<FieldPath>, value: Value) -> WhereNode {
        WhereNode::leaf(field, Condition::Gt(value))
    }

    pub fn lt(field: impl Into<FieldPath>, value: Value) -> WhereNode {
        WhereNode::leaf(field, Condition::Lt(value))
    }

    pub fn like(field: impl Into<FieldPath>, pattern: impl Into<String>) -> WhereNode {
        WhereNode::leaf(field, Condition::Like(pattern.into()))
    }

    pub fn inq(field: impl Into<FieldPath>, values: Vec<Value>) -> WhereNode {
        WhereNode::leaf(field, Condition::Inq(values))
    }

    pub fn nin(field: impl Into<FieldPath>, values: Vec<Value>) -> WhereNode {
        WhereNode::leaf(field, Condition::Nin(values))
    }

    pub fn contains(field: impl Into<FieldPath>, document: Value) -> WhereNode {
        WhereNode::leaf(field, Condition::ContainsJson(document))
    }

    pub fn and(nodes: Vec<WhereNode>) -> WhereNode {
        WhereNode::And(nodes)
    }

    pub fn or(nodes: Vec<WhereNode>) -> WhereNode {
        WhereNode::Or(nodes)
    }

    pub fn not(node: WhereNode) -> WhereNode {
        WhereNode::Not(Box::new(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ==================== FieldPath ====================

    #[test]
    fn test_field_path_segments() {
        let path = FieldPath::from("meta.schema.field");
        assert_eq!(path.root(), "meta");
        assert_eq!(path.subpath(), &["schema".to_string(), "field".to_string()]);
        assert!(path.is_nested());
        assert_eq!(path.to_string(), "meta.schema.field");
        assert!(!FieldPath::from("id").is_nested());
    }

    #[test]
    fn test_field_path_parse_rejects_empty_segments() {
        for path in ["", "meta.", "a..b", ".meta"] {
            let err = FieldPath::parse(path).unwrap_err();
            assert!(matches!(err, MetadataStoreError::Validation(_)), "{}", path);
        }
        assert_eq!(FieldPath::parse("meta.a").unwrap(), FieldPath::from("meta.a"));
    }

    #[test]
    fn test_field_path_deserialization_is_checked() {
        assert!(serde_json::from_value::<FieldPath>(json!("meta..a")).is_err());
        assert_eq!(
            serde_json::from_value::<FieldPath>(json!("meta.a")).unwrap(),
            FieldPath::from("meta.a")
        );
    }

    #[test]
    fn test_field_path_starts_with() {
        assert!(FieldPath::from("meta.a.b").starts_with(&FieldPath::from("meta.a")));
        assert!(FieldPath::from("meta").starts_with(&FieldPath::from("meta")));
        assert!(!FieldPath::from("meta.ab").starts_with(&FieldPath::from("meta.a")));
    }

    // ==================== Condition ====================

    #[test]
    fn test_condition_operator_object() {
        assert_eq!(
            Condition::try_from(json!({"gt": 3})).unwrap(),
            Condition::Gt(json!(3))
        );
        assert_eq!(
            Condition::try_from(json!({"like": "%x%"})).unwrap(),
            Condition::Like("%x%".to_string())
        );
    }

    #[test]
    fn test_condition_bare_scalar_is_eq() {
        assert_eq!(Condition::try_from(json!("a")).unwrap(), Condition::Eq(json!("a")));
        assert_eq!(Condition::try_from(json!(null)).unwrap(), Condition::Eq(json!(null)));
    }

    #[test]
    fn test_condition_bare_object_is_containment() {
        assert_eq!(
            Condition::try_from(json!({"Assay": "RNA-seq"})).unwrap(),
            Condition::ContainsJson(json!({"Assay": "RNA-seq"}))
        );
    }

    #[test]
    fn test_condition_between_requires_two_bounds() {
        let err = Condition::try_from(json!({"between": [1]})).unwrap_err();
        assert!(matches!(err, MetadataStoreError::InvalidPredicate(_)));
        assert!(Condition::try_from(json!({"between": [1, 2, 3]})).is_err());
        assert!(Condition::try_from(json!({"between": 1})).is_err());
        assert_eq!(
            Condition::try_from(json!({"between": [1, 2]})).unwrap(),
            Condition::Between(json!(1), json!(2))
        );
    }

    #[test]
    fn test_condition_rejects_mixed_operator_object() {
        let err = Condition::try_from(json!({"eq": 1, "gt": 0})).unwrap_err();
        assert!(matches!(err, MetadataStoreError::InvalidPredicate(_)));
        assert!(Condition::try_from(json!({"eq": 1, "other": 0})).is_err());
    }

    #[test]
    fn test_condition_like_requires_string() {
        assert!(Condition::try_from(json!({"like": 3})).is_err());
    }

    #[test]
    fn test_condition_any_accepts_single_key() {
        assert_eq!(
            Condition::try_from(json!({"any": "a"})).unwrap(),
            Condition::Any(vec!["a".to_string()])
        );
        assert!(Condition::try_from(json!({"any": [1]})).is_err());
    }

    #[test]
    fn test_condition_round_trips_through_json() {
        let condition = Condition::Inq(vec![json!(1), json!("b")]);
        let value: Value = condition.clone().into();
        assert_eq!(value, json!({"inq": [1, "b"]}));
        assert_eq!(Condition::try_from(value).unwrap(), condition);
    }

    // ==================== FullTextQuery ====================

    #[test]
    fn test_full_text_query_parsing() {
        let query = FullTextQuery::try_from(json!({
            "and": ["breast", {"or": [{"eq": "cancer"}, {"neq": "tumor"}]}, {"not": "mouse"}]
        }))
        .unwrap();
        assert_eq!(
            query,
            FullTextQuery::And(vec![
                FullTextQuery::Term("breast".to_string()),
                FullTextQuery::Or(vec![
                    FullTextQuery::Term("cancer".to_string()),
                    FullTextQuery::Neq("tumor".to_string()),
                ]),
                FullTextQuery::Not(Box::new(FullTextQuery::Term("mouse".to_string()))),
            ])
        );
    }

    #[test]
    fn test_full_text_query_rejects_empty_group() {
        assert!(FullTextQuery::try_from(json!({"and": []})).is_err());
        assert!(FullTextQuery::try_from(json!(3)).is_err());
    }

    // ==================== WhereNode ====================

    #[test]
    fn test_where_explicit_leaf() {
        let node = WhereNode::try_from(json!({"field": "meta.x", "condition": {"eq": 1}})).unwrap();
        assert_eq!(node, condition_helpers::eq("meta.x", json!(1)));
    }

    #[test]
    fn test_where_groups() {
        let node = WhereNode::try_from(json!({
            "and": [
                {"field": "meta.x", "condition": {"eq": 1}},
                {"field": "meta.y", "condition": {"neq": null}}
            ]
        }))
        .unwrap();
        assert_eq!(
            node,
            WhereNode::And(vec![
                condition_helpers::eq("meta.x", json!(1)),
                condition_helpers::neq("meta.y", json!(null)),
            ])
        );
    }

    #[test]
    fn test_where_shorthand() {
        let node = WhereNode::try_from(json!({"meta.a": "b", "id": {"inq": []}})).unwrap();
        assert_eq!(
            node,
            WhereNode::And(vec![
                condition_helpers::inq("id", vec![]),
                condition_helpers::eq("meta.a", json!("b")),
            ])
        );
    }

    #[test]
    fn test_where_not() {
        let node = WhereNode::try_from(json!({"not": {"meta.a": 1}})).unwrap();
        assert_eq!(node, condition_helpers::not(condition_helpers::eq("meta.a", json!(1))));
    }

    #[test]
    fn test_where_rejects_malformed_shapes() {
        for value in [
            json!({}),
            json!({"and": []}),
            json!({"or": {}}),
            json!([1, 2]),
            json!("meta"),
            json!({"field": 3, "condition": 1}),
        ] {
            let err = WhereNode::try_from(value).unwrap_err();
            assert!(matches!(err, MetadataStoreError::InvalidPredicate(_)));
        }
    }

    #[test]
    fn test_where_serde_round_trip() {
        let node = condition_helpers::or(vec![
            condition_helpers::like("meta.name", "%p53%"),
            condition_helpers::gt("meta.size", json!(10)),
        ]);
        let json = serde_json::to_value(&node).unwrap();
        let parsed: WhereNode = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, node);
    }

    // ==================== OrderSpec ====================

    #[test]
    fn test_order_spec_parsing() {
        assert_eq!(
            OrderSpec::try_from("meta.x DESC".to_string()).unwrap(),
            OrderSpec::desc("meta.x")
        );
        assert_eq!(
            OrderSpec::try_from("id".to_string()).unwrap(),
            OrderSpec::asc("id")
        );
        assert_eq!(
            OrderSpec::try_from("id asc".to_string()).unwrap(),
            OrderSpec::asc("id")
        );
    }

    #[test]
    fn test_order_spec_invalid_direction() {
        let err = OrderSpec::try_from("id sideways".to_string()).unwrap_err();
        assert!(matches!(err, MetadataStoreError::InvalidOrder(_)));
        assert!(OrderSpec::try_from("".to_string()).is_err());
        assert!(OrderSpec::try_from("a b c".to_string()).is_err());
    }

    // ==================== Filter ====================

    #[test]
    fn test_filter_parsing() {
        let filter = Filter::from_value(json!({
            "fields": ["id", "meta.a"],
            "where": {"meta.a": "b"},
            "order": "meta.a DESC",
            "skip": 10,
            "limit": 5
        }))
        .unwrap();

        assert_eq!(
            filter.fields,
            Some(vec![FieldPath::from("id"), FieldPath::from("meta.a")])
        );
        assert_eq!(filter.condition, Some(condition_helpers::eq("meta.a", json!("b"))));
        assert_eq!(filter.order, vec![OrderSpec::desc("meta.a")]);
        assert_eq!(filter.skip, Some(10));
        assert_eq!(filter.limit, Some(5));
    }

    #[test]
    fn test_filter_fields_object_form() {
        let filter = Filter::from_value(json!({"fields": {"meta": true, "id": false}})).unwrap();
        assert_eq!(filter.fields, Some(vec![FieldPath::from("meta")]));
        assert!(Filter::from_value(json!({"fields": {"meta": false}})).is_err());
    }

    #[test]
    fn test_filter_rejects_negative_pagination() {
        assert!(Filter::from_value(json!({"skip": -1})).is_err());
        assert!(Filter::from_value(json!({"limit": -5})).is_err());
        assert!(Filter::from_value(json!({"limit": "10"})).is_err());
    }

    #[test]
    fn test_filter_limit_must_be_positive() {
        let err = Filter::from_value(json!({"limit": 0})).unwrap_err();
        assert!(matches!(err, MetadataStoreError::Validation(_)));
        assert_eq!(Filter::from_value(json!({"limit": 1})).unwrap().limit, Some(1));
        assert_eq!(Filter::from_value(json!({"skip": 0})).unwrap().skip, Some(0));
    }

    #[test]
    fn test_filter_rejects_malformed_paths() {
        let err = Filter::from_value(json!({"fields": ["meta..a"]})).unwrap_err();
        assert!(matches!(err, MetadataStoreError::Validation(_)));
        assert!(Filter::from_value(json!({"fields": {"meta.": true}})).is_err());

        let err = Filter::from_value(json!({"where": {"meta.": 1}})).unwrap_err();
        assert!(matches!(err, MetadataStoreError::InvalidPredicate(_)));
        let err = Filter::from_value(json!({"where": {"field": "", "condition": 1}})).unwrap_err();
        assert!(matches!(err, MetadataStoreError::InvalidPredicate(_)));

        let err = Filter::from_value(json!({"order": "a..b DESC"})).unwrap_err();
        assert!(matches!(err, MetadataStoreError::InvalidOrder(_)));

        let join = serde_json::from_value::<JoinSpec>(json!({
            "relation": "library", "alias": "lib", "select": ["meta."]
        }));
        assert!(join.is_err());
    }

    #[test]
    fn test_filter_rejects_unknown_keys() {
        let err = Filter::from_value(json!({"whre": {}})).unwrap_err();
        assert!(err.to_string().contains("Unknown filter key"));
    }

    #[test]
    fn test_filter_null_is_empty() {
        assert_eq!(Filter::from_value(Value::Null).unwrap(), Filter::default());
    }

    #[test]
    fn test_filter_builder_and_serialization() {
        let filter = Filter::new()
            .with_fields(["meta.a"])
            .with_where(condition_helpers::eq("meta.a", json!(1)))
            .with_order(OrderSpec::asc("id"))
            .with_pagination(0, 25);

        let value = serde_json::to_value(&filter).unwrap();
        assert_eq!(value["limit"], json!(25));
        assert_eq!(value["order"], json!(["id ASC"]));
        let parsed: Filter = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, filter);
    }

    // ==================== JoinSpec ====================

    #[test]
    fn test_join_spec_deserialization() {
        let join: JoinSpec = serde_json::from_value(json!({
            "relation": "library",
            "alias": "lib",
            "select": ["meta.name"],
            "where": {"dataset": "lincs"}
        }))
        .unwrap();
        assert_eq!(join.relation, "library");
        assert_eq!(join.select, vec![FieldPath::from("meta.name")]);
        assert_eq!(join.condition, Some(condition_helpers::eq("dataset", json!("lincs"))));

        let unknown = serde_json::from_value::<JoinSpec>(json!({
            "relation": "library", "alias": "lib", "extra": 1
        }));
        assert!(unknown.is_err());
    }
}
