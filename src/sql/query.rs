//! Statement compilation
//!
//! Composes path resolution and predicate compilation into complete SELECT,
//! COUNT, INSERT, UPDATE and DELETE statements. Compilation is pure: every
//! statement is built in full or an error is returned before anything is
//! sent to the database.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};

use crate::catalog::{Catalog, EntityDescriptor, RelationKind};
use crate::error::{MetadataStoreError, Result};
use crate::filter::{FieldPath, Filter, JoinSpec, WhereNode};
use crate::sql::condition::{build_order_by_clause, compile_where};
use crate::sql::params::{ParamAllocator, SqlParam};
use crate::sql::path::{DeepProjection, ResolvedPath, column_reference, resolve};
use crate::sql::sanitize::{quote_identifier, quote_json_key};

/// SQL text with its positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

/// Compiles statements for one entity of a catalog
///
/// The entity is aliased by its name; a joined entity uses the alias given in
/// its [`JoinSpec`]. A join never multiplies base rows: it filters through a
/// correlated `EXISTS` and projects related rows through a correlated
/// subquery.
#[derive(Debug, Clone, Copy)]
pub struct QueryCompiler<'a> {
    catalog: &'a Catalog,
    descriptor: &'a EntityDescriptor,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(catalog: &'a Catalog, entity: &str) -> Result<Self> {
        Ok(Self {
            catalog,
            descriptor: catalog.entity(entity)?,
        })
    }

    pub fn descriptor(&self) -> &'a EntityDescriptor {
        self.descriptor
    }

    fn alias(&self) -> &'a str {
        &self.descriptor.name
    }

    fn table(&self) -> String {
        format!(
            "{} AS {}",
            quote_identifier(&self.descriptor.table),
            quote_identifier(self.alias())
        )
    }

    // ========================================================================
    // SELECT
    // ========================================================================

    /// Compile a SELECT honoring projection, predicate, join, order and paging
    pub fn compile_select(&self, filter: &Filter, join: Option<&JoinSpec>) -> Result<CompiledQuery> {
        let mut params = ParamAllocator::new();

        let mut columns = project(
            self.descriptor,
            filter.fields.as_deref(),
            Some(self.alias()),
            true,
        )?
        .into_iter()
        .map(|(property, expr)| format!("{} AS {}", expr, quote_identifier(&property)))
        .collect::<Vec<_>>();

        if let Some(join) = join.filter(|j| !j.select.is_empty()) {
            let related = self.related(join)?;
            let entries = project(
                related.target,
                Some(join.select.as_slice()),
                Some(&join.alias),
                false,
            )?
            .into_iter()
            .map(|(property, expr)| format!("{}, {}", quote_json_key(&property), expr))
            .collect::<Vec<_>>();
            let object = format!("jsonb_build_object({})", entries.join(", "));
            let predicate = related.predicate(join, &mut params)?;

            // To-many relations project every matching row as an array
            let subquery = if related.to_many {
                format!("SELECT jsonb_agg({}) {} WHERE {}", object, related.from, predicate)
            } else {
                format!("SELECT {} {} WHERE {} LIMIT 1", object, related.from, predicate)
            };
            columns.push(format!("({}) AS {}", subquery, quote_identifier(&join.alias)));
        }

        let source = self.source(filter.condition.as_ref(), join, &mut params)?;
        let mut sql = format!("SELECT {} {}", columns.join(", "), source);

        if !filter.order.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&build_order_by_clause(
                self.descriptor,
                &filter.order,
                Some(self.alias()),
            )?);
        }
        if let Some(limit) = filter.limit {
            let limit = Filter::check_limit(limit)?;
            sql.push_str(&format!(" LIMIT {}", params.push(count_param("limit", limit)?)));
        }
        if let Some(skip) = filter.skip {
            sql.push_str(&format!(" OFFSET {}", params.push(count_param("skip", skip)?)));
        }

        Ok(CompiledQuery {
            sql,
            params: params.into_params(),
        })
    }

    /// Full-row SELECT of the rows matching `condition`, sharing `params`
    ///
    /// Used as the row source of aggregations.
    pub fn compile_base(
        &self,
        condition: Option<&WhereNode>,
        join: Option<&JoinSpec>,
        params: &mut ParamAllocator,
    ) -> Result<String> {
        let columns = project(self.descriptor, None, Some(self.alias()), true)?
            .into_iter()
            .map(|(property, expr)| format!("{} AS {}", expr, quote_identifier(&property)))
            .collect::<Vec<_>>();
        let source = self.source(condition, join, params)?;
        Ok(format!("SELECT {} {}", columns.join(", "), source))
    }

    /// Compile `SELECT COUNT(*)` over the rows matching `condition`
    pub fn compile_count(
        &self,
        condition: Option<&WhereNode>,
        join: Option<&JoinSpec>,
    ) -> Result<CompiledQuery> {
        let mut params = ParamAllocator::new();
        let source = self.source(condition, join, &mut params)?;
        Ok(CompiledQuery {
            sql: format!("SELECT COUNT(*) AS \"count\" {}", source),
            params: params.into_params(),
        })
    }

    /// FROM clause and WHERE, with a join reduced to an `EXISTS` test
    fn source(
        &self,
        condition: Option<&WhereNode>,
        join: Option<&JoinSpec>,
        params: &mut ParamAllocator,
    ) -> Result<String> {
        let mut sql = format!("FROM {}", self.table());
        let mut predicates = Vec::new();

        if let Some(condition) = condition {
            predicates.push(compile_where(
                self.descriptor,
                condition,
                Some(self.alias()),
                params,
            )?);
        }

        if let Some(join) = join {
            let related = self.related(join)?;
            predicates.push(format!(
                "EXISTS (SELECT 1 {} WHERE {})",
                related.from,
                related.predicate(join, params)?
            ));
        }

        match predicates.len() {
            0 => {}
            1 => sql.push_str(&format!(" WHERE {}", predicates[0])),
            _ => sql.push_str(&format!(
                " WHERE ({})",
                predicates.join(") AND (")
            )),
        }
        Ok(sql)
    }

    /// Rows of the related entity, correlated with the base row
    fn related(&self, join: &JoinSpec) -> Result<RelatedRows<'a>> {
        if join.alias.is_empty() || join.alias == self.alias() {
            return Err(MetadataStoreError::unsupported_relationship(format!(
                "Join alias '{}' must be non-empty and differ from '{}'",
                join.alias,
                self.alias()
            )));
        }

        let (relation, target) = self.catalog.relation(&self.descriptor.name, &join.relation)?;
        let source_column = |name: &str| -> Result<String> {
            self.descriptor
                .column(name)
                .map(|c| column_reference(Some(self.alias()), c))
                .ok_or_else(|| {
                    MetadataStoreError::unsupported_relationship(format!(
                        "{}.{}: unknown source column '{}'",
                        self.descriptor.name, relation.name, name
                    ))
                })
        };
        let target_column = |name: &str| -> Result<String> {
            target
                .column(name)
                .map(|c| column_reference(Some(&join.alias), c))
                .ok_or_else(|| {
                    MetadataStoreError::unsupported_relationship(format!(
                        "{}.{}: unknown target column '{}'",
                        self.descriptor.name, relation.name, name
                    ))
                })
        };
        let mut from = format!(
            "FROM {} AS {}",
            quote_identifier(&target.table),
            quote_identifier(&join.alias)
        );
        let mut correlation = Vec::new();

        match (relation.kind, &relation.junction) {
            (RelationKind::ManyToMany, Some(junction)) => {
                let junction_alias = format!("{}__j", join.alias);
                let qualified = |column: &str| {
                    format!(
                        "{}.{}",
                        quote_identifier(&junction_alias),
                        quote_identifier(column)
                    )
                };

                let mut target_on = Vec::new();
                for (key, junction_column) in
                    relation.target_columns.iter().zip(&junction.target_columns)
                {
                    target_on.push(format!("{} = {}", qualified(junction_column), target_column(key)?));
                }
                from.push_str(&format!(
                    " INNER JOIN {} AS {} ON {}",
                    quote_identifier(&junction.table),
                    quote_identifier(&junction_alias),
                    target_on.join(" AND ")
                ));
                for (key, junction_column) in
                    relation.source_columns.iter().zip(&junction.source_columns)
                {
                    correlation.push(format!("{} = {}", source_column(key)?, qualified(junction_column)));
                }
            }
            (RelationKind::ManyToMany, None) => {
                return Err(MetadataStoreError::unsupported_relationship(format!(
                    "{}.{}: many-to-many requires a junction table",
                    self.descriptor.name, relation.name
                )));
            }
            _ => {
                for (source_key, target_key) in
                    relation.source_columns.iter().zip(&relation.target_columns)
                {
                    correlation.push(format!(
                        "{} = {}",
                        source_column(source_key)?,
                        target_column(target_key)?
                    ));
                }
            }
        }

        Ok(RelatedRows {
            target,
            from,
            correlation,
            to_many: matches!(relation.kind, RelationKind::OneToMany | RelationKind::ManyToMany),
        })
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Compile `INSERT ... RETURNING` for one row
    ///
    /// Properties absent from `row` are left to column defaults; every
    /// non-nullable column must still be provided.
    pub fn compile_insert(&self, row: &Map<String, Value>) -> Result<CompiledQuery> {
        validate_values(self.descriptor, row)?;
        for column in self.descriptor.columns() {
            if !column.nullable && !row.contains_key(&column.property_name) {
                return Err(MetadataStoreError::validation(format!(
                    "{}.{} is required",
                    self.descriptor.name, column.property_name
                )));
            }
        }

        let mut params = ParamAllocator::new();
        let mut names = Vec::new();
        let mut placeholders = Vec::new();
        for column in self.descriptor.columns() {
            if let Some(value) = row.get(&column.property_name) {
                names.push(quote_identifier(&column.database_name));
                placeholders.push(params.push(SqlParam::for_column(column, value)?));
            }
        }

        let returning = project(self.descriptor, None, Some(self.alias()), true)?
            .into_iter()
            .map(|(property, expr)| format!("{} AS {}", expr, quote_identifier(&property)))
            .collect::<Vec<_>>();

        Ok(CompiledQuery {
            sql: format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
                self.table(),
                names.join(", "),
                placeholders.join(", "),
                returning.join(", ")
            ),
            params: params.into_params(),
        })
    }

    /// Compile `UPDATE ... SET` for the rows matching `condition`
    pub fn compile_update(
        &self,
        condition: Option<&WhereNode>,
        values: &Map<String, Value>,
    ) -> Result<CompiledQuery> {
        if values.is_empty() {
            return Err(MetadataStoreError::validation(format!(
                "Update of '{}' sets no properties",
                self.descriptor.name
            )));
        }
        validate_values(self.descriptor, values)?;

        let mut params = ParamAllocator::new();
        let mut assignments = Vec::new();
        for column in self.descriptor.columns() {
            if let Some(value) = values.get(&column.property_name) {
                assignments.push(format!(
                    "{} = {}",
                    quote_identifier(&column.database_name),
                    params.push(SqlParam::for_column(column, value)?)
                ));
            }
        }

        let mut sql = format!("UPDATE {} SET {}", self.table(), assignments.join(", "));
        if let Some(condition) = condition {
            sql.push_str(" WHERE ");
            sql.push_str(&compile_where(
                self.descriptor,
                condition,
                Some(self.alias()),
                &mut params,
            )?);
        }

        Ok(CompiledQuery {
            sql,
            params: params.into_params(),
        })
    }

    /// Compile `DELETE` for the rows matching `condition`
    pub fn compile_delete(&self, condition: Option<&WhereNode>) -> Result<CompiledQuery> {
        let mut params = ParamAllocator::new();
        let mut sql = format!("DELETE FROM {}", self.table());
        if let Some(condition) = condition {
            sql.push_str(" WHERE ");
            sql.push_str(&compile_where(
                self.descriptor,
                condition,
                Some(self.alias()),
                &mut params,
            )?);
        }
        Ok(CompiledQuery {
            sql,
            params: params.into_params(),
        })
    }
}

/// FROM clause and key equalities reaching a related entity from the base row
struct RelatedRows<'a> {
    target: &'a EntityDescriptor,
    from: String,
    correlation: Vec<String>,
    to_many: bool,
}

impl RelatedRows<'_> {
    /// Key equalities plus the join's own predicate on the related entity
    fn predicate(&self, join: &JoinSpec, params: &mut ParamAllocator) -> Result<String> {
        let mut parts = self.correlation.clone();
        if let Some(condition) = &join.condition {
            parts.push(format!(
                "({})",
                compile_where(self.target, condition, Some(&join.alias), params)?
            ));
        }
        Ok(parts.join(" AND "))
    }
}

fn count_param(name: &str, value: u64) -> Result<SqlParam> {
    let value = i64::try_from(value)
        .map_err(|_| MetadataStoreError::validation(format!("{} is out of range", name)))?;
    Ok(SqlParam::Integer(Some(value)))
}

/// Check property names, value types and nullability of a write payload
fn validate_values(descriptor: &EntityDescriptor, values: &Map<String, Value>) -> Result<()> {
    for (property, value) in values {
        let column = descriptor.column(property).ok_or_else(|| {
            MetadataStoreError::unknown_column(format!("{}.{}", descriptor.name, property))
        })?;
        if value.is_null() && !column.nullable {
            return Err(MetadataStoreError::validation(format!(
                "{}.{} cannot be null",
                descriptor.name, property
            )));
        }
        column.column_type.validate_value(value).map_err(|e| {
            MetadataStoreError::validation(format!("{}.{}: {}", descriptor.name, property, e))
        })?;
    }
    Ok(())
}

/// Resolve a field selection into `(property, expression)` pairs in column
/// order
///
/// Deep paths under one root are merged into a single object; a root selected
/// in full absorbs its deep paths. With `include_key` the primary key is always
/// selected.
fn project(
    descriptor: &EntityDescriptor,
    fields: Option<&[FieldPath]>,
    alias: Option<&str>,
    include_key: bool,
) -> Result<Vec<(String, String)>> {
    let Some(fields) = fields.filter(|f| !f.is_empty()) else {
        return Ok(descriptor
            .columns()
            .iter()
            .map(|c| (c.property_name.clone(), column_reference(alias, c)))
            .collect());
    };

    let mut shallow = HashSet::new();
    let mut deep: BTreeMap<&str, DeepProjection<'_>> = BTreeMap::new();
    if include_key {
        shallow.insert(descriptor.primary_key().property_name.as_str());
    }

    for field in fields {
        match resolve(descriptor, field)? {
            ResolvedPath::Shallow { column } => {
                shallow.insert(column.property_name.as_str());
            }
            ResolvedPath::Deep { column, subpath } => {
                deep.entry(column.property_name.as_str())
                    .or_insert_with(|| DeepProjection::new(column))
                    .add(&subpath);
            }
        }
    }

    Ok(descriptor
        .columns()
        .iter()
        .filter_map(|c| {
            let property = c.property_name.as_str();
            if shallow.contains(property) {
                Some((c.property_name.clone(), column_reference(alias, c)))
            } else {
                deep.get(property)
                    .map(|projection| (c.property_name.clone(), projection.expression(alias)))
            }
        })
        .collect())
}
