//! Condition building for SQL WHERE clauses
//!
//! Compiles a [`WhereNode`] tree into a boolean SQL expression. Values are
//! always pushed into the [`ParamAllocator`]; only quoted identifiers and JSON
//! keys are inlined into the SQL text.

use serde_json::Value;

use crate::catalog::EntityDescriptor;
use crate::error::{MetadataStoreError, Result};
use crate::filter::{Condition, FieldPath, FullTextQuery, OrderSpec, WhereNode};
use crate::sql::params::{ParamAllocator, SqlParam};
use crate::sql::path::{ResolvedPath, resolve};

/// Build a SQL boolean expression from a predicate tree
///
/// # Arguments
/// * `descriptor` - The entity the field paths are resolved against
/// * `node` - The predicate tree
/// * `alias` - Table alias used to qualify column references
/// * `params` - Allocator receiving every bound value, shared by the statement
///
/// # Supported Operations
/// - Logical: and, or, not
/// - Comparison: eq, neq, lt, lte, gt, gte, between
/// - Membership: inq, nin
/// - Pattern: like, ilike, nlike, nilike
/// - Text search: fullTextSearch
/// - JSON: any, containsJSON
pub fn compile_where(
    descriptor: &EntityDescriptor,
    node: &WhereNode,
    alias: Option<&str>,
    params: &mut ParamAllocator,
) -> Result<String> {
    match node {
        WhereNode::And(children) => compile_group(descriptor, "AND", children, alias, params),
        WhereNode::Or(children) => compile_group(descriptor, "OR", children, alias, params),
        WhereNode::Not(inner) => Ok(format!(
            "NOT ({})",
            compile_where(descriptor, inner, alias, params)?
        )),
        WhereNode::Leaf { field, condition } => {
            let resolved = resolve(descriptor, field)?;
            compile_condition(&resolved, field, condition, alias, params)
        }
    }
}

fn compile_group(
    descriptor: &EntityDescriptor,
    operator: &str,
    children: &[WhereNode],
    alias: Option<&str>,
    params: &mut ParamAllocator,
) -> Result<String> {
    if children.is_empty() {
        return Err(MetadataStoreError::invalid_predicate(format!(
            "{} requires at least one condition",
            operator
        )));
    }

    let mut clauses = Vec::with_capacity(children.len());
    for child in children {
        clauses.push(format!(
            "({})",
            compile_where(descriptor, child, alias, params)?
        ));
    }
    Ok(clauses.join(&format!(" {} ", operator)))
}

/// Bind a comparison operand with the type the expression produces
fn bind_operand(resolved: &ResolvedPath<'_>, value: &Value, params: &mut ParamAllocator) -> Result<String> {
    let param = if resolved.is_json() {
        SqlParam::json(value.clone())
    } else {
        SqlParam::for_column(resolved.column(), value)?
    };
    Ok(params.push(param))
}

fn compile_condition(
    resolved: &ResolvedPath<'_>,
    field: &FieldPath,
    condition: &Condition,
    alias: Option<&str>,
    params: &mut ParamAllocator,
) -> Result<String> {
    let expr = resolved.scalar_expression(alias, false);

    let comparison = |operator: &str, value: &Value, params: &mut ParamAllocator| -> Result<String> {
        if value.is_null() {
            return Err(MetadataStoreError::invalid_predicate(format!(
                "{} on '{}' does not accept null",
                condition.operator(),
                field
            )));
        }
        Ok(format!(
            "{} {} {}",
            expr,
            operator,
            bind_operand(resolved, value, params)?
        ))
    };

    match condition {
        // A JSON expression is null when absent (SQL NULL) or when it holds JSON null
        Condition::Eq(Value::Null) if resolved.is_json() => Ok(format!(
            "({expr} IS NULL OR {expr} = {})",
            params.push(SqlParam::json(Value::Null))
        )),
        Condition::Neq(Value::Null) if resolved.is_json() => Ok(format!(
            "({expr} IS NOT NULL AND {expr} != {})",
            params.push(SqlParam::json(Value::Null))
        )),
        Condition::Eq(Value::Null) => Ok(format!("{} IS NULL", expr)),
        Condition::Neq(Value::Null) => Ok(format!("{} IS NOT NULL", expr)),
        Condition::Eq(value) => comparison("=", value, params),
        Condition::Neq(value) => comparison("!=", value, params),
        Condition::Lt(value) => comparison("<", value, params),
        Condition::Lte(value) => comparison("<=", value, params),
        Condition::Gt(value) => comparison(">", value, params),
        Condition::Gte(value) => comparison(">=", value, params),
        Condition::Between(low, high) => {
            if low.is_null() || high.is_null() {
                return Err(MetadataStoreError::invalid_predicate(format!(
                    "between on '{}' does not accept null bounds",
                    field
                )));
            }
            let low = bind_operand(resolved, low, params)?;
            let high = bind_operand(resolved, high, params)?;
            Ok(format!("{} BETWEEN {} AND {}", expr, low, high))
        }
        Condition::Inq(values) if values.is_empty() => Ok(format!("{} IN (NULL)", expr)),
        Condition::Nin(values) if values.is_empty() => Ok(format!("{} IS NOT NULL", expr)),
        Condition::Inq(values) | Condition::Nin(values) => {
            let placeholders = values
                .iter()
                .map(|value| bind_operand(resolved, value, params))
                .collect::<Result<Vec<_>>>()?;
            let operator = if matches!(condition, Condition::Inq(_)) {
                "IN"
            } else {
                "NOT IN"
            };
            Ok(format!("{} {} ({})", expr, operator, placeholders.join(", ")))
        }
        Condition::Like(pattern)
        | Condition::Ilike(pattern)
        | Condition::Nlike(pattern)
        | Condition::Nilike(pattern) => {
            let text = resolved.text_expression(alias)?;
            let operator = match condition {
                Condition::Like(_) => "LIKE",
                Condition::Ilike(_) => "ILIKE",
                Condition::Nlike(_) => "NOT LIKE",
                _ => "NOT ILIKE",
            };
            Ok(format!(
                "{} {} {}",
                text,
                operator,
                params.push(SqlParam::text(pattern.as_str()))
            ))
        }
        Condition::FullTextSearch(query) => {
            let text = resolved.text_expression(alias)?;
            Ok(format!(
                "to_tsvector({}) @@ {}",
                text,
                compile_tsquery(query, params)?
            ))
        }
        Condition::Any(keys) => {
            require_json(resolved, field, condition)?;
            Ok(format!(
                "{} ?| {}",
                expr,
                params.push(SqlParam::TextArray(keys.clone()))
            ))
        }
        Condition::ContainsJson(document) => {
            require_json(resolved, field, condition)?;
            Ok(format!(
                "{} @> {}",
                expr,
                params.push(SqlParam::json(document.clone()))
            ))
        }
    }
}

fn require_json(resolved: &ResolvedPath<'_>, field: &FieldPath, condition: &Condition) -> Result<()> {
    if resolved.is_json() {
        Ok(())
    } else {
        Err(MetadataStoreError::type_mismatch(format!(
            "{} requires a JSON expression, '{}' is {:?}",
            condition.operator(),
            field,
            resolved.column().column_type
        )))
    }
}

/// Compile a full-text query into a `tsquery` expression
fn compile_tsquery(query: &FullTextQuery, params: &mut ParamAllocator) -> Result<String> {
    let group = |items: &[FullTextQuery], operator: &str, params: &mut ParamAllocator| -> Result<String> {
        if items.is_empty() {
            return Err(MetadataStoreError::invalid_predicate(
                "fullTextSearch groups require at least one term",
            ));
        }
        let parts = items
            .iter()
            .map(|item| compile_tsquery(item, params))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("({})", parts.join(operator)))
    };

    match query {
        FullTextQuery::Term(term) => Ok(format!(
            "plainto_tsquery({})",
            params.push(SqlParam::text(term.as_str()))
        )),
        FullTextQuery::Neq(term) => Ok(format!(
            "!!plainto_tsquery({})",
            params.push(SqlParam::text(term.as_str()))
        )),
        FullTextQuery::And(items) => group(items, " && ", params),
        FullTextQuery::Or(items) => group(items, " || ", params),
        FullTextQuery::Not(inner) => Ok(format!("!!({})", compile_tsquery(inner, params)?)),
    }
}

/// Build ORDER BY clause (without the "ORDER BY" prefix)
///
/// Every field must resolve against `descriptor`; any failure is reported as
/// `InvalidOrder`.
pub fn build_order_by_clause(
    descriptor: &EntityDescriptor,
    order: &[OrderSpec],
    alias: Option<&str>,
) -> Result<String> {
    let mut order_parts = Vec::with_capacity(order.len());
    for spec in order {
        let resolved = resolve(descriptor, &spec.field).map_err(|e| {
            MetadataStoreError::invalid_order(format!(
                "Invalid sort field '{}': {}",
                spec.field, e
            ))
        })?;
        order_parts.push(format!(
            "{} {}",
            resolved.scalar_expression(alias, false),
            spec.direction.as_sql()
        ));
    }
    Ok(order_parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, ColumnDescriptor};
    use crate::filter::condition_helpers;
    use crate::types::ColumnType;
    use serde_json::json;

    fn libraries() -> EntityDescriptor {
        Catalog::metadata().unwrap().entity("libraries").unwrap().clone()
    }

    fn compile(node: &WhereNode) -> Result<(String, Vec<SqlParam>)> {
        let mut params = ParamAllocator::new();
        let sql = compile_where(&libraries(), node, None, &mut params)?;
        Ok((sql, params.into_params()))
    }

    fn parse(value: Value) -> WhereNode {
        WhereNode::try_from(value).unwrap()
    }

    // ==================== Comparison Operations ====================

    #[test]
    fn test_eq_on_deep_path_binds_json() {
        let (clause, params) = compile(&condition_helpers::eq("meta.x", json!(1))).unwrap();
        assert_eq!(clause, "\"meta\"->'x' = $1");
        assert_eq!(params, vec![SqlParam::json(json!(1))]);
    }

    #[test]
    fn test_eq_on_scalar_column_binds_native_type() {
        let (clause, params) = compile(&condition_helpers::eq("dataset", json!("lincs"))).unwrap();
        assert_eq!(clause, "\"dataset\" = $1");
        assert_eq!(params, vec![SqlParam::text("lincs")]);

        let id = "67e55044-10b1-426f-9247-bb680e5fe0c8";
        let (_, params) = compile(&condition_helpers::eq("id", json!(id))).unwrap();
        assert_eq!(params, vec![SqlParam::Uuid(Some(id.parse().unwrap()))]);
    }

    #[test]
    fn test_eq_null_on_scalar_column_is_null_check() {
        let (clause, params) = compile(&condition_helpers::eq("dataset", json!(null))).unwrap();
        assert_eq!(clause, "\"dataset\" IS NULL");
        assert!(params.is_empty());

        let (clause, _) = compile(&condition_helpers::neq("resource", json!(null))).unwrap();
        assert_eq!(clause, "\"resource\" IS NOT NULL");
    }

    #[test]
    fn test_null_on_json_path_also_matches_json_null() {
        let (clause, params) = compile(&condition_helpers::eq("meta.x", json!(null))).unwrap();
        assert_eq!(clause, "(\"meta\"->'x' IS NULL OR \"meta\"->'x' = $1)");
        assert_eq!(params, vec![SqlParam::json(json!(null))]);

        let (clause, params) = compile(&condition_helpers::neq("meta.x", json!(null))).unwrap();
        assert_eq!(clause, "(\"meta\"->'x' IS NOT NULL AND \"meta\"->'x' != $1)");
        assert_eq!(params, vec![SqlParam::json(json!(null))]);
    }

    #[test]
    fn test_ordering_comparison_rejects_null() {
        let err = compile(&condition_helpers::gt("meta.x", json!(null))).unwrap_err();
        assert!(matches!(err, MetadataStoreError::InvalidPredicate(_)));
    }

    #[test]
    fn test_between() {
        let (clause, params) = compile(&WhereNode::leaf(
            "meta.size",
            Condition::Between(json!(1), json!(10)),
        ))
        .unwrap();
        assert_eq!(clause, "\"meta\"->'size' BETWEEN $1 AND $2");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_scalar_type_mismatch() {
        let err = compile(&condition_helpers::eq("id", json!("not-a-uuid"))).unwrap_err();
        assert!(matches!(err, MetadataStoreError::TypeMismatch(_)));
    }

    // ==================== Logical Operations ====================

    #[test]
    fn test_and_of_two_json_comparisons() {
        let node = parse(json!({
            "and": [
                {"field": "meta.x", "condition": {"eq": 1}},
                {"field": "meta.y", "condition": {"neq": null}}
            ]
        }));
        let (clause, params) = compile(&node).unwrap();
        assert_eq!(
            clause,
            "(\"meta\"->'x' = $1) AND ((\"meta\"->'y' IS NOT NULL AND \"meta\"->'y' != $2))"
        );
        assert_eq!(params, vec![SqlParam::json(json!(1)), SqlParam::json(json!(null))]);
    }

    #[test]
    fn test_and_of_shorthand_comparisons() {
        let node = parse(json!({"meta.x": 1, "meta.y": {"neq": 2}}));
        let (clause, params) = compile(&node).unwrap();
        assert_eq!(clause.matches(" AND ").count(), 1);
        assert!(clause.contains("\"meta\"->'x' = $1"));
        assert!(clause.contains("\"meta\"->'y' != $2"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_nested_or_and_not() {
        let node = condition_helpers::and(vec![
            condition_helpers::eq("dataset", json!("lincs")),
            condition_helpers::or(vec![
                condition_helpers::eq("meta.a", json!("x")),
                condition_helpers::not(condition_helpers::eq("meta.b", json!("y"))),
            ]),
        ]);
        let (clause, params) = compile(&node).unwrap();
        assert_eq!(
            clause,
            "(\"dataset\" = $1) AND ((\"meta\"->'a' = $2) OR (NOT (\"meta\"->'b' = $3)))"
        );
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_empty_group_is_invalid() {
        let err = compile(&WhereNode::And(vec![])).unwrap_err();
        assert!(matches!(err, MetadataStoreError::InvalidPredicate(_)));
        assert!(compile(&WhereNode::Or(vec![])).is_err());
    }

    // ==================== Membership ====================

    #[test]
    fn test_inq_and_nin() {
        let (clause, params) =
            compile(&condition_helpers::inq("dataset", vec![json!("a"), json!("b")])).unwrap();
        assert_eq!(clause, "\"dataset\" IN ($1, $2)");
        assert_eq!(params, vec![SqlParam::text("a"), SqlParam::text("b")]);

        let (clause, _) = compile(&condition_helpers::nin("meta.k", vec![json!(1)])).unwrap();
        assert_eq!(clause, "\"meta\"->'k' NOT IN ($1)");
    }

    #[test]
    fn test_empty_membership() {
        let (clause, params) = compile(&condition_helpers::inq("meta.k", vec![])).unwrap();
        assert_eq!(clause, "\"meta\"->'k' IN (NULL)");
        assert!(params.is_empty());

        let (clause, params) = compile(&condition_helpers::nin("meta.k", vec![])).unwrap();
        assert_eq!(clause, "\"meta\"->'k' IS NOT NULL");
        assert!(params.is_empty());
    }

    // ==================== Pattern Operations ====================

    #[test]
    fn test_like_forces_text() {
        let (clause, params) = compile(&condition_helpers::like("meta.name", "%p53%")).unwrap();
        assert_eq!(clause, "\"meta\"->>'name' LIKE $1");
        assert_eq!(params, vec![SqlParam::text("%p53%")]);

        let (clause, _) =
            compile(&WhereNode::leaf("meta", Condition::Nilike("%x%".to_string()))).unwrap();
        assert_eq!(clause, "\"meta\"::text NOT ILIKE $1");
    }

    #[test]
    fn test_like_on_uuid_is_type_mismatch() {
        let err = compile(&condition_helpers::like("id", "%1%")).unwrap_err();
        assert!(matches!(err, MetadataStoreError::TypeMismatch(_)));
    }

    // ==================== Full-text Search ====================

    #[test]
    fn test_full_text_search() {
        let node = parse(json!({
            "meta": {"fullTextSearch": {"and": ["breast", {"not": "mouse"}]}}
        }));
        let (clause, params) = compile(&node).unwrap();
        assert_eq!(
            clause,
            "to_tsvector(\"meta\"::text) @@ (plainto_tsquery($1) && !!(plainto_tsquery($2)))"
        );
        assert_eq!(params, vec![SqlParam::text("breast"), SqlParam::text("mouse")]);
    }

    #[test]
    fn test_full_text_search_requires_text() {
        let node = WhereNode::leaf(
            "id",
            Condition::FullTextSearch(FullTextQuery::Term("x".to_string())),
        );
        let err = compile(&node).unwrap_err();
        assert!(matches!(err, MetadataStoreError::TypeMismatch(_)));
    }

    // ==================== JSON Operations ====================

    #[test]
    fn test_any_and_contains() {
        let (clause, params) = compile(&WhereNode::leaf(
            "meta",
            Condition::Any(vec!["Assay".to_string(), "Organism".to_string()]),
        ))
        .unwrap();
        assert_eq!(clause, "\"meta\" ?| $1");
        assert_eq!(
            params,
            vec![SqlParam::TextArray(vec![
                "Assay".to_string(),
                "Organism".to_string()
            ])]
        );

        let (clause, params) = compile(&parse(json!({"meta.Assay": {"name": "RNA-seq"}}))).unwrap();
        assert_eq!(clause, "\"meta\"->'Assay' @> $1");
        assert_eq!(params, vec![SqlParam::json(json!({"name": "RNA-seq"}))]);
    }

    #[test]
    fn test_json_operators_reject_scalar_columns() {
        let err = compile(&condition_helpers::contains("dataset", json!({"a": 1}))).unwrap_err();
        assert!(matches!(err, MetadataStoreError::TypeMismatch(_)));
        let err = compile(&WhereNode::leaf("dataset", Condition::Any(vec!["a".to_string()])))
            .unwrap_err();
        assert!(matches!(err, MetadataStoreError::TypeMismatch(_)));
    }

    // ==================== Resolution and aliasing ====================

    #[test]
    fn test_unknown_column() {
        let err = compile(&condition_helpers::eq("nope", json!(1))).unwrap_err();
        assert!(matches!(err, MetadataStoreError::UnknownColumn(_)));
    }

    #[test]
    fn test_alias_qualifies_columns() {
        let mut params = ParamAllocator::new();
        let clause = compile_where(
            &libraries(),
            &condition_helpers::eq("meta.a", json!(1)),
            Some("lib"),
            &mut params,
        )
        .unwrap();
        assert_eq!(clause, "\"lib\".\"meta\"->'a' = $1");
    }

    #[test]
    fn test_param_numbering_continues_from_allocator() {
        let mut params = ParamAllocator::new();
        params.push(SqlParam::text("earlier"));
        let clause = compile_where(
            &libraries(),
            &condition_helpers::eq("meta.a", json!(1)),
            None,
            &mut params,
        )
        .unwrap();
        assert_eq!(clause, "\"meta\"->'a' = $2");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_literals_never_inlined() {
        let hostile = "x'; DROP TABLE libraries; --\"";
        let (clause, params) = compile(&condition_helpers::eq("dataset", json!(hostile))).unwrap();
        assert!(!clause.contains("DROP"));
        assert_eq!(params, vec![SqlParam::text(hostile)]);
    }

    // ==================== build_order_by_clause Tests ====================

    #[test]
    fn test_order_by_deep_and_shallow() {
        let clause = build_order_by_clause(
            &libraries(),
            &[OrderSpec::desc("meta.x"), OrderSpec::asc("dataset")],
            Some("libraries"),
        )
        .unwrap();
        assert_eq!(
            clause,
            "\"libraries\".\"meta\"->'x' DESC, \"libraries\".\"dataset\" ASC"
        );
    }

    #[test]
    fn test_order_by_invalid_field() {
        let err = build_order_by_clause(&libraries(), &[OrderSpec::asc("nonexistent")], None)
            .unwrap_err();
        assert!(matches!(err, MetadataStoreError::InvalidOrder(_)));
        assert!(err.to_string().contains("Invalid sort field"));
    }

    #[test]
    fn test_order_by_into_scalar_column_is_invalid_order() {
        let descriptor = EntityDescriptor::new(
            "things",
            "things",
            vec![ColumnDescriptor::new("id", ColumnType::Integer).primary_key()],
        )
        .unwrap();
        let err = build_order_by_clause(&descriptor, &[OrderSpec::asc("id.x")], None).unwrap_err();
        assert!(matches!(err, MetadataStoreError::InvalidOrder(_)));
    }
}
