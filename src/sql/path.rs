//! Field path resolution
//!
//! Maps a dotted [`FieldPath`] onto a column of an [`EntityDescriptor`] and
//! renders the SQL expressions used to read it. A path that names a column
//! exactly is shallow; otherwise its first segment must name a JSON column and
//! the remaining segments walk into the document.

use std::collections::BTreeMap;

use crate::catalog::{ColumnDescriptor, EntityDescriptor};
use crate::error::{MetadataStoreError, Result};
use crate::filter::FieldPath;
use crate::sql::sanitize::{quote_identifier, quote_json_key};

/// Reference a column, optionally qualified by a table alias
pub fn column_reference(alias: Option<&str>, column: &ColumnDescriptor) -> String {
    match alias {
        Some(alias) => format!(
            "{}.{}",
            quote_identifier(alias),
            quote_identifier(&column.database_name)
        ),
        None => quote_identifier(&column.database_name),
    }
}

/// Walk `keys` from a jsonb expression, returning text at the last step when
/// `force_text` is set
fn json_path(base: String, keys: &[String], force_text: bool) -> String {
    let mut expr = base;
    for (i, key) in keys.iter().enumerate() {
        let arrow = if force_text && i + 1 == keys.len() {
            "->>"
        } else {
            "->"
        };
        expr = format!("{}{}{}", expr, arrow, quote_json_key(key));
    }
    expr
}

/// A path resolved against a descriptor
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedPath<'a> {
    /// The path names a column
    Shallow { column: &'a ColumnDescriptor },
    /// The path walks into a JSON column
    Deep {
        column: &'a ColumnDescriptor,
        subpath: Vec<String>,
    },
}

impl<'a> ResolvedPath<'a> {
    pub fn column(&self) -> &'a ColumnDescriptor {
        match self {
            ResolvedPath::Shallow { column } | ResolvedPath::Deep { column, .. } => column,
        }
    }

    pub fn is_deep(&self) -> bool {
        matches!(self, ResolvedPath::Deep { .. })
    }

    /// Whether [`scalar_expression`](Self::scalar_expression) yields jsonb
    pub fn is_json(&self) -> bool {
        self.is_deep() || self.column().is_json()
    }

    /// Expression reading the value; deep paths yield jsonb unless
    /// `force_text` is set, in which case the last step uses `->>`
    pub fn scalar_expression(&self, alias: Option<&str>, force_text: bool) -> String {
        match self {
            ResolvedPath::Shallow { column } => column_reference(alias, column),
            ResolvedPath::Deep { column, subpath } => {
                json_path(column_reference(alias, column), subpath, force_text)
            }
        }
    }

    /// Expression producing text, as required by the pattern operators
    pub fn text_expression(&self, alias: Option<&str>) -> Result<String> {
        match self {
            ResolvedPath::Deep { .. } => Ok(self.scalar_expression(alias, true)),
            ResolvedPath::Shallow { column } if column.column_type.is_textual() => {
                Ok(column_reference(alias, column))
            }
            ResolvedPath::Shallow { column } if column.is_json() => {
                Ok(format!("{}::text", column_reference(alias, column)))
            }
            ResolvedPath::Shallow { column } => Err(MetadataStoreError::type_mismatch(format!(
                "Column '{}' of type {:?} does not produce text",
                column.property_name, column.column_type
            ))),
        }
    }

    /// Expression rebuilding the nested object that holds this path, e.g.
    /// `meta.a.b` becomes `jsonb_build_object('a', jsonb_build_object('b', ...))`
    pub fn object_expression(&self, alias: Option<&str>) -> Result<String> {
        match self {
            ResolvedPath::Shallow { column } => Err(MetadataStoreError::type_mismatch(format!(
                "Column '{}' is selected directly, not as a nested object",
                column.property_name
            ))),
            ResolvedPath::Deep { column, subpath } => {
                let mut projection = DeepProjection::new(column);
                projection.add(subpath);
                Ok(projection.expression(alias))
            }
        }
    }
}

/// Resolve `path` against `descriptor`
///
/// An exact property match wins, so a property containing dots is reachable.
/// An unknown root fails with `UnknownColumn`; walking into a non-JSON column
/// fails with `TypeMismatch`.
pub fn resolve<'a>(descriptor: &'a EntityDescriptor, path: &FieldPath) -> Result<ResolvedPath<'a>> {
    path.check()?;
    let dotted = path.to_string();
    if let Some(column) = descriptor.column(&dotted) {
        return Ok(ResolvedPath::Shallow { column });
    }

    let column = descriptor.column(path.root()).ok_or_else(|| {
        MetadataStoreError::unknown_column(format!("{}.{}", descriptor.name, dotted))
    })?;

    if !path.is_nested() {
        return Ok(ResolvedPath::Shallow { column });
    }

    if !column.is_json() {
        return Err(MetadataStoreError::type_mismatch(format!(
            "Cannot read '{}': column '{}' is not a JSON column",
            dotted, column.property_name
        )));
    }

    Ok(ResolvedPath::Deep {
        column,
        subpath: path.subpath().to_vec(),
    })
}

#[derive(Debug, Default)]
struct ProjectionNode {
    selected: bool,
    children: BTreeMap<String, ProjectionNode>,
}

/// Several deep paths into one JSON column merged into a single object
///
/// A selected prefix covers every longer path beneath it and adding a path
/// twice has no effect, so the projected object does not depend on the
/// order or repetition of the requested paths.
#[derive(Debug)]
pub struct DeepProjection<'a> {
    column: &'a ColumnDescriptor,
    root: ProjectionNode,
}

impl<'a> DeepProjection<'a> {
    pub fn new(column: &'a ColumnDescriptor) -> Self {
        Self {
            column,
            root: ProjectionNode::default(),
        }
    }

    pub fn column(&self) -> &'a ColumnDescriptor {
        self.column
    }

    /// Add a subpath below the column; an empty subpath selects the whole column
    pub fn add(&mut self, subpath: &[String]) {
        let mut node = &mut self.root;
        for key in subpath {
            if node.selected {
                return;
            }
            node = node.children.entry(key.clone()).or_default();
        }
        node.selected = true;
        node.children.clear();
    }

    pub fn expression(&self, alias: Option<&str>) -> String {
        let base = column_reference(alias, self.column);
        if self.root.selected {
            return base;
        }
        if self.root.children.is_empty() {
            return "'{}'::jsonb".to_string();
        }

        let mut prefix = Vec::new();
        self.root
            .children
            .iter()
            .map(|(key, child)| {
                prefix.push(key.clone());
                let expr = format!(
                    "jsonb_build_object({}, {})",
                    quote_json_key(key),
                    Self::emit(child, &base, &mut prefix)
                );
                prefix.pop();
                expr
            })
            .collect::<Vec<_>>()
            .join(" || ")
    }

    fn emit(node: &ProjectionNode, base: &str, prefix: &mut Vec<String>) -> String {
        if node.selected {
            return json_path(base.to_string(), prefix, false);
        }
        let mut entries = Vec::with_capacity(node.children.len());
        for (key, child) in &node.children {
            prefix.push(key.clone());
            entries.push(format!(
                "{}, {}",
                quote_json_key(key),
                Self::emit(child, base, prefix)
            ));
            prefix.pop();
        }
        format!("jsonb_build_object({})", entries.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnType;

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::new(
            "libraries",
            "libraries",
            vec![
                ColumnDescriptor::new("id", ColumnType::Uuid).primary_key(),
                ColumnDescriptor::new("dataset", ColumnType::String),
                ColumnDescriptor::new("meta", ColumnType::Json),
                ColumnDescriptor::new("meta.legacy", ColumnType::String).column("meta_legacy"),
            ],
        )
        .unwrap()
    }

    fn path(s: &str) -> FieldPath {
        FieldPath::from(s)
    }

    // ==================== resolve ====================

    #[test]
    fn test_resolve_shallow() {
        let d = descriptor();
        let resolved = resolve(&d, &path("dataset")).unwrap();
        assert!(!resolved.is_deep());
        assert_eq!(resolved.scalar_expression(None, false), "\"dataset\"");
        assert_eq!(resolved.scalar_expression(Some("l"), false), "\"l\".\"dataset\"");
    }

    #[test]
    fn test_resolve_deep() {
        let d = descriptor();
        let resolved = resolve(&d, &path("meta.Assay.name")).unwrap();
        assert!(resolved.is_deep());
        assert!(resolved.is_json());
        assert_eq!(
            resolved.scalar_expression(None, false),
            "\"meta\"->'Assay'->'name'"
        );
        assert_eq!(
            resolved.scalar_expression(Some("libraries"), true),
            "\"libraries\".\"meta\"->'Assay'->>'name'"
        );
    }

    #[test]
    fn test_resolve_exact_property_wins() {
        let d = descriptor();
        let resolved = resolve(&d, &path("meta.legacy")).unwrap();
        assert_eq!(resolved.scalar_expression(None, false), "\"meta_legacy\"");
    }

    #[test]
    fn test_resolve_unknown_root() {
        let d = descriptor();
        let err = resolve(&d, &path("nope.a")).unwrap_err();
        assert!(matches!(err, MetadataStoreError::UnknownColumn(_)));
        assert!(resolve(&d, &path("")).is_err());
    }

    #[test]
    fn test_resolve_rejects_empty_segments() {
        let d = descriptor();
        for p in ["meta..a", "meta.", ""] {
            let err = resolve(&d, &path(p)).unwrap_err();
            assert!(matches!(err, MetadataStoreError::Validation(_)), "{}", p);
        }
    }

    #[test]
    fn test_resolve_deep_into_scalar_column() {
        let d = descriptor();
        let err = resolve(&d, &path("dataset.x")).unwrap_err();
        assert!(matches!(err, MetadataStoreError::TypeMismatch(_)));
    }

    #[test]
    fn test_json_keys_are_quoted() {
        let d = descriptor();
        let resolved = resolve(&d, &path("meta.it's")).unwrap();
        assert_eq!(resolved.scalar_expression(None, false), "\"meta\"->'it''s'");
    }

    // ==================== text_expression ====================

    #[test]
    fn test_text_expression() {
        let d = descriptor();
        assert_eq!(
            resolve(&d, &path("dataset")).unwrap().text_expression(None).unwrap(),
            "\"dataset\""
        );
        assert_eq!(
            resolve(&d, &path("meta")).unwrap().text_expression(None).unwrap(),
            "\"meta\"::text"
        );
        assert_eq!(
            resolve(&d, &path("meta.a")).unwrap().text_expression(None).unwrap(),
            "\"meta\"->>'a'"
        );
        let err = resolve(&d, &path("id")).unwrap().text_expression(None).unwrap_err();
        assert!(matches!(err, MetadataStoreError::TypeMismatch(_)));
    }

    // ==================== projection ====================

    #[test]
    fn test_object_expression_nests() {
        let d = descriptor();
        let resolved = resolve(&d, &path("meta.a.b")).unwrap();
        assert_eq!(
            resolved.object_expression(None).unwrap(),
            "jsonb_build_object('a', jsonb_build_object('b', \"meta\"->'a'->'b'))"
        );

        let shallow = resolve(&d, &path("dataset")).unwrap();
        assert!(shallow.object_expression(None).is_err());
    }

    #[test]
    fn test_projection_merges_siblings() {
        let d = descriptor();
        let column = d.column("meta").unwrap();
        let mut projection = DeepProjection::new(column);
        projection.add(&["a".to_string(), "x".to_string()]);
        projection.add(&["a".to_string(), "y".to_string()]);
        projection.add(&["b".to_string()]);
        assert_eq!(
            projection.expression(None),
            "jsonb_build_object('a', jsonb_build_object('x', \"meta\"->'a'->'x', 'y', \"meta\"->'a'->'y')) || jsonb_build_object('b', \"meta\"->'b')"
        );
    }

    #[test]
    fn test_projection_prefix_covers_longer_paths() {
        let d = descriptor();
        let column = d.column("meta").unwrap();

        let mut first = DeepProjection::new(column);
        first.add(&["a".to_string(), "x".to_string()]);
        first.add(&["a".to_string()]);

        let mut second = DeepProjection::new(column);
        second.add(&["a".to_string()]);
        second.add(&["a".to_string(), "x".to_string()]);
        second.add(&["a".to_string()]);

        assert_eq!(first.expression(None), second.expression(None));
        assert_eq!(
            first.expression(None),
            "jsonb_build_object('a', \"meta\"->'a')"
        );
    }

    #[test]
    fn test_projection_whole_column() {
        let d = descriptor();
        let column = d.column("meta").unwrap();
        let mut projection = DeepProjection::new(column);
        projection.add(&["a".to_string()]);
        projection.add(&[]);
        assert_eq!(projection.expression(Some("r")), "\"r\".\"meta\"");
    }
}
