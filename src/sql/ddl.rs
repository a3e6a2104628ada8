//! DDL generation for entity tables
//!
//! Migrations are owned elsewhere; the store only creates secondary indexes on
//! demand. Table DDL is kept for provisioning test databases.

use std::fmt;
use std::str::FromStr;

use crate::catalog::{ColumnDescriptor, EntityDescriptor};
use crate::error::{MetadataStoreError, Result};
use crate::filter::FieldPath;
use crate::sql::path::{ResolvedPath, resolve};
use crate::sql::sanitize::{generated_name, quote_identifier};

/// Index access methods accepted by `ensure_index`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMethod {
    Btree,
    Gist,
    Gin,
    Hash,
}

impl IndexMethod {
    pub const ALL: [IndexMethod; 4] = [
        IndexMethod::Btree,
        IndexMethod::Gist,
        IndexMethod::Gin,
        IndexMethod::Hash,
    ];

    pub fn as_sql(self) -> &'static str {
        match self {
            IndexMethod::Btree => "btree",
            IndexMethod::Gist => "gist",
            IndexMethod::Gin => "gin",
            IndexMethod::Hash => "hash",
        }
    }
}

impl fmt::Display for IndexMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for IndexMethod {
    type Err = MetadataStoreError;

    fn from_str(s: &str) -> Result<Self> {
        IndexMethod::ALL
            .into_iter()
            .find(|m| m.as_sql() == s)
            .ok_or_else(|| {
                MetadataStoreError::validation(format!(
                    "Unsupported index method '{}'. Expected one of: btree, gist, gin, hash",
                    s
                ))
            })
    }
}

/// DDL generator for one entity's table
pub struct DdlGenerator<'a> {
    descriptor: &'a EntityDescriptor,
}

impl<'a> DdlGenerator<'a> {
    pub fn new(descriptor: &'a EntityDescriptor) -> Self {
        Self { descriptor }
    }

    /// Generate `CREATE TABLE IF NOT EXISTS` with every catalog column
    pub fn generate_create_table(&self) -> String {
        let columns = self
            .descriptor
            .columns()
            .iter()
            .map(Self::format_column_definition)
            .collect::<Vec<_>>();

        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_identifier(&self.descriptor.table),
            columns.join(", ")
        )
    }

    pub fn generate_drop_table(&self) -> String {
        format!(
            "DROP TABLE IF EXISTS {} CASCADE",
            quote_identifier(&self.descriptor.table)
        )
    }

    /// Generate `CREATE INDEX CONCURRENTLY IF NOT EXISTS` for a field
    ///
    /// Returns the index name together with the statement. The name is derived
    /// from the table, the exact field path and the method, so repeated calls
    /// converge on the same index and different fields never share one.
    pub fn generate_create_index(
        &self,
        field: &FieldPath,
        method: IndexMethod,
    ) -> Result<(String, String)> {
        let resolved = resolve(self.descriptor, field)?;
        let field_name = field.to_string();
        let name = generated_name(&[&self.descriptor.table, &field_name, method.as_sql()]);

        let expression = match &resolved {
            ResolvedPath::Shallow { column } => quote_identifier(&column.database_name),
            ResolvedPath::Deep { .. } => format!("({})", resolved.scalar_expression(None, false)),
        };

        let sql = format!(
            "CREATE INDEX CONCURRENTLY IF NOT EXISTS {} ON {} USING {} ({})",
            quote_identifier(&name),
            quote_identifier(&self.descriptor.table),
            method.as_sql(),
            expression
        );
        Ok((name, sql))
    }

    pub fn format_column_definition(col: &ColumnDescriptor) -> String {
        let quoted = quote_identifier(&col.database_name);
        let mut parts = vec![quoted.clone(), col.column_type.to_sql_type(&quoted)];

        if col.primary_key {
            parts.push("PRIMARY KEY".to_string());
        } else if !col.nullable {
            parts.push("NOT NULL".to_string());
        }

        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::types::ColumnType;

    fn libraries() -> EntityDescriptor {
        Catalog::metadata().unwrap().entity("libraries").unwrap().clone()
    }

    // ==================== Index Method Tests ====================

    #[test]
    fn test_index_method_allow_list() {
        assert_eq!("btree".parse::<IndexMethod>().unwrap(), IndexMethod::Btree);
        assert_eq!("gin".parse::<IndexMethod>().unwrap(), IndexMethod::Gin);
        assert_eq!("gist".parse::<IndexMethod>().unwrap(), IndexMethod::Gist);
        assert_eq!("hash".parse::<IndexMethod>().unwrap(), IndexMethod::Hash);
    }

    #[test]
    fn test_index_method_rejects_unknown() {
        let err = "brin; DROP TABLE x".parse::<IndexMethod>().unwrap_err();
        assert!(matches!(err, MetadataStoreError::Validation(_)));
        assert!("BTREE".parse::<IndexMethod>().is_err());
    }

    // ==================== CREATE INDEX Tests ====================

    #[test]
    fn test_generate_create_index_on_column() {
        let descriptor = libraries();
        let generator = DdlGenerator::new(&descriptor);
        let (name, sql) = generator
            .generate_create_index(&FieldPath::from("dataset"), IndexMethod::Btree)
            .unwrap();

        assert_eq!(name, "libraries_dataset_btree_01f72824");
        assert_eq!(
            sql,
            "CREATE INDEX CONCURRENTLY IF NOT EXISTS \"libraries_dataset_btree_01f72824\" ON \"libraries\" USING btree (\"dataset\")"
        );
    }

    #[test]
    fn test_generate_create_index_on_json_path() {
        let descriptor = libraries();
        let generator = DdlGenerator::new(&descriptor);
        let (name, sql) = generator
            .generate_create_index(&FieldPath::from("meta.assay"), IndexMethod::Gin)
            .unwrap();

        assert_eq!(name, "libraries_meta_assay_gin_2692fadd");
        assert_eq!(
            sql,
            "CREATE INDEX CONCURRENTLY IF NOT EXISTS \"libraries_meta_assay_gin_2692fadd\" ON \"libraries\" USING gin ((\"meta\"->'assay'))"
        );
    }

    #[test]
    fn test_generate_create_index_distinct_paths_get_distinct_names() {
        let descriptor = Catalog::metadata().unwrap().entity("signatures").unwrap().clone();
        let generator = DdlGenerator::new(&descriptor);
        let (nested, nested_sql) = generator
            .generate_create_index(&FieldPath::from("meta.a.b"), IndexMethod::Btree)
            .unwrap();
        let (flat, flat_sql) = generator
            .generate_create_index(&FieldPath::from("meta.a_b"), IndexMethod::Btree)
            .unwrap();

        assert_ne!(nested, flat);
        assert!(nested_sql.ends_with("((\"meta\"->'a'->'b'))"));
        assert!(flat_sql.ends_with("((\"meta\"->'a_b'))"));
    }

    #[test]
    fn test_generate_create_index_unknown_field() {
        let descriptor = libraries();
        let generator = DdlGenerator::new(&descriptor);
        let err = generator
            .generate_create_index(&FieldPath::from("nope"), IndexMethod::Btree)
            .unwrap_err();
        assert!(matches!(err, MetadataStoreError::UnknownColumn(_)));
    }

    // ==================== CREATE TABLE Tests ====================

    #[test]
    fn test_generate_create_table() {
        let descriptor = EntityDescriptor::new(
            "things",
            "things",
            vec![
                ColumnDescriptor::new("id", ColumnType::Uuid).primary_key(),
                ColumnDescriptor::new("name", ColumnType::String).not_null(),
                ColumnDescriptor::new("meta", ColumnType::Json),
            ],
        )
        .unwrap();
        let ddl = DdlGenerator::new(&descriptor).generate_create_table();

        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS \"things\" (\"id\" UUID PRIMARY KEY, \"name\" TEXT NOT NULL, \"meta\" JSONB)"
        );
    }

    #[test]
    fn test_generate_drop_table() {
        let descriptor = libraries();
        assert_eq!(
            DdlGenerator::new(&descriptor).generate_drop_table(),
            "DROP TABLE IF EXISTS \"libraries\" CASCADE"
        );
    }

    #[test]
    fn test_format_column_definition_enum_check_uses_quoted_name() {
        let state = ColumnType::Enum {
            values: vec!["ok".to_string(), "bad".to_string()],
        };
        let col = ColumnDescriptor::new("state", state).not_null();
        assert_eq!(
            DdlGenerator::format_column_definition(&col),
            "\"state\" TEXT CHECK (\"state\" IN ('ok', 'bad')) NOT NULL"
        );
    }
}
