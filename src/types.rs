//! Column type definitions
//!
//! Maps declared column kinds to PostgreSQL types and validates payload values.

use serde::{Deserialize, Serialize};

/// Column type with validation and SQL mapping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ColumnType {
    /// Text field (maps to TEXT)
    String,

    /// Integer field (maps to BIGINT)
    Integer,

    /// Decimal field with precision and scale (maps to NUMERIC)
    Decimal {
        #[serde(default = "default_precision")]
        precision: u8,
        #[serde(default = "default_scale")]
        scale: u8,
    },

    /// Boolean field (maps to BOOLEAN)
    Boolean,

    /// Timestamp field, always stored in UTC (maps to TIMESTAMP WITH TIME ZONE)
    Timestamp,

    /// UUID field (maps to UUID)
    Uuid,

    /// JSON document, stored as binary JSON (maps to JSONB)
    Json,

    /// Text restricted to a set of values
    Enum { values: Vec<String> },
}

fn default_precision() -> u8 {
    19
}

fn default_scale() -> u8 {
    4
}

impl ColumnType {
    pub fn decimal(precision: u8, scale: u8) -> Self {
        ColumnType::Decimal { precision, scale }
    }

    /// Whether the column stores a JSON document
    pub fn is_json(&self) -> bool {
        matches!(self, ColumnType::Json)
    }

    /// Whether the column value is already text in SQL
    pub fn is_textual(&self) -> bool {
        matches!(self, ColumnType::String | ColumnType::Enum { .. })
    }

    /// Convert column type to PostgreSQL type string
    pub fn to_sql_type(&self, column_name: &str) -> String {
        match self {
            ColumnType::String => "TEXT".to_string(),
            ColumnType::Integer => "BIGINT".to_string(),
            ColumnType::Decimal { precision, scale } => {
                format!("NUMERIC({},{})", precision, scale)
            }
            ColumnType::Boolean => "BOOLEAN".to_string(),
            ColumnType::Timestamp => "TIMESTAMP WITH TIME ZONE".to_string(),
            ColumnType::Uuid => "UUID".to_string(),
            ColumnType::Json => "JSONB".to_string(),
            ColumnType::Enum { values } => {
                format!(
                    "TEXT CHECK ({} IN ({}))",
                    column_name,
                    values
                        .iter()
                        .map(|v| format!("'{}'", v.replace('\'', "''")))
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            }
        }
    }

    /// Validate that a JSON value is compatible with this column type
    pub fn validate_value(&self, value: &serde_json::Value) -> Result<(), String> {
        // Null is governed by the nullable flag
        if value.is_null() {
            return Ok(());
        }

        match (self, value) {
            (ColumnType::String, serde_json::Value::String(_)) => Ok(()),
            (ColumnType::Integer, serde_json::Value::Number(n)) if n.is_i64() => Ok(()),
            (ColumnType::Integer, serde_json::Value::String(s)) => s
                .parse::<i64>()
                .map(|_| ())
                .map_err(|_| format!("Cannot convert '{}' to integer", s)),
            (ColumnType::Decimal { .. }, serde_json::Value::Number(_)) => Ok(()),
            (ColumnType::Decimal { .. }, serde_json::Value::String(s)) => s
                .parse::<rust_decimal::Decimal>()
                .map(|_| ())
                .map_err(|_| format!("Cannot convert '{}' to decimal", s)),
            (ColumnType::Boolean, serde_json::Value::Bool(_)) => Ok(()),
            (ColumnType::Boolean, serde_json::Value::String(s)) => {
                match s.to_lowercase().as_str() {
                    "true" | "false" | "1" | "0" | "yes" | "no" => Ok(()),
                    _ => Err(format!("Cannot convert '{}' to boolean", s)),
                }
            }
            (ColumnType::Timestamp, serde_json::Value::String(s)) => {
                chrono::DateTime::parse_from_rfc3339(s)
                    .map(|_| ())
                    .map_err(|e| format!("Invalid timestamp format: {}", e))
            }
            (ColumnType::Uuid, serde_json::Value::String(s)) => uuid::Uuid::parse_str(s)
                .map(|_| ())
                .map_err(|e| format!("Invalid uuid '{}': {}", s, e)),
            (ColumnType::Json, _) => Ok(()),
            (ColumnType::Enum { values }, serde_json::Value::String(s)) => {
                if values.contains(s) {
                    Ok(())
                } else {
                    Err(format!("Value '{}' not in enum values: {:?}", s, values))
                }
            }
            _ => Err(format!(
                "Type mismatch: expected {:?}, got {}",
                self, value
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // =========================================================================
    // SQL Type Tests
    // =========================================================================

    #[test]
    fn test_column_type_sql() {
        assert_eq!(ColumnType::String.to_sql_type("name"), "TEXT");
        assert_eq!(ColumnType::Integer.to_sql_type("count"), "BIGINT");
        assert_eq!(ColumnType::decimal(10, 2).to_sql_type("price"), "NUMERIC(10,2)");
        assert_eq!(ColumnType::Boolean.to_sql_type("active"), "BOOLEAN");
        assert_eq!(
            ColumnType::Timestamp.to_sql_type("created"),
            "TIMESTAMP WITH TIME ZONE"
        );
        assert_eq!(ColumnType::Uuid.to_sql_type("id"), "UUID");
        assert_eq!(ColumnType::Json.to_sql_type("meta"), "JSONB");
    }

    #[test]
    fn test_column_type_enum_sql_escapes_quotes() {
        let enum_type = ColumnType::Enum {
            values: vec!["it's".to_string(), "normal".to_string()],
        };
        let sql = enum_type.to_sql_type("kind");
        assert!(sql.contains("TEXT CHECK"));
        assert!(sql.contains("'it''s'"));
    }

    #[test]
    fn test_kind_predicates() {
        assert!(ColumnType::Json.is_json());
        assert!(!ColumnType::String.is_json());
        assert!(ColumnType::String.is_textual());
        assert!(ColumnType::Enum { values: vec![] }.is_textual());
        assert!(!ColumnType::Uuid.is_textual());
        assert!(!ColumnType::Json.is_textual());
    }

    // =========================================================================
    // Serialization Tests
    // =========================================================================

    #[test]
    fn test_column_type_serialization() {
        let json = serde_json::to_string(&ColumnType::Uuid).unwrap();
        assert_eq!(json, r#"{"type":"uuid"}"#);

        let col: ColumnType = serde_json::from_str(r#"{"type":"decimal"}"#).unwrap();
        assert_eq!(col, ColumnType::decimal(19, 4));
    }

    // =========================================================================
    // Value Validation Tests
    // =========================================================================

    #[test]
    fn test_validate_scalars() {
        assert!(ColumnType::String.validate_value(&json!("hello")).is_ok());
        assert!(ColumnType::String.validate_value(&json!(1)).is_err());
        assert!(ColumnType::Integer.validate_value(&json!(-4)).is_ok());
        assert!(ColumnType::Integer.validate_value(&json!("12")).is_ok());
        assert!(ColumnType::Integer.validate_value(&json!("1.5")).is_err());
        assert!(ColumnType::decimal(10, 2).validate_value(&json!("9.99")).is_ok());
        assert!(ColumnType::decimal(10, 2).validate_value(&json!("abc")).is_err());
        assert!(ColumnType::Boolean.validate_value(&json!("yes")).is_ok());
        assert!(ColumnType::Boolean.validate_value(&json!("maybe")).is_err());
    }

    #[test]
    fn test_validate_uuid() {
        let t = ColumnType::Uuid;
        assert!(
            t.validate_value(&json!("67e55044-10b1-426f-9247-bb680e5fe0c8"))
                .is_ok()
        );
        assert!(t.validate_value(&json!("not-a-uuid")).is_err());
        assert!(t.validate_value(&json!(42)).is_err());
    }

    #[test]
    fn test_validate_timestamp() {
        let t = ColumnType::Timestamp;
        assert!(t.validate_value(&json!("2024-01-15T10:30:00Z")).is_ok());
        assert!(t.validate_value(&json!("2024-01-15")).is_err());
    }

    #[test]
    fn test_validate_json_accepts_any() {
        let t = ColumnType::Json;
        assert!(t.validate_value(&json!({"a": [1, 2]})).is_ok());
        assert!(t.validate_value(&json!("text")).is_ok());
    }

    #[test]
    fn test_validate_enum() {
        let t = ColumnType::Enum {
            values: vec!["rank".to_string(), "geneset".to_string()],
        };
        assert!(t.validate_value(&json!("rank")).is_ok());
        assert!(t.validate_value(&json!("RANK")).is_err());
    }

    #[test]
    fn test_validate_null_always_ok() {
        assert!(ColumnType::Uuid.validate_value(&json!(null)).is_ok());
        assert!(ColumnType::Integer.validate_value(&json!(null)).is_ok());
    }
}
