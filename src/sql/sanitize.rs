//! SQL identifier sanitization
//!
//! Values always travel as bound parameters. Identifiers and JSON keys cannot,
//! so they are inlined through the quoting functions in this module.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// PostgreSQL reserved keywords that cannot be used as unquoted identifiers
pub const POSTGRES_RESERVED_WORDS: &[&str] = &[
    "ALL",
    "ANALYSE",
    "ANALYZE",
    "AND",
    "ANY",
    "ARRAY",
    "AS",
    "ASC",
    "ASYMMETRIC",
    "BOTH",
    "CASE",
    "CAST",
    "CHECK",
    "COLLATE",
    "COLUMN",
    "CONSTRAINT",
    "CREATE",
    "CURRENT_CATALOG",
    "CURRENT_DATE",
    "CURRENT_ROLE",
    "CURRENT_TIME",
    "CURRENT_TIMESTAMP",
    "CURRENT_USER",
    "DEFAULT",
    "DEFERRABLE",
    "DESC",
    "DISTINCT",
    "DO",
    "ELSE",
    "END",
    "EXCEPT",
    "FALSE",
    "FETCH",
    "FOR",
    "FOREIGN",
    "FROM",
    "GRANT",
    "GROUP",
    "HAVING",
    "IN",
    "INITIALLY",
    "INTERSECT",
    "INTO",
    "LATERAL",
    "LEADING",
    "LIMIT",
    "LOCALTIME",
    "LOCALTIMESTAMP",
    "NOT",
    "NULL",
    "OFFSET",
    "ON",
    "ONLY",
    "OR",
    "ORDER",
    "PLACING",
    "PRIMARY",
    "REFERENCES",
    "RETURNING",
    "SELECT",
    "SESSION_USER",
    "SOME",
    "SYMMETRIC",
    "TABLE",
    "THEN",
    "TO",
    "TRAILING",
    "TRUE",
    "UNION",
    "UNIQUE",
    "USER",
    "USING",
    "VARIADIC",
    "WHEN",
    "WHERE",
    "WINDOW",
    "WITH",
];

/// Quote a SQL identifier to make it safe for use in queries
///
/// Identifiers cannot be bound as parameters, so every table, column and alias
/// name is inlined through this function: the name is wrapped in double quotes
/// and any embedded double quote is doubled.
///
/// # Example
/// ```
/// use metadata_store::sql::quote_identifier;
///
/// assert_eq!(quote_identifier("signatures"), "\"signatures\"");
/// assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
/// ```
pub fn quote_identifier(identifier: &str) -> String {
    let escaped = identifier.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Quote a JSON object key for use with the `->` / `->>` operators
///
/// JSON keys are inlined as string literals with embedded single quotes doubled.
///
/// # Example
/// ```
/// use metadata_store::sql::quote_json_key;
///
/// assert_eq!(quote_json_key("name"), "'name'");
/// assert_eq!(quote_json_key("it's"), "'it''s'");
/// ```
pub fn quote_json_key(key: &str) -> String {
    let escaped = key.replace('\'', "''");
    format!("'{}'", escaped)
}

static IDENTIFIER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("identifier pattern is valid"));

static NAME_FRAGMENT_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("separator pattern is valid"));

/// Validate a table name
///
/// Rules:
/// - Must start with a letter (a-z)
/// - Can only contain lowercase letters, numbers, and underscores
/// - Cannot be a PostgreSQL reserved word
/// - Cannot be one of `reserved_names`
///
/// # Example
/// ```
/// use metadata_store::sql::validate_identifier;
///
/// assert!(validate_identifier("signatures", &[]).is_ok());
/// assert!(validate_identifier("select", &[]).is_err());
/// assert!(validate_identifier("id", &["id"]).is_err());
/// ```
pub fn validate_identifier(name: &str, reserved_names: &[&str]) -> Result<(), String> {
    if name.is_empty() {
        return Err("Identifier cannot be empty".to_string());
    }

    if !IDENTIFIER_PATTERN.is_match(name) {
        return Err(format!(
            "Identifier '{}' is invalid. Must start with a lowercase letter and contain only lowercase letters, numbers, and underscores.",
            name
        ));
    }

    if POSTGRES_RESERVED_WORDS.contains(&name.to_uppercase().as_str()) {
        return Err(format!(
            "Identifier '{}' is a PostgreSQL reserved keyword and cannot be used.",
            name
        ));
    }

    if reserved_names.contains(&name) {
        return Err(format!("Name '{}' is reserved and cannot be used.", name));
    }

    Ok(())
}

/// Build a generated object name (e.g. an index name) from free-form parts
///
/// Each part is lowercased, runs of characters outside `[a-z0-9]` collapse to
/// `_`, and parts are joined with `_`. An 8-digit digest of the exact parts is
/// appended, so parts that normalize alike (`a.b` and `a_b`, `A` and `a`, long
/// shared prefixes) still get distinct names. The result fits PostgreSQL's
/// 63-byte identifier limit.
pub fn generated_name(parts: &[&str]) -> String {
    let suffix = name_digest(parts);
    let readable = parts
        .iter()
        .map(|part| {
            NAME_FRAGMENT_SEPARATORS
                .replace_all(&part.to_lowercase(), "_")
                .trim_matches('_')
                .to_string()
        })
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    let readable: String = readable.chars().take(63 - suffix.len() - 1).collect();

    match readable.trim_end_matches('_') {
        "" => suffix,
        readable => format!("{}_{}", readable, suffix),
    }
}

fn name_digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        let len = u32::try_from(part.len()).unwrap_or(u32::MAX);
        hasher.update(len.to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .take(4)
        .map(|byte| format!("{:02x}", byte))
        .collect()
}
