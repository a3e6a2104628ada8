//! SQL generation for metadata queries
//!
//! Path resolution, predicate compilation, statement compilation, parameter
//! binding, identifier sanitization and index DDL.

pub mod condition;
pub mod ddl;
pub mod params;
pub mod path;
pub mod query;
pub mod sanitize;

pub use condition::{build_order_by_clause, compile_where};
pub use ddl::{DdlGenerator, IndexMethod};
pub use params::{ParamAllocator, SqlParam};
pub use query::{CompiledQuery, QueryCompiler};
pub use sanitize::{POSTGRES_RESERVED_WORDS, quote_identifier, quote_json_key, validate_identifier};
