//! Error types for metadata store operations

use thiserror::Error;

/// Errors that can occur while compiling or executing metadata queries
#[derive(Debug, Error)]
pub enum MetadataStoreError {
    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Invalid predicate: {0}")]
    InvalidPredicate(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Unsupported relationship: {0}")]
    UnsupportedRelationship(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MetadataStoreError {
    pub fn unknown_column(msg: impl Into<String>) -> Self {
        Self::UnknownColumn(msg.into())
    }

    pub fn invalid_predicate(msg: impl Into<String>) -> Self {
        Self::InvalidPredicate(msg.into())
    }

    pub fn type_mismatch(msg: impl Into<String>) -> Self {
        Self::TypeMismatch(msg.into())
    }

    pub fn invalid_order(msg: impl Into<String>) -> Self {
        Self::InvalidOrder(msg.into())
    }

    pub fn unsupported_relationship(msg: impl Into<String>) -> Self {
        Self::UnsupportedRelationship(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn entity_not_found(msg: impl Into<String>) -> Self {
        Self::EntityNotFound(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Whether the error was caused by the request rather than the database.
    ///
    /// Client errors are raised before any statement reaches the database.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownColumn(_)
                | Self::InvalidPredicate(_)
                | Self::TypeMismatch(_)
                | Self::InvalidOrder(_)
                | Self::UnsupportedRelationship(_)
                | Self::Validation(_)
                | Self::EntityNotFound(_)
                | Self::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MetadataStoreError>;
