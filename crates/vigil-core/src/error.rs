//! Validation errors raised while registering schemas and compiling statements

use thiserror::Error;

use crate::types::Type;

/// A statement or schema was rejected at registration time.
///
/// Expression-level variants carry the rendered sub-expression so the
/// caller can tell which part of a statement failed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Event type '{0}' is not registered")]
    UnknownEventType(String),

    #[error("Event type '{name}' conflicts with its existing definition: {reason}")]
    EventTypeConflict { name: String, reason: String },

    #[error("Failed to validate expression '{expr}': property named '{property}' is not valid in any stream")]
    UnknownProperty { expr: String, property: String },

    #[error("Failed to validate expression '{expr}': property named '{property}' is ambiguous as it is valid for more than one stream")]
    AmbiguousProperty { expr: String, property: String },

    #[error("Failed to validate expression '{expr}': expected {expected} but received {actual}")]
    TypeMismatch {
        expr: String,
        expected: String,
        actual: Type,
    },

    #[error("Failed to validate expression '{expr}': enumeration method '{method}' {message}")]
    InvalidEnumArgument {
        expr: String,
        method: String,
        message: String,
    },

    #[error("Failed to validate expression '{expr}': aggregation functions are not allowed in this context")]
    AggregationNotAllowed { expr: String },

    #[error("Failed to validate expression '{expr}': table access is not allowed in this context")]
    TableAccessNotAllowed { expr: String },

    #[error("Table '{0}' is not defined")]
    UnknownTable(String),

    #[error("Table '{0}' is already defined")]
    DuplicateTable(String),

    #[error("Column '{column}' is not defined in table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("Column '{column}' of table '{table}' is a primary key column and cannot be updated")]
    KeyColumnUpdate { table: String, column: String },

    #[error("Column '{column}' of table '{table}' {message}")]
    InvalidColumn {
        table: String,
        column: String,
        message: String,
    },

    #[error("Invalid statement: {0}")]
    InvalidStatement(String),
}

impl ValidationError {
    pub fn mismatch(expr: impl ToString, expected: impl Into<String>, actual: Type) -> Self {
        ValidationError::TypeMismatch {
            expr: expr.to_string(),
            expected: expected.into(),
            actual,
        }
    }

    pub fn enum_argument(
        expr: impl ToString,
        method: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ValidationError::InvalidEnumArgument {
            expr: expr.to_string(),
            method: method.into(),
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        ValidationError::InvalidStatement(message.into())
    }
}

pub type ValidationResult<T> = Result<T, ValidationError>;
