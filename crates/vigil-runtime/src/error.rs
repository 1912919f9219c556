//! Engine error types

use std::fmt;
use thiserror::Error;
use vigil_core::{GroupKey, ValidationError};

use crate::config::ConfigError;

/// Errors returned by engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Event type '{0}' is not registered")]
    UnknownEventType(String),

    #[error("Statement '{0}' does not exist")]
    UnknownStatement(String),

    #[error("Statement '{0}' already exists")]
    DuplicateStatement(String),

    #[error("Table '{0}' is not defined")]
    UnknownTable(String),

    #[error("{kind} '{name}' is in use by statement '{statement}'")]
    InUse {
        kind: &'static str,
        name: String,
        statement: String,
    },

    #[error("Key {key} has {actual} values but table '{table}' has {expected} primary key columns")]
    KeyArity {
        table: String,
        key: GroupKey,
        expected: usize,
        actual: usize,
    },
}

/// An insert hit an existing primary key and was not applied
#[derive(Debug, Clone, PartialEq)]
pub struct MergeConflict {
    pub statement: String,
    pub table: String,
    pub key: GroupKey,
}

impl fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "statement '{}' inserted duplicate key {} into table '{}'",
            self.statement, self.key, self.table
        )
    }
}

impl std::error::Error for MergeConflict {}

pub type EngineResult<T> = Result<T, EngineError>;
