use crate::types::Backend;
use sea_orm::DbErr;
use thiserror::Error;

/// User-input failures. Reported before any mutation; batch-style checks
/// collect every offending field instead of stopping at the first one.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("unknown fields: {}", .0.join(", "))]
    UnknownFields(Vec<String>),
    #[error("missing required fields: {}", .0.join(", "))]
    MissingRequired(Vec<String>),
    #[error("field '{field}': expected {expected}")]
    WrongType { field: String, expected: &'static str },
    #[error("field '{field}': {message}")]
    InvalidValue { field: String, message: String },
    #[error("duplicate external_ids in batch: {}", .0.join(", "))]
    DuplicateExternalIds(Vec<String>),
    #[error("illegal backend transition: {from} -> {to}")]
    IllegalTransition { from: Backend, to: Backend },
    #[error("filter nesting exceeds maximum depth of {0}")]
    FilterTooDeep(usize),
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("batch of {got} rows exceeds the maximum of {max}")]
    BatchTooLarge { got: usize, max: usize },
    #[error("operation was not accepted; re-run with accept=true")]
    NotAccepted,
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("data series is locked")]
    Locked,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(#[from] DbErr),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
