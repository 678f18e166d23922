//! Common types and errors for ClassPoints
//!
//! This crate provides the domain model shared by the sync engine, the
//! configuration layer and the CLI.

pub mod model;
pub mod normalize;
pub mod telemetry;

pub use model::{
    CanonicalId, Collection, DedupKey, LocalId, OwnerScope, Record, RecordBody, RemoteRecord,
    Turn,
};

use thiserror::Error;

/// Core error types for ClassPoints operations
#[derive(Error, Debug)]
pub enum CpError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    #[error("Invalid input: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, CpError>;

/// Exit code constants for the `classpoints` binary
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_CONFIG_ERROR: i32 = 101;
