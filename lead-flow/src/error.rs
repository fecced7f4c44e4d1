use thiserror::Error;

/// Errors raised by the flow-execution engine.
///
/// Validation failures, checkpoint rejections and poll mismatches are not
/// errors; they are returned as data so callers can render them.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Flow not found: {0}")]
    FlowNotFound(i64),

    #[error("Config not found: {0}")]
    ConfigNotFound(i64),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid field configuration for '{field}': {reason}")]
    InvalidFieldConfig { field: String, reason: String },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Distribution error: {0}")]
    DistributionError(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "leads-api")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
