//! # Error Types
//!
//! Process-level error types for crossvault using `thiserror`. Per-target
//! replication failures live in [`crate::replication::ReplicationError`]; this
//! enum covers everything that happens around a reconciliation pass (startup
//! validation, the state database, configuration loading, backend setup).

/// Custom result type for crossvault operations
pub type Result<T> = std::result::Result<T, CrossvaultError>;

/// Main error type for the crossvault engine
#[derive(thiserror::Error, Debug)]
pub enum CrossvaultError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Database and storage errors
    #[error("Database error: {context}")]
    Database {
        #[source]
        source: sqlx::Error,
        context: String,
    },

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// Secret backend setup errors (connection, login, health check)
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// Replication record not found
    #[error("Replication record not found: {key}")]
    RecordNotFound { key: String },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CrossvaultError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create a validation error with field information
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Create a backend error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend { message: message.into() }
    }

    /// Create a record not found error
    pub fn record_not_found<S: Into<String>>(key: S) -> Self {
        Self::RecordNotFound { key: key.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Wrap a sqlx error with context
    pub fn database<S: Into<String>>(source: sqlx::Error, context: S) -> Self {
        Self::Database { source, context: context.into() }
    }

    /// Wrap an I/O error with context
    pub fn io<S: Into<String>>(source: std::io::Error, context: S) -> Self {
        Self::Io { source, context: context.into() }
    }

    /// Process exit code used by the CLI for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CrossvaultError::Config { .. } | CrossvaultError::Validation { .. } => 2,
            CrossvaultError::Backend { .. } => 3,
            _ => 1,
        }
    }
}

impl From<sqlx::Error> for CrossvaultError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database { source: error, context: "Database operation failed".to_string() }
    }
}

impl From<sqlx::migrate::MigrateError> for CrossvaultError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::Internal {
            message: "Database migration failed".to_string(),
            source: Some(Box::new(error)),
        }
    }
}

impl From<std::io::Error> for CrossvaultError {
    fn from(error: std::io::Error) -> Self {
        Self::Io { source: error, context: "I/O operation failed".to_string() }
    }
}

impl From<serde_json::Error> for CrossvaultError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization { source: error, context: "JSON serialization failed".to_string() }
    }
}

impl From<config::ConfigError> for CrossvaultError {
    fn from(error: config::ConfigError) -> Self {
        Self::config_with_source("Configuration loading failed", Box::new(error))
    }
}

impl From<validator::ValidationErrors> for CrossvaultError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut fields: Vec<String> = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| {
                        e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string())
                    })
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect();
        fields.sort();

        Self::validation(format!("Validation failed: {}", fields.join("; ")))
    }
}
