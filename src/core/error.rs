use crate::backend::BackendError;
use thiserror::Error;
use uuid::Uuid;

/// Core error types for hostfw
#[derive(Debug, Error)]
pub enum Error {
    /// Rule draft is malformed or semantically invalid
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// An enabled rule with the same tuple already exists
    #[error("Conflict: rule {existing} already enforces {tuple}")]
    Conflict { existing: Uuid, tuple: String },

    /// Update or delete targeted an id the catalogue does not know
    #[error("Rule not found: {0}")]
    NotFound(Uuid),

    /// The firewall control mechanism rejected or could not execute a change
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Some changes were applied and the best-effort rollback did not fully succeed
    #[error("Partial failure: {message} (uncertain rules: {})", format_ids(.uncertain))]
    PartialFailure { message: String, uncertain: Vec<Uuid> },

    /// A batch was cancelled between operations and rolled back
    #[error("Batch cancelled")]
    Cancelled,

    /// Catalogue persistence failed
    #[error("Catalogue error: {0}")]
    Catalogue(#[from] CatalogueError),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable kind for result payloads
    pub const fn kind(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation",
            Error::Conflict { .. } => "conflict",
            Error::NotFound(_) => "not_found",
            Error::Backend(_) => "backend",
            Error::PartialFailure { .. } => "partial_failure",
            Error::Cancelled => "cancelled",
            Error::Catalogue(_) | Error::Io(_) | Error::Serialization(_) => "storage",
            Error::Elevation(_) => "elevation",
            Error::Config(_) => "config",
            Error::Internal(_) => "internal",
        }
    }

    /// Rules whose backend state could not be confirmed
    pub fn uncertain_rules(&self) -> &[Uuid] {
        match self {
            Error::PartialFailure { uncertain, .. } => uncertain,
            _ => &[],
        }
    }
}

fn format_ids(ids: &[Uuid]) -> String {
    if ids.is_empty() {
        return "none".to_string();
    }
    ids.iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Catalogue-specific errors
#[derive(Debug, Error)]
pub enum CatalogueError {
    #[error("Catalogue corrupted: {0}")]
    Corrupted(String),

    #[error("Catalogue format version mismatch: found v{found}, expected v{expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("Catalogue holds {count} rules (max: {max})")]
    TooManyRules { count: usize, max: usize },

    #[error("Duplicate rule id in catalogue: {0}")]
    DuplicateId(Uuid),
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Operator-facing explanation of an error, used by the CLI.
pub fn translate(error: &Error) -> ErrorTranslation {
    match error {
        Error::Validation { field, message } => {
            ErrorTranslation::new(format!("Invalid rule: {field}: {message}"))
                .with_suggestion("Ports must be between 1 and 65535, e.g. 22, 80-443, 22,80,8000-9000")
                .with_suggestion("Addresses take IP or CIDR form: 192.168.1.0/24, 2001:db8::/32")
        }
        Error::Conflict { existing, .. } => {
            ErrorTranslation::new("An identical enabled rule already exists")
                .with_suggestion(format!("Update rule {existing} instead of creating a new one"))
                .with_suggestion("Or disable the existing rule first")
        }
        Error::NotFound(id) => ErrorTranslation::new(format!("No rule with id {id}"))
            .with_suggestion("List rules with: hostfw search"),
        Error::Backend(backend) => backend.translate(),
        Error::PartialFailure { uncertain, .. } => {
            ErrorTranslation::new("The firewall may not match the catalogue")
                .with_suggestion(format!(
                    "Inspect these rules on the host: {}",
                    format_ids(uncertain)
                ))
                .with_suggestion("Run `hostfw recover` to re-apply catalogue rules")
        }
        Error::Cancelled => ErrorTranslation::new("Batch cancelled; completed operations were rolled back"),
        other => ErrorTranslation::new(other.to_string()),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
