//! Error types for Loom

use thiserror::Error;

use crate::domain::locking::LockError;

/// Result type alias using Loom's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Loom error types with stable codes and operator suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Graph errors (E001-E099)
    #[error("Node '{0}' not found")]
    NodeNotFound(String),

    #[error("Edge '{0}' not found")]
    EdgeNotFound(String),

    #[error("Dangling reference: edge '{edge}' points at missing node '{node}'")]
    DanglingReference { edge: String, node: String },

    #[error("Stale reference: node '{0}' was retired and no survivor is known")]
    StaleReference(String),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    // Candidate errors (E100-E199)
    #[error("Validation failed: {0}")]
    ValidationError(String),

    #[error("Dangling temp reference: edge '{edge}' references unknown temp id '{temp_id}'")]
    DanglingTempReference { edge: String, temp_id: String },

    // Proposal errors (E200-E299)
    #[error("Proposal rejected for stage '{stage}': {reason}")]
    ProposalRejected { stage: String, reason: String },

    #[error("Model invocation failed: {0}")]
    ModelError(String),

    #[error("Network error: {0}. Check the model endpoint in `loom config get proposals.endpoint`.")]
    NetworkError(#[from] reqwest::Error),

    // Concurrency errors (E300-E399)
    #[error("Merge conflict: node '{0}' is locked by an in-flight merge")]
    MergeConflict(String),

    #[error("Lock timeout: node '{0}' stayed locked past the wait budget")]
    LockTimeout(String),

    #[error("Pipeline is paused: {0}")]
    PipelinePaused(String),

    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Repair errors (E500-E599)
    #[error("Repair case '{0}' not found. Run `loom repair scan` to list cases.")]
    RepairCaseNotFound(String),

    #[error("Invalid verdict for case '{case_id}': {reason}")]
    InvalidVerdict { case_id: String, reason: String },

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::NodeNotFound(_) => "E001",
            Self::EdgeNotFound(_) => "E002",
            Self::DanglingReference { .. } => "E003",
            Self::StaleReference(_) => "E004",
            Self::TransactionAborted(_) => "E005",
            Self::ValidationError(_) => "E100",
            Self::DanglingTempReference { .. } => "E101",
            Self::ProposalRejected { .. } => "E200",
            Self::ModelError(_) => "E201",
            Self::NetworkError(_) => "E202",
            Self::MergeConflict(_) => "E300",
            Self::LockTimeout(_) => "E301",
            Self::PipelinePaused(_) => "E302",
            Self::DatabaseError(_) => "E400",
            Self::Serialization(_) => "E401",
            Self::RepairCaseNotFound(_) => "E500",
            Self::InvalidVerdict { .. } => "E501",
            Self::ConfigError(_) => "E600",
            Self::InvalidInput(_) => "E800",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::NetworkError(_) | Self::ModelError(_) => {
                Some("loom config get proposals.endpoint".to_string())
            }
            Self::PipelinePaused(_) => Some("loom repair resume".to_string()),
            Self::RepairCaseNotFound(_) => Some("loom repair scan".to_string()),
            Self::DatabaseError(_) => Some("loom log status".to_string()),
            _ => None,
        }
    }

    /// Whether a model proposal that failed with this error should be retried
    pub fn is_retryable_proposal_failure(&self) -> bool {
        matches!(
            self,
            Self::ProposalRejected { .. }
                | Self::ModelError(_)
                | Self::NetworkError(_)
                | Self::Serialization(_)
        )
    }
}

impl From<LockError> for Error {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { resource, .. } => Self::LockTimeout(resource),
            LockError::Contention { resource, .. } => Self::MergeConflict(resource),
            other => Self::Other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_grouped() {
        assert_eq!(Error::NodeNotFound("n".into()).code(), "E001");
        assert_eq!(
            Error::DanglingTempReference {
                edge: "e".into(),
                temp_id: "t".into()
            }
            .code(),
            "E101"
        );
        assert_eq!(Error::MergeConflict("n".into()).code(), "E300");
    }

    #[test]
    fn test_lock_error_conversion() {
        let err: Error = LockError::Contention {
            resource: "node:a".into(),
            holder: "merge".into(),
        }
        .into();
        assert!(matches!(err, Error::MergeConflict(ref r) if r == "node:a"));

        let err: Error = LockError::Timeout {
            resource: "node:b".into(),
            holder: "merge".into(),
        }
        .into();
        assert!(matches!(err, Error::LockTimeout(_)));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(
            Error::ProposalRejected {
                stage: "extraction".into(),
                reason: "bad".into()
            }
            .is_retryable_proposal_failure()
        );
        assert!(!Error::ValidationError("x".into()).is_retryable_proposal_failure());
    }
}
