//! Error Types
//!
//! Errors are split by concern:
//!
//! - [`DefinitionError`]: loading and validating process definitions
//! - [`PersistenceError`]: saving and loading process records
//! - [`EngineError`]: process execution
//!
//! Runtime dispatch problems caused by bad external input (unknown event
//! names, inactive activities) are *not* errors: they are routed to the
//! default event handler and execution continues.

use thiserror::Error;

use crate::definition::validator::ValidationError;

/// Errors raised while building, loading or validating a process definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("Failed to read process definition '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse process definition YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse process definition JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Process definition is invalid:\n{}", format_validation_errors(.0))]
    Invalid(Vec<ValidationError>),

    #[error("Participant name '{name}' resolves to {count} participants")]
    AmbiguousParticipant { name: String, count: usize },
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  [{}] {}", e.code(), e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Errors raised by a persistence backend.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Persistence I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Persisted record could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Persistence backend is closed")]
    Closed,
}

/// Errors raised by the process engine.
///
/// Entry points return the *fatal* variants as `Err`. The remaining variants
/// are reported through the default error handler of the affected process.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown process '{0}'")]
    UnknownProcess(String),

    #[error("Process '{0}' already exists")]
    DuplicateProcess(String),

    #[error("Called process '{process}' must have exactly one start event, found {count}")]
    StartEventCount { process: String, count: usize },

    #[error("Call activity '{activity}' does not reference a process definition")]
    UnresolvedCallActivity { activity: String },

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("The timeout handler '{handler}' does not return a non-negative number of milliseconds but '{value}'")]
    InvalidTimeout { handler: String, value: String },

    #[error("No timeout handler '{handler}' registered")]
    MissingTimeoutHandler { handler: String },

    #[error("Timer '{name}' could not be scheduled: {reason}")]
    TimerUnavailable { name: String, reason: String },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl EngineError {
    /// Returns true if this error aborts the triggering call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnknownProcess(_)
                | Self::DuplicateProcess(_)
                | Self::StartEventCount { .. }
                | Self::UnresolvedCallActivity { .. }
                | Self::Definition(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_timeout_message_names_handler_and_value() {
        let err = EngineError::InvalidTimeout {
            handler: "Wait$getTimeout".to_string(),
            value: "\"soon\"".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("Wait$getTimeout"));
        assert!(message.contains("\"soon\""));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::StartEventCount {
            process: "p".to_string(),
            count: 2
        }
        .is_fatal());
        assert!(!EngineError::Persistence(PersistenceError::Closed).is_fatal());
    }

    #[test]
    fn test_invalid_definition_lists_codes() {
        let err = DefinitionError::Invalid(vec![ValidationError::DuplicateName {
            name: "Task".to_string(),
        }]);
        assert!(err.to_string().contains("FO1"));
    }
}
