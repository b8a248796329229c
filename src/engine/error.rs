use thiserror::Error;

use crate::storage::JournalError;

/// Errors surfaced by the workflow manager's public operations.
///
/// Step failures never show up here; they are journaled and reported
/// through the completion handler instead.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Unknown workflow definition: {0}")]
    UnknownDefinition(String),

    #[error("Workflow definition already registered: {0}")]
    DuplicateDefinition(String),

    #[error("Workflow definition '{0}' has no steps")]
    EmptyDefinition(String),

    #[error("Unknown completion handler: {0}")]
    UnknownHandler(String),

    #[error("Invalid workflow payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error(transparent)]
    Journal(#[from] JournalError),
}
