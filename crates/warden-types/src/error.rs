use thiserror::Error;
use uuid::Uuid;

/// Error type shared by every crate in the workspace.
///
/// Malformed model output is deliberately absent: the decision parser always
/// recovers it into a human-required decision instead of failing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WardenError {
    #[error("Capability not registered: {0}")]
    CapabilityMissing(String),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Task {0} has already finished")]
    TaskFinished(Uuid),

    #[error("LLM call failed: {0}")]
    Llm(String),

    #[error("Tool transport failed: {0}")]
    Tool(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No human request is currently awaiting a response")]
    NotAwaitingHuman,

    #[error("Task run was cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for WardenError {
    fn from(e: serde_json::Error) -> Self {
        WardenError::Serialization(e.to_string())
    }
}
