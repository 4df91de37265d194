use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoostError {
    /// Bad argument shape or value, reported synchronously at the call site
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Duplicate consumer tag, exclusivity violation or conflicting re-declaration
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Operation that fundamentally requires the target to exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// State capture hit message content that has no serializable form
    #[error("Queue '{queue}' holds content that cannot be captured as state")]
    NotSerializable { queue: String },
}
