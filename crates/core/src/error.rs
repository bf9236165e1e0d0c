//! Domain errors shared by every layer above `core`.

/// Error raised by pure domain logic.
///
/// `Validation` is what admission turns into a rejected submission.
/// `Conflict` marks a request that is well-formed but does not fit the
/// job's current state, such as asking a training job for detections.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
