use crate::shape::Shape;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EmberError>;

#[derive(Error, Debug)]
pub enum EmberError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Construction failed: {0}")]
    ConstructionFailed(String),

    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EmberError {
    /// True for errors the caller can clear by supplying different attributes.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            EmberError::InvalidArgument(_) | EmberError::ShapeMismatch { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EmberError::NotFound(_))
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, EmberError::ResourceExhausted(_))
    }

    pub fn is_unimplemented(&self) -> bool {
        matches!(self, EmberError::Unimplemented(_))
    }
}
