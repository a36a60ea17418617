//! Engine-level error types.

use thiserror::Error;

/// Top-level error type for the engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Graphics API errors bubbled up from the RHI layer
    #[error("Vulkan error: {0}")]
    Vulkan(String),

    /// Surface/window related errors
    #[error("Window error: {0}")]
    Window(String),

    /// Resource creation or upload errors
    #[error("Resource error: {0}")]
    Resource(String),

    /// Shader module errors
    #[error("Shader error: {0}")]
    Shader(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using the engine's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let error = Error::Vulkan("device lost".to_string());
        assert_eq!(error.to_string(), "Vulkan error: device lost");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let error: Error = io.into();
        assert!(matches!(error, Error::Io(_)));
    }
}
