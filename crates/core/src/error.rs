//! Error types for application-level glue code.

use thiserror::Error;

/// Top-level error type for applications built on the renderer.
#[derive(Error, Debug)]
pub enum Error {
    /// Vulkan-related errors
    #[error("Vulkan error: {0}")]
    Vulkan(String),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wraps any displayable error as a Vulkan error.
    ///
    /// Convenient for bubbling RHI errors up through application code
    /// without a crate dependency in that direction.
    pub fn vulkan(err: impl std::fmt::Display) -> Self {
        Error::Vulkan(err.to_string())
    }
}

/// Result type alias using the renderer's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vulkan_wrapper_preserves_message() {
        let err = Error::vulkan("device lost");
        assert_eq!(err.to_string(), "Vulkan error: device lost");
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
