//! Error types shared by every layer of the HAL
//!
//! Programming-state errors and backend failures travel as [`HalError`].
//! Pipeline validation failures are not errors; they are reported as
//! [`crate::queue::BindResult`] values.

use ash::vk;
use thiserror::Error;

/// Errors raised by queues, resources, devices and backends
#[derive(Error, Debug)]
pub enum HalError {
    /// A draw, dispatch or `end` was issued before `begin`
    #[error("Command queue is not recording")]
    NotRecording,

    /// `begin` was called on a queue that is already recording
    #[error("Command queue is already recording")]
    AlreadyRecording,

    /// A second map was opened on a resource before the first was closed
    #[error("Resource '{name}' is already mapped")]
    AlreadyMapped {
        /// Resource name
        name: String,
    },

    /// An unmap was issued for a resource with no open map
    #[error("Resource '{name}' is not mapped")]
    NotMapped {
        /// Resource name
        name: String,
    },

    /// The requested CPU access is not allowed by the resource flags
    #[error("Invalid map access on '{name}': {reason}")]
    InvalidMapAccess {
        /// Resource name
        name: String,
        /// Why the access was rejected
        reason: String,
    },

    /// A deferred command list was submitted where a primary list is required
    #[error("Deferred command lists cannot be submitted; execute them on a primary queue")]
    NotPrimary,

    /// A non-deferred command list was passed to `execute`
    #[error("Only deferred command lists can be executed")]
    NotDeferred,

    /// `submit` was called without a closed command list
    #[error("No closed command list is available for submission")]
    NothingToSubmit,

    /// Native resource or object creation failed
    #[error("Creation failed: {0}")]
    Creation(String),

    /// The backend cannot provide a required feature or format
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Backend initialization failed
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// The resource was already released and has no native representation
    #[error("Resource '{0}' has been released")]
    Released(String),

    /// No memory type satisfies the allocation requirements
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Reading or writing a mapped stream failed
    #[error("Stream error: {0}")]
    Stream(#[from] std::io::Error),

    /// Vulkan API error
    #[error("Vulkan API error: {0:?}")]
    Vulkan(vk::Result),

    /// Invalid operation
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Reason for the failure
        reason: String,
    },
}

impl HalError {
    /// Shorthand for [`HalError::InvalidOperation`]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidOperation { reason: reason.into() }
    }
}

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_resource() {
        let err = HalError::AlreadyMapped { name: "vb0".to_string() };
        assert_eq!(err.to_string(), "Resource 'vb0' is already mapped");

        let err = HalError::invalid("bad slot");
        assert_eq!(err.to_string(), "Invalid operation: bad slot");
    }
}
