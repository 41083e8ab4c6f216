//! Vulkan error types and the central result check

use ash::prelude::VkResult;
use ash::vk;
use thiserror::Error;

/// Vulkan-specific error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// A shader or texture could not be read or decoded
    #[error("Failed to load {path}: {reason}")]
    ResourceLoad {
        /// File that failed to load
        path: String,
        /// Underlying cause
        reason: String,
    },
}

impl VulkanError {
    /// Shorthand for [`VulkanError::InvalidOperation`]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidOperation { reason: reason.into() }
    }

    /// Whether the swapchain must be recreated before presenting again
    pub const fn is_out_of_date(&self) -> bool {
        matches!(self, Self::Api(vk::Result::ERROR_OUT_OF_DATE_KHR))
    }
}

impl From<vk::Result> for VulkanError {
    fn from(result: vk::Result) -> Self {
        Self::Api(result)
    }
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

/// Route a raw Vulkan result through the renderer's error path
///
/// Every failing device call is logged here with what was being attempted.
pub fn check_result<T>(result: VkResult<T>, what: &str) -> VulkanResult<T> {
    result.map_err(|code| {
        log::error!("Vulkan call failed ({what}): {code:?}");
        VulkanError::Api(code)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_result_maps_code() {
        let ok: VulkanResult<u32> = check_result(Ok(7), "noop");
        assert_eq!(ok, Ok(7));

        let err: VulkanResult<()> = check_result(Err(vk::Result::ERROR_DEVICE_LOST), "submit");
        assert_eq!(err, Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST)));
    }

    #[test]
    fn test_out_of_date_detection() {
        assert!(VulkanError::Api(vk::Result::ERROR_OUT_OF_DATE_KHR).is_out_of_date());
        assert!(!VulkanError::Api(vk::Result::TIMEOUT).is_out_of_date());
        assert!(!VulkanError::invalid("x").is_out_of_date());
    }
}
