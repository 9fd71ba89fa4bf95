// Core error taxonomy
//
// Everything below the application returns GpuError. None of these are
// expected runtime conditions: they are invariant violations or fatal device
// failures and are never retried silently.

use ash::vk;
use thiserror::Error;

use crate::context::ContextState;

/// Result alias used throughout the core
pub type GpuResult<T> = Result<T, GpuError>;

#[derive(Debug, Error)]
pub enum GpuError {
    /// The fixed-capacity descriptor table is exhausted.
    #[error("descriptor table exhausted (capacity {capacity})")]
    OutOfCapacity { capacity: u32 },

    /// Queue or device failure. Fatal: the frame loop must stop.
    #[error("device lost: {0}")]
    DeviceLost(String),

    /// A command context was used outside its reset/finish bracket or with a
    /// command its queue role cannot execute.
    #[error("command context misuse: {operation} while {state:?}")]
    RecordingMisuse {
        operation: &'static str,
        state: ContextState,
    },

    /// Reset was called while the GPU still owns the allocator's memory.
    #[error("command allocator still in use: pending fence value {pending}, completed {completed}")]
    AllocatorInUse { pending: u64, completed: u64 },

    /// Waiting on a value nobody signaled would block forever.
    #[error("wait for fence value {requested} but only {signaled} was signaled")]
    InvalidWait { requested: u64, signaled: u64 },

    #[error("buffer range {offset}..{end} out of bounds (size {size})")]
    OutOfBounds { offset: u64, end: u64, size: u64 },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("vulkan call failed: {0}")]
    Vulkan(vk::Result),

    #[error("gpu memory allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),
}

impl GpuError {
    pub fn is_device_lost(&self) -> bool {
        matches!(self, GpuError::DeviceLost(_))
    }
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost(result.to_string()),
            other => GpuError::Vulkan(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lost_result_maps_to_fatal_variant() {
        let err: GpuError = vk::Result::ERROR_DEVICE_LOST.into();
        assert!(err.is_device_lost());

        let err: GpuError = vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into();
        assert!(matches!(err, GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)));
    }

    #[test]
    fn capacity_error_names_the_capacity() {
        let err = GpuError::OutOfCapacity { capacity: 16 };
        assert_eq!(err.to_string(), "descriptor table exhausted (capacity 16)");
    }
}
