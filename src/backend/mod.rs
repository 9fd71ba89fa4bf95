// Backend module - GPU abstraction layer
//
// Design: the core (descriptor heap, queues, contexts, frame loop) is written
// once against GpuBackend. Two implementations:
// - vulkan:   ash + gpu-allocator, headless device with timeline semaphores
// - software: CPU-emulated device, one worker thread per queue

pub mod software;
pub mod vulkan;

use std::fmt;

use crate::command::Command;
use crate::error::GpuResult;

pub use software::SoftwareBackend;
pub use vulkan::VulkanBackend;

/// Logical execution queue role. One queue per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Compute,
    Transfer,
}

impl QueueRole {
    pub const ALL: [QueueRole; 3] = [QueueRole::Graphics, QueueRole::Compute, QueueRole::Transfer];

    pub fn index(self) -> usize {
        match self {
            QueueRole::Graphics => 0,
            QueueRole::Compute => 1,
            QueueRole::Transfer => 2,
        }
    }
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueRole::Graphics => "graphics",
            QueueRole::Compute => "compute",
            QueueRole::Transfer => "transfer",
        };
        f.write_str(name)
    }
}

/// How a buffer will be used. Upload buffers are host-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Vertex,
    Index,
    Uniform,
    Storage,
    /// Host-visible staging / per-frame data
    Upload,
}

impl BufferUsage {
    pub fn is_host_visible(self) -> bool {
        matches!(self, BufferUsage::Upload)
    }
}

/// Geometry of a descriptor table, reported by the backend at creation.
///
/// Both handle spaces are a linear offset of `index * stride` from their base,
/// so mapping a CPU slot to its shader-visible counterpart never needs a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorLayout {
    pub capacity: u32,
    pub stride: u32,
    pub cpu_base: usize,
    pub gpu_base: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
}

/// A buffer view written into a descriptor slot
pub struct BufferDescriptor<B: GpuBackend> {
    pub kind: DescriptorKind,
    pub buffer: B::Buffer,
    pub offset: u64,
    pub range: u64,
}

impl<B: GpuBackend> Clone for BufferDescriptor<B> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            buffer: self.buffer.clone(),
            offset: self.offset,
            range: self.range,
        }
    }
}

impl<B: GpuBackend> fmt::Debug for BufferDescriptor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferDescriptor")
            .field("kind", &self.kind)
            .field("buffer", &self.buffer)
            .field("offset", &self.offset)
            .field("range", &self.range)
            .finish()
    }
}

/// The device-facing half of the core.
///
/// Handles own their GPU objects and release them on drop. `Buffer` is a
/// cheap reference-counted handle: clones share one allocation, which is freed
/// when the last clone goes away.
pub trait GpuBackend: Send + Sync + Sized + 'static {
    type Queue: Send + Sync;
    /// Monotonic completion counter (timeline)
    type Fence: Send + Sync;
    /// Backing storage for one command context's recordings
    type CommandAllocator: Send;
    type DescriptorTable: Send + Sync;
    type Buffer: Clone + fmt::Debug + Send + Sync;
    type Pipeline: Clone + fmt::Debug + Send + Sync;

    fn name(&self) -> &'static str;

    // ── queues & fences ─────────────────────────────────────────────────────
    fn create_queue(&self, role: QueueRole) -> GpuResult<Self::Queue>;
    fn create_fence(&self, initial_value: u64) -> GpuResult<Self::Fence>;
    /// Current GPU-side counter value
    fn completed_value(&self, fence: &Self::Fence) -> GpuResult<u64>;
    /// Block the calling thread until the counter reaches `value`
    fn wait_for_value(&self, fence: &Self::Fence, value: u64) -> GpuResult<()>;
    /// Set the fence to `value` once all work submitted to `queue` so far has retired
    fn signal(&self, queue: &Self::Queue, fence: &Self::Fence, value: u64) -> GpuResult<()>;
    /// Submit the commands previously closed into `allocator`
    fn execute(&self, queue: &Self::Queue, allocator: &mut Self::CommandAllocator) -> GpuResult<()>;

    // ── command recording ───────────────────────────────────────────────────
    fn create_command_allocator(&self, role: QueueRole) -> GpuResult<Self::CommandAllocator>;
    /// Only valid once the GPU retired everything recorded through `allocator`
    fn reset_command_allocator(&self, allocator: &mut Self::CommandAllocator) -> GpuResult<()>;
    /// Encode a finished recording into the allocator's command buffer
    fn close(&self, allocator: &mut Self::CommandAllocator, commands: &[Command<Self>]) -> GpuResult<()>;

    // ── resources ───────────────────────────────────────────────────────────
    fn create_descriptor_table(&self, capacity: u32) -> GpuResult<(Self::DescriptorTable, DescriptorLayout)>;
    fn write_descriptor(
        &self,
        table: &Self::DescriptorTable,
        index: u32,
        descriptor: &BufferDescriptor<Self>,
    ) -> GpuResult<()>;
    fn create_buffer(&self, size: u64, usage: BufferUsage) -> GpuResult<Self::Buffer>;
    fn buffer_size(&self, buffer: &Self::Buffer) -> u64;
    /// Write into a host-visible buffer
    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> GpuResult<()>;

    /// Wait until every queue is idle
    fn wait_idle(&self) -> GpuResult<()>;
}

/// Bounds check shared by the backends' buffer paths
pub(crate) fn check_range(offset: u64, len: u64, size: u64) -> GpuResult<()> {
    let end = offset.checked_add(len).unwrap_or(u64::MAX);
    if end > size {
        return Err(crate::error::GpuError::OutOfBounds { offset, end, size });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_have_distinct_indices() {
        let mut seen = [false; 3];
        for role in QueueRole::ALL {
            assert!(!seen[role.index()]);
            seen[role.index()] = true;
        }
        assert_eq!(QueueRole::Transfer.to_string(), "transfer");
    }

    #[test]
    fn range_check_rejects_overflowing_ranges() {
        assert!(check_range(0, 16, 16).is_ok());
        assert!(check_range(8, 9, 16).is_err());
        assert!(check_range(u64::MAX, 2, 16).is_err());
    }
}
