// =============================================================================
// RENDER CORE - GPU resource and frame-orchestration core
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  FrameLoop (frames in flight, culling, per-frame instance data) │
// │    └── RenderCore (descriptor heap, one queue per role)         │
// │          └── CommandContext (reset → record → finish)           │
// │                └── SubmissionQueue (monotonic fence)            │
// │                      └── GpuBackend (vulkan | software)         │
// └─────────────────────────────────────────────────────────────────┘
//
// Culling (FrustumCuller) is pure math and sits beside the stack.
//
// =============================================================================

pub mod backend;
pub mod command;
pub mod config;
pub mod context;
pub mod core;
pub mod culling;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod queue;

pub use backend::{
    BufferDescriptor, BufferUsage, DescriptorKind, DescriptorLayout, GpuBackend, QueueRole, SoftwareBackend,
    VulkanBackend,
};
pub use command::{ScissorRect, Viewport};
pub use context::{CommandContext, ContextState};
pub use crate::core::RenderCore;
pub use culling::{Aabb, Frustum, FrustumCuller, Plane, Visibility};
pub use descriptor::{CpuDescriptorHandle, DescriptorAllocator, DescriptorHeap, DescriptorSlot, GpuDescriptorHandle};
pub use error::{GpuError, GpuResult};
pub use frame::{Drawable, FrameLoop, FrameStats};
pub use queue::SubmissionQueue;
