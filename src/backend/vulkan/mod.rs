// Vulkan backend
//
// Headless: no surface, no swapchain. Fences are timeline semaphores, command
// allocators are transient command pools, the descriptor table is a single
// bindless set, buffers come from gpu-allocator.

mod buffer;
mod command;
mod descriptor;
mod device;
mod sync;

pub use buffer::VulkanBuffer;
pub use command::VulkanCommandAllocator;
pub use descriptor::BindlessTable;
pub use device::{QueueSlot, VulkanDevice};
pub use sync::TimelineFence;

use ash::vk;
use std::sync::Arc;

use crate::backend::{BufferDescriptor, BufferUsage, DescriptorLayout, GpuBackend, QueueRole};
use crate::command::Command;
use crate::error::{GpuError, GpuResult};

/// Queue handle bound to its role
pub struct VulkanQueue {
    role: QueueRole,
    slot: QueueSlot,
}

impl VulkanQueue {
    pub fn role(&self) -> QueueRole {
        self.role
    }

    pub fn family(&self) -> u32 {
        self.slot.family
    }
}

pub struct VulkanBackend {
    device: Arc<VulkanDevice>,
}

impl VulkanBackend {
    pub fn new(app_name: &str, enable_validation: bool) -> anyhow::Result<Arc<Self>> {
        let device = VulkanDevice::new(app_name, enable_validation)?;
        Ok(Arc::new(Self { device }))
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    fn submit(&self, queue: &VulkanQueue, submit: &vk::SubmitInfo) -> GpuResult<()> {
        self.device.with_submit_lock(|| unsafe {
            self.device
                .device
                .queue_submit(queue.slot.queue, std::slice::from_ref(submit), vk::Fence::null())
        })?;
        Ok(())
    }
}

impl GpuBackend for VulkanBackend {
    type Queue = VulkanQueue;
    type Fence = TimelineFence;
    type CommandAllocator = VulkanCommandAllocator;
    type DescriptorTable = BindlessTable;
    type Buffer = VulkanBuffer;
    type Pipeline = vk::Pipeline;

    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn create_queue(&self, role: QueueRole) -> GpuResult<VulkanQueue> {
        Ok(VulkanQueue {
            role,
            slot: self.device.queue(role),
        })
    }

    fn create_fence(&self, initial_value: u64) -> GpuResult<TimelineFence> {
        TimelineFence::new(&self.device, initial_value)
    }

    fn completed_value(&self, fence: &TimelineFence) -> GpuResult<u64> {
        fence.completed_value()
    }

    fn wait_for_value(&self, fence: &TimelineFence, value: u64) -> GpuResult<()> {
        fence.wait(value)
    }

    fn signal(&self, queue: &VulkanQueue, fence: &TimelineFence, value: u64) -> GpuResult<()> {
        // Empty submission: the semaphore is signaled once everything
        // submitted before it on this queue has completed
        let semaphores = [fence.semaphore];
        let values = [value];
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&values);
        let submit = vk::SubmitInfo::builder()
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline_info)
            .build();

        self.submit(queue, &submit)
    }

    fn execute(&self, queue: &VulkanQueue, allocator: &mut VulkanCommandAllocator) -> GpuResult<()> {
        if allocator.role() != queue.role {
            return Err(GpuError::Unsupported(format!(
                "{} allocator submitted to {} queue",
                allocator.role(),
                queue.role
            )));
        }
        let command_buffers = [allocator.take_for_submit()?];
        let submit = vk::SubmitInfo::builder().command_buffers(&command_buffers).build();

        self.submit(queue, &submit)
    }

    fn create_command_allocator(&self, role: QueueRole) -> GpuResult<VulkanCommandAllocator> {
        VulkanCommandAllocator::new(&self.device, role)
    }

    fn reset_command_allocator(&self, allocator: &mut VulkanCommandAllocator) -> GpuResult<()> {
        allocator.reset()
    }

    fn close(&self, allocator: &mut VulkanCommandAllocator, commands: &[Command<Self>]) -> GpuResult<()> {
        allocator.encode(commands)
    }

    fn create_descriptor_table(&self, capacity: u32) -> GpuResult<(BindlessTable, DescriptorLayout)> {
        let table = BindlessTable::new(&self.device, capacity)?;
        // Handles are bindless indices: no base, unit stride
        let layout = DescriptorLayout {
            capacity,
            stride: 1,
            cpu_base: 0,
            gpu_base: 0,
        };
        Ok((table, layout))
    }

    fn write_descriptor(
        &self,
        table: &BindlessTable,
        index: u32,
        descriptor: &BufferDescriptor<Self>,
    ) -> GpuResult<()> {
        table.write(index, descriptor)
    }

    fn create_buffer(&self, size: u64, usage: BufferUsage) -> GpuResult<VulkanBuffer> {
        VulkanBuffer::new(&self.device, size, usage)
    }

    fn buffer_size(&self, buffer: &VulkanBuffer) -> u64 {
        buffer.size()
    }

    fn write_buffer(&self, buffer: &VulkanBuffer, offset: u64, data: &[u8]) -> GpuResult<()> {
        buffer.write(offset, data)
    }

    fn wait_idle(&self) -> GpuResult<()> {
        self.device.wait_idle()?;
        Ok(())
    }
}
