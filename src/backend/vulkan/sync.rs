// Synchronization primitives
//
// Timeline semaphores are the completion fence: a 64-bit counter the GPU
// advances when a queue reaches a signal, and the CPU can both query it and
// block on it with vkWaitSemaphores.

use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::GpuResult;

/// Timeline semaphore wrapper with automatic cleanup
pub struct TimelineFence {
    pub semaphore: vk::Semaphore,
    device: Arc<VulkanDevice>,
}

impl TimelineFence {
    pub fn new(device: &Arc<VulkanDevice>, initial_value: u64) -> GpuResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let semaphore_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let semaphore = unsafe { device.device.create_semaphore(&semaphore_info, None)? };

        Ok(Self {
            semaphore,
            device: device.clone(),
        })
    }

    pub fn completed_value(&self) -> GpuResult<u64> {
        let value = unsafe { self.device.device.get_semaphore_counter_value(self.semaphore)? };
        Ok(value)
    }

    /// Block until the counter reaches `value`. No timeout: a hung GPU
    /// surfaces as device loss.
    pub fn wait(&self, value: u64) -> GpuResult<()> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);

        unsafe { self.device.device.wait_semaphores(&wait_info, u64::MAX)? };
        Ok(())
    }
}

impl Drop for TimelineFence {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.semaphore, None);
        }
    }
}
