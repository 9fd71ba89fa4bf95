// GPU buffers backed by gpu-allocator
//
// Upload buffers live in host-visible memory and stay mapped; everything
// else is device-local and filled through a transfer copy.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use super::VulkanDevice;
use crate::backend::{check_range, BufferUsage};
use crate::error::{GpuError, GpuResult};

/// Reference-counted buffer handle. The allocation is freed when the last
/// clone drops.
#[derive(Clone)]
pub struct VulkanBuffer(Arc<BufferInner>);

struct BufferInner {
    device: Arc<VulkanDevice>,
    raw: vk::Buffer,
    size: u64,
    usage: BufferUsage,
    allocation: Mutex<Option<Allocation>>,
}

fn usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    let base = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    base | match usage {
        BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
        BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER,
        BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
        BufferUsage::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
        // Per-frame data is read straight from upload memory
        BufferUsage::Upload => {
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::VERTEX_BUFFER
        }
    }
}

fn memory_location(usage: BufferUsage) -> MemoryLocation {
    if usage.is_host_visible() {
        MemoryLocation::CpuToGpu
    } else {
        MemoryLocation::GpuOnly
    }
}

impl VulkanBuffer {
    pub fn new(device: &Arc<VulkanDevice>, size: u64, usage: BufferUsage) -> GpuResult<Self> {
        // Zero-sized buffers are invalid in Vulkan
        let alloc_size = size.max(1);

        // Uploads cross from the transfer queue to the others; share across
        // families rather than transferring ownership per copy
        let families = device.unique_families();
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(alloc_size)
            .usage(usage_flags(usage));
        let buffer_info = if families.len() > 1 {
            buffer_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            buffer_info.sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let raw = unsafe { device.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.device.get_buffer_memory_requirements(raw) };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name: "render-core buffer",
            requirements,
            location: memory_location(usage),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.device.destroy_buffer(raw, None) };
                return Err(err.into());
            }
        };

        if let Err(err) =
            unsafe { device.device.bind_buffer_memory(raw, allocation.memory(), allocation.offset()) }
        {
            let _ = device.allocator().lock().free(allocation);
            unsafe { device.device.destroy_buffer(raw, None) };
            return Err(err.into());
        }

        Ok(Self(Arc::new(BufferInner {
            device: device.clone(),
            raw,
            size,
            usage,
            allocation: Mutex::new(Some(allocation)),
        })))
    }

    pub fn raw(&self) -> vk::Buffer {
        self.0.raw
    }

    pub fn size(&self) -> u64 {
        self.0.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.0.usage
    }

    /// Copy `data` into the mapped allocation at `offset`
    pub fn write(&self, offset: u64, data: &[u8]) -> GpuResult<()> {
        check_range(offset, data.len() as u64, self.0.size)?;

        let mut allocation = self.0.allocation.lock();
        let mapped = allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or_else(|| {
                GpuError::Unsupported(format!("{:?} buffer is not host-visible", self.0.usage))
            })?;

        let start = offset as usize;
        mapped[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl fmt::Debug for VulkanBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VulkanBuffer")
            .field("raw", &self.0.raw)
            .field("size", &self.0.size)
            .field("usage", &self.0.usage)
            .finish()
    }
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.get_mut().take() {
            if let Err(err) = self.device.allocator().lock().free(allocation) {
                log::warn!("Failed to free buffer allocation: {}", err);
            }
        }
        unsafe {
            self.device.device.destroy_buffer(self.raw, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_upload_buffers_are_host_visible() {
        assert_eq!(memory_location(BufferUsage::Upload), MemoryLocation::CpuToGpu);
        assert_eq!(memory_location(BufferUsage::Vertex), MemoryLocation::GpuOnly);
        assert_eq!(memory_location(BufferUsage::Storage), MemoryLocation::GpuOnly);
    }

    #[test]
    fn every_buffer_can_take_part_in_copies() {
        for usage in [
            BufferUsage::Vertex,
            BufferUsage::Index,
            BufferUsage::Uniform,
            BufferUsage::Storage,
            BufferUsage::Upload,
        ] {
            let flags = usage_flags(usage);
            assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST));
        }
        assert!(usage_flags(BufferUsage::Upload).contains(vk::BufferUsageFlags::STORAGE_BUFFER));
    }
}
