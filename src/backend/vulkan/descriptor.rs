// Bindless descriptor table
//
// One descriptor set with two runtime-sized arrays:
//   binding 0: storage buffers
//   binding 1: uniform buffers
// Both arrays share the slot index space, so a slot index is the bindless
// index a shader uses. Slots are partially bound and updated after bind.

use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;
use crate::backend::{BufferDescriptor, DescriptorKind};
use crate::error::{GpuError, GpuResult};

pub const STORAGE_BINDING: u32 = 0;
pub const UNIFORM_BINDING: u32 = 1;

pub struct BindlessTable {
    pub set: vk::DescriptorSet,
    pub layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    capacity: u32,
    device: Arc<VulkanDevice>,
}

impl BindlessTable {
    pub fn new(device: &Arc<VulkanDevice>, capacity: u32) -> GpuResult<Self> {
        if capacity > device.max_bindless_storage_buffers {
            return Err(GpuError::Unsupported(format!(
                "{} bindless storage buffers requested, device limit {}",
                capacity, device.max_bindless_storage_buffers
            )));
        }
        if device.uniform_update_after_bind && capacity > device.max_bindless_uniform_buffers {
            return Err(GpuError::Unsupported(format!(
                "{} bindless uniform buffers requested, device limit {}",
                capacity, device.max_bindless_uniform_buffers
            )));
        }

        // Step 1: Layout
        let bindings = [
            vk::DescriptorSetLayoutBinding::builder()
                .binding(STORAGE_BINDING)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(capacity)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(UNIFORM_BINDING)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(capacity)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
        ];

        let uniform_flags = if device.uniform_update_after_bind {
            vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
        } else {
            vk::DescriptorBindingFlags::PARTIALLY_BOUND
        };
        let binding_flags = [
            vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND,
            uniform_flags,
        ];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&binding_flags);

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);

        let layout = unsafe { device.device.create_descriptor_set_layout(&layout_info, None)? };

        // Step 2: Pool sized for exactly one set
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: capacity,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: capacity,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);

        let pool = match unsafe { device.device.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(err) => {
                unsafe { device.device.destroy_descriptor_set_layout(layout, None) };
                return Err(err.into());
            }
        };

        // Step 3: The set itself
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        let set = match unsafe { device.device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(err) => {
                unsafe {
                    device.device.destroy_descriptor_pool(pool, None);
                    device.device.destroy_descriptor_set_layout(layout, None);
                }
                return Err(err.into());
            }
        };

        log::info!("Bindless descriptor table created ({} slots)", capacity);

        Ok(Self {
            set,
            layout,
            pool,
            capacity,
            device: device.clone(),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn write(&self, index: u32, descriptor: &BufferDescriptor<super::VulkanBackend>) -> GpuResult<()> {
        if index >= self.capacity {
            return Err(GpuError::OutOfCapacity {
                capacity: self.capacity,
            });
        }
        crate::backend::check_range(descriptor.offset, descriptor.range, descriptor.buffer.size())?;

        let (binding, ty) = match descriptor.kind {
            DescriptorKind::StorageBuffer => (STORAGE_BINDING, vk::DescriptorType::STORAGE_BUFFER),
            DescriptorKind::UniformBuffer => (UNIFORM_BINDING, vk::DescriptorType::UNIFORM_BUFFER),
        };

        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: descriptor.buffer.raw(),
            offset: descriptor.offset,
            range: descriptor.range,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(binding)
            .dst_array_element(index)
            .descriptor_type(ty)
            .buffer_info(&buffer_info)
            .build();

        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }
}

impl Drop for BindlessTable {
    fn drop(&mut self) {
        unsafe {
            // Destroying the pool frees the set
            self.device.device.destroy_descriptor_pool(self.pool, None);
            self.device.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}
