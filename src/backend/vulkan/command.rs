// Command allocators
//
// One transient command pool plus one primary command buffer per command
// context. Resetting the pool recycles the buffer's memory, which is only
// legal after the GPU retired the previous submission.

use ash::vk;
use std::sync::Arc;

use super::{VulkanBackend, VulkanDevice};
use crate::backend::QueueRole;
use crate::command::Command;
use crate::error::{GpuError, GpuResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Open,
    Closed,
    Submitted,
}

pub struct VulkanCommandAllocator {
    pub buffer: vk::CommandBuffer,
    pool: vk::CommandPool,
    role: QueueRole,
    state: BufferState,
    device: Arc<VulkanDevice>,
}

impl VulkanCommandAllocator {
    pub fn new(device: &Arc<VulkanDevice>, role: QueueRole) -> GpuResult<Self> {
        let family = device.queue(role).family;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(family);
        let pool = unsafe { device.device.create_command_pool(&pool_info, None)? };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffer = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(err) => {
                unsafe { device.device.destroy_command_pool(pool, None) };
                return Err(err.into());
            }
        };

        Ok(Self {
            buffer,
            pool,
            role,
            state: BufferState::Open,
            device: device.clone(),
        })
    }

    pub fn role(&self) -> QueueRole {
        self.role
    }

    /// Hand out the closed command buffer for one submission
    pub fn take_for_submit(&mut self) -> GpuResult<vk::CommandBuffer> {
        if self.state != BufferState::Closed {
            return Err(GpuError::Unsupported(format!(
                "execute of a command allocator in state {:?}",
                self.state
            )));
        }
        self.state = BufferState::Submitted;
        Ok(self.buffer)
    }

    pub fn reset(&mut self) -> GpuResult<()> {
        unsafe {
            self.device
                .device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
        }
        self.state = BufferState::Open;
        Ok(())
    }

    /// Encode `commands` into the command buffer and end it
    pub fn encode(&mut self, commands: &[Command<VulkanBackend>]) -> GpuResult<()> {
        if self.state != BufferState::Open {
            return Err(GpuError::Unsupported(format!(
                "command allocator encoded while {:?}; reset it first",
                self.state
            )));
        }

        let device = &self.device.device;
        let cmd = self.buffer;
        let bind_point = match self.role {
            QueueRole::Compute => vk::PipelineBindPoint::COMPUTE,
            _ => vk::PipelineBindPoint::GRAPHICS,
        };

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device.begin_command_buffer(cmd, &begin_info)?;

            for command in commands {
                match command {
                    Command::SetPipelineState(pipeline) => {
                        device.cmd_bind_pipeline(cmd, bind_point, *pipeline);
                    }
                    Command::SetViewport(v) => {
                        let viewport = vk::Viewport {
                            x: v.x,
                            y: v.y,
                            width: v.width,
                            height: v.height,
                            min_depth: v.min_depth,
                            max_depth: v.max_depth,
                        };
                        device.cmd_set_viewport(cmd, 0, &[viewport]);
                    }
                    Command::SetScissor(s) => {
                        let scissor = vk::Rect2D {
                            offset: vk::Offset2D { x: s.x, y: s.y },
                            extent: vk::Extent2D {
                                width: s.width,
                                height: s.height,
                            },
                        };
                        device.cmd_set_scissor(cmd, 0, &[scissor]);
                    }
                    Command::BindVertexBuffer { buffer, offset } => {
                        device.cmd_bind_vertex_buffers(cmd, 0, &[buffer.raw()], &[*offset]);
                    }
                    Command::BindIndexBuffer { buffer, offset } => {
                        device.cmd_bind_index_buffer(cmd, buffer.raw(), *offset, vk::IndexType::UINT32);
                    }
                    Command::Draw {
                        vertex_count,
                        instance_count,
                        first_vertex,
                        first_instance,
                    } => {
                        device.cmd_draw(cmd, *vertex_count, *instance_count, *first_vertex, *first_instance);
                    }
                    Command::DrawIndexed {
                        index_count,
                        instance_count,
                        first_index,
                        vertex_offset,
                        first_instance,
                    } => {
                        device.cmd_draw_indexed(
                            cmd,
                            *index_count,
                            *instance_count,
                            *first_index,
                            *vertex_offset,
                            *first_instance,
                        );
                    }
                    Command::CopyBuffer {
                        src,
                        dst,
                        src_offset,
                        dst_offset,
                        size,
                    } => {
                        let region = vk::BufferCopy {
                            src_offset: *src_offset,
                            dst_offset: *dst_offset,
                            size: *size,
                        };
                        device.cmd_copy_buffer(cmd, src.raw(), dst.raw(), &[region]);
                    }
                }
            }

            device.end_command_buffer(cmd)?;
        }

        self.state = BufferState::Closed;
        Ok(())
    }
}

impl Drop for VulkanCommandAllocator {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}
