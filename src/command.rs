// Recorded GPU commands
//
// A command context records into a backend-agnostic list. Nothing here has a
// GPU-visible effect until the context is finished and the backend encodes
// the list into its own command buffer.

use std::fmt;

use crate::backend::{GpuBackend, QueueRole};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Full-target viewport with the standard [0, 1] depth range
    pub fn from_extent(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    pub fn aspect_ratio(&self) -> f32 {
        if self.height > 0.0 {
            self.width / self.height
        } else {
            1.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl ScissorRect {
    pub fn from_extent(width: u32, height: u32) -> Self {
        Self { x: 0, y: 0, width, height }
    }
}

/// One recorded command.
///
/// Buffers are held by value (backends hand out reference-counted buffer
/// handles), so a recording keeps every buffer it touches alive until the
/// owning context is reset.
pub enum Command<B: GpuBackend> {
    SetPipelineState(B::Pipeline),
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    BindVertexBuffer {
        buffer: B::Buffer,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: B::Buffer,
        offset: u64,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    CopyBuffer {
        src: B::Buffer,
        dst: B::Buffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    },
}

impl<B: GpuBackend> Command<B> {
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetPipelineState(_) => "set_pipeline_state",
            Command::SetViewport(_) => "set_viewport",
            Command::SetScissor(_) => "set_scissor",
            Command::BindVertexBuffer { .. } => "bind_vertex_buffer",
            Command::BindIndexBuffer { .. } => "bind_index_buffer",
            Command::Draw { .. } => "draw",
            Command::DrawIndexed { .. } => "draw_indexed",
            Command::CopyBuffer { .. } => "copy_buffer",
        }
    }

    /// Copies run on every queue role, pipelines on graphics and compute.
    /// Draw state and draws need a graphics queue.
    pub fn supported_on(&self, role: QueueRole) -> bool {
        match self {
            Command::CopyBuffer { .. } => true,
            Command::SetPipelineState(_) => role != QueueRole::Transfer,
            _ => role == QueueRole::Graphics,
        }
    }
}

impl<B: GpuBackend> Clone for Command<B> {
    fn clone(&self) -> Self {
        match self {
            Command::SetPipelineState(p) => Command::SetPipelineState(p.clone()),
            Command::SetViewport(v) => Command::SetViewport(*v),
            Command::SetScissor(s) => Command::SetScissor(*s),
            Command::BindVertexBuffer { buffer, offset } => Command::BindVertexBuffer {
                buffer: buffer.clone(),
                offset: *offset,
            },
            Command::BindIndexBuffer { buffer, offset } => Command::BindIndexBuffer {
                buffer: buffer.clone(),
                offset: *offset,
            },
            Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => Command::Draw {
                vertex_count: *vertex_count,
                instance_count: *instance_count,
                first_vertex: *first_vertex,
                first_instance: *first_instance,
            },
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => Command::DrawIndexed {
                index_count: *index_count,
                instance_count: *instance_count,
                first_index: *first_index,
                vertex_offset: *vertex_offset,
                first_instance: *first_instance,
            },
            Command::CopyBuffer {
                src,
                dst,
                src_offset,
                dst_offset,
                size,
            } => Command::CopyBuffer {
                src: src.clone(),
                dst: dst.clone(),
                src_offset: *src_offset,
                dst_offset: *dst_offset,
                size: *size,
            },
        }
    }
}

impl<B: GpuBackend> fmt::Debug for Command<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetPipelineState(p) => f.debug_tuple("SetPipelineState").field(p).finish(),
            Command::SetViewport(v) => f.debug_tuple("SetViewport").field(v).finish(),
            Command::SetScissor(s) => f.debug_tuple("SetScissor").field(s).finish(),
            Command::BindVertexBuffer { buffer, offset } => f
                .debug_struct("BindVertexBuffer")
                .field("buffer", buffer)
                .field("offset", offset)
                .finish(),
            Command::BindIndexBuffer { buffer, offset } => f
                .debug_struct("BindIndexBuffer")
                .field("buffer", buffer)
                .field("offset", offset)
                .finish(),
            Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => f
                .debug_struct("Draw")
                .field("vertex_count", vertex_count)
                .field("instance_count", instance_count)
                .field("first_vertex", first_vertex)
                .field("first_instance", first_instance)
                .finish(),
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => f
                .debug_struct("DrawIndexed")
                .field("index_count", index_count)
                .field("instance_count", instance_count)
                .field("first_index", first_index)
                .field("vertex_offset", vertex_offset)
                .field("first_instance", first_instance)
                .finish(),
            Command::CopyBuffer {
                src,
                dst,
                src_offset,
                dst_offset,
                size,
            } => f
                .debug_struct("CopyBuffer")
                .field("src", src)
                .field("dst", dst)
                .field("src_offset", src_offset)
                .field("dst_offset", dst_offset)
                .field("size", size)
                .finish(),
        }
    }
}
