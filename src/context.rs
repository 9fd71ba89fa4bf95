// Command Context - reusable recorder bound to one queue role
//
// Lifecycle: Initial -> reset -> Recording -> finish -> Submitted -> reset ...
//
// Recording only touches the CPU-side command list. Nothing reaches the GPU
// until finish(), which encodes the list into the backend allocator, submits
// it and signals the queue's fence.

use std::sync::Arc;

use crate::backend::{GpuBackend, QueueRole};
use crate::command::{Command, ScissorRect, Viewport};
use crate::error::{GpuError, GpuResult};
use crate::queue::SubmissionQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Created, never reset
    Initial,
    Recording,
    /// Finished; must be reset before recording again
    Submitted,
}

pub struct CommandContext<B: GpuBackend> {
    queue: Arc<SubmissionQueue<B>>,
    allocator: B::CommandAllocator,
    commands: Vec<Command<B>>,
    state: ContextState,
    last_submission: Option<u64>,
}

impl<B: GpuBackend> CommandContext<B> {
    pub fn new(backend: &B, queue: Arc<SubmissionQueue<B>>) -> GpuResult<Self> {
        let allocator = backend.create_command_allocator(queue.role())?;
        Ok(Self {
            queue,
            allocator,
            commands: Vec::new(),
            state: ContextState::Initial,
            last_submission: None,
        })
    }

    pub fn role(&self) -> QueueRole {
        self.queue.role()
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Fence value signaled right after the last submission
    pub fn last_submission(&self) -> Option<u64> {
        self.last_submission
    }

    /// Whether the GPU has retired this context's last submission
    pub fn is_retired(&self) -> GpuResult<bool> {
        match self.last_submission {
            Some(value) => self.queue.is_complete(value),
            None => Ok(true),
        }
    }

    /// Start a new recording.
    ///
    /// The allocator's memory is recycled here, so the previous submission
    /// must have retired. This never blocks: callers wait on the fence first.
    pub fn reset(&mut self, backend: &B) -> GpuResult<()> {
        if self.state == ContextState::Recording {
            return Err(self.misuse("reset"));
        }
        if let Some(pending) = self.last_submission {
            let completed = self.queue.completed_value()?;
            if completed < pending {
                return Err(GpuError::AllocatorInUse { pending, completed });
            }
        }

        backend.reset_command_allocator(&mut self.allocator)?;
        // Drops the clones that kept last frame's resources alive
        self.commands.clear();
        self.state = ContextState::Recording;
        Ok(())
    }

    // ========================================================================
    // Recording
    // ========================================================================

    pub fn set_pipeline_state(&mut self, pipeline: &B::Pipeline) -> GpuResult<()> {
        self.record(Command::SetPipelineState(pipeline.clone()))
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> GpuResult<()> {
        self.record(Command::SetViewport(viewport))
    }

    pub fn set_scissor(&mut self, scissor: ScissorRect) -> GpuResult<()> {
        self.record(Command::SetScissor(scissor))
    }

    pub fn bind_vertex_buffer(&mut self, buffer: &B::Buffer, offset: u64) -> GpuResult<()> {
        self.record(Command::BindVertexBuffer {
            buffer: buffer.clone(),
            offset,
        })
    }

    pub fn bind_index_buffer(&mut self, buffer: &B::Buffer, offset: u64) -> GpuResult<()> {
        self.record(Command::BindIndexBuffer {
            buffer: buffer.clone(),
            offset,
        })
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> GpuResult<()> {
        self.record(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        })
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> GpuResult<()> {
        self.record(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        })
    }

    pub fn copy_buffer(
        &mut self,
        src: &B::Buffer,
        src_offset: u64,
        dst: &B::Buffer,
        dst_offset: u64,
        size: u64,
    ) -> GpuResult<()> {
        self.record(Command::CopyBuffer {
            src: src.clone(),
            dst: dst.clone(),
            src_offset,
            dst_offset,
            size,
        })
    }

    /// Number of commands recorded since the last reset
    pub fn recorded(&self) -> usize {
        self.commands.len()
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Close, submit and signal. Returns the fence value that marks this
    /// submission's completion; with `wait` the call blocks until it retires.
    pub fn finish(&mut self, backend: &B, wait: bool) -> GpuResult<u64> {
        if self.state != ContextState::Recording {
            return Err(self.misuse("finish"));
        }

        backend.close(&mut self.allocator, &self.commands)?;
        self.queue.execute(&mut self.allocator)?;
        let value = self.queue.signal()?;

        self.state = ContextState::Submitted;
        self.last_submission = Some(value);
        log::trace!(
            "[{}] submitted {} commands, fence {}",
            self.role(),
            self.commands.len(),
            value
        );

        if wait {
            self.queue.wait_for_value(value)?;
        }
        Ok(value)
    }

    fn record(&mut self, command: Command<B>) -> GpuResult<()> {
        if self.state != ContextState::Recording {
            return Err(self.misuse(command.name()));
        }
        if !command.supported_on(self.role()) {
            return Err(self.misuse(command.name()));
        }
        self.commands.push(command);
        Ok(())
    }

    fn misuse(&self, operation: &'static str) -> GpuError {
        GpuError::RecordingMisuse {
            operation,
            state: self.state,
        }
    }
}
