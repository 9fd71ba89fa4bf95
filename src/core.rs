// Render Core - process-wide GPU context
//
// Responsibilities:
// - Own the backend, the descriptor heap and one submission queue per role
// - Hand out command contexts bound to those queues
// - One-shot buffer uploads through the transfer queue
// - Drain every queue on teardown

use std::sync::Arc;

use crate::backend::{BufferUsage, GpuBackend, QueueRole};
use crate::context::CommandContext;
use crate::descriptor::{DescriptorHeap, DescriptorSlot, GpuDescriptorHandle};
use crate::error::GpuResult;
use crate::queue::SubmissionQueue;

pub struct RenderCore<B: GpuBackend> {
    // Field order is drop order: queues and heap go before the backend
    queues: [Arc<SubmissionQueue<B>>; 3],
    descriptors: DescriptorHeap<B>,
    backend: Arc<B>,
}

impl<B: GpuBackend> RenderCore<B> {
    pub fn new(backend: Arc<B>, descriptor_capacity: u32) -> GpuResult<Self> {
        log::info!("Initializing render core ({} backend)", backend.name());

        let descriptors = DescriptorHeap::new(backend.clone(), descriptor_capacity)?;
        let queues = [
            Arc::new(SubmissionQueue::new(backend.clone(), QueueRole::Graphics)?),
            Arc::new(SubmissionQueue::new(backend.clone(), QueueRole::Compute)?),
            Arc::new(SubmissionQueue::new(backend.clone(), QueueRole::Transfer)?),
        ];

        Ok(Self {
            queues,
            descriptors,
            backend,
        })
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn descriptors(&self) -> &DescriptorHeap<B> {
        &self.descriptors
    }

    pub fn allocate_descriptor(&self) -> GpuResult<DescriptorSlot> {
        self.descriptors.allocate()
    }

    pub fn shader_visible(&self, slot: DescriptorSlot) -> GpuDescriptorHandle {
        self.descriptors.shader_visible(slot)
    }

    pub fn queue(&self, role: QueueRole) -> &Arc<SubmissionQueue<B>> {
        &self.queues[role.index()]
    }

    pub fn create_context(&self, role: QueueRole) -> GpuResult<CommandContext<B>> {
        CommandContext::new(&self.backend, self.queue(role).clone())
    }

    /// Create a buffer holding `bytes`.
    ///
    /// Upload buffers are written directly. Anything else goes through a
    /// staging buffer and a transfer-queue copy; the call returns once the
    /// copy retired, so the buffer is ready for any queue.
    pub fn upload_buffer(&self, bytes: &[u8], usage: BufferUsage) -> GpuResult<B::Buffer> {
        let size = bytes.len() as u64;
        let buffer = self.backend.create_buffer(size, usage)?;
        if bytes.is_empty() {
            return Ok(buffer);
        }

        if usage.is_host_visible() {
            self.backend.write_buffer(&buffer, 0, bytes)?;
            return Ok(buffer);
        }

        let staging = self.backend.create_buffer(size, BufferUsage::Upload)?;
        self.backend.write_buffer(&staging, 0, bytes)?;

        let mut ctx = self.create_context(QueueRole::Transfer)?;
        ctx.reset(&self.backend)?;
        ctx.copy_buffer(&staging, 0, &buffer, 0, size)?;
        let value = ctx.finish(&self.backend, true)?;
        log::debug!("Uploaded {} bytes as {:?} (transfer fence {})", size, usage, value);

        Ok(buffer)
    }

    /// Wait for everything signaled on every queue, then for the device
    pub fn wait_idle(&self) -> GpuResult<()> {
        for queue in &self.queues {
            queue.wait_for_completion()?;
        }
        self.backend.wait_idle()
    }
}

impl<B: GpuBackend> Drop for RenderCore<B> {
    fn drop(&mut self) {
        log::info!("Shutting down render core...");
        if let Err(err) = self.wait_idle() {
            log::error!("GPU did not drain cleanly: {}", err);
        }
        log::info!(
            "Render core destroyed ({} of {} descriptors used)",
            self.descriptors.allocator().allocated(),
            self.descriptors.allocator().capacity()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::error::GpuError;

    #[test]
    fn each_role_gets_its_own_queue() {
        let core = RenderCore::new(SoftwareBackend::new(), 4).unwrap();
        for role in QueueRole::ALL {
            assert_eq!(core.queue(role).role(), role);
        }
        assert!(!Arc::ptr_eq(core.queue(QueueRole::Graphics), core.queue(QueueRole::Compute)));
    }

    #[test]
    fn descriptors_exhaust_through_the_core() {
        let core = RenderCore::new(SoftwareBackend::new(), 2).unwrap();
        let first = core.allocate_descriptor().unwrap();
        let second = core.allocate_descriptor().unwrap();
        assert_ne!(core.shader_visible(first), core.shader_visible(second));
        assert!(matches!(
            core.allocate_descriptor(),
            Err(GpuError::OutOfCapacity { capacity: 2 })
        ));
    }

    #[test]
    fn empty_upload_skips_the_copy() {
        let backend = SoftwareBackend::new();
        let core = RenderCore::new(backend.clone(), 1).unwrap();
        let buffer = core.upload_buffer(&[], BufferUsage::Vertex).unwrap();
        assert_eq!(backend.buffer_size(&buffer), 0);
        assert_eq!(core.queue(QueueRole::Transfer).last_signaled(), 0);
    }
}
