// Submission queue
//
// Owns one backend queue and one monotonic completion fence. Every signal
// hands out the next fence value; the GPU writes that value once everything
// submitted before it has finished.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::backend::{GpuBackend, QueueRole};
use crate::error::{GpuError, GpuResult};

pub struct SubmissionQueue<B: GpuBackend> {
    backend: Arc<B>,
    role: QueueRole,
    raw: B::Queue,
    fence: B::Fence,
    // Held across the backend signal so values reach the GPU in order
    last_signaled: Mutex<u64>,
}

impl<B: GpuBackend> SubmissionQueue<B> {
    pub fn new(backend: Arc<B>, role: QueueRole) -> GpuResult<Self> {
        let raw = backend.create_queue(role)?;
        let fence = backend.create_fence(0)?;
        log::debug!("Submission queue ready: {}", role);
        Ok(Self {
            backend,
            role,
            raw,
            fence,
            last_signaled: Mutex::new(0),
        })
    }

    pub fn role(&self) -> QueueRole {
        self.role
    }

    /// Enqueue a fence signal behind all prior submissions.
    /// Returns the value that will mark their completion.
    pub fn signal(&self) -> GpuResult<u64> {
        let mut last = self.last_signaled.lock();
        let value = *last + 1;
        self.backend.signal(&self.raw, &self.fence, value)?;
        *last = value;
        log::trace!("[{}] signal {}", self.role, value);
        Ok(value)
    }

    /// Submit a closed command allocator
    pub fn execute(&self, allocator: &mut B::CommandAllocator) -> GpuResult<()> {
        // Same lock as signal: an execute never slips past a concurrent signal
        let _last = self.last_signaled.lock();
        self.backend.execute(&self.raw, allocator)
    }

    /// Highest value the GPU has reached
    pub fn completed_value(&self) -> GpuResult<u64> {
        self.backend.completed_value(&self.fence)
    }

    pub fn is_complete(&self, value: u64) -> GpuResult<bool> {
        Ok(self.completed_value()? >= value)
    }

    pub fn last_signaled(&self) -> u64 {
        *self.last_signaled.lock()
    }

    /// Block until the fence reaches `value`.
    ///
    /// Values never signaled would block forever and are rejected.
    pub fn wait_for_value(&self, value: u64) -> GpuResult<()> {
        let signaled = self.last_signaled();
        if value > signaled {
            return Err(GpuError::InvalidWait {
                requested: value,
                signaled,
            });
        }
        if self.completed_value()? >= value {
            return Ok(());
        }
        log::trace!("[{}] waiting for {}", self.role, value);
        self.backend.wait_for_value(&self.fence, value)
    }

    /// Wait for everything signaled so far. Returns immediately when the
    /// queue has no outstanding signals.
    pub fn wait_for_completion(&self) -> GpuResult<()> {
        self.wait_for_value(self.last_signaled())
    }

    /// Signal, then wait for that signal
    pub fn flush(&self) -> GpuResult<u64> {
        let value = self.signal()?;
        self.wait_for_value(value)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use std::time::Duration;

    #[test]
    fn signals_are_sequential_and_complete_in_order() {
        let queue = SubmissionQueue::new(SoftwareBackend::new(), QueueRole::Graphics).unwrap();

        let values: Vec<u64> = (0..5).map(|_| queue.signal().unwrap()).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);

        queue.wait_for_completion().unwrap();
        assert_eq!(queue.completed_value().unwrap(), 5);
        assert!(queue.is_complete(3).unwrap());
    }

    #[test]
    fn fresh_queue_waits_trivially() {
        let queue = SubmissionQueue::new(SoftwareBackend::new(), QueueRole::Compute).unwrap();
        assert_eq!(queue.last_signaled(), 0);
        queue.wait_for_completion().unwrap();
        queue.wait_for_completion().unwrap();
    }

    #[test]
    fn waiting_on_an_unsignaled_value_is_rejected() {
        let queue = SubmissionQueue::new(SoftwareBackend::new(), QueueRole::Transfer).unwrap();
        queue.signal().unwrap();
        assert!(matches!(
            queue.wait_for_value(2),
            Err(GpuError::InvalidWait {
                requested: 2,
                signaled: 1
            })
        ));
    }

    #[test]
    fn flush_blocks_until_delayed_work_retires() {
        let backend = SoftwareBackend::with_execution_delay(Duration::from_millis(5));
        let queue = SubmissionQueue::new(backend, QueueRole::Graphics).unwrap();
        let value = queue.flush().unwrap();
        assert!(queue.is_complete(value).unwrap());
    }

    #[test]
    fn concurrent_signals_never_reuse_a_value() {
        let queue = Arc::new(SubmissionQueue::new(SoftwareBackend::new(), QueueRole::Graphics).unwrap());

        let mut values: Vec<u64> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let queue = &queue;
                    scope.spawn(move || (0..25).map(|_| queue.signal().unwrap()).collect::<Vec<_>>())
                })
                .collect();
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
        });

        values.sort_unstable();
        assert_eq!(values, (1..=100).collect::<Vec<u64>>());
        queue.wait_for_completion().unwrap();
        assert_eq!(queue.completed_value().unwrap(), 100);
    }
}
