// Software backend - CPU-emulated GPU
//
// Every queue gets a worker thread that plays the role of the GPU: it pops
// submissions in FIFO order, executes them, and advances fences when it
// reaches a signal. The CPU side sees exactly the asynchrony a real device
// gives it, which is what the queue/context/frame code has to get right.
//
// Extras for tests and headless runs: simulated execution latency, device
// loss injection, readable buffer memory and execution statistics.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use super::{check_range, BufferDescriptor, BufferUsage, DescriptorLayout, GpuBackend, QueueRole};
use crate::command::Command;
use crate::error::{GpuError, GpuResult};

/// Byte stride of one emulated descriptor
pub const SOFT_DESCRIPTOR_STRIDE: u32 = 32;
/// Synthetic base addresses of the emulated descriptor heap
pub const SOFT_CPU_HEAP_BASE: usize = 0x0010_0000;
pub const SOFT_GPU_HEAP_BASE: u64 = 0x0001_0000_0000_0000;

// =============================================================================
// HANDLES
// =============================================================================

#[derive(Clone)]
pub struct SoftBuffer {
    id: u64,
    usage: BufferUsage,
    memory: Arc<Mutex<Vec<u8>>>,
}

impl SoftBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    fn len(&self) -> u64 {
        self.memory.lock().len() as u64
    }
}

impl fmt::Debug for SoftBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftBuffer")
            .field("id", &self.id)
            .field("usage", &self.usage)
            .field("size", &self.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftPipeline {
    id: u64,
    label: Arc<str>,
}

impl SoftPipeline {
    pub fn label(&self) -> &str {
        &self.label
    }
}

pub struct SoftFence {
    state: Arc<FenceState>,
}

struct FenceState {
    value: Mutex<u64>,
    changed: Condvar,
}

impl FenceState {
    fn advance(&self, value: u64) {
        let mut current = self.value.lock();
        if value > *current {
            *current = value;
        }
        self.changed.notify_all();
    }

    fn wake(&self) {
        let _guard = self.value.lock();
        self.changed.notify_all();
    }
}

pub struct SoftCommandAllocator {
    role: QueueRole,
    encoded: Option<Vec<Command<SoftwareBackend>>>,
    executing: Arc<AtomicUsize>,
}

pub struct SoftDescriptorTable {
    slots: Mutex<Vec<Option<BufferDescriptor<SoftwareBackend>>>>,
}

impl SoftDescriptorTable {
    /// What is currently written into `index`
    pub fn descriptor(&self, index: u32) -> Option<BufferDescriptor<SoftwareBackend>> {
        self.slots.lock().get(index as usize).cloned().flatten()
    }
}

// =============================================================================
// DEVICE STATE
// =============================================================================

/// Execution counters, updated by the queue workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftwareStats {
    pub submissions: u64,
    pub signals: u64,
    pub draws: u64,
    pub vertices: u64,
    pub copies: u64,
    pub bytes_copied: u64,
}

#[derive(Default)]
struct Counters {
    submissions: AtomicU64,
    signals: AtomicU64,
    draws: AtomicU64,
    vertices: AtomicU64,
    copies: AtomicU64,
    bytes_copied: AtomicU64,
}

struct DeviceState {
    lost: Mutex<Option<String>>,
    fences: Mutex<Vec<Weak<FenceState>>>,
    queues: Mutex<Vec<Weak<QueueShared>>>,
    counters: Counters,
    execution_delay: Duration,
}

impl DeviceState {
    fn check_alive(&self) -> GpuResult<()> {
        match self.lost.lock().as_ref() {
            Some(reason) => Err(GpuError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }

    fn lose(&self, reason: String) {
        {
            let mut lost = self.lost.lock();
            if lost.is_some() {
                return;
            }
            log::error!("[software] device lost: {}", reason);
            *lost = Some(reason);
        }

        // Wake everything that could be blocked on the GPU
        for fence in self.fences.lock().iter().filter_map(Weak::upgrade) {
            fence.wake();
        }
        for queue in self.queues.lock().iter().filter_map(Weak::upgrade) {
            let _guard = queue.state.lock();
            queue.idle.notify_all();
        }
    }
}

// =============================================================================
// QUEUES
// =============================================================================

enum Job {
    Execute {
        commands: Vec<Command<SoftwareBackend>>,
        executing: Arc<AtomicUsize>,
    },
    Signal {
        fence: Arc<FenceState>,
        value: u64,
    },
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    running: bool,
    shutdown: bool,
}

struct QueueShared {
    role: QueueRole,
    state: Mutex<QueueState>,
    work: Condvar,
    idle: Condvar,
}

pub struct SoftQueue {
    shared: Arc<QueueShared>,
    worker: Option<JoinHandle<()>>,
}

impl SoftQueue {
    pub fn role(&self) -> QueueRole {
        self.shared.role
    }

    fn push(&self, job: Job) {
        let mut state = self.shared.state.lock();
        state.pending.push_back(job);
        self.shared.work.notify_one();
    }
}

impl Drop for SoftQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.work.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("[software] {} queue worker panicked", self.shared.role);
            }
        }
    }
}

fn run_queue_worker(shared: Arc<QueueShared>, device: Arc<DeviceState>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.pending.pop_front() {
                    state.running = true;
                    break job;
                }
                if state.shutdown {
                    return;
                }
                shared.work.wait(&mut state);
            }
        };

        // A lost device retires nothing: submissions and signals are dropped
        if device.check_alive().is_ok() {
            run_job(job, &device);
        }

        let mut state = shared.state.lock();
        state.running = false;
        if state.pending.is_empty() {
            shared.idle.notify_all();
        }
    }
}

fn run_job(job: Job, device: &DeviceState) {
    match job {
        Job::Execute { commands, executing } => {
            if !device.execution_delay.is_zero() {
                std::thread::sleep(device.execution_delay);
            }
            if let Err(reason) = execute_commands(&commands, device) {
                device.lose(reason);
            }
            device.counters.submissions.fetch_add(1, Ordering::Relaxed);
            executing.fetch_sub(1, Ordering::AcqRel);
        }
        Job::Signal { fence, value } => {
            fence.advance(value);
            device.counters.signals.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn execute_commands(commands: &[Command<SoftwareBackend>], device: &DeviceState) -> Result<(), String> {
    let counters = &device.counters;
    let mut pipeline_bound = false;

    for command in commands {
        match command {
            Command::SetPipelineState(_) => pipeline_bound = true,
            Command::Draw {
                vertex_count,
                instance_count,
                ..
            } => {
                if !pipeline_bound {
                    return Err("draw without pipeline state".to_string());
                }
                counters.draws.fetch_add(1, Ordering::Relaxed);
                counters
                    .vertices
                    .fetch_add(*vertex_count as u64 * *instance_count as u64, Ordering::Relaxed);
            }
            Command::DrawIndexed {
                index_count,
                instance_count,
                ..
            } => {
                if !pipeline_bound {
                    return Err("indexed draw without pipeline state".to_string());
                }
                counters.draws.fetch_add(1, Ordering::Relaxed);
                counters
                    .vertices
                    .fetch_add(*index_count as u64 * *instance_count as u64, Ordering::Relaxed);
            }
            Command::CopyBuffer {
                src,
                dst,
                src_offset,
                dst_offset,
                size,
            } => {
                copy_buffer(src, dst, *src_offset, *dst_offset, *size)?;
                counters.copies.fetch_add(1, Ordering::Relaxed);
                counters.bytes_copied.fetch_add(*size, Ordering::Relaxed);
            }
            Command::SetViewport(_)
            | Command::SetScissor(_)
            | Command::BindVertexBuffer { .. }
            | Command::BindIndexBuffer { .. } => {}
        }
    }
    Ok(())
}

fn copy_buffer(src: &SoftBuffer, dst: &SoftBuffer, src_offset: u64, dst_offset: u64, size: u64) -> Result<(), String> {
    let fault = |e: GpuError| format!("copy fault: {e}");

    if Arc::ptr_eq(&src.memory, &dst.memory) {
        let mut memory = src.memory.lock();
        let len = memory.len() as u64;
        check_range(src_offset, size, len).map_err(fault)?;
        check_range(dst_offset, size, len).map_err(fault)?;
        let from = src_offset as usize..(src_offset + size) as usize;
        memory.copy_within(from, dst_offset as usize);
        return Ok(());
    }

    // Lower id locks first, so swapped copies on two queues cannot deadlock
    let (src_memory, mut dst_memory) = if src.id < dst.id {
        let src_memory = src.memory.lock();
        (src_memory, dst.memory.lock())
    } else {
        let dst_memory = dst.memory.lock();
        (src.memory.lock(), dst_memory)
    };
    check_range(src_offset, size, src_memory.len() as u64).map_err(fault)?;
    check_range(dst_offset, size, dst_memory.len() as u64).map_err(fault)?;
    let (s, d, n) = (src_offset as usize, dst_offset as usize, size as usize);
    dst_memory[d..d + n].copy_from_slice(&src_memory[s..s + n]);
    Ok(())
}

// =============================================================================
// BACKEND
// =============================================================================

pub struct SoftwareBackend {
    device: Arc<DeviceState>,
    next_id: AtomicU64,
}

impl SoftwareBackend {
    pub fn new() -> Arc<Self> {
        Self::with_execution_delay(Duration::ZERO)
    }

    /// Every submission takes at least `delay` to execute on its queue
    pub fn with_execution_delay(delay: Duration) -> Arc<Self> {
        log::info!("Creating software device (execution delay {:?})", delay);
        Arc::new(Self {
            device: Arc::new(DeviceState {
                lost: Mutex::new(None),
                fences: Mutex::new(Vec::new()),
                queues: Mutex::new(Vec::new()),
                counters: Counters::default(),
                execution_delay: delay,
            }),
            next_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Pipelines come from shader tooling on a real device; here they are labels.
    pub fn create_pipeline(&self, label: &str) -> SoftPipeline {
        SoftPipeline {
            id: self.next_id(),
            label: Arc::from(label),
        }
    }

    /// Snapshot of a buffer's memory
    pub fn read_buffer(&self, buffer: &SoftBuffer) -> Vec<u8> {
        buffer.memory.lock().clone()
    }

    pub fn stats(&self) -> SoftwareStats {
        let c = &self.device.counters;
        SoftwareStats {
            submissions: c.submissions.load(Ordering::Relaxed),
            signals: c.signals.load(Ordering::Relaxed),
            draws: c.draws.load(Ordering::Relaxed),
            vertices: c.vertices.load(Ordering::Relaxed),
            copies: c.copies.load(Ordering::Relaxed),
            bytes_copied: c.bytes_copied.load(Ordering::Relaxed),
        }
    }

    /// Simulate a device removal; pending and future work never retires.
    pub fn lose_device(&self, reason: &str) {
        self.device.lose(reason.to_string());
    }
}

impl GpuBackend for SoftwareBackend {
    type Queue = SoftQueue;
    type Fence = SoftFence;
    type CommandAllocator = SoftCommandAllocator;
    type DescriptorTable = SoftDescriptorTable;
    type Buffer = SoftBuffer;
    type Pipeline = SoftPipeline;

    fn name(&self) -> &'static str {
        "software"
    }

    fn create_queue(&self, role: QueueRole) -> GpuResult<SoftQueue> {
        let shared = Arc::new(QueueShared {
            role,
            state: Mutex::new(QueueState::default()),
            work: Condvar::new(),
            idle: Condvar::new(),
        });

        let worker = {
            let shared = shared.clone();
            let device = self.device.clone();
            std::thread::Builder::new()
                .name(format!("soft-gpu-{role}"))
                .spawn(move || run_queue_worker(shared, device))
                .map_err(|e| GpuError::Unsupported(format!("failed to spawn {role} queue worker: {e}")))?
        };

        self.device.queues.lock().push(Arc::downgrade(&shared));
        log::debug!("[software] created {} queue", role);

        Ok(SoftQueue {
            shared,
            worker: Some(worker),
        })
    }

    fn create_fence(&self, initial_value: u64) -> GpuResult<SoftFence> {
        let state = Arc::new(FenceState {
            value: Mutex::new(initial_value),
            changed: Condvar::new(),
        });
        let mut fences = self.device.fences.lock();
        fences.retain(|f| f.strong_count() > 0);
        fences.push(Arc::downgrade(&state));
        Ok(SoftFence { state })
    }

    fn completed_value(&self, fence: &SoftFence) -> GpuResult<u64> {
        self.device.check_alive()?;
        Ok(*fence.state.value.lock())
    }

    fn wait_for_value(&self, fence: &SoftFence, value: u64) -> GpuResult<()> {
        let mut current = fence.state.value.lock();
        while *current < value {
            self.device.check_alive()?;
            fence.state.changed.wait(&mut current);
        }
        Ok(())
    }

    fn signal(&self, queue: &SoftQueue, fence: &SoftFence, value: u64) -> GpuResult<()> {
        self.device.check_alive()?;
        queue.push(Job::Signal {
            fence: fence.state.clone(),
            value,
        });
        Ok(())
    }

    fn execute(&self, queue: &SoftQueue, allocator: &mut SoftCommandAllocator) -> GpuResult<()> {
        self.device.check_alive()?;
        if allocator.role != queue.role() {
            return Err(GpuError::Unsupported(format!(
                "{} allocator submitted to {} queue",
                allocator.role,
                queue.role()
            )));
        }
        let commands = allocator
            .encoded
            .take()
            .ok_or_else(|| GpuError::Unsupported("execute of a command allocator that was never closed".into()))?;

        allocator.executing.fetch_add(1, Ordering::AcqRel);
        queue.push(Job::Execute {
            commands,
            executing: allocator.executing.clone(),
        });
        Ok(())
    }

    fn create_command_allocator(&self, role: QueueRole) -> GpuResult<SoftCommandAllocator> {
        Ok(SoftCommandAllocator {
            role,
            encoded: None,
            executing: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn reset_command_allocator(&self, allocator: &mut SoftCommandAllocator) -> GpuResult<()> {
        // On hardware this is a resource-still-in-use fault
        if allocator.executing.load(Ordering::Acquire) > 0 {
            return Err(GpuError::DeviceLost(
                "command allocator reset while its commands are executing".into(),
            ));
        }
        allocator.encoded = None;
        Ok(())
    }

    fn close(&self, allocator: &mut SoftCommandAllocator, commands: &[Command<Self>]) -> GpuResult<()> {
        allocator.encoded = Some(commands.to_vec());
        Ok(())
    }

    fn create_descriptor_table(&self, capacity: u32) -> GpuResult<(SoftDescriptorTable, DescriptorLayout)> {
        let table = SoftDescriptorTable {
            slots: Mutex::new(vec![None; capacity as usize]),
        };
        let layout = DescriptorLayout {
            capacity,
            stride: SOFT_DESCRIPTOR_STRIDE,
            cpu_base: SOFT_CPU_HEAP_BASE,
            gpu_base: SOFT_GPU_HEAP_BASE,
        };
        Ok((table, layout))
    }

    fn write_descriptor(
        &self,
        table: &SoftDescriptorTable,
        index: u32,
        descriptor: &BufferDescriptor<Self>,
    ) -> GpuResult<()> {
        check_range(descriptor.offset, descriptor.range, descriptor.buffer.len())?;
        let mut slots = table.slots.lock();
        let capacity = slots.len() as u32;
        let slot = slots
            .get_mut(index as usize)
            .ok_or(GpuError::OutOfCapacity { capacity })?;
        *slot = Some(descriptor.clone());
        Ok(())
    }

    fn create_buffer(&self, size: u64, usage: BufferUsage) -> GpuResult<SoftBuffer> {
        Ok(SoftBuffer {
            id: self.next_id(),
            usage,
            memory: Arc::new(Mutex::new(vec![0; size as usize])),
        })
    }

    fn buffer_size(&self, buffer: &SoftBuffer) -> u64 {
        buffer.len()
    }

    fn write_buffer(&self, buffer: &SoftBuffer, offset: u64, data: &[u8]) -> GpuResult<()> {
        if !buffer.usage.is_host_visible() {
            return Err(GpuError::Unsupported(format!(
                "write to {:?} buffer; only upload buffers are host-visible",
                buffer.usage
            )));
        }
        let mut memory = buffer.memory.lock();
        check_range(offset, data.len() as u64, memory.len() as u64)?;
        let start = offset as usize;
        memory[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn wait_idle(&self) -> GpuResult<()> {
        let queues: Vec<_> = self.device.queues.lock().iter().filter_map(Weak::upgrade).collect();
        for queue in queues {
            let mut state = queue.state.lock();
            while state.running || !state.pending.is_empty() {
                self.device.check_alive()?;
                queue.idle.wait(&mut state);
            }
        }
        self.device.check_alive()
    }
}
