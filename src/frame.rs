// Frame Loop - per-frame driver
//
// A ring of frame slots (frames in flight). Each slot owns a graphics command
// context, a host-visible instance buffer with its descriptor, and the fence
// value of the last frame that used it.
//
// FRAME FLOW:
// 1. Wait for the slot's previous frame to retire (the only block per frame)
// 2. Reset the slot's context
// 3. Re-derive frustum planes, cull every drawable
// 4. Write visible instance transforms into the slot's buffer
// 5. Record one draw per visible drawable, finish without waiting

use glam::Mat4;
use std::fmt;

use crate::backend::{BufferDescriptor, BufferUsage, DescriptorKind, GpuBackend, QueueRole};
use crate::command::{ScissorRect, Viewport};
use crate::context::CommandContext;
use crate::core::RenderCore;
use crate::culling::{Aabb, FrustumCuller};
use crate::descriptor::DescriptorSlot;
use crate::error::{GpuError, GpuResult};

/// Bytes of one instance record (a column-major model matrix)
pub const INSTANCE_STRIDE: u64 = std::mem::size_of::<Mat4>() as u64;

/// Something the frame loop can cull and draw
pub struct Drawable<B: GpuBackend> {
    pub bounds: Aabb,
    pub transform: Mat4,
    pub vertex_buffer: B::Buffer,
    pub vertex_count: u32,
}

impl<B: GpuBackend> Clone for Drawable<B> {
    fn clone(&self) -> Self {
        Self {
            bounds: self.bounds,
            transform: self.transform,
            vertex_buffer: self.vertex_buffer.clone(),
            vertex_count: self.vertex_count,
        }
    }
}

impl<B: GpuBackend> fmt::Debug for Drawable<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drawable")
            .field("bounds", &self.bounds)
            .field("vertex_count", &self.vertex_count)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frame: u64,
    pub visible: u32,
    pub culled: u32,
    /// Graphics fence value that retires this frame
    pub fence_value: u64,
}

struct FrameSlot<B: GpuBackend> {
    context: CommandContext<B>,
    instances: B::Buffer,
    instance_capacity: u32,
    descriptor: DescriptorSlot,
    // 0 = never submitted
    retire_value: u64,
}

pub struct FrameLoop<B: GpuBackend> {
    slots: Vec<FrameSlot<B>>,
    culler: FrustumCuller,
    frame: u64,
    // Set by resize, used when a frame passes no viewport
    viewport: Option<Viewport>,
    // Reused between frames
    visible: Vec<Mat4>,
}

impl<B: GpuBackend> FrameLoop<B> {
    pub fn new(core: &RenderCore<B>, frames_in_flight: usize, instance_capacity: u32) -> GpuResult<Self> {
        if frames_in_flight == 0 {
            return Err(GpuError::Unsupported("frame loop needs at least one frame in flight".into()));
        }
        let instance_capacity = instance_capacity.max(1);

        let mut slots = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            let context = core.create_context(QueueRole::Graphics)?;
            let descriptor = core.allocate_descriptor()?;
            let instances = create_instance_buffer(core, descriptor, instance_capacity)?;
            slots.push(FrameSlot {
                context,
                instances,
                instance_capacity,
                descriptor,
                retire_value: 0,
            });
        }

        log::info!(
            "Frame loop: {} frames in flight, {} instances per frame",
            frames_in_flight,
            instance_capacity
        );

        Ok(Self {
            slots,
            culler: FrustumCuller::new(),
            frame: 0,
            viewport: None,
            visible: Vec::with_capacity(instance_capacity as usize),
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Frames rendered so far
    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    /// Descriptor of a slot's instance buffer
    pub fn instance_descriptor(&self, slot: usize) -> Option<DescriptorSlot> {
        self.slots.get(slot).map(|s| s.descriptor)
    }

    pub fn instance_buffer(&self, slot: usize) -> Option<&B::Buffer> {
        self.slots.get(slot).map(|s| &s.instances)
    }

    pub fn instance_capacity(&self, slot: usize) -> Option<u32> {
        self.slots.get(slot).map(|s| s.instance_capacity)
    }

    /// Viewport from the last resize
    pub fn viewport(&self) -> Option<Viewport> {
        self.viewport
    }

    /// Cull, record and submit one frame.
    ///
    /// Without a pipeline the frame still culls and submits, but records no
    /// draws. Without a viewport it falls back to the extent of the last
    /// `resize`, and records no viewport or scissor before the first one.
    pub fn render_frame(
        &mut self,
        core: &RenderCore<B>,
        view_proj: Mat4,
        drawables: &[Drawable<B>],
        pipeline: Option<&B::Pipeline>,
        viewport: Option<Viewport>,
    ) -> GpuResult<FrameStats> {
        let viewport = viewport.or(self.viewport);
        let backend = core.backend();
        let graphics = core.queue(QueueRole::Graphics);
        let slot_index = (self.frame % self.slots.len() as u64) as usize;
        let slot = &mut self.slots[slot_index];

        // Step 1: Wait for this slot's previous use to retire
        if slot.retire_value > 0 && !graphics.is_complete(slot.retire_value)? {
            log::debug!("Frame {}: waiting for fence {}", self.frame, slot.retire_value);
            graphics.wait_for_value(slot.retire_value)?;
        }

        // Step 2: Reset
        slot.context.reset(backend)?;

        // Step 3: Cull
        let frustum = self.culler.extract_planes(view_proj);
        self.visible.clear();
        let mut visible_drawables = Vec::new();
        for drawable in drawables {
            if frustum.is_visible(&drawable.bounds, &drawable.transform) {
                self.visible.push(drawable.transform);
                visible_drawables.push(drawable);
            }
        }
        let visible = self.visible.len() as u32;
        let culled = drawables.len() as u32 - visible;

        // Step 4: Instance data
        if visible > slot.instance_capacity {
            let capacity = visible.next_power_of_two();
            slot.instances = create_instance_buffer(core, slot.descriptor, capacity)?;
            slot.instance_capacity = capacity;
            log::debug!("Frame slot {} instance buffer grown to {}", slot_index, capacity);
        }
        if !self.visible.is_empty() {
            backend.write_buffer(&slot.instances, 0, bytemuck::cast_slice(&self.visible))?;
        }

        // Step 5: Record
        let ctx = &mut slot.context;
        if let Some(viewport) = viewport {
            ctx.set_viewport(viewport)?;
            ctx.set_scissor(ScissorRect::from_extent(viewport.width as u32, viewport.height as u32))?;
        }
        if let Some(pipeline) = pipeline {
            ctx.set_pipeline_state(pipeline)?;
            for (instance, drawable) in visible_drawables.iter().enumerate() {
                ctx.bind_vertex_buffer(&drawable.vertex_buffer, 0)?;
                ctx.draw(drawable.vertex_count, 1, 0, instance as u32)?;
            }
        }

        let fence_value = ctx.finish(backend, false)?;
        slot.retire_value = fence_value;

        let stats = FrameStats {
            frame: self.frame,
            visible,
            culled,
            fence_value,
        };
        log::trace!("{:?}", stats);
        self.frame += 1;
        Ok(stats)
    }

    /// Drain the graphics queue so every slot is free to reuse, then make
    /// `width` x `height` the default viewport and scissor
    pub fn resize(&mut self, core: &RenderCore<B>, width: u32, height: u32) -> GpuResult<()> {
        log::debug!("Resize to {}x{}: flushing graphics queue", width, height);
        core.queue(QueueRole::Graphics).flush()?;
        self.viewport = Some(Viewport::from_extent(width, height));
        Ok(())
    }
}

fn create_instance_buffer<B: GpuBackend>(
    core: &RenderCore<B>,
    descriptor: DescriptorSlot,
    capacity: u32,
) -> GpuResult<B::Buffer> {
    let size = u64::from(capacity) * INSTANCE_STRIDE;
    let buffer = core.backend().create_buffer(size, BufferUsage::Upload)?;
    core.descriptors().write_buffer(
        descriptor,
        &BufferDescriptor {
            kind: DescriptorKind::StorageBuffer,
            buffer: buffer.clone(),
            offset: 0,
            range: size,
        },
    )?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use glam::Vec3;

    fn camera() -> Mat4 {
        Mat4::perspective_lh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0)
    }

    fn cubes(backend: &SoftwareBackend, centers: &[Vec3]) -> Vec<Drawable<SoftwareBackend>> {
        let vertices = backend.create_buffer(36 * 12, BufferUsage::Vertex).unwrap();
        centers
            .iter()
            .map(|&center| Drawable {
                bounds: Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0)),
                transform: Mat4::from_translation(center),
                vertex_buffer: vertices.clone(),
                vertex_count: 36,
            })
            .collect()
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        let core = RenderCore::new(SoftwareBackend::new(), 4).unwrap();
        assert!(FrameLoop::new(&core, 0, 8).is_err());
    }

    #[test]
    fn culled_drawables_are_not_drawn() {
        let backend = SoftwareBackend::new();
        let core = RenderCore::new(backend.clone(), 4).unwrap();
        let mut frames = FrameLoop::new(&core, 2, 8).unwrap();
        let pipeline = backend.create_pipeline("cubes");

        let drawables = cubes(
            &backend,
            &[Vec3::new(0.0, 0.0, 10.0), Vec3::new(0.0, 0.0, -10.0), Vec3::new(2.0, 0.0, 20.0)],
        );
        let stats = frames
            .render_frame(&core, camera(), &drawables, Some(&pipeline), Some(Viewport::from_extent(64, 64)))
            .unwrap();

        assert_eq!(stats.visible, 2);
        assert_eq!(stats.culled, 1);
        core.wait_idle().unwrap();
        assert_eq!(backend.stats().draws, 2);
        assert_eq!(backend.stats().vertices, 72);
    }

    #[test]
    fn instance_buffer_grows_and_descriptor_follows() {
        let backend = SoftwareBackend::new();
        let core = RenderCore::new(backend.clone(), 4).unwrap();
        let mut frames = FrameLoop::new(&core, 1, 2).unwrap();

        let centers: Vec<Vec3> = (0..5).map(|i| Vec3::new(0.0, 0.0, 10.0 + i as f32)).collect();
        let drawables = cubes(&backend, &centers);
        frames
            .render_frame(&core, camera(), &drawables, None, Some(Viewport::from_extent(64, 64)))
            .unwrap();

        assert_eq!(frames.instance_capacity(0), Some(8));
        let slot = frames.instance_descriptor(0).unwrap();
        let written = core.descriptors().table().descriptor(slot.index).unwrap();
        assert_eq!(written.range, 8 * INSTANCE_STRIDE);
        assert_eq!(written.buffer.id(), frames.instance_buffer(0).unwrap().id());

        // First instance's model matrix landed at offset 0
        let bytes = backend.read_buffer(frames.instance_buffer(0).unwrap());
        let first: Mat4 = bytemuck::pod_read_unaligned(&bytes[..INSTANCE_STRIDE as usize]);
        assert_eq!(first, Mat4::from_translation(centers[0]));
    }

    #[test]
    fn resize_sets_the_default_viewport() {
        let backend = SoftwareBackend::new();
        let core = RenderCore::new(backend.clone(), 4).unwrap();
        let mut frames = FrameLoop::new(&core, 1, 4).unwrap();
        let drawables = cubes(&backend, &[Vec3::new(0.0, 0.0, 10.0)]);

        // No viewport yet: nothing recorded
        frames.render_frame(&core, camera(), &drawables, None, None).unwrap();
        assert_eq!(frames.slots[0].context.recorded(), 0);

        frames.resize(&core, 320, 200).unwrap();
        assert_eq!(frames.viewport(), Some(Viewport::from_extent(320, 200)));

        frames.render_frame(&core, camera(), &drawables, None, None).unwrap();
        assert_eq!(frames.slots[0].context.recorded(), 2);
    }
}
