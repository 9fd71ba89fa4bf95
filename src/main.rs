// =============================================================================
// RENDER CORE DEMO - headless frame loop
// =============================================================================
//
// Drives the frame loop against a field of cubes with an orbiting camera, so
// every frame culls a different subset.
//
// FRAME FLOW:
// 1. Advance the camera
// 2. FrameLoop::render_frame (wait slot -> reset -> cull -> record -> submit)
// 3. Track FPS / culling stats
// 4. On exit: drain every queue
//
// =============================================================================

use anyhow::{Context, Result};
use glam::{Mat4, Vec3};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use render_core::config::{BackendKind, Config};
use render_core::culling::Aabb;
use render_core::{BufferUsage, Drawable, FrameLoop, FrameStats, GpuBackend, RenderCore, SoftwareBackend, VulkanBackend, Viewport};

/// Cubes per side of the grid
const GRID: i32 = 16;
const SPACING: f32 = 6.0;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    // Initialize logging
    init_logging(&config);
    log::info!("Starting render core demo");
    log::info!(
        "Viewport: {}x{}, {} frames in flight, {} frames",
        config.frames.width,
        config.frames.height,
        config.frames.frames_in_flight,
        config.frames.frame_count
    );

    match config.backend_kind() {
        BackendKind::Software => {
            let delay = Duration::from_micros(config.device.execution_delay_us);
            let backend = SoftwareBackend::with_execution_delay(delay);
            let pipeline = backend.create_pipeline("instanced-cubes");
            run(backend, Some(pipeline), &config)?;
        }
        BackendKind::Vulkan => {
            let backend = VulkanBackend::new(&config.device.app_name, config.device.validation_layers)
                .context("Failed to create Vulkan backend")?;
            // Pipelines come from shader tooling; without one the loop culls
            // and submits but records no draws
            run(backend, None, &config)?;
        }
    }

    log::info!("Shutdown complete");
    Ok(())
}

/// Initialize logging with optional file output
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== Render Core Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

// =============================================================================
// FRAME LOOP
// =============================================================================

fn run<B: GpuBackend>(backend: Arc<B>, pipeline: Option<B::Pipeline>, config: &Config) -> Result<()> {
    let core = RenderCore::new(backend, config.descriptors.capacity).context("Failed to create render core")?;

    // ─────────────────────────────────────────────────────────────────────────
    // SCENE: one shared vertex buffer, a grid of transforms
    // ─────────────────────────────────────────────────────────────────────────
    let vertices = cube_vertices();
    let vertex_buffer = core
        .upload_buffer(bytemuck::cast_slice(&vertices), BufferUsage::Vertex)
        .context("Failed to upload cube vertices")?;
    let drawables = build_scene::<B>(&vertex_buffer, vertices.len() as u32);
    log::info!("Scene: {} drawables", drawables.len());

    let mut frames = FrameLoop::new(&core, config.frames.frames_in_flight, config.frames.instance_capacity)
        .context("Failed to create frame loop")?;

    frames
        .resize(&core, config.frames.width, config.frames.height)
        .context("Failed to size frame loop")?;
    let viewport = Viewport::from_extent(config.frames.width, config.frames.height);
    let projection = Mat4::perspective_lh(
        config.camera.fov_y_degrees.to_radians(),
        viewport.aspect_ratio(),
        config.camera.near,
        config.camera.far,
    );

    let mut fps = FpsCounter::new(config.debug.show_fps);
    let mut total_culled = 0u64;
    let mut total_visible = 0u64;

    for frame in 0..config.frames.frame_count {
        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Advance the camera
        // ─────────────────────────────────────────────────────────────────────
        let angle = frame as f32 * 0.01;
        let eye = Vec3::new(angle.cos() * 20.0, 8.0, angle.sin() * 20.0);
        let view = Mat4::look_at_lh(eye, Vec3::ZERO, Vec3::Y);

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Render
        // ─────────────────────────────────────────────────────────────────────
        let stats = match frames.render_frame(&core, projection * view, &drawables, pipeline.as_ref(), None) {
            Ok(stats) => stats,
            Err(err) if err.is_device_lost() => {
                log::error!("Frame {}: {}", frame, err);
                return Err(err).context("GPU device lost");
            }
            Err(err) => return Err(err).context("Frame failed"),
        };

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Stats
        // ─────────────────────────────────────────────────────────────────────
        total_visible += u64::from(stats.visible);
        total_culled += u64::from(stats.culled);
        fps.tick(&stats);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // CLEANUP: drain every queue before anything is destroyed
    // ─────────────────────────────────────────────────────────────────────────
    core.wait_idle().context("Failed to drain GPU queues")?;
    log::info!(
        "Rendered {} frames: {} visible, {} culled",
        frames.frame_count(),
        total_visible,
        total_culled
    );
    Ok(())
}

fn build_scene<B: GpuBackend>(vertex_buffer: &B::Buffer, vertex_count: u32) -> Vec<Drawable<B>> {
    let half = GRID as f32 * SPACING / 2.0;
    let mut drawables = Vec::with_capacity((GRID * GRID) as usize);
    for x in 0..GRID {
        for z in 0..GRID {
            let position = Vec3::new(x as f32 * SPACING - half, 0.0, z as f32 * SPACING - half);
            drawables.push(Drawable {
                bounds: Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0)),
                transform: Mat4::from_translation(position) * Mat4::from_rotation_y((x * z) as f32 * 0.1),
                vertex_buffer: vertex_buffer.clone(),
                vertex_count,
            });
        }
    }
    drawables
}

/// Unit cube as a non-indexed triangle list
fn cube_vertices() -> Vec<[f32; 3]> {
    const FACES: [[[f32; 3]; 4]; 6] = [
        [[-1.0, -1.0, 1.0], [1.0, -1.0, 1.0], [1.0, 1.0, 1.0], [-1.0, 1.0, 1.0]],
        [[1.0, -1.0, -1.0], [-1.0, -1.0, -1.0], [-1.0, 1.0, -1.0], [1.0, 1.0, -1.0]],
        [[-1.0, -1.0, -1.0], [-1.0, -1.0, 1.0], [-1.0, 1.0, 1.0], [-1.0, 1.0, -1.0]],
        [[1.0, -1.0, 1.0], [1.0, -1.0, -1.0], [1.0, 1.0, -1.0], [1.0, 1.0, 1.0]],
        [[-1.0, 1.0, 1.0], [1.0, 1.0, 1.0], [1.0, 1.0, -1.0], [-1.0, 1.0, -1.0]],
        [[-1.0, -1.0, -1.0], [1.0, -1.0, -1.0], [1.0, -1.0, 1.0], [-1.0, -1.0, 1.0]],
    ];
    FACES
        .iter()
        .flat_map(|[a, b, c, d]| [*a, *b, *c, *a, *c, *d])
        .collect()
}

// =============================================================================
// FPS TRACKING
// =============================================================================

struct FpsCounter {
    enabled: bool,
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl FpsCounter {
    fn new(enabled: bool) -> Self {
        let now = Instant::now();
        Self {
            enabled,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn tick(&mut self, stats: &FrameStats) {
        if !self.enabled {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Report every second
        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            log::info!(
                "{:.0} FPS ({:.2}ms) - frame {}: {} visible, {} culled, fence {}",
                fps,
                frame_time * 1000.0,
                stats.frame,
                stats.visible,
                stats.culled,
                stats.fence_value
            );

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}
