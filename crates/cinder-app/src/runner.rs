//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use ash::vk;
use cinder_core::constants::MAX_FRAMES_IN_FLIGHT;
use cinder_gpu::command::submit_command_buffers;
use cinder_gpu::error::abort_on_fatal;
use cinder_gpu::{CommandEncoder, GpuContextBuilder, VulkanFence};
use raw_window_handle::HasDisplayHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Fullscreen, Window, WindowId};

use crate::app::CinderApp;
use crate::config::RuntimeConfig;
use crate::context::{AppContext, FENCE_TIMEOUT};
use crate::frame::FrameContext;

/// Run a `CinderApp` with the given configuration.
///
/// This function initializes logging, creates the window and GPU context,
/// and runs the event loop until the application exits.
pub fn run_app<A: CinderApp + 'static>(config: RuntimeConfig) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
    };

    if let Err(e) = event_loop.run_app(&mut runner) {
        error!("Event loop error: {e}");
    }

    // Exiting without a close request still tears down in order.
    if let Some(state) = runner.state.take() {
        state.shutdown();
    }

    Ok(())
}

/// Internal application runner that implements winit's `ApplicationHandler`.
struct AppRunner<A: CinderApp> {
    config: RuntimeConfig,
    state: Option<AppState<A>>,
}

/// Internal application state.
struct AppState<A: CinderApp> {
    ctx: AppContext,
    app: A,
    target_frame_time: Option<Duration>,
    last_frame_time: Instant,
    // FPS tracking
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl<A: CinderApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        // Let the app handle the event first
        if let Some(state) = &mut self.state {
            if state.app.on_event(&mut state.ctx, &event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(state) = self.state.take() {
                    state.shutdown();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Some(state) = &mut self.state {
                    if let Err(e) = state.render_frame() {
                        error!("Render error: {e:#}");
                    }
                    state.ctx.window().request_redraw();
                }
            }
            WindowEvent::Resized(size) => {
                // The presenter picks the new extent up at the next frame.
                tracing::debug!(width = size.width, height = size.height, "Window resized");
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window().request_redraw();
        }
    }
}

impl<A: CinderApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height))
            .with_fullscreen(self.config.fullscreen.then_some(Fullscreen::Borderless(None)));

        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let display = window.display_handle()?.as_raw();
        let gpu = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation_policy())
            .build(display)?;

        info!("GPU: {}", gpu.capabilities().summary());

        let mut ctx = AppContext::new(window, gpu, &self.config)?;

        let app = A::init(&mut ctx)?;

        let target_frame_time = self
            .config
            .target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)));

        Ok(AppState {
            ctx,
            app,
            target_frame_time,
            last_frame_time: Instant::now(),
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        })
    }
}

impl<A: CinderApp> AppState<A> {
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();

        let dt = {
            let now = Instant::now();
            let dt = now.duration_since(self.last_frame_time).as_secs_f32();
            self.last_frame_time = now;

            if dt > 0.0 {
                let fps = 1.0 / f64::from(dt);
                self.min_fps = self.min_fps.min(fps);
                self.max_fps = self.max_fps.max(fps);
                self.fps_sum += fps;
            }
            dt
        };

        let dispatch = self.ctx.dispatch().clone();
        dispatch.drain_main();
        self.ctx.tracker.poll(&dispatch);

        self.app.update(&self.ctx, dt);

        let frame = self.ctx.frame_count + 1;
        let max_in_flight = MAX_FRAMES_IN_FLIGHT as u64;
        // The slot this frame reuses must be free before its fence is reset.
        if frame > max_in_flight
            && !self
                .ctx
                .tracker
                .wait_for(frame - max_in_flight, FENCE_TIMEOUT, &dispatch)
        {
            anyhow::bail!("GPU frame {} did not complete", frame - max_in_flight);
        }

        abort_on_fatal(self.ctx.presenter.maintain())?;
        let Some(image_index) = abort_on_fatal(self.ctx.presenter.acquire())? else {
            // Minimised or waiting for a rebuild.
            return Ok(());
        };
        let (target, wait_semaphore, render_finished) = {
            let presenter = &self.ctx.presenter;
            let (Some(swapchain), Some(wait_semaphore)) =
                (presenter.swapchain(), presenter.backend().acquire_semaphore())
            else {
                return Ok(());
            };
            let target = swapchain
                .render_target(image_index)
                .context("Acquired image out of range")?;
            (target, wait_semaphore, swapchain.render_finished(image_index))
        };

        let encoder = self.ctx.factory().create_command_encoder()?;
        let mut frame_ctx = FrameContext::new(frame, dt, image_index, target, encoder);
        let rendered = self.app.render(&self.ctx, &mut frame_ctx);
        let mut encoder = frame_ctx.into_encoder();

        let submitted = rendered.and_then(|()| {
            self.submit(frame, &mut encoder, wait_semaphore, render_finished)
        });
        let fence = match submitted {
            Ok(fence) => fence,
            Err(e) => {
                // Never reached the GPU.
                dispatch.destroy_end_of_frame(encoder);
                return Err(e);
            }
        };

        // The encoder owns the framebuffers the GPU is still reading.
        dispatch.destroy_after_gpu_frame(encoder, frame);
        let presented = abort_on_fatal(self.ctx.presenter.present(frame));
        dispatch.end_cpu_frame(frame);
        self.ctx.tracker.track(frame, fence);
        self.ctx.frame_count = frame;
        presented?;

        // Frame pacing
        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }

        Ok(())
    }

    /// Finish `encoder` and submit it on the graphics queue with the fence of
    /// `frame`'s slot.
    fn submit(
        &self,
        frame: u64,
        encoder: &mut CommandEncoder,
        wait_semaphore: vk::Semaphore,
        render_finished: vk::Semaphore,
    ) -> anyhow::Result<VulkanFence> {
        let command_buffer = encoder.finish()?;
        let sync = self.ctx.sync.as_ref().context("Frame sync already destroyed")?;
        let gpu = self.ctx.gpu();
        unsafe {
            let fence = sync.begin(frame)?;
            abort_on_fatal(submit_command_buffers(
                gpu.device(),
                gpu.graphics_queue(),
                &[command_buffer],
                &[wait_semaphore],
                &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
                &[render_finished],
                fence.handle(),
            ))?;
            Ok(fence)
        }
    }

    fn shutdown(self) {
        let Self {
            mut ctx,
            mut app,
            min_fps,
            max_fps,
            fps_sum,
            ..
        } = self;

        // Print FPS statistics
        if ctx.frame_count > 0 {
            #[allow(clippy::cast_precision_loss)]
            let avg_fps = fps_sum / ctx.frame_count as f64;
            info!("FPS Statistics:");
            info!("  Min: {min_fps:.1}");
            info!("  Max: {max_fps:.1}");
            info!("  Avg: {:.1}", avg_fps);
            info!("  Total frames: {}", ctx.frame_count);
        }

        info!("Starting cleanup...");
        ctx.wait_for_gpu();

        // Let the app cleanup first
        app.cleanup(&mut ctx);

        ctx.shutdown();
    }
}
