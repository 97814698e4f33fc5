//! Viewer application.

use std::sync::Arc;

use cinder_app::{AppContext, CinderApp, FrameContext, RenderPass, RenderPassDesc};
use parking_lot::Mutex;
use tracing::{debug, info};
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

const GOLDEN_RATIO: f32 = 0.618_034;

/// Clears the screen with a colour that changes on request.
pub struct Viewer {
    clear: [f32; 4],
    hue: f32,
    pass: Option<RenderPass>,
    // Written by the main queue, read in `update`.
    pending_clear: Arc<Mutex<Option<[f32; 4]>>>,
}

impl CinderApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        info!(
            vsync = ctx.vsync(),
            extent = ?ctx.extent(),
            "Viewer ready (V: vsync, F: fullscreen, C: colour)"
        );
        Ok(Self {
            clear: [0.05, 0.05, 0.08, 1.0],
            hue: 0.0,
            pass: None,
            pending_clear: Arc::new(Mutex::new(None)),
        })
    }

    fn update(&mut self, ctx: &AppContext, _dt: f32) {
        let Some(clear) = self.pending_clear.lock().take() else {
            return;
        };
        self.clear = clear;
        // Frames already submitted still reference the old pass.
        if let Some(old) = self.pass.take() {
            ctx.dispatch().destroy_after_gpu_frame(old, ctx.frame_count);
        }
    }

    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()> {
        let format = frame.target.format;
        if self
            .pass
            .as_ref()
            .is_some_and(|pass| pass.desc().color_format != format)
        {
            debug!(?format, "Swapchain format changed, rebuilding render pass");
            if let Some(old) = self.pass.take() {
                ctx.dispatch()
                    .destroy_after_gpu_frame(old, frame.frame_number - 1);
            }
        }

        let pass = match self.pass.take() {
            Some(pass) => pass,
            None => ctx
                .factory()
                .create_render_pass(&RenderPassDesc::present(format, self.clear))?,
        };
        let pass = self.pass.insert(pass);

        frame.begin_render_pass(pass)?;
        frame.end_render_pass();
        Ok(())
    }

    fn on_event(&mut self, ctx: &mut AppContext, event: &WindowEvent) -> bool {
        let WindowEvent::KeyboardInput {
            event:
                KeyEvent {
                    physical_key: PhysicalKey::Code(key),
                    state: ElementState::Pressed,
                    repeat: false,
                    ..
                },
            ..
        } = event
        else {
            return false;
        };

        match key {
            KeyCode::KeyV => {
                let vsync = !ctx.vsync();
                info!(vsync, "Toggling vsync");
                ctx.set_vsync(vsync);
            }
            KeyCode::KeyF => {
                let fullscreen = !ctx.fullscreen();
                info!(fullscreen, "Toggling fullscreen");
                ctx.set_fullscreen(fullscreen);
            }
            KeyCode::KeyC => self.request_colour(ctx),
            _ => return false,
        }
        true
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        if let Some(pass) = self.pass.take() {
            ctx.dispatch().destroy_on_shutdown(pass);
        }
    }
}

impl Viewer {
    /// Compute the next colour on the background pool and apply it from the
    /// main thread.
    fn request_colour(&mut self, ctx: &AppContext) {
        self.hue = (self.hue + GOLDEN_RATIO).fract();
        let hue = self.hue;
        let pending = Arc::clone(&self.pending_clear);
        let dispatch = ctx.dispatch().clone();

        ctx.dispatch().spawn_background(move |thread| {
            let [r, g, b] = hsv_to_rgb(hue, 0.6, 0.35);
            debug!(%thread, hue, "Computed clear colour");
            dispatch.run_on_main(move |_| {
                *pending.lock() = Some([r, g, b, 1.0]);
            });
        });
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [f32; 3] {
    let sector = h * 6.0;
    let f = sector.fract();
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match sector as u32 % 6 {
        0 => [v, t, p],
        1 => [q, v, p],
        2 => [p, v, t],
        3 => [p, q, v],
        4 => [t, p, v],
        _ => [v, p, q],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hsv_primaries() {
        assert_eq!(hsv_to_rgb(0.0, 1.0, 1.0), [1.0, 0.0, 0.0]);
        let green = hsv_to_rgb(1.0 / 3.0, 1.0, 1.0);
        assert!(green[1] > 0.99 && green[0] < 0.01 && green[2] < 0.01);
        assert_eq!(hsv_to_rgb(0.5, 0.0, 0.5), [0.5, 0.5, 0.5]);
    }
}
