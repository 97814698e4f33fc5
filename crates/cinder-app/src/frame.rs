//! Per-frame context for rendering.

use ash::vk;
use cinder_gpu::{CommandEncoder, FramebufferState, RenderPass, RenderTarget};

/// Context for the current frame being rendered.
///
/// Owned by the render thread for the duration of one frame. Carries the
/// encoder recording the frame and the framebuffer binding state.
pub struct FrameContext {
    /// Current frame number. The first frame is 1.
    pub frame_number: u64,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    /// The swapchain image for this frame.
    pub target: RenderTarget,
    /// Bound render target, viewport and render area.
    pub framebuffer: FramebufferState,
    encoder: CommandEncoder,
}

impl FrameContext {
    pub(crate) fn new(
        frame_number: u64,
        dt: f32,
        image_index: u32,
        target: RenderTarget,
        encoder: CommandEncoder,
    ) -> Self {
        Self {
            frame_number,
            dt,
            image_index,
            target,
            framebuffer: FramebufferState::default(),
            encoder,
        }
    }

    /// Command buffer being recorded.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.encoder.handle()
    }

    pub fn encoder(&mut self) -> &mut CommandEncoder {
        &mut self.encoder
    }

    /// Open `pass` on the swapchain image.
    pub fn begin_render_pass(&mut self, pass: &RenderPass) -> cinder_gpu::Result<()> {
        self.encoder
            .begin_render_pass(&mut self.framebuffer, pass, self.target)
    }

    pub fn end_render_pass(&mut self) {
        self.encoder.end_render_pass(&mut self.framebuffer);
    }

    /// Close any pass left open and hand back the encoder.
    pub(crate) fn into_encoder(mut self) -> CommandEncoder {
        if self.framebuffer.in_render_pass() {
            tracing::warn!(frame = self.frame_number, "Render pass left open, closing it");
            self.encoder.end_render_pass(&mut self.framebuffer);
        }
        self.encoder
    }
}
