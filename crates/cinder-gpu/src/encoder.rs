//! Command encoders and render passes.
//!
//! Bound render target, viewport and render area live in a
//! [`FramebufferState`] owned by the recording thread's frame context and
//! passed to the encoder explicitly.

use std::sync::Arc;

use ash::vk;
use cinder_core::ThreadIndex;
use cinder_dispatch::Destroyable;

use crate::command::{begin_command_buffer, end_command_buffer, ThreadCommandPools};
use crate::error::{GpuError, Result};

/// An image view that a render pass can draw into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// Framebuffer binding state of the frame being recorded.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramebufferState {
    /// Target of the open render pass, if any.
    pub render_target: Option<RenderTarget>,
    pub viewport: vk::Viewport,
    pub render_area: vk::Rect2D,
}

impl FramebufferState {
    /// Whether a render pass is open.
    #[must_use]
    pub const fn in_render_pass(&self) -> bool {
        self.render_target.is_some()
    }
}

/// What happens to the colour attachment at the start of a pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColorLoad {
    Clear([f32; 4]),
    Load,
    DontCare,
}

/// Render pass description: one colour attachment.
#[derive(Debug, Clone, Copy)]
pub struct RenderPassDesc {
    pub color_format: vk::Format,
    pub load: ColorLoad,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

impl RenderPassDesc {
    /// A pass that clears `format` and leaves the image ready to present.
    #[must_use]
    pub const fn present(format: vk::Format, clear: [f32; 4]) -> Self {
        Self {
            color_format: format,
            load: ColorLoad::Clear(clear),
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }
}

/// A render pass object.
pub struct RenderPass {
    device: Arc<ash::Device>,
    pass: vk::RenderPass,
    desc: RenderPassDesc,
}

impl RenderPass {
    /// # Safety
    /// The device must be valid.
    pub(crate) unsafe fn new(device: Arc<ash::Device>, desc: RenderPassDesc) -> Result<Self> {
        let load_op = match desc.load {
            ColorLoad::Clear(_) => vk::AttachmentLoadOp::CLEAR,
            ColorLoad::Load => vk::AttachmentLoadOp::LOAD,
            ColorLoad::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        };
        let attachments = [vk::AttachmentDescription::default()
            .format(desc.color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(desc.initial_layout)
            .final_layout(desc.final_layout)];
        let color_refs = [vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];
        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)];
        // Order the layout transition after the acquire semaphore wait.
        let dependencies = [vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)];

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let pass = device.create_render_pass(&create_info, None)?;

        Ok(Self { device, pass, desc })
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.pass
    }

    pub fn desc(&self) -> &RenderPassDesc {
        &self.desc
    }
}

impl Destroyable for RenderPass {
    fn destroy(mut self) {
        let pass = std::mem::replace(&mut self.pass, vk::RenderPass::null());
        unsafe { self.device.destroy_render_pass(pass, None) };
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        if self.pass != vk::RenderPass::null() {
            tracing::warn!("Render pass dropped without being destroyed");
        }
    }
}

/// A primary command buffer being recorded on the calling thread.
///
/// Framebuffers created by [`CommandEncoder::begin_render_pass`] live as long
/// as the encoder, so destroy it only after the GPU frame that executes it.
pub struct CommandEncoder {
    pools: Arc<ThreadCommandPools>,
    owner: ThreadIndex,
    cmd: vk::CommandBuffer,
    framebuffers: Vec<vk::Framebuffer>,
    finished: bool,
}

impl CommandEncoder {
    /// # Safety
    /// The pools' device must be valid.
    pub(crate) unsafe fn new(pools: Arc<ThreadCommandPools>) -> Result<Self> {
        let (owner, cmd) = pools.allocate()?;
        if let Err(e) = begin_command_buffer(
            pools.device(),
            cmd,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        ) {
            pools.free(owner, cmd);
            return Err(e);
        }
        Ok(Self {
            pools,
            owner,
            cmd,
            framebuffers: Vec::new(),
            finished: false,
        })
    }

    /// Raw command buffer, for recording commands this type does not wrap.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.cmd
    }

    /// Thread whose pool owns the command buffer.
    pub fn owner(&self) -> ThreadIndex {
        self.owner
    }

    /// Open `pass` on `target` and record the binding in `state`.
    pub fn begin_render_pass(
        &mut self,
        state: &mut FramebufferState,
        pass: &RenderPass,
        target: RenderTarget,
    ) -> Result<()> {
        debug_assert!(!state.in_render_pass(), "render pass already open");
        if self.finished {
            return Err(GpuError::InvalidState("Encoder already finished".to_string()));
        }
        if target.format != pass.desc.color_format {
            return Err(GpuError::InvalidState(format!(
                "Render target format {:?} does not match pass format {:?}",
                target.format, pass.desc.color_format
            )));
        }

        let device = self.pools.device();
        let views = [target.view];
        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(pass.pass)
            .attachments(&views)
            .width(target.extent.width)
            .height(target.extent.height)
            .layers(1);
        let framebuffer = unsafe { device.create_framebuffer(&framebuffer_info, None)? };
        self.framebuffers.push(framebuffer);

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: target.extent,
        };
        let clear_values = match pass.desc.load {
            ColorLoad::Clear(color) => vec![vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            }],
            ColorLoad::Load | ColorLoad::DontCare => Vec::new(),
        };
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(pass.pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);

        #[allow(clippy::cast_precision_loss)]
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: target.extent.width as f32,
            height: target.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            device.cmd_begin_render_pass(self.cmd, &begin_info, vk::SubpassContents::INLINE);
        }

        state.render_target = Some(target);
        state.viewport = viewport;
        state.render_area = render_area;
        Ok(())
    }

    /// Close the open render pass.
    pub fn end_render_pass(&mut self, state: &mut FramebufferState) {
        debug_assert!(state.in_render_pass(), "no render pass open");
        if state.render_target.take().is_some() {
            unsafe { self.pools.device().cmd_end_render_pass(self.cmd) };
        }
    }

    /// Stop recording. Returns the command buffer for submission.
    pub fn finish(&mut self) -> Result<vk::CommandBuffer> {
        if !self.finished {
            unsafe { end_command_buffer(self.pools.device(), self.cmd)? };
            self.finished = true;
        }
        Ok(self.cmd)
    }
}

impl Destroyable for CommandEncoder {
    fn destroy(mut self) {
        let device = self.pools.device();
        for framebuffer in self.framebuffers.drain(..) {
            unsafe { device.destroy_framebuffer(framebuffer, None) };
        }
        let cmd = std::mem::replace(&mut self.cmd, vk::CommandBuffer::null());
        unsafe { self.pools.free(self.owner, cmd) };
    }
}

impl Drop for CommandEncoder {
    fn drop(&mut self) {
        if self.cmd != vk::CommandBuffer::null() {
            tracing::warn!(owner = %self.owner, "Command encoder dropped without being destroyed");
        }
    }
}
