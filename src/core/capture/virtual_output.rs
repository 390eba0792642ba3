//! Virtual output controller.
//!
//! Overlays capture behavior on a rendering backend without the backend
//! knowing a capture session exists. Lifecycle per output:
//!
//! created -> enabled -> repainting <-> frame-submitted -> disabled -> destroyed
//!
//! The controller composes its backend and delegates to it explicitly;
//! the generic teardown still runs because destroy/disable always call
//! through after the capture-specific work.

use std::os::unix::io::OwnedFd;
use std::rc::Rc;

use crate::core::buffer::{Allocator, Framebuffer, FramebufferTable};
use crate::core::errors::{CoreError, Result};
use crate::core::event_loop::TimerId;
use crate::core::output::{parse_modeline, Head, OutputState};
use crate::core::renderer::{Renderer, TargetKind};

/// A frame freshly rendered and locked in its allocator: the submission
/// reference plus the exported descriptor the fence handler will mmap.
pub struct RenderedFrame {
    pub fb: Framebuffer,
    pub fd: OwnedFd,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

/// Rendering backend an output delegates its lifecycle to.
pub trait OutputBackend {
    fn target_kind(&self) -> TargetKind;
    fn enable(&mut self, output: &OutputState) -> Result<()>;
    fn disable(&mut self, output: &OutputState);
    fn start_repaint_loop(&mut self, output: &OutputState);
    fn repaint(&mut self, output: &OutputState) -> Result<RenderedFrame>;
    fn create_fence_fd(&mut self, output: &OutputState) -> Option<OwnedFd>;
    fn finish_frame(&mut self, output: &OutputState);
    fn destroy(&mut self, output: &OutputState);
    fn has_free_buffers(&self) -> bool;
}

// ============================================================================
// RenderBackend, the one real implementation
// ============================================================================

/// Backend over any [`Allocator`] pool plus a [`Renderer`]. Instantiated
/// once per pool kind; the framebuffer ring logic is shared.
pub struct RenderBackend {
    allocator: Rc<dyn Allocator>,
    renderer: Box<dyn Renderer>,
    kind: TargetKind,
    table: FramebufferTable,
    /// Previous frame's reference; retired only once the next frame is
    /// current, so a 2-deep ring keeps in-flight reads valid.
    prev_fb: Option<Framebuffer>,
}

impl RenderBackend {
    pub fn new(allocator: Rc<dyn Allocator>, renderer: Box<dyn Renderer>, kind: TargetKind) -> Self {
        Self {
            allocator,
            renderer,
            kind,
            table: FramebufferTable::new(),
            prev_fb: None,
        }
    }

    pub fn prev_fb(&self) -> Option<&Framebuffer> {
        self.prev_fb.as_ref()
    }
}

impl OutputBackend for RenderBackend {
    fn target_kind(&self) -> TargetKind {
        self.kind
    }

    fn enable(&mut self, output: &OutputState) -> Result<()> {
        if !self.renderer.compatible_with(self.kind) {
            tracing::warn!(
                "renderer '{}' cannot drive {:?} buffers for output '{}'",
                self.renderer.name(),
                self.kind,
                output.name
            );
            return Err(CoreError::NoRenderer(output.name.clone()));
        }
        Ok(())
    }

    fn disable(&mut self, output: &OutputState) {
        if let Some(prev) = self.prev_fb.take() {
            prev.unref();
        }
        tracing::debug!("backend state torn down for output '{}'", output.name);
    }

    fn start_repaint_loop(&mut self, _output: &OutputState) {}

    fn repaint(&mut self, output: &OutputState) -> Result<RenderedFrame> {
        // Drop the frame if there are no free buffers.
        if !self.allocator.has_free_buffers() {
            tracing::warn!("output '{}': no free buffers, dropping frame", output.name);
            return Err(CoreError::NoFreeBuffers);
        }

        let bo = self.allocator.acquire().ok_or(CoreError::NoFreeBuffers)?;
        let mapping = self.allocator.map(&bo)?;
        let target = unsafe { std::slice::from_raw_parts_mut(mapping.ptr, mapping.len) };
        self.renderer.repaint(output, target, bo.stride)?;

        let fb = self.table.get_from_bo(&bo, Rc::clone(&self.allocator));
        let fd = self.allocator.export_fd(&bo)?;

        // The new frame takes the ring slot; only now is the previous
        // frame's reference retired.
        let ring_ref = fb.ref_();
        if let Some(prev) = self.prev_fb.replace(ring_ref) {
            prev.unref();
        }

        Ok(RenderedFrame {
            fd,
            width: bo.width,
            height: bo.height,
            stride: bo.stride,
            fb,
        })
    }

    fn create_fence_fd(&mut self, output: &OutputState) -> Option<OwnedFd> {
        self.renderer.create_fence_fd(output)
    }

    fn finish_frame(&mut self, output: &OutputState) {
        tracing::trace!("finish_frame for output '{}'", output.name);
    }

    fn destroy(&mut self, output: &OutputState) {
        self.disable(output);
    }

    fn has_free_buffers(&self) -> bool {
        self.allocator.has_free_buffers()
    }
}

// ============================================================================
// VirtualOutput
// ============================================================================

/// One virtual output: geometry, head, backend and capture flags.
pub struct VirtualOutput {
    pub state: OutputState,
    pub head: Head,
    backend: Box<dyn OutputBackend>,
    /// Set by the capture server before enable; mirrors the submit-frame
    /// hook the backend refuses to run without.
    submit_armed: bool,
    /// A real frame was produced this presentation period.
    pub submitted_frame: bool,
    /// The whole output is stale and due for re-render.
    pub damaged: bool,
    /// An (fd, context) fence wait is outstanding; at most one at a time.
    pub fence_pending: bool,
    pub finish_frame_timer: Option<TimerId>,
}

impl VirtualOutput {
    pub fn new(
        id: u32,
        name: impl Into<String>,
        modeline: &str,
        backend: Box<dyn OutputBackend>,
    ) -> Result<Self> {
        let mode = parse_modeline(modeline)?;
        let state = OutputState::new(id, name, mode);
        let mut head = Head::virtual_head();
        head.physical_width = mode.width;
        head.physical_height = mode.height;
        tracing::info!(
            "created virtual output '{}' ({}x{}@{}mHz)",
            state.name,
            mode.width,
            mode.height,
            mode.refresh
        );
        Ok(Self {
            state,
            head,
            backend,
            submit_armed: false,
            submitted_frame: false,
            damaged: false,
            fence_pending: false,
            finish_frame_timer: None,
        })
    }

    /// Register the submit-frame path. Must happen before `enable`.
    pub fn arm_submit(&mut self) {
        self.submit_armed = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled
    }

    pub fn backend(&self) -> &dyn OutputBackend {
        self.backend.as_ref()
    }

    /// Enable the output. Fails without an armed submit path or a
    /// compatible renderer; the backend's own enable still runs.
    pub fn enable(&mut self) -> Result<()> {
        if !self.submit_armed {
            tracing::warn!("output '{}': submit-frame hook is not set", self.state.name);
            return Err(CoreError::SubmitHookMissing(self.state.name.clone()));
        }
        self.backend.enable(&self.state)?;
        self.state.enabled = true;
        Ok(())
    }

    /// Disable the output; idempotent.
    pub fn disable(&mut self) {
        if !self.state.enabled {
            return;
        }
        self.backend.disable(&self.state);
        self.state.enabled = false;
        self.damaged = false;
    }

    /// Replace the current mode from a modeline string.
    pub fn set_mode(&mut self, modeline: &str) -> Result<()> {
        let mode = parse_modeline(modeline)?;
        self.state.modes.push(mode);
        self.state.current_mode = mode;
        self.head.physical_width = mode.width;
        self.head.physical_height = mode.height;
        Ok(())
    }

    /// Render the next frame. Refuses while disabled or while a fence
    /// wait is outstanding; backpressure from the pool drops the frame.
    pub fn repaint(&mut self) -> Result<RenderedFrame> {
        if !self.state.enabled {
            return Err(CoreError::OutputNotFound(self.state.id));
        }
        if self.fence_pending {
            return Err(CoreError::NoFreeBuffers);
        }
        self.backend.repaint(&self.state)
    }

    pub fn create_fence_fd(&mut self) -> Option<OwnedFd> {
        self.backend.create_fence_fd(&self.state)
    }

    pub fn start_repaint_loop(&mut self) {
        self.backend.start_repaint_loop(&self.state);
    }

    pub fn finish_frame(&mut self) {
        self.backend.finish_frame(&self.state);
    }

    /// Tear down: modes, head and backend state. The caller unlinks the
    /// output from the registry and cancels its timer.
    pub fn destroy(&mut self) {
        self.disable();
        self.state.modes.clear();
        self.backend.destroy(&self.state);
        tracing::info!(
            "released head '{}' of output '{}'",
            self.head.connector_name,
            self.state.name
        );
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::memfd::MemfdAllocator;
    use crate::core::renderer::SoftwareRenderer;

    fn headless_backend(width: u32, height: u32, slots: usize) -> Box<RenderBackend> {
        let allocator = Rc::new(MemfdAllocator::new(width, height, slots).unwrap());
        Box::new(RenderBackend::new(
            allocator,
            Box::new(SoftwareRenderer::for_output(0)),
            TargetKind::Memfd,
        ))
    }

    fn virtual_output(slots: usize) -> VirtualOutput {
        VirtualOutput::new(1, "virt-1", "8x8@60", headless_backend(8, 8, slots)).unwrap()
    }

    #[test]
    fn test_enable_requires_armed_submit_hook() {
        let mut vo = virtual_output(2);
        assert!(matches!(vo.enable(), Err(CoreError::SubmitHookMissing(_))));
        vo.arm_submit();
        vo.enable().unwrap();
        assert!(vo.is_enabled());
    }

    #[test]
    fn test_disable_is_idempotent() {
        let mut vo = virtual_output(2);
        vo.arm_submit();
        vo.enable().unwrap();
        vo.disable();
        assert!(!vo.is_enabled());
        vo.disable();
        assert!(!vo.is_enabled());
    }

    #[test]
    fn test_repaint_retires_previous_frame_reference() {
        let mut vo = virtual_output(3);
        vo.arm_submit();
        vo.enable().unwrap();

        let first = vo.repaint().unwrap();
        // Ring slot + submission reference.
        assert_eq!(first.fb.refcount(), 2);
        first.fb.unref();

        let second = vo.repaint().unwrap();
        assert_eq!(second.fb.refcount(), 2);
        second.fb.unref();
    }

    #[test]
    fn test_exhausted_pool_drops_frame_and_keeps_previous() {
        let mut vo = VirtualOutput::new(1, "virt-1", "8x8", headless_backend(8, 8, 1)).unwrap();
        vo.arm_submit();
        vo.enable().unwrap();

        let frame = vo.repaint().unwrap();
        // The only slot is locked by the in-flight frame; the next
        // repaint must fail without touching reference counts.
        let refs_before = frame.fb.refcount();
        assert!(matches!(vo.repaint(), Err(CoreError::NoFreeBuffers)));
        assert_eq!(frame.fb.refcount(), refs_before);
        frame.fb.unref();
    }

    #[test]
    fn test_repaint_blocked_while_fence_pending() {
        let mut vo = virtual_output(3);
        vo.arm_submit();
        vo.enable().unwrap();
        vo.fence_pending = true;
        assert!(vo.repaint().is_err());
    }

    #[test]
    fn test_set_mode_updates_head_physical_size() {
        let mut vo = virtual_output(2);
        vo.set_mode("1024x768@30").unwrap();
        assert_eq!(vo.state.width(), 1024);
        assert_eq!(vo.head.physical_width, 1024);
        assert_eq!(vo.head.physical_height, 768);
        assert_eq!(vo.state.modes.len(), 2);
        assert!(vo.set_mode("nope").is_err());
    }
}
