//! Renderer capability surface.
//!
//! Actual pixel production (GL, scene graphs, color math) is an external
//! collaborator; the capture pipeline only needs three things from it:
//! paint the output into a CPU-visible target, hand out a fence fd that
//! becomes readable when the frame is resident, and say whether it can
//! drive a given buffer pool at all.

use std::os::unix::io::{FromRawFd, OwnedFd};

use crate::core::errors::{CoreError, Result};
use crate::core::output::OutputState;

/// Which pool a backend renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Memfd,
    Dmabuf,
}

pub trait Renderer {
    fn name(&self) -> &str;

    /// Whether this renderer can produce frames for the given pool kind.
    fn compatible_with(&self, target: TargetKind) -> bool;

    /// Paint the output's current contents into `target`.
    fn repaint(&mut self, output: &OutputState, target: &mut [u8], stride: u32) -> Result<()>;

    /// Fence fd for the last repaint, readable once the GPU is done.
    /// None means the renderer cannot fence and frames complete
    /// synchronously.
    fn create_fence_fd(&mut self, output: &OutputState) -> Option<OwnedFd>;
}

// ============================================================================
// Software renderer
// ============================================================================

/// CPU renderer for the headless path. Fills the frame with a solid
/// diagnostic color and fences with an already-signaled pipe, since CPU
/// rendering finishes before submit returns.
pub struct SoftwareRenderer {
    color: u32,
}

impl SoftwareRenderer {
    /// Color derived from the output id so every output is tellable
    /// apart in a stitched capture.
    pub fn for_output(output_id: u32) -> Self {
        const PALETTE: [u32; 4] = [0xFF2060C0, 0xFFC03030, 0xFF30A050, 0xFFB09020];
        Self {
            color: PALETTE[output_id as usize % PALETTE.len()],
        }
    }

    pub fn with_color(color: u32) -> Self {
        Self { color }
    }
}

impl Renderer for SoftwareRenderer {
    fn name(&self) -> &str {
        "software"
    }

    fn compatible_with(&self, _target: TargetKind) -> bool {
        true
    }

    fn repaint(&mut self, output: &OutputState, target: &mut [u8], stride: u32) -> Result<()> {
        let width = output.width() as usize;
        let height = output.height() as usize;
        let stride = stride as usize;
        if stride * height > target.len() {
            return Err(CoreError::allocation(format!(
                "render target too small for {}x{} (stride {})",
                width, height, stride
            )));
        }
        let bytes = self.color.to_le_bytes();
        for row in target.chunks_exact_mut(stride).take(height) {
            for px in row[..width * 4].chunks_exact_mut(4) {
                px.copy_from_slice(&bytes);
            }
        }
        Ok(())
    }

    fn create_fence_fd(&mut self, _output: &OutputState) -> Option<OwnedFd> {
        signaled_pipe()
    }
}

/// A pipe read end with one byte already written: readable immediately,
/// behaving like a fence that signaled at submit time.
fn signaled_pipe() -> Option<OwnedFd> {
    let mut fds = [0; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if ret != 0 {
        tracing::warn!("pipe2 failed: {}", std::io::Error::last_os_error());
        return None;
    }
    let wrote = unsafe { libc::write(fds[1], [0u8].as_ptr() as *const _, 1) };
    unsafe { libc::close(fds[1]) };
    if wrote != 1 {
        unsafe { libc::close(fds[0]) };
        return None;
    }
    Some(unsafe { OwnedFd::from_raw_fd(fds[0]) })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::output::{parse_modeline, OutputState};
    use std::os::unix::io::AsRawFd;

    fn output() -> OutputState {
        OutputState::new(0, "virt-0", parse_modeline("4x2").unwrap())
    }

    #[test]
    fn test_repaint_fills_every_pixel() {
        let mut renderer = SoftwareRenderer::with_color(0xFF112233);
        let mut target = vec![0u8; 4 * 2 * 4];
        renderer.repaint(&output(), &mut target, 16).unwrap();
        for px in target.chunks_exact(4) {
            assert_eq!(px, 0xFF112233u32.to_le_bytes());
        }
    }

    #[test]
    fn test_repaint_respects_stride_padding() {
        let mut renderer = SoftwareRenderer::with_color(0xFFFFFFFF);
        // Stride of 24 bytes for a 4-pixel row leaves 8 bytes untouched.
        let mut target = vec![0u8; 24 * 2];
        renderer.repaint(&output(), &mut target, 24).unwrap();
        assert_eq!(&target[16..24], &[0u8; 8]);
        assert_eq!(&target[0..4], 0xFFFFFFFFu32.to_le_bytes());
    }

    #[test]
    fn test_fence_is_immediately_readable() {
        let mut renderer = SoftwareRenderer::for_output(1);
        let fd = renderer.create_fence_fd(&output()).unwrap();
        let mut pfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, 0) };
        assert_eq!(ready, 1);
        assert_ne!(pfd.revents & libc::POLLIN, 0);
    }
}
