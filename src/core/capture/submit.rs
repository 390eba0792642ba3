//! Frame submission and fence handling.
//!
//! A repaint produces a frame that the GPU may still be writing. Submission
//! registers the renderer's fence fd with the event loop; when it signals,
//! the handler copies the finished pixels into the client's bound shm
//! buffer and announces completion on every capture session; a copy that
//! cannot be carried out is reported on the sessions as a protocol error
//! instead. Without a fence the frame is complete at submit time and
//! nothing is copied out.
//!
//! The wait carries its own context (output id, frame reference, exported
//! frame fd and plane geometry) so a signal arriving after the output went
//! away still reclaims every resource without touching dead state.

use std::os::unix::io::{AsRawFd, OwnedFd};

use crate::core::buffer::dmabuf::{cpu_read_begin, cpu_read_end};
use crate::core::buffer::Framebuffer;
use crate::core::errors::CoreError;
use crate::core::event_loop::{EventLoop, PollAction};
use crate::core::state::ServerState;

use super::virtual_output::RenderedFrame;

/// Everything a fence signal needs, captured at submit time.
struct FenceWait {
    output_id: u32,
    /// The submission reference; dropped exactly once when the wait ends.
    fb: Framebuffer,
    frame_fd: OwnedFd,
    width: u32,
    height: u32,
    stride: u32,
}

// ============================================================================
// Repaint scheduling
// ============================================================================

/// Render and submit every damaged output. A pool with no free buffers
/// drops the frame but keeps the damage, so the next pass retries.
pub fn repaint_damaged(state: &mut ServerState, el: &mut EventLoop<ServerState>) {
    let due: Vec<u32> = state
        .outputs
        .iter()
        .filter(|o| o.is_enabled() && o.damaged && !o.fence_pending)
        .map(|o| o.state.id)
        .collect();

    for output_id in due {
        let Some(output) = state.output_mut(output_id) else {
            continue;
        };
        match output.repaint() {
            Ok(frame) => {
                output.damaged = false;
                submit_frame(state, el, output_id, frame);
            }
            Err(CoreError::NoFreeBuffers) => {
                tracing::trace!("output {}: repaint deferred, pool exhausted", output_id);
            }
            Err(err) => {
                tracing::warn!("output {}: repaint failed: {}", output_id, err);
            }
        }
    }
}

// ============================================================================
// Submission
// ============================================================================

/// Hand a rendered frame to the completion machinery.
pub fn submit_frame(
    state: &mut ServerState,
    el: &mut EventLoop<ServerState>,
    output_id: u32,
    frame: RenderedFrame,
) {
    let Some(output) = state.output_mut(output_id) else {
        frame.fb.unref();
        return;
    };

    let Some(fence_fd) = output.create_fence_fd() else {
        // No fence means the renderer finished synchronously. The frame
        // counts for pacing but there is nothing to wait on or copy out.
        tracing::trace!("output {}: frame complete without fence", output_id);
        output.submitted_frame = true;
        frame.fb.unref();
        return;
    };

    output.fence_pending = true;

    let raw = fence_fd.as_raw_fd();
    let mut wait = Some(FenceWait {
        output_id,
        fb: frame.fb,
        frame_fd: frame.fd,
        width: frame.width,
        height: frame.height,
        stride: frame.stride,
    });
    el.add_fd(raw, move |state: &mut ServerState| {
        // One-shot: the fence fd lives in the closure and is closed by
        // the Remove below.
        let _fence = &fence_fd;
        if let Some(wait) = wait.take() {
            fence_signaled(state, wait);
        }
        PollAction::Remove
    });
}

// ============================================================================
// Fence completion
// ============================================================================

fn fence_signaled(state: &mut ServerState, wait: FenceWait) {
    let Some(output) = state.output_mut(wait.output_id) else {
        // Output destroyed while the GPU was still writing. Nothing to
        // notify; just let the frame go.
        wait.fb.unref();
        return;
    };
    if !output.is_enabled() {
        output.fence_pending = false;
        wait.fb.unref();
        return;
    }
    output.fence_pending = false;
    output.submitted_frame = true;

    // The binding is a mailbox: taken on completion, re-armed by the
    // client's next capture request.
    let bound = match state.capture.bound {
        Some(b) if b.output_id == wait.output_id => {
            state.capture.bound = None;
            Some(b)
        }
        _ => None,
    };

    if let Some(bound) = bound {
        match copy_frame(state, &wait, bound.buffer_id) {
            Ok(()) => state.capture.broadcast_done(),
            Err(err) => {
                tracing::warn!(
                    "output {}: frame copy into buffer {} failed: {}",
                    wait.output_id,
                    bound.buffer_id,
                    err
                );
                state.capture.fail_capture(&format!(
                    "buffer {} cannot take the captured frame: {}",
                    bound.buffer_id, err
                ));
            }
        }
    }

    wait.fb.unref();
}

/// Copy the completed frame into a client shm buffer, row by row so the
/// two strides may differ. Mismatched sizes copy the overlapping region.
fn copy_frame(state: &mut ServerState, wait: &FenceWait, buffer_id: u32) -> crate::prelude::Result<()> {
    let buffer = state
        .shm
        .buffers
        .get(&buffer_id)
        .copied()
        .ok_or_else(|| CoreError::protocol(format!("shm buffer {buffer_id} is gone")))?;
    let pool = state
        .shm
        .pools
        .get_mut(&buffer.pool_id)
        .ok_or_else(|| CoreError::protocol(format!("shm pool {} is gone", buffer.pool_id)))?;
    let pool_size = pool.size;
    let dst_base = pool
        .map()
        .ok_or_else(|| CoreError::allocation("shm pool mmap failed"))?;

    let rows = wait.height.min(buffer.height.max(0) as u32) as usize;
    let src_stride = wait.stride as usize;
    let dst_stride = buffer.stride.max(0) as usize;
    let row_bytes = (wait.width.min(buffer.width.max(0) as u32) as usize * 4)
        .min(src_stride)
        .min(dst_stride);
    let offset = buffer.offset.max(0) as usize;
    if rows == 0 || row_bytes == 0 {
        return Ok(());
    }
    if offset + (rows - 1) * dst_stride + row_bytes > pool_size {
        return Err(CoreError::protocol(format!(
            "buffer {buffer_id} exceeds its pool ({pool_size} bytes)"
        )));
    }

    let src_len = src_stride * wait.height as usize;
    cpu_read_begin(wait.frame_fd.as_raw_fd());
    let src_base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            src_len,
            libc::PROT_READ,
            libc::MAP_SHARED,
            wait.frame_fd.as_raw_fd(),
            0,
        )
    };
    if src_base == libc::MAP_FAILED {
        cpu_read_end(wait.frame_fd.as_raw_fd());
        return Err(CoreError::allocation(format!(
            "frame mmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    for row in 0..rows {
        unsafe {
            std::ptr::copy_nonoverlapping(
                (src_base as *const u8).add(row * src_stride),
                dst_base.add(offset + row * dst_stride),
                row_bytes,
            );
        }
    }

    unsafe {
        libc::munmap(src_base, src_len);
    }
    cpu_read_end(wait.frame_fd.as_raw_fd());

    tracing::debug!(
        "output {}: copied {}x{} frame into shm buffer {}",
        wait.output_id,
        row_bytes / 4,
        rows,
        buffer_id
    );
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
