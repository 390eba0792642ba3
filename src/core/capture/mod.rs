//! Capture pipeline.
//!
//! Virtual outputs render into allocator-owned buffers; completed frames
//! are fenced, copied into the client's bound shm buffer and announced on
//! every live capture session. Split into:
//!
//! - `virtual_output` - per-output lifecycle and the rendering backend
//! - `submit` - frame submission, fence waits and the copy-out path

pub mod submit;
pub mod virtual_output;

use crate::core::errors::Result;
use crate::core::event_loop::EventLoop;
use crate::core::state::ServerState;
use crate::core::wayland::protocol::server::tioga_capture_v1::{self, TiogaCaptureV1};

use wayland_server::Resource;

// ============================================================================
// CaptureState
// ============================================================================

/// The single capture binding: which output feeds which client buffer.
/// A new capture request simply replaces it; the last writer wins.
#[derive(Debug, Clone, Copy)]
pub struct BoundCapture {
    pub output_id: u32,
    pub buffer_id: u32,
}

/// Capture sessions and the current binding.
#[derive(Default)]
pub struct CaptureState {
    sessions: Vec<TiogaCaptureV1>,
    pub bound: Option<BoundCapture>,
}

impl CaptureState {
    pub fn add_session(&mut self, session: TiogaCaptureV1) {
        self.sessions.push(session);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Bind an output to a destination buffer, displacing any previous
    /// binding.
    pub fn bind(&mut self, output_id: u32, buffer_id: u32) {
        if let Some(prev) = self.bound.replace(BoundCapture {
            output_id,
            buffer_id,
        }) {
            tracing::debug!(
                "capture rebound: output {} buffer {} displaces output {} buffer {}",
                output_id,
                buffer_id,
                prev.output_id,
                prev.buffer_id
            );
        }
    }

    fn prune_dead_sessions(&mut self) {
        self.sessions.retain(|s| s.is_alive());
    }

    /// A captured frame landed in the bound buffer. Sent to every live
    /// session, requester or not.
    pub fn broadcast_done(&mut self) {
        self.prune_dead_sessions();
        for session in &self.sessions {
            session.done();
        }
    }

    /// A presentation period with a real frame elapsed. Same fan-out as
    /// `broadcast_done`.
    pub fn broadcast_frame_done(&mut self) {
        self.prune_dead_sessions();
        for session in &self.sessions {
            session.frame_done();
        }
    }

    /// The bound copy could not be carried out. Posted as a protocol
    /// error on every live session so no requester waits on a done event
    /// that will never come.
    pub fn fail_capture(&mut self, description: &str) {
        self.prune_dead_sessions();
        for session in &self.sessions {
            session.post_error(tioga_capture_v1::Error::InvalidBuffer, description);
        }
    }
}

// ============================================================================
// Output control
// ============================================================================

/// Enable an output and start its finish-frame pacing timer.
pub fn enable_output(
    state: &mut ServerState,
    el: &mut EventLoop<ServerState>,
    output_id: u32,
) -> Result<()> {
    let output = state
        .output_mut(output_id)
        .ok_or(crate::core::errors::CoreError::OutputNotFound(output_id))?;
    output.enable()?;
    let interval = output.state.current_mode.frame_interval();

    // The timer ticks once per presentation period. It only reports a
    // frame when one was actually submitted since the last tick, and it
    // cancels itself once its output is gone.
    let timer = el.add_timer(interval, move |state: &mut ServerState| {
        let Some(output) = state.output_mut(output_id) else {
            return None;
        };
        if !output.is_enabled() {
            return None;
        }
        let interval = output.state.current_mode.frame_interval();
        if output.submitted_frame {
            output.submitted_frame = false;
            output.finish_frame();
            state.capture.broadcast_frame_done();
        }
        Some(interval)
    });

    let output = state
        .output_mut(output_id)
        .ok_or(crate::core::errors::CoreError::OutputNotFound(output_id))?;
    output.finish_frame_timer = Some(timer);
    output.damaged = true;
    tracing::info!("output {} enabled, frame interval {:?}", output_id, interval);
    Ok(())
}

/// Kick off the repaint loop: everything stale, first frame due one
/// refresh interval out.
pub fn start_repaint_loop(
    state: &mut ServerState,
    el: &mut EventLoop<ServerState>,
    output_id: u32,
) {
    if let Some(output) = state.output_mut(output_id) {
        output.start_repaint_loop();
        output.damaged = true;
        if let Some(timer) = output.finish_frame_timer {
            el.update_timer(timer, output.state.current_mode.frame_interval());
        }
    }
}

/// Disable an output and cancel its pacing timer. An in-flight fence
/// wait is left to drain on its own; the fence handler finds the output
/// disabled and only reclaims resources.
pub fn disable_output(
    state: &mut ServerState,
    el: &mut EventLoop<ServerState>,
    output_id: u32,
) {
    if let Some(output) = state.output_mut(output_id) {
        if let Some(timer) = output.finish_frame_timer.take() {
            el.remove_timer(timer);
        }
        output.disable();
        tracing::info!("output {} disabled", output_id);
    }
}

/// Tear an output down completely and unlink it from the registry.
pub fn destroy_output(
    state: &mut ServerState,
    el: &mut EventLoop<ServerState>,
    output_id: u32,
) {
    disable_output(state, el, output_id);
    if let Some(index) = state.outputs.iter().position(|o| o.state.id == output_id) {
        let mut output = state.outputs.remove(index);
        output.destroy();
    }
    // A binding against the dead output will never complete.
    if state
        .capture
        .bound
        .is_some_and(|b| b.output_id == output_id)
    {
        state.capture.bound = None;
    }
}

// ============================================================================
// Tests
// ============================================================================
