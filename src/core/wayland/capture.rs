//! tioga_capture_v1 protocol implementation.
//!
//! One request, two events. `capture` binds an output to a destination
//! buffer; `done` announces a completed copy and `frame_done` the end of
//! a presentation period. Both events go to every bound session, not
//! only the requester.

use wayland_server::{Dispatch, DisplayHandle, GlobalDispatch, Resource};

use crate::core::state::ServerState;
use crate::core::wayland::output::OutputGlobal;
use crate::core::wayland::protocol::server::tioga_capture_v1::{self, TiogaCaptureV1};

impl GlobalDispatch<TiogaCaptureV1, ()> for ServerState {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<TiogaCaptureV1>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let session = data_init.init(resource, ());
        tracing::info!(
            "capture session opened by client {:?}",
            session.client().map(|c| c.id())
        );
        state.capture.add_session(session);
    }
}

impl Dispatch<TiogaCaptureV1, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &TiogaCaptureV1,
        request: tioga_capture_v1::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let tioga_capture_v1::Request::Capture { output, buffer } = request;

        // A request against an output we cannot serve must fail loudly;
        // silently dropping it would leave the requester waiting on a
        // done event that never comes.
        let Some(global) = output.data::<OutputGlobal>() else {
            resource.post_error(
                tioga_capture_v1::Error::InvalidOutput,
                "wl_output was not created by this compositor",
            );
            return;
        };
        let output_id = global.output_id;
        if state.output(output_id).is_none() {
            resource.post_error(
                tioga_capture_v1::Error::InvalidOutput,
                format!("output {output_id} no longer exists"),
            );
            return;
        }

        let buffer_id = buffer.id().protocol_id();
        if !state.shm.buffers.contains_key(&buffer_id) {
            resource.post_error(
                tioga_capture_v1::Error::InvalidBuffer,
                format!("wl_buffer {buffer_id} is not a known shm buffer"),
            );
            return;
        }

        state.capture.bind(output_id, buffer_id);
        state.damage_output(output_id);
        tracing::debug!("capture armed: output {} -> buffer {}", output_id, buffer_id);
    }
}
