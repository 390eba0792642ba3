//! wl_output protocol implementation.
//!
//! Each virtual output is advertised as its own global; a bound resource
//! carries the output's id so later requests naming the resource resolve
//! to the right output directly.

use wayland_server::{
    protocol::wl_output::{self, Subpixel, Transform, WlOutput},
    Dispatch, DisplayHandle, GlobalDispatch, Resource,
};

use crate::core::capture::virtual_output::VirtualOutput;
use crate::core::state::ServerState;

/// Output global data - references an output by ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputGlobal {
    pub output_id: u32,
}

impl OutputGlobal {
    pub fn new(output_id: u32) -> Self {
        Self { output_id }
    }
}

// ============================================================================
// wl_output GlobalDispatch
// ============================================================================

impl GlobalDispatch<WlOutput, OutputGlobal> for ServerState {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<WlOutput>,
        global_data: &OutputGlobal,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let resource = data_init.init(resource, *global_data);
        tracing::debug!(
            "bound wl_output v{} for output {}",
            resource.version(),
            global_data.output_id
        );

        if let Some(output) = state.output(global_data.output_id) {
            send_output_info(&resource, output);
        } else {
            tracing::error!("wl_output bind for unknown output {}", global_data.output_id);
        }
    }
}

impl Dispatch<WlOutput, OutputGlobal> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        resource: &WlOutput,
        request: wl_output::Request,
        data: &OutputGlobal,
        _dhandle: &DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        if let wl_output::Request::Release = request {
            tracing::debug!(
                "wl_output for output {} released by client {:?}",
                data.output_id,
                resource.client().map(|c| c.id())
            );
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Send the full description to a newly bound output resource.
fn send_output_info(resource: &WlOutput, output: &VirtualOutput) {
    let state = &output.state;
    let head = &output.head;

    resource.geometry(
        state.x,
        state.y,
        head.physical_width as i32,
        head.physical_height as i32,
        Subpixel::Unknown,
        head.make.clone(),
        head.model.clone(),
        Transform::Normal,
    );

    for mode in &state.modes {
        let mut flags = wl_output::Mode::empty();
        if *mode == state.current_mode {
            flags |= wl_output::Mode::Current | wl_output::Mode::Preferred;
        }
        resource.mode(flags, mode.width as i32, mode.height as i32, mode.refresh as i32);
    }

    if resource.version() >= 2 {
        resource.scale(state.scale as i32);
    }
    if resource.version() >= 4 {
        resource.name(state.name.clone());
        resource.description(format!("{} {}", head.make, head.model));
    }
    if resource.version() >= 2 {
        resource.done();
    }
}
