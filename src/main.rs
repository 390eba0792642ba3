use std::rc::Rc;

use anyhow::Result;
use tioga::config::ServerConfig;
use tioga::core::buffer::memfd::MemfdAllocator;
use tioga::core::capture;
use tioga::core::capture::virtual_output::{RenderBackend, VirtualOutput};
use tioga::core::output::parse_modeline;
use tioga::core::renderer::{SoftwareRenderer, TargetKind};
use tioga::core::wayland::register_globals;
use tioga::core::{Compositor, EventLoop, ServerState};

fn main() -> Result<()> {
    // Initialize logging
    // Set default log level to info
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,tioga=debug");
    }
    // Initialize logging with standardized format
    tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
            "%Y-%m-%d %H:%M:%S".to_string(),
        ))
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ServerConfig::from_env()?;
    let mut compositor = Compositor::new(&config.socket_name)?;
    let mut state = ServerState::new();
    let mut el = EventLoop::new();

    // One headless pool and software renderer per configured output.
    for (index, output_config) in config.outputs.iter().enumerate() {
        let id = index as u32 + 1;
        let mode = parse_modeline(&output_config.modeline)?;
        let allocator = Rc::new(MemfdAllocator::new(
            mode.width,
            mode.height,
            MemfdAllocator::DEFAULT_SLOTS,
        )?);
        let backend = Box::new(RenderBackend::new(
            allocator,
            Box::new(SoftwareRenderer::for_output(id)),
            TargetKind::Memfd,
        ));
        let mut output =
            VirtualOutput::new(id, output_config.name.clone(), &output_config.modeline, backend)?;
        output.arm_submit();
        state.add_output(output);
    }

    register_globals(&compositor.display_handle(), &state);

    let output_ids: Vec<u32> = state.outputs.iter().map(|o| o.state.id).collect();
    for id in output_ids {
        capture::enable_output(&mut state, &mut el, id)?;
        capture::start_repaint_loop(&mut state, &mut el, id);
    }

    tracing::info!(
        "tioga ready: {} outputs on '{}'",
        state.outputs.len(),
        compositor.socket_name()
    );
    compositor.run(&mut state, &mut el)?;
    Ok(())
}
