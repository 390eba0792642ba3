//! Snapshot client.
//!
//! Connects to the compositor, discovers its outputs, captures each one
//! sequentially into an shm buffer, then stitches the results and writes
//! a timestamped PNG. Outputs are captured one at a time because the
//! server holds a single capture binding; a second request would simply
//! displace the first.

use std::io::Read;
use std::os::unix::io::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use wayland_client::{
    protocol::{wl_buffer, wl_output, wl_registry, wl_shm, wl_shm_pool},
    Connection, Dispatch, QueueHandle, WEnum,
};

use crate::config::SnapConfig;
use crate::core::wayland::protocol::client::tioga_capture_v1::{self, TiogaCaptureV1};

use super::layout::{assign_offsets, compute_buffer_size, OutputRect};
use super::stitch::{stitch, xrgb_to_rgba, CapturedOutput};

struct OutputHandle {
    proxy: wl_output::WlOutput,
    rect: OutputRect,
}

#[derive(Default)]
struct SnapshotApp {
    shm: Option<wl_shm::WlShm>,
    capture: Option<TiogaCaptureV1>,
    outputs: Vec<OutputHandle>,
    done_count: u32,
    frame_count: u32,
}

// ============================================================================
// Dispatch
// ============================================================================

impl Dispatch<wl_registry::WlRegistry, ()> for SnapshotApp {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        if let wl_registry::Event::Global {
            name,
            interface,
            version,
        } = event
        {
            match &interface[..] {
                "wl_output" => {
                    let index = state.outputs.len();
                    let proxy = registry.bind(name, version.min(4), qh, index);
                    state.outputs.push(OutputHandle {
                        proxy,
                        rect: OutputRect::default(),
                    });
                }
                "wl_shm" => {
                    state.shm = Some(registry.bind(name, 1, qh, ()));
                }
                "tioga_capture_v1" => {
                    state.capture = Some(registry.bind(name, 1, qh, ()));
                }
                _ => {}
            }
        }
    }
}

impl Dispatch<wl_output::WlOutput, usize> for SnapshotApp {
    fn event(
        state: &mut Self,
        _: &wl_output::WlOutput,
        event: wl_output::Event,
        index: &usize,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let Some(handle) = state.outputs.get_mut(*index) else {
            return;
        };
        match event {
            wl_output::Event::Geometry { x, y, .. } => {
                // The x offset is recomputed by the layout pass; y is
                // trusted as announced.
                handle.rect.offset_x = x;
                handle.rect.offset_y = y;
            }
            wl_output::Event::Mode {
                flags,
                width,
                height,
                ..
            } => {
                if let WEnum::Value(flags) = flags {
                    if flags.contains(wl_output::Mode::Current) {
                        handle.rect.width = width.max(0) as u32;
                        handle.rect.height = height.max(0) as u32;
                    }
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_shm::WlShm, ()> for SnapshotApp {
    fn event(
        _: &mut Self,
        _: &wl_shm::WlShm,
        _: wl_shm::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_shm_pool::WlShmPool, ()> for SnapshotApp {
    fn event(
        _: &mut Self,
        _: &wl_shm_pool::WlShmPool,
        _: wl_shm_pool::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_buffer::WlBuffer, ()> for SnapshotApp {
    fn event(
        _: &mut Self,
        _: &wl_buffer::WlBuffer,
        _: wl_buffer::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<TiogaCaptureV1, ()> for SnapshotApp {
    fn event(
        state: &mut Self,
        _: &TiogaCaptureV1,
        event: tioga_capture_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            tioga_capture_v1::Event::Done => {
                state.done_count += 1;
                tracing::debug!("capture done ({})", state.done_count);
            }
            tioga_capture_v1::Event::FrameDone => {
                state.frame_count += 1;
            }
        }
    }
}

// ============================================================================
// Capture run
// ============================================================================

/// Take one snapshot of every output and return the written PNG path.
pub fn run(config: &SnapConfig) -> Result<PathBuf> {
    let conn = Connection::connect_to_env().context("failed to connect to Wayland display")?;
    let mut queue = conn.new_event_queue();
    let qh = queue.handle();
    let _registry = conn.display().get_registry(&qh, ());

    let mut app = SnapshotApp::default();
    // First pass announces globals, second delivers output geometry.
    queue.roundtrip(&mut app).context("registry roundtrip failed")?;
    queue.roundtrip(&mut app).context("output info roundtrip failed")?;

    let Some(shm) = app.shm.clone() else {
        bail!("compositor does not advertise wl_shm");
    };
    let Some(capture) = app.capture.clone() else {
        bail!("compositor does not advertise tioga_capture_v1");
    };
    if app.outputs.is_empty() {
        bail!("compositor has no outputs");
    }

    let mut rects: Vec<OutputRect> = app.outputs.iter().map(|o| o.rect).collect();
    assign_offsets(&mut rects);
    for (handle, rect) in app.outputs.iter_mut().zip(&rects) {
        handle.rect = *rect;
    }
    let size = compute_buffer_size(&rects)?;
    tracing::info!(
        "capturing {} outputs into a {}x{} snapshot",
        rects.len(),
        size.width,
        size.height
    );

    let mut captures = Vec::with_capacity(app.outputs.len());
    for index in 0..app.outputs.len() {
        let rect = app.outputs[index].rect;
        let stride = rect.width * 4;
        let bytes = (stride * rect.height) as usize;

        let fd = create_shm_fd(bytes)?;
        let pool = shm.create_pool(fd.as_fd(), bytes as i32, &qh, ());
        let buffer = pool.create_buffer(
            0,
            rect.width as i32,
            rect.height as i32,
            stride as i32,
            wl_shm::Format::Xrgb8888,
            &qh,
            (),
        );

        let target = app.done_count + 1;
        capture.capture(&app.outputs[index].proxy, &buffer);
        while app.done_count < target {
            queue
                .blocking_dispatch(&mut app)
                .context("dispatch while awaiting capture")?;
        }

        let mut pixels = vec![0u8; bytes];
        let mut file = std::fs::File::from(fd);
        file.read_exact(&mut pixels)
            .context("failed to read captured pixels")?;

        buffer.destroy();
        pool.destroy();
        captures.push(CapturedOutput {
            rect,
            stride,
            pixels,
        });
        tracing::debug!("output {} captured ({}x{})", index, rect.width, rect.height);
    }

    let stitched = stitch(&captures, &size);
    let rgba = xrgb_to_rgba(&stitched);

    let filename = format!(
        "tioga-snapshot-{}.png",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    );
    let path = config.output_dir.join(filename);
    image::save_buffer(
        &path,
        &rgba,
        size.width,
        size.height,
        image::ExtendedColorType::Rgba8,
    )
    .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!("snapshot written to {}", path.display());
    Ok(path)
}

/// Anonymous shm file of the given size for one destination buffer.
fn create_shm_fd(size: usize) -> Result<OwnedFd> {
    let raw = unsafe { libc::memfd_create(c"tioga-snap".as_ptr(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        bail!("memfd_create failed: {}", std::io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
        bail!("ftruncate failed: {}", std::io::Error::last_os_error());
    }
    Ok(fd)
}
