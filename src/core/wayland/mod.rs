//! Wayland protocol layer.
//!
//! Globals advertised to clients: one wl_output per virtual output,
//! wl_shm for destination buffers, and the capture extension itself.
//! Dispatch implementations live next to the state they mutate.

pub mod capture;
pub mod output;
pub mod protocol;
pub mod shm;

use wayland_server::protocol::{wl_output::WlOutput, wl_shm::WlShm};
use wayland_server::DisplayHandle;

use crate::core::state::ServerState;
use output::OutputGlobal;
use protocol::server::tioga_capture_v1::TiogaCaptureV1;

/// Advertise every global. Output globals live as long as the server;
/// outputs are not hotplugged at runtime.
pub fn register_globals(dh: &DisplayHandle, state: &ServerState) {
    for output in &state.outputs {
        dh.create_global::<ServerState, WlOutput, _>(4, OutputGlobal::new(output.state.id));
    }
    dh.create_global::<ServerState, WlShm, _>(1, ());
    dh.create_global::<ServerState, TiogaCaptureV1, _>(1, ());
    tracing::info!(
        "registered globals: {} wl_output, wl_shm, tioga_capture_v1",
        state.outputs.len()
    );
}

// ============================================================================
// Tests
// ============================================================================

// The dispatch layer only shows its behavior over a live connection, so
// these tests run a real client against the server over a socketpair,
// stepping both ends by hand instead of blocking on either side.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::memfd::MemfdAllocator;
    use crate::core::capture;
    use crate::core::capture::submit;
    use crate::core::capture::virtual_output::{RenderBackend, VirtualOutput};
    use crate::core::compositor::TiogaClientData;
    use crate::core::event_loop::EventLoop;
    use crate::core::renderer::{SoftwareRenderer, TargetKind};
    use crate::core::wayland::protocol::client::tioga_capture_v1 as capture_proto;

    use std::os::unix::io::{AsFd, AsRawFd, FromRawFd, OwnedFd};
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::time::Duration;

    use wayland_client::protocol::{wl_buffer, wl_output, wl_registry, wl_shm, wl_shm_pool};
    use wayland_client::{Connection, Dispatch, QueueHandle};

    const W: u32 = 8;
    const H: u32 = 8;

    #[derive(Default)]
    struct TestClient {
        shm: Option<wl_shm::WlShm>,
        capture: Option<capture_proto::TiogaCaptureV1>,
        outputs: Vec<wl_output::WlOutput>,
        done: u32,
    }

    impl Dispatch<wl_registry::WlRegistry, ()> for TestClient {
        fn event(
            state: &mut Self,
            registry: &wl_registry::WlRegistry,
            event: wl_registry::Event,
            _: &(),
            _: &Connection,
            qh: &QueueHandle<Self>,
        ) {
            if let wl_registry::Event::Global {
                name, interface, ..
            } = event
            {
                match &interface[..] {
                    "wl_output" => state.outputs.push(registry.bind(name, 4, qh, ())),
                    "wl_shm" => state.shm = Some(registry.bind(name, 1, qh, ())),
                    "tioga_capture_v1" => state.capture = Some(registry.bind(name, 1, qh, ())),
                    _ => {}
                }
            }
        }
    }

    impl Dispatch<wl_output::WlOutput, ()> for TestClient {
        fn event(
            _: &mut Self,
            _: &wl_output::WlOutput,
            _: wl_output::Event,
            _: &(),
            _: &Connection,
            _: &QueueHandle<Self>,
        ) {
        }
    }

    impl Dispatch<wl_shm::WlShm, ()> for TestClient {
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

    impl Dispatch<wl_shm_pool::WlShmPool, ()> for TestClient {
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

    impl Dispatch<wl_buffer::WlBuffer, ()> for TestClient {
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

    impl Dispatch<capture_proto::TiogaCaptureV1, ()> for TestClient {
        fn event(
            state: &mut Self,
            _: &capture_proto::TiogaCaptureV1,
            event: capture_proto::Event,
            _: &(),
            _: &Connection,
            _: &QueueHandle<Self>,
        ) {
            match event {
                capture_proto::Event::Done => state.done += 1,
                capture_proto::Event::FrameDone => {}
            }
        }
    }

    struct Harness {
        display: wayland_server::Display<ServerState>,
        state: ServerState,
        el: EventLoop<ServerState>,
        conn: Connection,
        queue: wayland_client::EventQueue<TestClient>,
        app: TestClient,
    }

    impl Harness {
        /// Step both ends a few times: client requests out, server
        /// dispatch, server events back, client dispatch.
        fn pump(&mut self) -> Result<(), wayland_client::DispatchError> {
            for _ in 0..8 {
                let _ = self.conn.flush();
                let _ = self.display.dispatch_clients(&mut self.state);
                let _ = self.display.flush_clients();
                if let Some(guard) = self.conn.prepare_read() {
                    let _ = guard.read();
                }
                self.queue.dispatch_pending(&mut self.app)?;
            }
            Ok(())
        }

        fn drain_fences(&mut self) {
            while self.el.source_count() > 0 {
                self.el
                    .dispatch(Some(Duration::from_millis(100)), &mut self.state)
                    .unwrap();
            }
        }
    }

    fn memfd(size: usize) -> OwnedFd {
        let raw = unsafe { libc::memfd_create(c"tioga-test".as_ptr(), libc::MFD_CLOEXEC) };
        assert!(raw >= 0);
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        assert_eq!(
            unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) },
            0
        );
        fd
    }

    fn connect() -> Harness {
        let allocator = Rc::new(MemfdAllocator::new(W, H, 3).unwrap());
        let backend = Box::new(RenderBackend::new(
            allocator,
            Box::new(SoftwareRenderer::for_output(1)),
            TargetKind::Memfd,
        ));
        let mut output = VirtualOutput::new(1, "virt-1", "8x8@60", backend).unwrap();
        output.arm_submit();
        let mut state = ServerState::new();
        state.add_output(output);

        let display = wayland_server::Display::<ServerState>::new().unwrap();
        let mut dh = display.handle();
        register_globals(&dh, &state);
        let mut el = EventLoop::new();
        capture::enable_output(&mut state, &mut el, 1).unwrap();

        let (server_stream, client_stream) = UnixStream::pair().unwrap();
        client_stream.set_nonblocking(true).unwrap();
        dh.insert_client(server_stream, Arc::new(TiogaClientData::new(1)))
            .unwrap();

        let conn = Connection::from_socket(client_stream).unwrap();
        let queue = conn.new_event_queue();
        let qh = queue.handle();
        let _registry = conn.display().get_registry(&qh, ());

        let mut harness = Harness {
            display,
            state,
            el,
            conn,
            queue,
            app: TestClient::default(),
        };
        harness.pump().unwrap();
        assert!(harness.app.shm.is_some());
        assert!(harness.app.capture.is_some());
        assert_eq!(harness.app.outputs.len(), 1);
        harness
    }

    fn create_buffer(
        h: &mut Harness,
        declared_size: usize,
        fd_size: usize,
    ) -> (wl_shm_pool::WlShmPool, wl_buffer::WlBuffer) {
        let qh = h.queue.handle();
        let shm = h.app.shm.clone().unwrap();
        let fd = memfd(fd_size);
        let pool = shm.create_pool(fd.as_fd(), declared_size as i32, &qh, ());
        let buffer = pool.create_buffer(
            0,
            W as i32,
            H as i32,
            (W * 4) as i32,
            wl_shm::Format::Xrgb8888,
            &qh,
            (),
        );
        (pool, buffer)
    }

    #[test]
    fn test_capture_done_reaches_client() {
        let mut h = connect();
        let size = (W * 4 * H) as usize;
        let (_pool, buffer) = create_buffer(&mut h, size, size);
        let capture_obj = h.app.capture.clone().unwrap();
        let output = h.app.outputs[0].clone();
        capture_obj.capture(&output, &buffer);
        h.pump().unwrap();
        assert!(h.state.capture.bound.is_some());

        submit::repaint_damaged(&mut h.state, &mut h.el);
        h.drain_fences();
        h.pump().unwrap();

        assert_eq!(h.app.done, 1);
        assert!(h.conn.protocol_error().is_none());
    }

    #[test]
    fn test_failed_copy_posts_protocol_error() {
        let mut h = connect();
        // The pool declares no storage; the copy into its buffer cannot
        // succeed once the frame completes.
        let (_pool, buffer) = create_buffer(&mut h, 0, 0);
        let capture_obj = h.app.capture.clone().unwrap();
        let output = h.app.outputs[0].clone();
        capture_obj.capture(&output, &buffer);
        h.pump().unwrap();
        assert!(h.state.capture.bound.is_some());

        submit::repaint_damaged(&mut h.state, &mut h.el);
        h.drain_fences();
        assert!(h.state.capture.bound.is_none());

        // The client must not be left waiting: no done event, a protocol
        // error instead.
        let _ = h.pump();
        assert_eq!(h.app.done, 0);
        let err = h.conn.protocol_error().expect("copy failure reported");
        assert_eq!(err.code, capture_proto::Error::InvalidBuffer as u32);
        assert_eq!(err.object_interface, "tioga_capture_v1");
    }

    #[test]
    fn test_capture_of_vanished_output_posts_protocol_error() {
        let mut h = connect();
        let size = (W * 4 * H) as usize;
        let (_pool, buffer) = create_buffer(&mut h, size, size);
        capture::destroy_output(&mut h.state, &mut h.el, 1);

        let capture_obj = h.app.capture.clone().unwrap();
        let output = h.app.outputs[0].clone();
        capture_obj.capture(&output, &buffer);
        let _ = h.pump();

        assert_eq!(h.app.done, 0);
        let err = h.conn.protocol_error().expect("dead output reported");
        assert_eq!(err.code, capture_proto::Error::InvalidOutput as u32);
        assert_eq!(err.object_interface, "tioga_capture_v1");
    }

    #[test]
    fn test_pool_storage_released_via_protocol() {
        let mut h = connect();
        let size = (W * 4 * H) as usize;
        let (pool, buffer) = create_buffer(&mut h, size, size);
        h.pump().unwrap();
        assert_eq!(h.state.shm.pools.len(), 1);
        assert_eq!(h.state.shm.buffers.len(), 1);

        // Destroying the pool first must keep the storage for its buffer.
        pool.destroy();
        h.pump().unwrap();
        assert_eq!(h.state.shm.pools.len(), 1);

        buffer.destroy();
        h.pump().unwrap();
        assert!(h.state.shm.buffers.is_empty());
        assert!(h.state.shm.pools.is_empty(), "storage released with the last buffer");
    }
}
