//! Compositor shell: display, listening socket, client connections.
//!
//! Owns the `wayland-server` display and the Unix socket clients connect
//! through, and runs the main loop that interleaves protocol dispatch
//! with the capture pipeline's repaint and fence handling.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use wayland_server::backend::{ClientData, ClientId, DisconnectReason};
use wayland_server::{Display, DisplayHandle, ListeningSocket};

use crate::core::capture::submit;
use crate::core::event_loop::{EventLoop, PollAction};
use crate::core::state::ServerState;

// ============================================================================
// Client Data
// ============================================================================

/// Per-client data stored with each Wayland connection
#[derive(Debug, Clone)]
pub struct TiogaClientData {
    /// Unique client identifier (internal)
    pub id: u32,
    /// Connection timestamp
    pub connected_at: Instant,
}

impl TiogaClientData {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            connected_at: Instant::now(),
        }
    }
}

impl ClientData for TiogaClientData {
    fn initialized(&self, client_id: ClientId) {
        tracing::info!("client {} initialized (internal id: {:?})", self.id, client_id);
    }

    fn disconnected(&self, client_id: ClientId, reason: DisconnectReason) {
        let reason_str = match reason {
            DisconnectReason::ConnectionClosed => "connection closed",
            DisconnectReason::ProtocolError(_) => "protocol error",
        };
        tracing::info!(
            "client {} disconnected: {} (internal id: {:?})",
            self.id,
            reason_str,
            client_id
        );
    }
}

// ============================================================================
// Compositor
// ============================================================================

pub struct Compositor {
    display: Display<ServerState>,
    socket: ListeningSocket,
    socket_name: String,
    next_client_id: u32,
    running: bool,
}

impl Compositor {
    /// Create the display and bind the listening socket.
    pub fn new(socket_name: &str) -> Result<Self> {
        let display = Display::new().context("failed to create Wayland display")?;

        ensure_runtime_dir()?;
        let socket = ListeningSocket::bind(socket_name)
            .with_context(|| format!("failed to bind socket '{socket_name}'"))?;
        tracing::info!("listening on socket '{}'", socket_name);

        Ok(Self {
            display,
            socket,
            socket_name: socket_name.to_string(),
            next_client_id: 1,
            running: false,
        })
    }

    /// Get the display handle for registering globals
    pub fn display_handle(&self) -> DisplayHandle {
        self.display.handle()
    }

    pub fn socket_name(&self) -> &str {
        &self.socket_name
    }

    /// Accept any pending connections.
    pub fn accept_connections(&mut self) {
        while let Ok(Some(stream)) = self.socket.accept() {
            let id = self.next_client_id;
            self.next_client_id += 1;
            match self
                .display
                .handle()
                .insert_client(stream, Arc::new(TiogaClientData::new(id)))
            {
                Ok(_) => tracing::info!("accepted client {}", id),
                Err(e) => tracing::warn!("failed to insert client: {}", e),
            }
        }
    }

    /// Dispatch pending Wayland events.
    pub fn dispatch(&mut self, state: &mut ServerState) -> Result<usize> {
        self.accept_connections();
        let dispatched = self
            .display
            .dispatch_clients(state)
            .context("failed to dispatch Wayland events")?;
        self.display
            .flush_clients()
            .context("failed to flush clients")?;
        Ok(dispatched)
    }

    /// Flush all client event queues
    pub fn flush(&mut self) -> Result<()> {
        self.display
            .flush_clients()
            .context("failed to flush clients")?;
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Main loop. Blocks in the event loop until the display fd, the
    /// listening socket, a fence fd or a pacing timer wakes it, then
    /// runs one round of dispatch, repaint and flush.
    pub fn run(&mut self, state: &mut ServerState, el: &mut EventLoop<ServerState>) -> Result<()> {
        let display_fd: RawFd = self.display.backend().poll_fd().as_raw_fd();
        let socket_fd: RawFd = self.socket.as_raw_fd();

        // Wake-only sources; the actual dispatch runs in the loop body
        // where `self` is available.
        el.add_fd(display_fd, |_| PollAction::Keep);
        el.add_fd(socket_fd, |_| PollAction::Keep);

        self.running = true;
        tracing::info!("compositor running");
        while self.running {
            el.dispatch(None, state)
                .context("event loop dispatch failed")?;
            self.dispatch(state)?;
            submit::repaint_damaged(state, el);
            self.flush()?;
        }
        Ok(())
    }
}

/// Ensure XDG_RUNTIME_DIR exists with proper permissions.
fn ensure_runtime_dir() -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        if std::fs::metadata(&dir).is_ok() {
            return Ok(());
        }
        anyhow::bail!("XDG_RUNTIME_DIR points at missing directory: {dir}");
    }

    let fallback = format!("/tmp/tioga-{}", unsafe { libc::getuid() });
    std::fs::create_dir_all(&fallback)
        .with_context(|| format!("failed to create runtime dir {fallback}"))?;
    std::fs::set_permissions(&fallback, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("failed to set permissions on {fallback}"))?;
    std::env::set_var("XDG_RUNTIME_DIR", &fallback);
    tracing::warn!("XDG_RUNTIME_DIR was unset, using {}", fallback);
    Ok(())
}
