//! Server-side state shared by all protocol dispatch and the capture
//! pipeline: the virtual outputs, the shm pools and buffers clients have
//! created, and the capture bookkeeping.

use crate::core::capture::CaptureState;
use crate::core::capture::virtual_output::VirtualOutput;
use crate::prelude::*;

use std::os::unix::io::{AsRawFd, OwnedFd};
use wayland_server::protocol::wl_shm;

// ============================================================================
// SHM pools and buffers
// ============================================================================

/// SHM pool backing store for client buffers.
pub struct ShmPool {
    /// File descriptor for the pool (owned - keeps fd alive!)
    pub fd: OwnedFd,
    /// Size of the pool in bytes
    pub size: usize,
    /// mmap'd data pointer (None until first access)
    pub data: Option<*mut u8>,
    /// The wl_shm_pool resource was destroyed; the storage lingers only
    /// while buffers still carve into it.
    pub released: bool,
}

impl ShmPool {
    pub fn new(fd: OwnedFd, size: i32) -> Self {
        Self {
            fd,
            size: size as usize,
            data: None,
            released: false,
        }
    }

    /// mmap the pool and return a pointer to its data.
    pub fn map(&mut self) -> Option<*mut u8> {
        if self.data.is_some() {
            return self.data;
        }

        // SAFETY: mapping the pool fd shared, writable so the fence
        // handler can copy completed frames into client buffers.
        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                self.size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                0,
            );
            if ptr == libc::MAP_FAILED {
                tracing::error!(
                    "failed to mmap shm pool (fd={}, size={})",
                    self.fd.as_raw_fd(),
                    self.size
                );
                return None;
            }
            self.data = Some(ptr as *mut u8);
            self.data
        }
    }

    /// Resize the pool; remapped lazily on the next `map()`.
    pub fn resize(&mut self, new_size: i32) {
        let new_size = new_size as usize;
        if new_size == self.size {
            return;
        }
        if let Some(ptr) = self.data {
            unsafe {
                libc::munmap(ptr as *mut libc::c_void, self.size);
            }
            self.data = None;
        }
        self.size = new_size;
        tracing::debug!("resized shm pool to {} bytes", self.size);
    }
}

impl Drop for ShmPool {
    fn drop(&mut self) {
        if let Some(ptr) = self.data {
            unsafe {
                libc::munmap(ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

/// One wl_buffer carved out of a pool.
#[derive(Debug, Clone, Copy)]
pub struct ShmBuffer {
    pub pool_id: u32,
    pub offset: i32,
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    pub format: wl_shm::Format,
}

/// All shm objects, keyed by protocol object id.
#[derive(Default)]
pub struct ShmState {
    pub pools: HashMap<u32, ShmPool>,
    pub buffers: HashMap<u32, ShmBuffer>,
}

impl ShmState {
    fn pool_referenced(&self, pool_id: u32) -> bool {
        self.buffers.values().any(|b| b.pool_id == pool_id)
    }

    /// The client destroyed the pool object. The backing storage must
    /// outlive the pool while buffers still reference it; it is unmapped
    /// now only when nothing does.
    pub fn destroy_pool(&mut self, pool_id: u32) {
        if self.pool_referenced(pool_id) {
            if let Some(pool) = self.pools.get_mut(&pool_id) {
                pool.released = true;
            }
            return;
        }
        if self.pools.remove(&pool_id).is_some() {
            tracing::debug!("shm pool {} unmapped", pool_id);
        }
    }

    /// The client destroyed a buffer. A released pool loses its storage
    /// with its last buffer.
    pub fn destroy_buffer(&mut self, buffer_id: u32) {
        let Some(buffer) = self.buffers.remove(&buffer_id) else {
            return;
        };
        let released = self
            .pools
            .get(&buffer.pool_id)
            .is_some_and(|p| p.released);
        if released && !self.pool_referenced(buffer.pool_id) {
            self.pools.remove(&buffer.pool_id);
            tracing::debug!("shm pool {} unmapped with its last buffer", buffer.pool_id);
        }
    }
}

// ============================================================================
// ServerState
// ============================================================================

/// Root of the compositor's mutable state. Single-threaded; every
/// dispatch and event-loop callback gets `&mut ServerState`.
#[derive(Default)]
pub struct ServerState {
    pub outputs: Vec<VirtualOutput>,
    pub shm: ShmState,
    pub capture: CaptureState,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_output(&mut self, output: VirtualOutput) {
        self.outputs.push(output);
    }

    pub fn output(&self, id: u32) -> Option<&VirtualOutput> {
        self.outputs.iter().find(|o| o.state.id == id)
    }

    pub fn output_mut(&mut self, id: u32) -> Option<&mut VirtualOutput> {
        self.outputs.iter_mut().find(|o| o.state.id == id)
    }

    /// Mark the whole output stale; the next repaint pass re-renders it.
    pub fn damage_output(&mut self, id: u32) {
        if let Some(output) = self.output_mut(id) {
            output.damaged = true;
        }
    }

    /// Record that a real frame went out this presentation period.
    pub fn mark_submitted(&mut self, id: u32) {
        if let Some(output) = self.output_mut(id) {
            output.submitted_frame = true;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::FromRawFd;

    fn memfd(size: i32) -> OwnedFd {
        let raw = unsafe { libc::memfd_create(c"tioga-test-pool".as_ptr(), libc::MFD_CLOEXEC) };
        assert!(raw >= 0);
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        assert_eq!(unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) }, 0);
        fd
    }

    #[test]
    fn test_pool_maps_once_and_remaps_after_resize() {
        let mut pool = ShmPool::new(memfd(4096), 4096);
        let first = pool.map().unwrap();
        assert_eq!(pool.map().unwrap(), first);

        pool.resize(8192);
        assert!(pool.data.is_none());
        assert_eq!(pool.size, 8192);
    }

    #[test]
    fn test_pool_resize_needs_grown_fd() {
        // Resizing tracks the client's ftruncate; mapping after a grow
        // works because the fd itself was grown first.
        let fd = memfd(8192);
        let mut pool = ShmPool::new(fd, 4096);
        pool.resize(8192);
        assert!(pool.map().is_some());
    }

    fn buffer_in(pool_id: u32) -> ShmBuffer {
        ShmBuffer {
            pool_id,
            offset: 0,
            width: 8,
            height: 8,
            stride: 32,
            format: wl_shm::Format::Xrgb8888,
        }
    }

    #[test]
    fn test_pool_outlives_destroy_while_buffers_remain() {
        let mut shm = ShmState::default();
        shm.pools.insert(7, ShmPool::new(memfd(4096), 4096));
        shm.buffers.insert(42, buffer_in(7));

        shm.destroy_pool(7);
        assert!(shm.pools.contains_key(&7), "storage stays for the buffer");

        shm.destroy_buffer(42);
        assert!(shm.pools.is_empty(), "last buffer takes the pool with it");
        assert!(shm.buffers.is_empty());
    }

    #[test]
    fn test_unreferenced_pool_dropped_on_destroy() {
        let mut shm = ShmState::default();
        shm.pools.insert(7, ShmPool::new(memfd(4096), 4096));
        shm.destroy_pool(7);
        assert!(shm.pools.is_empty());
    }

    #[test]
    fn test_buffer_destroy_keeps_live_pool() {
        let mut shm = ShmState::default();
        shm.pools.insert(7, ShmPool::new(memfd(4096), 4096));
        shm.buffers.insert(42, buffer_in(7));
        shm.buffers.insert(43, buffer_in(7));

        shm.destroy_buffer(42);
        assert!(shm.pools.contains_key(&7), "pool object is still alive");

        // Destroying the pool with one buffer left defers, then the last
        // buffer releases it.
        shm.destroy_pool(7);
        shm.destroy_buffer(43);
        assert!(shm.pools.is_empty());
    }
}
