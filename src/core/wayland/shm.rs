//! wl_shm implementation.
//!
//! Clients allocate destination buffers here: a pool wraps an fd the
//! client ftruncated, buffers carve rectangles out of it. The fence
//! handler later maps the pool and writes completed frames into the
//! bound buffer.

use wayland_server::protocol::{wl_buffer, wl_shm, wl_shm_pool};
use wayland_server::{Dispatch, DisplayHandle, GlobalDispatch, Resource, WEnum};

use crate::core::state::{ServerState, ShmBuffer, ShmPool};

impl GlobalDispatch<wl_shm::WlShm, ()> for ServerState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wl_shm::WlShm>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let shm = data_init.init(resource, ());
        // Advertise supported formats
        shm.format(wl_shm::Format::Argb8888);
        shm.format(wl_shm::Format::Xrgb8888);
    }
}

impl Dispatch<wl_shm::WlShm, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_shm::WlShm,
        request: wl_shm::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        if let wl_shm::Request::CreatePool { id, fd, size } = request {
            let pool = data_init.init(id, ());
            let pool_id = pool.id().protocol_id();
            state.shm.pools.insert(pool_id, ShmPool::new(fd, size));
            tracing::debug!("wl_shm.create_pool: id={}, size={}", pool_id, size);
        }
    }
}

impl Dispatch<wl_shm_pool::WlShmPool, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &wl_shm_pool::WlShmPool,
        request: wl_shm_pool::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_shm_pool::Request::CreateBuffer {
                id,
                offset,
                width,
                height,
                stride,
                format,
            } => {
                let buffer = data_init.init(id, ());
                let buffer_id = buffer.id().protocol_id();
                let format = match format {
                    WEnum::Value(f) => f,
                    WEnum::Unknown(raw) => {
                        tracing::warn!("wl_shm_pool.create_buffer: unknown format {:#x}", raw);
                        wl_shm::Format::Xrgb8888
                    }
                };
                state.shm.buffers.insert(
                    buffer_id,
                    ShmBuffer {
                        pool_id: resource.id().protocol_id(),
                        offset,
                        width,
                        height,
                        stride,
                        format,
                    },
                );
                tracing::debug!(
                    "wl_shm_pool.create_buffer: {}x{} stride {} (id={})",
                    width,
                    height,
                    stride,
                    buffer_id
                );
            }
            wl_shm_pool::Request::Resize { size } => {
                if let Some(pool) = state.shm.pools.get_mut(&resource.id().protocol_id()) {
                    pool.resize(size);
                }
            }
            wl_shm_pool::Request::Destroy => {
                let pool_id = resource.id().protocol_id();
                state.shm.destroy_pool(pool_id);
                tracing::debug!("wl_shm_pool.destroy: id={}", pool_id);
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_buffer::WlBuffer, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &wl_buffer::WlBuffer,
        request: wl_buffer::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        if let wl_buffer::Request::Destroy = request {
            let id = resource.id().protocol_id();
            state.shm.destroy_buffer(id);
            if state.capture.bound.is_some_and(|b| b.buffer_id == id) {
                state.capture.bound = None;
                tracing::debug!("wl_buffer.destroy: dropped pending capture binding");
            }
            tracing::debug!("wl_buffer.destroy: removed buffer {}", id);
        }
    }
}
