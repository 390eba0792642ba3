//! Hardware buffer pool over externally produced dma-bufs.
//!
//! The DRM/GBM device that produces the buffers is an external
//! collaborator; this pool only manages lock/export/release of the fds it
//! was constructed with, so the shared framebuffer lifecycle code drives
//! the hardware path exactly like the headless one.
//!
//! Also home to the dma-buf CPU access bracket used by the fence handler
//! before and after copying a completed frame out of GPU memory.

use std::cell::RefCell;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use super::{Allocator, BufferObject, Mapping};
use crate::core::errors::{CoreError, Result};

/// One dma-buf handed over by the scanout device.
pub struct DmabufSlot {
    pub fd: OwnedFd,
    pub bo: BufferObject,
}

struct SlotState {
    slot: DmabufSlot,
    mapping: Option<Mapping>,
    busy: bool,
}

pub struct DmabufAllocator {
    slots: RefCell<Vec<SlotState>>,
}

impl DmabufAllocator {
    pub fn new(slots: Vec<DmabufSlot>) -> Self {
        Self {
            slots: RefCell::new(
                slots
                    .into_iter()
                    .map(|slot| SlotState {
                        slot,
                        mapping: None,
                        busy: false,
                    })
                    .collect(),
            ),
        }
    }
}

impl Allocator for DmabufAllocator {
    fn acquire(&self) -> Option<BufferObject> {
        let mut slots = self.slots.borrow_mut();
        let state = slots.iter_mut().find(|s| !s.busy)?;
        state.busy = true;
        Some(state.slot.bo.clone())
    }

    fn map(&self, bo: &BufferObject) -> Result<Mapping> {
        let mut slots = self.slots.borrow_mut();
        let state = slots
            .iter_mut()
            .find(|s| s.slot.bo.handle == bo.handle)
            .ok_or_else(|| CoreError::allocation(format!("unknown dmabuf handle {}", bo.handle)))?;
        if let Some(mapping) = state.mapping {
            return Ok(mapping);
        }
        let len = state.slot.bo.size_bytes();
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                state.slot.fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CoreError::allocation(format!(
                "dmabuf mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let mapping = Mapping {
            ptr: ptr as *mut u8,
            len,
        };
        state.mapping = Some(mapping);
        Ok(mapping)
    }

    fn export_fd(&self, bo: &BufferObject) -> Result<OwnedFd> {
        let slots = self.slots.borrow();
        let state = slots
            .iter()
            .find(|s| s.slot.bo.handle == bo.handle)
            .ok_or_else(|| CoreError::allocation(format!("unknown dmabuf handle {}", bo.handle)))?;
        Ok(state.slot.fd.try_clone()?)
    }

    fn release(&self, bo: &BufferObject) {
        let mut slots = self.slots.borrow_mut();
        if let Some(state) = slots.iter_mut().find(|s| s.slot.bo.handle == bo.handle) {
            state.busy = false;
        }
    }

    fn has_free_buffers(&self) -> bool {
        self.slots.borrow().iter().any(|s| !s.busy)
    }
}

impl Drop for DmabufAllocator {
    fn drop(&mut self) {
        for state in self.slots.borrow_mut().iter() {
            if let Some(mapping) = state.mapping {
                unsafe {
                    libc::munmap(mapping.ptr as *mut _, mapping.len);
                }
            }
        }
    }
}

// ============================================================================
// dma-buf CPU access sync
// ============================================================================

// From <linux/dma-buf.h>: _IOW('b', 0, struct dma_buf_sync)
const DMA_BUF_IOCTL_SYNC: libc::c_ulong = 0x4008_6200;
const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_START: u64 = 0 << 2;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

#[repr(C)]
struct DmaBufSync {
    flags: u64,
}

fn dma_buf_sync(fd: RawFd, flags: u64) {
    let sync = DmaBufSync { flags };
    let ret = unsafe { libc::ioctl(fd, DMA_BUF_IOCTL_SYNC, &sync) };
    if ret != 0 {
        // memfd-backed frames don't implement the ioctl; nothing to sync.
        tracing::trace!(
            "DMA_BUF_IOCTL_SYNC not applied (fd={}, flags={:#x}): {}",
            fd,
            flags,
            std::io::Error::last_os_error()
        );
    }
}

/// Bracket CPU reads of a just-signaled frame.
pub fn cpu_read_begin(fd: RawFd) {
    dma_buf_sync(fd, DMA_BUF_SYNC_START | DMA_BUF_SYNC_READ);
}

pub fn cpu_read_end(fd: RawFd) {
    dma_buf_sync(fd, DMA_BUF_SYNC_END | DMA_BUF_SYNC_READ);
}

// ============================================================================
// Tests
// ============================================================================
