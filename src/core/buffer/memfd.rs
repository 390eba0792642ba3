//! Headless buffer pool backed by memfds.
//!
//! Stands in for a GBM surface when no GPU scanout path exists: a fixed
//! number of CPU-mapped slots, locked on acquire and returned on release.
//! The fixed slot count is what gives the repaint path backpressure: an
//! exhausted pool drops the frame instead of queueing.

use std::cell::RefCell;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

use super::{Allocator, BufferObject, Mapping, PixelFormat};
use crate::core::errors::{CoreError, Result};

struct Slot {
    fd: OwnedFd,
    mapping: Mapping,
    busy: bool,
}

// Mapping holds a raw pointer; the allocator never leaves its thread.
pub struct MemfdAllocator {
    slots: RefCell<Vec<Slot>>,
    width: u32,
    height: u32,
    stride: u32,
}

impl MemfdAllocator {
    pub const DEFAULT_SLOTS: usize = 3;

    pub fn new(width: u32, height: u32, slot_count: usize) -> Result<Self> {
        let stride = width * 4;
        let size = stride as usize * height as usize;
        let mut slots = Vec::with_capacity(slot_count);
        for index in 0..slot_count {
            let fd = create_memfd(&format!("tioga-slot-{index}"), size)?;
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd.as_raw_fd(),
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(CoreError::allocation(format!(
                    "mmap of slot {index} failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            slots.push(Slot {
                fd,
                mapping: Mapping {
                    ptr: ptr as *mut u8,
                    len: size,
                },
                busy: false,
            });
        }
        Ok(Self {
            slots: RefCell::new(slots),
            width,
            height,
            stride,
        })
    }

    fn slot_bo(&self, index: usize) -> BufferObject {
        BufferObject {
            handle: index as u32,
            width: self.width,
            height: self.height,
            stride: self.stride,
            format: PixelFormat::Xrgb8888,
            modifier: 0,
        }
    }
}

impl Allocator for MemfdAllocator {
    fn acquire(&self) -> Option<BufferObject> {
        let mut slots = self.slots.borrow_mut();
        let index = slots.iter().position(|s| !s.busy)?;
        slots[index].busy = true;
        Some(self.slot_bo(index))
    }

    fn map(&self, bo: &BufferObject) -> Result<Mapping> {
        let slots = self.slots.borrow();
        slots
            .get(bo.handle as usize)
            .map(|s| s.mapping)
            .ok_or_else(|| CoreError::allocation(format!("unknown slot {}", bo.handle)))
    }

    fn export_fd(&self, bo: &BufferObject) -> Result<OwnedFd> {
        let slots = self.slots.borrow();
        let slot = slots
            .get(bo.handle as usize)
            .ok_or_else(|| CoreError::allocation(format!("unknown slot {}", bo.handle)))?;
        Ok(slot.fd.try_clone()?)
    }

    fn release(&self, bo: &BufferObject) {
        let mut slots = self.slots.borrow_mut();
        if let Some(slot) = slots.get_mut(bo.handle as usize) {
            slot.busy = false;
        }
    }

    fn has_free_buffers(&self) -> bool {
        self.slots.borrow().iter().any(|s| !s.busy)
    }
}

impl Drop for MemfdAllocator {
    fn drop(&mut self) {
        for slot in self.slots.borrow_mut().iter() {
            unsafe {
                libc::munmap(slot.mapping.ptr as *mut _, slot.mapping.len);
            }
        }
    }
}

fn create_memfd(name: &str, size: usize) -> Result<OwnedFd> {
    let cname = std::ffi::CString::new(name)
        .map_err(|_| CoreError::allocation("memfd name contains NUL"))?;
    let raw = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        return Err(CoreError::allocation(format!(
            "memfd_create failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    let ret = unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) };
    if ret < 0 {
        return Err(CoreError::allocation(format!(
            "ftruncate failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(fd)
}

// ============================================================================
// Tests
// ============================================================================
