//! Framebuffer lifecycle management.
//!
//! One rendered frame lives in an allocator-owned buffer object. The
//! [`Framebuffer`] wrapper reference-counts that buffer across its
//! in-flight states: held as the output's previous frame, and held by an
//! outstanding fence wait. The buffer is returned to its allocator only
//! when the count reaches zero, which callers guarantee happens strictly
//! after the fence confirmed the GPU is done reading it.
//!
//! The refcount logic is implemented once and parameterized over the
//! [`Allocator`] capability; the headless memfd pool and the dma-buf pool
//! are just two instantiations.

pub mod dmabuf;
pub mod memfd;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::OwnedFd;
use std::rc::Rc;

use crate::core::errors::Result;

/// Pixel format tags for buffer objects. Only 32-bit formats are carried
/// through the pipeline (4 bytes per pixel on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Xrgb8888,
    Argb8888,
}

/// An allocator-native buffer handle plus its plane description.
/// One plane is supported.
#[derive(Debug, Clone)]
pub struct BufferObject {
    /// Allocator-scoped handle (slot index or PRIME handle).
    pub handle: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub modifier: u64,
}

impl BufferObject {
    pub fn size_bytes(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

/// A CPU mapping of a buffer object, valid while the allocator holds the
/// underlying storage.
#[derive(Debug, Clone, Copy)]
pub struct Mapping {
    pub ptr: *mut u8,
    pub len: usize,
}

/// Buffer-producing capability shared by both backends.
///
/// Methods take `&self`; implementations keep slot bookkeeping behind a
/// `RefCell` so a [`Framebuffer`] can release back into the allocator it
/// holds an `Rc` to.
pub trait Allocator {
    /// Lock the next free buffer, or None when the pool is exhausted.
    fn acquire(&self) -> Option<BufferObject>;

    /// CPU-map a locked buffer for rendering.
    fn map(&self, bo: &BufferObject) -> Result<Mapping>;

    /// Export the buffer as a file descriptor the fence handler can mmap.
    fn export_fd(&self, bo: &BufferObject) -> Result<OwnedFd>;

    /// Return a buffer to the pool. Called from the last unref.
    fn release(&self, bo: &BufferObject);

    fn has_free_buffers(&self) -> bool;
}

// ============================================================================
// Framebuffer
// ============================================================================

struct FramebufferInner {
    refcnt: Cell<u32>,
    bo: BufferObject,
    allocator: Rc<dyn Allocator>,
}

/// Reference-counted wrapper around one rendered frame's buffer object.
///
/// References are explicit: `ref_` takes one, `unref` drops one. Cloning
/// the handle via `ref_` is the only way to extend the frame's lifetime;
/// the count going below zero is a fatal invariant violation.
pub struct Framebuffer {
    inner: Rc<FramebufferInner>,
}

impl Framebuffer {
    /// Take an additional reference and return a handle for it.
    pub fn ref_(&self) -> Framebuffer {
        self.inner.refcnt.set(self.inner.refcnt.get() + 1);
        Framebuffer {
            inner: Rc::clone(&self.inner),
        }
    }

    /// Drop one reference. At zero the buffer object is handed back to
    /// its allocator; GPU reads must be confirmed finished by then.
    pub fn unref(self) {
        let count = self.inner.refcnt.get();
        assert!(count > 0, "framebuffer unreferenced below zero");
        self.inner.refcnt.set(count - 1);
        if count == 1 {
            self.inner.allocator.release(&self.inner.bo);
        }
    }

    pub fn refcount(&self) -> u32 {
        self.inner.refcnt.get()
    }

    pub fn bo(&self) -> &BufferObject {
        &self.inner.bo
    }

    pub fn width(&self) -> u32 {
        self.inner.bo.width
    }

    pub fn height(&self) -> u32 {
        self.inner.bo.height
    }

    pub fn stride(&self) -> u32 {
        self.inner.bo.stride
    }
}

/// Pairs each allocator buffer handle 1:1 with its wrapper, so repeated
/// lookups of the same handle yield the same [`Framebuffer`] rather than
/// a duplicate with its own count.
#[derive(Default)]
pub struct FramebufferTable {
    by_handle: RefCell<HashMap<u32, Rc<FramebufferInner>>>,
}

impl FramebufferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up (or create) the wrapper for `bo` and take a reference on it.
    pub fn get_from_bo(&self, bo: &BufferObject, allocator: Rc<dyn Allocator>) -> Framebuffer {
        let mut table = self.by_handle.borrow_mut();
        if let Some(inner) = table.get(&bo.handle) {
            let fb = Framebuffer {
                inner: Rc::clone(inner),
            };
            fb.inner.refcnt.set(fb.inner.refcnt.get() + 1);
            return fb;
        }

        let inner = Rc::new(FramebufferInner {
            refcnt: Cell::new(1),
            bo: bo.clone(),
            allocator,
        });
        table.insert(bo.handle, Rc::clone(&inner));
        Framebuffer { inner }
    }

    pub fn len(&self) -> usize {
        self.by_handle.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.borrow().is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Allocator that only counts releases.
    struct CountingAllocator {
        released: Cell<u32>,
    }

    impl CountingAllocator {
        fn new() -> Rc<Self> {
            Rc::new(Self {
                released: Cell::new(0),
            })
        }
    }

    impl Allocator for CountingAllocator {
        fn acquire(&self) -> Option<BufferObject> {
            None
        }
        fn map(&self, _bo: &BufferObject) -> Result<Mapping> {
            unimplemented!()
        }
        fn export_fd(&self, _bo: &BufferObject) -> Result<OwnedFd> {
            unimplemented!()
        }
        fn release(&self, _bo: &BufferObject) {
            self.released.set(self.released.get() + 1);
        }
        fn has_free_buffers(&self) -> bool {
            false
        }
    }

    fn test_bo(handle: u32) -> BufferObject {
        BufferObject {
            handle,
            width: 64,
            height: 64,
            stride: 256,
            format: PixelFormat::Xrgb8888,
            modifier: 0,
        }
    }

    #[test]
    fn test_unref_after_n_refs_releases_once() {
        let allocator = CountingAllocator::new();
        let table = FramebufferTable::new();
        let fb = table.get_from_bo(&test_bo(1), allocator.clone());

        let extra: Vec<Framebuffer> = (0..3).map(|_| fb.ref_()).collect();
        assert_eq!(fb.refcount(), 4);

        for handle in extra {
            handle.unref();
            assert_eq!(allocator.released.get(), 0);
        }
        fb.unref();
        assert_eq!(allocator.released.get(), 1, "released exactly once at zero");
    }

    #[test]
    fn test_same_handle_returns_same_wrapper() {
        let allocator = CountingAllocator::new();
        let table = FramebufferTable::new();
        let a = table.get_from_bo(&test_bo(7), allocator.clone());
        let b = table.get_from_bo(&test_bo(7), allocator.clone());

        assert_eq!(table.len(), 1);
        assert_eq!(a.refcount(), 2);
        assert_eq!(b.refcount(), 2);

        a.unref();
        b.unref();
        assert_eq!(allocator.released.get(), 1);
    }

    #[test]
    fn test_reref_after_zero_reuses_wrapper() {
        let allocator = CountingAllocator::new();
        let table = FramebufferTable::new();
        let fb = table.get_from_bo(&test_bo(3), allocator.clone());
        fb.unref();
        assert_eq!(allocator.released.get(), 1);

        let again = table.get_from_bo(&test_bo(3), allocator.clone());
        assert_eq!(again.refcount(), 1);
        assert_eq!(table.len(), 1);
        again.unref();
        assert_eq!(allocator.released.get(), 2);
    }

    #[test]
    #[should_panic(expected = "below zero")]
    fn test_unref_below_zero_is_fatal() {
        let allocator = CountingAllocator::new();
        let table = FramebufferTable::new();
        let fb = table.get_from_bo(&test_bo(9), allocator.clone());
        let clone = Framebuffer {
            inner: Rc::clone(&fb.inner),
        };
        fb.unref();
        clone.unref();
    }
}
