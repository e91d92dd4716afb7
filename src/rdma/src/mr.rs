//! Owned memory suitable for registration with the NIC.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::slice;

use bitflags::bitflags;

use crate::{RdmaCm, Result};

bitflags! {
    /// Access rights requested when registering a memory region.
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 0b001;
        const REMOTE_WRITE = 0b010;
        const REMOTE_ATOMIC = 0b100;
    }
}

/// A registration produced by [`RdmaCm::register`]. Dropping it deregisters
/// the region, so it must never outlive the buffer it covers.
pub trait RegisteredMemory: Send {
    fn addr(&self) -> u64;
    fn lkey(&self) -> u32;
    fn rkey(&self) -> u32;
}

/// Owned, zero-initialized, cache-line aligned memory.
///
/// The allocation is stable for the lifetime of the value, which is what
/// makes it legal to expose to the NIC: remote peers keep writing through the
/// registered address until the registration is dropped.
pub struct Buffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// The buffer is plain memory with no interior references.
unsafe impl Send for Buffer {}

impl Buffer {
    const ALIGN: usize = 64;

    pub fn zeroed(len: usize) -> Self {
        assert!(len > 0, "zero-sized buffers cannot be registered");
        let layout = Layout::from_size_align(len, Self::ALIGN).expect("buffer layout");
        // Safety: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Buffer { ptr, len, layout }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Virtual address of the allocation, as advertised to remote peers.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // Safety: ptr/len describe a live allocation owned by self.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: ptr/len describe a live allocation owned by self.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // Safety: allocated in `zeroed` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A buffer coupled with its registration.
///
/// Field order matters: the registration is dropped first, so the region is
/// deregistered before the memory is freed.
pub struct RegisteredBuffer {
    mr: Box<dyn RegisteredMemory>,
    buf: Buffer,
}

impl RegisteredBuffer {
    pub fn register(mut buf: Buffer, cm: &dyn RdmaCm, access: AccessFlags) -> Result<Self> {
        let mr = cm.register(&mut buf, access)?;
        Ok(RegisteredBuffer { mr, buf })
    }

    #[inline]
    pub fn addr(&self) -> u64 {
        self.mr.addr()
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        self.mr.lkey()
    }

    #[inline]
    pub fn rkey(&self) -> u32 {
        self.mr.rkey()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_mut_slice()
    }
}
