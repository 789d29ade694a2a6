// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The control-device transport.
//!
//! Everything the runtime exchanges with the kernel shim travels through
//! handles on the anonymous control device: ioctls for setup, a blocking
//! ioctl per delivered operation, and two memory-mapped windows per
//! worker through which the operation header and its payload are shared
//! in place.
//!
//! The transport is expressed as the [`Relay`]/[`RelayHandle`] trait
//! pair so the runtime never names the device directly. [`dev::DevRelay`]
//! is the real implementation; with `feature = "testing"` the
//! [`testing::FakeRelay`] provides a fully scriptable in-process stand-in
//! with heap-backed windows, which is what every end-to-end test runs
//! against.

use std::any::Any;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use abi::{NumaMap, PmemGrab};
use memmap2::MmapRaw;

pub mod dev;
#[cfg(feature = "testing")]
pub mod testing;

/// A shared-memory window on a relay handle.
///
/// Either a real mapping over the device fd or, in tests, a heap buffer
/// the fake keeps alive on its side. The window is raw shared memory:
/// the kernel writes into it while the handle's owner is blocked in
/// [`RelayHandle::wait_for_op`], so all access goes through raw
/// pointers and the caller upholds the exchange protocol.
pub struct Window {
    ptr: NonNull<u8>,
    len: usize,
    _owner: WindowOwner,
}

enum WindowOwner {
    Mapped(MmapRaw),
    Shared(Arc<dyn Any + Send + Sync>),
}

// The pointer is owned by the mapping/backing kept in `_owner`; moving
// the Window between threads moves that ownership with it.
unsafe impl Send for Window {}
unsafe impl Sync for Window {}

impl Window {
    pub fn from_mmap(map: MmapRaw) -> Self {
        let ptr = NonNull::new(map.as_mut_ptr()).expect("mmap returned null");
        let len = map.len();
        Self {
            ptr,
            len,
            _owner: WindowOwner::Mapped(map),
        }
    }

    /// Wraps caller-managed memory; `owner` keeps the backing alive for
    /// the window's lifetime.
    pub fn from_shared(
        ptr: NonNull<u8>,
        len: usize,
        owner: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            ptr,
            len,
            _owner: WindowOwner::Shared(owner),
        }
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Views the whole window as bytes.
    ///
    /// # Safety
    ///
    /// The caller must be the side currently entitled to the window per
    /// the exchange protocol (nothing else is mutating it).
    pub unsafe fn bytes_mut(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

impl std::fmt::Debug for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Window").field("len", &self.len).finish()
    }
}

/// One open handle on the control device.
///
/// A handle serves exactly one role: a worker registers itself with
/// [`register_worker`](Self::register_worker) and then loops on
/// [`wait_for_op`](Self::wait_for_op); the mount controller loops on
/// [`receive_mount`](Self::receive_mount). Results travel back
/// implicitly: the runtime writes them into the shared buffer before
/// re-entering the kernel.
pub trait RelayHandle: Send + Sync {
    /// Copies the kernel's NUMA map out. Mount-handle setup call.
    fn numa_map(&self) -> io::Result<Box<NumaMap>>;

    /// Announces one filesystem implementation.
    fn register_fs(&self, info: &abi::FsRegister) -> io::Result<()>;

    /// Claims the `(cpu, channel)` worker slot for this handle.
    fn register_worker(&self, cpu: u32, channel: u32, opb_bytes: u32) -> io::Result<()>;

    /// Maps the app window (payload data), offset 0.
    fn map_app_window(&self) -> io::Result<Window>;

    /// Maps the op-buffer window at offset [`abi::APP_REGION_BYTES`].
    fn map_op_window(&self) -> io::Result<Window>;

    /// Blocks until the kernel delivers the next operation into the op
    /// window. An `Err` is a transport hiccup (signal, shutdown wake),
    /// not a reason to abandon the handle.
    fn wait_for_op(&self) -> io::Result<()>;

    /// Blocks until the next mount-channel event lands in `buf` (which
    /// must be [`abi::OP_BUFFER_BYTES`] long).
    fn receive_mount(&self, buf: &mut [u8]) -> io::Result<()>;

    /// Wakes every waiter blocked on this handle's channel.
    fn break_all(&self) -> io::Result<()>;

    /// Binds pmem device `pmem_id` to this handle and maps it.
    fn grab_pmem(&self, pmem_id: u64) -> io::Result<(PmemGrab, Window)>;

    /// Carves a kernel-shared scratch buffer out of the shim and maps
    /// it into the process.
    fn alloc_buffer(&self, bytes: usize) -> io::Result<Window>;
}

/// Factory for [`RelayHandle`]s; one per process configuration.
pub trait Relay: Send + Sync {
    fn open(&self) -> io::Result<Arc<dyn RelayHandle>>;
}
