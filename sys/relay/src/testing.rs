// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scriptable in-process relay for tests.
//!
//! `FakeRelay` mimics the kernel side of the exchange protocol: tests
//! enqueue operation images on a worker's port (or the mount port), the
//! blocked runtime thread picks them up from `wait_for_op` /
//! `receive_mount`, and the "kernel" observes the reply when the thread
//! re-enters — exactly the real buffer-exchange timing. Windows are heap
//! buffers owned by the fake, so the whole protocol runs without a
//! kernel.
//!
//! The fake only touches a window from inside the runtime thread's own
//! `wait_for_op` call, which is what makes the raw-pointer copies sound:
//! each side owns the buffer exactly when the protocol says it does.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::io;
use std::ptr::NonNull;
use std::sync::{Arc, Condvar, Mutex, Weak};

use abi::{FsRegister, NumaMap, PmemGrab, OP_BUFFER_BYTES};

use crate::{Relay, RelayHandle, Window};

/// App windows are shrunk in tests; payload offsets stay small.
pub const FAKE_APP_BYTES: usize = 64 << 10;

// u64-backed so the window base is aligned for in-place struct decoding,
// as a real page-aligned mapping would be.
struct HeapWin(UnsafeCell<Box<[u64]>>);

// Access is serialized by the exchange protocol (see module docs).
unsafe impl Send for HeapWin {}
unsafe impl Sync for HeapWin {}

fn heap_win(len: usize) -> (NonNull<u8>, Arc<HeapWin>) {
    let words = len.div_ceil(8);
    let win = Arc::new(HeapWin(UnsafeCell::new(vec![0u64; words].into_boxed_slice())));
    let ptr = NonNull::new(unsafe { (*win.0.get()).as_mut_ptr() as *mut u8 }).unwrap();
    (ptr, win)
}

#[derive(Clone, Copy)]
struct WinRef {
    ptr: NonNull<u8>,
    len: usize,
}

struct PortInner {
    queue: VecDeque<Vec<u8>>,
    issued: u64,
    completed: u64,
    inflight: bool,
    broken: bool,
    break_wakeups: u64,
    replies: Vec<Vec<u8>>,
    app: Option<WinRef>,
    opb: Option<WinRef>,
}

/// One fake handle. Also the test-side driver for that handle.
pub struct FakePort {
    state: Weak<FakeState>,
    slot: Mutex<Option<(u32, u32)>>,
    inner: Mutex<PortInner>,
    cv: Condvar,
}

// The raw window pointers inside `inner` are only dereferenced under
// the protocol ordering described in the module docs.
unsafe impl Send for FakePort {}
unsafe impl Sync for FakePort {}

struct FakeState {
    numa: NumaMap,
    pmem_bytes: usize,
    // Weak: a slot frees when its worker drops the handle, like an fd close.
    ports: Mutex<Vec<Weak<FakePort>>>,
    mount: Mutex<Option<Arc<FakePort>>>,
    mount_cv: Condvar,
    fs_registered: Mutex<Vec<String>>,
}

/// The fake kernel shim. Cloning shares the same state, so a test can
/// keep one clone for scripting and hand another to the runtime.
#[derive(Clone)]
pub struct FakeRelay {
    state: Arc<FakeState>,
}

impl FakeRelay {
    pub fn new(numa: NumaMap) -> Self {
        Self {
            state: Arc::new(FakeState {
                numa,
                pmem_bytes: 1 << 20,
                ports: Mutex::new(Vec::new()),
                mount: Mutex::new(None),
                mount_cv: Condvar::new(),
                fs_registered: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The port registered for worker `(cpu, channel)`, if one is up.
    pub fn worker_port(&self, cpu: u32, channel: u32) -> Option<Arc<FakePort>> {
        let ports = self.state.ports.lock().unwrap();
        ports
            .iter()
            .filter_map(Weak::upgrade)
            .find(|p| *p.slot.lock().unwrap() == Some((cpu, channel)))
    }

    /// Blocks until some runtime thread is listening for mount events,
    /// then returns its port.
    pub fn mount_port(&self) -> Arc<FakePort> {
        let mut mount = self.state.mount.lock().unwrap();
        loop {
            if let Some(p) = mount.as_ref() {
                return Arc::clone(p);
            }
            mount = self.state.mount_cv.wait(mount).unwrap();
        }
    }

    /// Filesystem type names announced via the register-fs ioctl.
    pub fn registered_fs(&self) -> Vec<String> {
        self.state.fs_registered.lock().unwrap().clone()
    }
}

impl Relay for FakeRelay {
    fn open(&self) -> io::Result<Arc<dyn RelayHandle>> {
        let port = Arc::new(FakePort {
            state: Arc::downgrade(&self.state),
            slot: Mutex::new(None),
            inner: Mutex::new(PortInner {
                queue: VecDeque::new(),
                issued: 0,
                completed: 0,
                inflight: false,
                broken: false,
                break_wakeups: 0,
                replies: Vec::new(),
                app: None,
                opb: None,
            }),
            cv: Condvar::new(),
        });
        self.state.ports.lock().unwrap().push(Arc::downgrade(&port));
        Ok(port)
    }
}

impl FakePort {
    /// Enqueues an operation image without waiting for its completion.
    pub fn push(&self, op: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.issued += 1;
        inner.queue.push_back(op.to_vec());
        self.cv.notify_all();
    }

    /// Enqueues an operation image and blocks until the runtime thread
    /// has processed it and re-entered the relay. Returns the op-window
    /// (or mount-buffer) image at re-entry, i.e. the reply.
    pub fn call(&self, op: &[u8]) -> Vec<u8> {
        let target = {
            let mut inner = self.inner.lock().unwrap();
            inner.issued += 1;
            inner.queue.push_back(op.to_vec());
            self.cv.notify_all();
            inner.issued
        };
        let mut inner = self.inner.lock().unwrap();
        while inner.completed < target {
            inner = self.cv.wait(inner).unwrap();
        }
        inner.replies[target as usize - 1].clone()
    }

    /// Completed exchange count.
    pub fn completed(&self) -> u64 {
        self.inner.lock().unwrap().completed
    }

    /// How many times a blocked wait on this port was woken by
    /// break-all. One per worker is the expected shutdown shape.
    pub fn break_wakeups(&self) -> u64 {
        self.inner.lock().unwrap().break_wakeups
    }

    /// Writes payload bytes into the port's app window.
    pub fn write_app(&self, offset: usize, bytes: &[u8]) {
        let inner = self.inner.lock().unwrap();
        let app = inner.app.expect("app window not mapped");
        assert!(offset + bytes.len() <= app.len);
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                app.ptr.as_ptr().add(offset),
                bytes.len(),
            );
        }
    }

    /// Reads payload bytes back out of the port's app window.
    pub fn read_app(&self, offset: usize, len: usize) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let app = inner.app.expect("app window not mapped");
        assert!(offset + len <= app.len);
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(app.ptr.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        out
    }

    fn finish_inflight(inner: &mut PortInner, reply: Vec<u8>, cv: &Condvar) {
        inner.inflight = false;
        inner.replies.push(reply);
        inner.completed += 1;
        cv.notify_all();
    }
}

impl RelayHandle for FakePort {
    fn numa_map(&self) -> io::Result<Box<NumaMap>> {
        let state = self.state.upgrade().ok_or(io::ErrorKind::BrokenPipe)?;
        Ok(Box::new(state.numa))
    }

    fn register_fs(&self, info: &FsRegister) -> io::Result<()> {
        let state = self.state.upgrade().ok_or(io::ErrorKind::BrokenPipe)?;
        state
            .fs_registered
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(info.fstype.as_bytes()).into_owned());
        Ok(())
    }

    fn register_worker(&self, cpu: u32, channel: u32, _opb_bytes: u32) -> io::Result<()> {
        let state = self.state.upgrade().ok_or(io::ErrorKind::BrokenPipe)?;
        let ports = state.ports.lock().unwrap();
        for p in ports.iter().filter_map(Weak::upgrade) {
            if *p.slot.lock().unwrap() == Some((cpu, channel)) {
                return Err(io::Error::from_raw_os_error(libc::EBUSY));
            }
        }
        drop(ports);
        *self.slot.lock().unwrap() = Some((cpu, channel));
        Ok(())
    }

    fn map_app_window(&self) -> io::Result<Window> {
        let (ptr, win) = heap_win(FAKE_APP_BYTES);
        self.inner.lock().unwrap().app = Some(WinRef {
            ptr,
            len: FAKE_APP_BYTES,
        });
        Ok(Window::from_shared(
            ptr,
            FAKE_APP_BYTES,
            win,
        ))
    }

    fn map_op_window(&self) -> io::Result<Window> {
        let (ptr, win) = heap_win(OP_BUFFER_BYTES);
        self.inner.lock().unwrap().opb = Some(WinRef {
            ptr,
            len: OP_BUFFER_BYTES,
        });
        Ok(Window::from_shared(
            ptr,
            OP_BUFFER_BYTES,
            win,
        ))
    }

    fn wait_for_op(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.inflight {
            let opb = inner.opb.expect("op window not mapped");
            let reply =
                unsafe { std::slice::from_raw_parts(opb.ptr.as_ptr(), opb.len) }.to_vec();
            Self::finish_inflight(&mut inner, reply, &self.cv);
        }
        loop {
            if inner.broken {
                inner.break_wakeups += 1;
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            if let Some(op) = inner.queue.pop_front() {
                let opb = inner.opb.expect("op window not mapped");
                assert!(op.len() <= opb.len);
                unsafe {
                    std::ptr::copy_nonoverlapping(op.as_ptr(), opb.ptr.as_ptr(), op.len());
                }
                inner.inflight = true;
                return Ok(());
            }
            inner = self.cv.wait(inner).unwrap();
        }
    }

    fn receive_mount(&self, buf: &mut [u8]) -> io::Result<()> {
        if let Some(state) = self.state.upgrade() {
            let mut mount = state.mount.lock().unwrap();
            if mount.is_none() {
                let ports = state.ports.lock().unwrap();
                let me = ports
                    .iter()
                    .filter_map(Weak::upgrade)
                    .find(|p| std::ptr::eq(p.as_ref(), self));
                drop(ports);
                *mount = me;
                state.mount_cv.notify_all();
            }
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.inflight {
            Self::finish_inflight(&mut inner, buf.to_vec(), &self.cv);
        }
        loop {
            if inner.broken {
                inner.break_wakeups += 1;
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            if let Some(op) = inner.queue.pop_front() {
                assert!(op.len() <= buf.len());
                buf[..op.len()].copy_from_slice(&op);
                inner.inflight = true;
                return Ok(());
            }
            inner = self.cv.wait(inner).unwrap();
        }
    }

    fn break_all(&self) -> io::Result<()> {
        let channel = self.slot.lock().unwrap().map(|(_, c)| c);
        match (channel, self.state.upgrade()) {
            (Some(channel), Some(state)) => {
                let ports = state.ports.lock().unwrap();
                for p in ports.iter().filter_map(Weak::upgrade) {
                    if p.slot.lock().unwrap().map(|(_, c)| c) == Some(channel) {
                        p.inner.lock().unwrap().broken = true;
                        p.cv.notify_all();
                    }
                }
            }
            _ => {
                self.inner.lock().unwrap().broken = true;
                self.cv.notify_all();
            }
        }
        Ok(())
    }

    fn grab_pmem(&self, pmem_id: u64) -> io::Result<(PmemGrab, Window)> {
        let state = self.state.upgrade().ok_or(io::ErrorKind::BrokenPipe)?;
        let blocksize = 4096u32;
        let grab = PmemGrab {
            pmem_id,
            pmem_kern_id: pmem_id + 1,
            blocks: (state.pmem_bytes as u64) / u64::from(blocksize),
            blocksize,
            _pad: 0,
        };
        let (ptr, win) = heap_win(state.pmem_bytes);
        Ok((
            grab,
            Window::from_shared(ptr, state.pmem_bytes, win),
        ))
    }

    fn alloc_buffer(&self, bytes: usize) -> io::Result<Window> {
        let (ptr, win) = heap_win(bytes);
        Ok(Window::from_shared(ptr, bytes, win))
    }
}
