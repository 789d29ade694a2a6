// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One worker: a thread serving a single `(cpu, channel)` slot.
//!
//! Lifecycle:
//!
//! ```text
//! CREATED → OPENING → REGISTERED → MAPPED → READY → DRAINING → EXITED
//!           │                               │
//!           └────────── any failure ────────┴──► FAILED
//! ```
//!
//! A worker opens its own relay handle, claims its slot, maps the app
//! and op windows, releases one token on the startup barrier and then
//! loops: block in the kernel, run the demultiplexer, fold the result
//! into the shared header, re-enter. Transport errors never break the
//! loop — a signal-interrupted wait must not wedge the channel — only
//! the stop flag does, once the pool's break-all has woken the blocked
//! wait.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use abi::{HdrFlags, HDR_FLAGS_OFFSET, OP_BUFFER_BYTES};
use log::{debug, warn};
use relay::{Relay as _, RelayHandle, Window};
use waitzero::WaitZero;

use crate::runtime::Runtime;
use crate::thread::WorkerCap;
use crate::{dispatch, thread};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum WorkerState {
    Created = 0,
    Opening,
    Registered,
    Mapped,
    Ready,
    Draining,
    Exited,
    Failed,
}

/// The slice of a worker visible outside its own thread: identity,
/// stop/error flags, and the live op-header address for the
/// signal-pending query.
pub struct WorkerShared {
    pub cpu: u32,
    pub channel: u32,
    /// Written by the pool during shutdown, read by the worker loop.
    pub stop: AtomicBool,
    /// First setup errno, published through the startup barrier.
    pub last_err: AtomicI32,
    state: AtomicU8,
    /// Base of the mapped op window while the worker is live; null
    /// otherwise. The kernel may flip header flags in place, hence the
    /// volatile read in [`WorkerShared::signal_pending`].
    op_base: AtomicPtr<u8>,
    /// Identity recorded as the worker comes up, for introspection.
    observed_cpu: AtomicU32,
    observed_node: AtomicU32,
    handle: Mutex<Option<Arc<dyn RelayHandle>>>,
}

impl WorkerShared {
    pub(crate) fn new(cpu: u32, channel: u32) -> Self {
        Self {
            cpu,
            channel,
            stop: AtomicBool::new(false),
            last_err: AtomicI32::new(0),
            state: AtomicU8::new(WorkerState::Created as u8),
            op_base: AtomicPtr::new(std::ptr::null_mut()),
            observed_cpu: AtomicU32::new(u32::MAX),
            observed_node: AtomicU32::new(u32::MAX),
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn set_state(&self, s: WorkerState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn state(&self) -> WorkerState {
        match self.state.load(Ordering::Acquire) {
            0 => WorkerState::Created,
            1 => WorkerState::Opening,
            2 => WorkerState::Registered,
            3 => WorkerState::Mapped,
            4 => WorkerState::Ready,
            5 => WorkerState::Draining,
            6 => WorkerState::Exited,
            _ => WorkerState::Failed,
        }
    }

    pub fn last_err(&self) -> i32 {
        self.last_err.load(Ordering::Acquire)
    }

    /// `(cpu, node)` the worker saw when it came up; `None` until then.
    pub fn observed_identity(&self) -> Option<(u32, u32)> {
        let cpu = self.observed_cpu.load(Ordering::Acquire);
        let node = self.observed_node.load(Ordering::Acquire);
        (cpu != u32::MAX).then_some((cpu, node))
    }

    pub(crate) fn handle(&self) -> Option<Arc<dyn RelayHandle>> {
        self.handle.lock().unwrap().clone()
    }
}

impl WorkerCap for WorkerShared {
    fn signal_pending(&self) -> bool {
        let base = self.op_base.load(Ordering::Acquire);
        if base.is_null() {
            return false;
        }
        // The kernel flips this word underneath us; read it volatile.
        let flags = unsafe { std::ptr::read_volatile(base.add(HDR_FLAGS_OFFSET) as *const u16) };
        HdrFlags::from_bits_truncate(flags).contains(HdrFlags::INTR)
    }
}

/// Asks whether the kernel requested interruption of the operation the
/// calling worker is currently processing. Calling this from anything
/// but a worker thread is a programmer error; it answers `false` with a
/// warning.
pub fn signal_pending() -> bool {
    thread::with_worker(|w| match w {
        Some(w) => w.signal_pending(),
        None => {
            warn!("signal_pending queried from a non-worker thread");
            false
        }
    })
}

struct WorkerIo {
    handle: Arc<dyn RelayHandle>,
    app: Window,
    opb: Window,
}

fn init(rt: &Runtime, shared: &WorkerShared) -> std::io::Result<WorkerIo> {
    shared.set_state(WorkerState::Opening);
    let handle = rt.relay().open()?;
    *shared.handle.lock().unwrap() = Some(Arc::clone(&handle));

    shared.set_state(WorkerState::Registered);
    handle.register_worker(shared.cpu, shared.channel, OP_BUFFER_BYTES as u32)?;

    let app = handle.map_app_window()?;
    let opb = handle.map_op_window()?;
    shared.set_state(WorkerState::Mapped);
    shared.op_base.store(opb.as_mut_ptr(), Ordering::Release);

    Ok(WorkerIo { handle, app, opb })
}

/// Thread body for one worker slot.
pub(crate) fn worker_main(rt: Arc<Runtime>, shared: Arc<WorkerShared>, barrier: Arc<WaitZero>) {
    match init(&rt, &shared) {
        Ok(io) => {
            // Identity is published before the barrier so the starter
            // sees it as soon as start() returns.
            shared
                .observed_cpu
                .store(thread::current_cpu(), Ordering::Release);
            shared
                .observed_node
                .store(thread::current_node(), Ordering::Release);
            shared.set_state(WorkerState::Ready);
            barrier.release();
            run_loop(&rt, &shared, &io);
            shared.op_base.store(std::ptr::null_mut(), Ordering::Release);
            drop(io); // unmaps both windows, closes the handle's side
            *shared.handle.lock().unwrap() = None;
            shared.set_state(WorkerState::Exited);
        }
        Err(e) => {
            shared
                .last_err
                .store(e.raw_os_error().unwrap_or(libc::EIO), Ordering::Release);
            shared.set_state(WorkerState::Failed);
            *shared.handle.lock().unwrap() = None;
            barrier.release();
        }
    }
}

fn run_loop(rt: &Runtime, shared: &WorkerShared, io: &WorkerIo) {
    loop {
        if shared.stop.load(Ordering::Relaxed) {
            break;
        }
        if let Err(e) = io.handle.wait_for_op() {
            if shared.stop.load(Ordering::Relaxed) {
                break;
            }
            // Transport hiccup (stray signal and the like): log and
            // re-enter. Exiting here would wedge the channel.
            debug!("ZT({}.{}) wait_for_op: {e}", shared.cpu, shared.channel);
            continue;
        }

        // The op buffer is ours until we re-enter the kernel.
        let opbuf = unsafe {
            std::slice::from_raw_parts_mut(io.opb.as_mut_ptr(), io.opb.len())
        };
        dispatch::dispatch(rt, opbuf, &io.app);
    }
    shared.set_state(WorkerState::Draining);
}
