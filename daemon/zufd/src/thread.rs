// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The thread primitive every runtime thread is created through.
//!
//! [`spawn`] binds affinity, scheduling class and priority *before* the
//! entry function runs, and installs a thread-local identity record
//! holding the bound CPU and NUMA node. Setup failures are reported
//! synchronously to the creator; the entry function never runs after a
//! failed setup.
//!
//! Threads not created here ("foreign" threads, e.g. the process main
//! thread) read back no identity. They can [`adopt`] one, after which
//! the same queries work; a second adoption on the same thread is a
//! caller error. Queries on an unadopted foreign thread degrade to
//! direct OS queries with a one-time warning instead of crashing —
//! a misplaced query in a handler must not take a worker down.

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Once};
use std::thread::JoinHandle;

use log::warn;
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use topology::Topology;

/// Scheduling class of a managed thread.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum SchedPolicy {
    /// Whatever the OS gives us (`SCHED_OTHER`).
    #[default]
    Default,
    /// Real-time round-robin at the given priority.
    RoundRobin { priority: u16 },
}

/// Creation parameters. At most one of `one_cpu`/`nid` may be set:
/// a single-CPU pin implies the node, a node pin leaves the CPU free
/// within that node.
#[derive(Clone, Debug)]
pub struct ThreadParams {
    pub name: String,
    pub policy: SchedPolicy,
    pub one_cpu: Option<u32>,
    pub nid: Option<u32>,
}

impl ThreadParams {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy: SchedPolicy::Default,
            one_cpu: None,
            nid: None,
        }
    }
}

/// Capability a worker thread installs alongside its identity so that
/// worker-only queries (see [`crate::worker::signal_pending`]) can reach
/// the worker record without reinterpreting pointers.
pub trait WorkerCap: Send + Sync {
    fn signal_pending(&self) -> bool;
}

struct Identity {
    cpu: u32,
    node: u32,
    worker: Option<Arc<dyn WorkerCap>>,
    private: Option<Box<dyn Any + Send>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Identity>> = const { RefCell::new(None) };
}

static FOREIGN_WARN: Once = Once::new();

fn warn_foreign(what: &str) {
    FOREIGN_WARN.call_once(|| {
        warn!("{what} called on a foreign thread; falling back to OS queries");
    });
}

/// A joinable managed thread.
#[derive(Debug)]
pub struct ZtThread {
    handle: JoinHandle<()>,
    name: String,
}

impl ZtThread {
    pub fn join(self) {
        if self.handle.join().is_err() {
            warn!("thread {} panicked", self.name);
        }
    }
}

fn os_getcpu() -> io::Result<(u32, u32)> {
    let mut cpu: libc::c_uint = 0;
    let mut node: libc::c_uint = 0;
    let rc = unsafe {
        libc::syscall(
            libc::SYS_getcpu,
            &mut cpu as *mut libc::c_uint,
            &mut node as *mut libc::c_uint,
            std::ptr::null_mut::<libc::c_void>(),
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((cpu, node))
}

fn set_policy(policy: SchedPolicy) -> io::Result<()> {
    match policy {
        SchedPolicy::Default => Ok(()),
        SchedPolicy::RoundRobin { priority } => {
            let param = libc::sched_param {
                sched_priority: i32::from(priority),
            };
            let rc = unsafe {
                libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_RR, &param)
            };
            if rc != 0 {
                Err(io::Error::from_raw_os_error(rc))
            } else {
                Ok(())
            }
        }
    }
}

fn pin_current(set: &CpuSet) -> io::Result<()> {
    sched_setaffinity(Pid::from_raw(0), set)
        .map_err(|e| io::Error::from_raw_os_error(e as i32))
}

/// Spawns a managed thread.
///
/// `topo` is required whenever a CPU or node pin is requested (the pin
/// is resolved against it). The returned error covers everything up to
/// and including the in-thread setup: if `spawn` returns `Ok`, the
/// thread is running `body` with affinity, policy and identity already
/// in place.
pub fn spawn(
    topo: Option<&Topology>,
    params: &ThreadParams,
    worker: Option<Arc<dyn WorkerCap>>,
    body: impl FnOnce() + Send + 'static,
) -> io::Result<ZtThread> {
    if params.one_cpu.is_some() && params.nid.is_some() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "one_cpu and nid are mutually exclusive",
        ));
    }

    // Resolve the pin against the topology up front; CpuSet is plain
    // data and travels into the thread.
    let (pin, fixed_cpu, fixed_node) = match (params.one_cpu, params.nid) {
        (Some(cpu), None) => {
            let topo = topo.ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "cpu pin requires a topology")
            })?;
            let mut set = CpuSet::new();
            set.set(cpu as usize)
                .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            (Some(set), Some(cpu), Some(topo.cpu_to_node(cpu)))
        }
        (None, Some(nid)) => {
            let topo = topo.ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "node pin requires a topology")
            })?;
            let mask = topo.node_mask(nid).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "node out of range")
            })?;
            let mut set = CpuSet::new();
            for cpu in mask.iter() {
                set.set(cpu as usize)
                    .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            }
            (Some(set), None, Some(nid))
        }
        (None, None) => (None, None, None),
        (Some(_), Some(_)) => unreachable!(),
    };

    let policy = params.policy;
    let (tx, rx) = mpsc::channel();
    let name = params.name.clone();
    let handle = std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let setup = (|| -> io::Result<(u32, u32)> {
                if let Some(set) = &pin {
                    pin_current(set)?;
                }
                set_policy(policy)?;
                let (cpu, node) = match (fixed_cpu, fixed_node) {
                    (Some(c), Some(n)) => (c, n),
                    (_, Some(n)) => (os_getcpu()?.0, n),
                    _ => os_getcpu()?,
                };
                Ok((cpu, node))
            })();

            match setup {
                Ok((cpu, node)) => {
                    CURRENT.with(|c| {
                        *c.borrow_mut() = Some(Identity {
                            cpu,
                            node,
                            worker,
                            private: None,
                        });
                    });
                    let _ = tx.send(Ok(()));
                    body();
                    CURRENT.with(|c| *c.borrow_mut() = None);
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                }
            }
        })?;

    match rx.recv() {
        Ok(Ok(())) => Ok(ZtThread { handle, name }),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => {
            let _ = handle.join();
            Err(io::Error::new(
                io::ErrorKind::Other,
                "thread died during setup",
            ))
        }
    }
}

/// Adopts an identity for the current (foreign) thread, populated from
/// `getcpu(2)`. Errors if this thread already carries one.
pub fn adopt() -> io::Result<()> {
    let (cpu, node) = os_getcpu()?;
    adopt_at(cpu, node)
}

/// Like [`adopt`] but records a fixed identity regardless of where the
/// thread actually runs.
pub fn adopt_at(cpu: u32, node: u32) -> io::Result<()> {
    CURRENT.with(|c| {
        let mut cur = c.borrow_mut();
        if cur.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "thread identity already present",
            ));
        }
        *cur = Some(Identity {
            cpu,
            node,
            worker: None,
            private: None,
        });
        Ok(())
    })
}

/// Tears down an adopted (or spawned) identity.
pub fn release() -> io::Result<()> {
    CURRENT.with(|c| {
        let mut cur = c.borrow_mut();
        if cur.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no thread identity to release",
            ));
        }
        *cur = None;
        Ok(())
    })
}

/// Rewrites the recorded identity of an already-managed thread. Used by
/// the mount controller, which presents as `(0, 0)` during setup no
/// matter where it runs.
pub(crate) fn set_identity(cpu: u32, node: u32) {
    CURRENT.with(|c| {
        let mut cur = c.borrow_mut();
        match cur.as_mut() {
            Some(id) => {
                id.cpu = cpu;
                id.node = node;
            }
            None => warn!("set_identity on a foreign thread"),
        }
    });
}

pub fn is_managed() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}

/// CPU this thread is bound to (or was adopted on). Foreign threads
/// fall back to `sched_getcpu` with a one-time warning.
pub fn current_cpu() -> u32 {
    CURRENT.with(|c| c.borrow().as_ref().map(|id| id.cpu)).unwrap_or_else(|| {
        warn_foreign("current_cpu");
        os_getcpu().map(|(c, _)| c).unwrap_or(0)
    })
}

/// NUMA node of this thread; same fallback rules as [`current_cpu`].
pub fn current_node() -> u32 {
    CURRENT.with(|c| c.borrow().as_ref().map(|id| id.node)).unwrap_or_else(|| {
        warn_foreign("current_node");
        os_getcpu().map(|(_, n)| n).unwrap_or(0)
    })
}

/// Opaque OS identity of the current thread.
pub fn self_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

/// Stores the caller-owned per-thread scratch value. No-op with a
/// warning on foreign threads.
pub fn private_set(value: Box<dyn Any + Send>) {
    CURRENT.with(|c| {
        let mut cur = c.borrow_mut();
        match cur.as_mut() {
            Some(id) => id.private = Some(value),
            None => warn_foreign("private_set"),
        }
    });
}

/// Takes the per-thread scratch value back out.
pub fn private_take() -> Option<Box<dyn Any + Send>> {
    CURRENT.with(|c| c.borrow_mut().as_mut().and_then(|id| id.private.take()))
}

/// Runs `f` with the per-thread scratch value, if any.
pub fn with_private<R>(f: impl FnOnce(Option<&mut (dyn Any + Send)>) -> R) -> R {
    CURRENT.with(|c| {
        let mut cur = c.borrow_mut();
        f(cur.as_mut().and_then(|id| id.private.as_deref_mut()))
    })
}

/// Runs `f` with this thread's worker capability, if it is a worker.
pub(crate) fn with_worker<R>(f: impl FnOnce(Option<&Arc<dyn WorkerCap>>) -> R) -> R {
    CURRENT.with(|c| {
        let cur = c.borrow();
        f(cur.as_ref().and_then(|id| id.worker.as_ref()))
    })
}
