// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The worker grid: `workers[channel][cpu]` over every possible CPU,
//! with live workers only on online CPUs.
//!
//! Startup arms a wait-for-zero barrier with `channels x online_cpus`,
//! creates every worker pinned to its CPU (ascending CPU order within a
//! channel, ascending channel order), waits for all of them to come up
//! or fail, and aborts the whole pool if any slot reported an error.
//!
//! Shutdown is cooperative: per channel, set every worker's stop flag,
//! wake the kernel-blocked waits with one break-all, then join.

use std::io;
use std::sync::Arc;

use log::{info, warn};
use relay::RelayHandle as _;
use waitzero::WaitZero;

use crate::runtime::Runtime;
use crate::thread::{self, ThreadParams, WorkerCap};
use crate::worker::{worker_main, WorkerShared, WorkerState};

pub struct Worker {
    pub shared: Arc<WorkerShared>,
    thread: Option<thread::ZtThread>,
}

impl Worker {
    pub fn is_online_slot(&self) -> bool {
        self.thread.is_some() || self.shared.state() != WorkerState::Created
    }
}

/// The two-dimensional worker grid. Zeroed (no channels) until the
/// first mount.
#[derive(Default)]
pub struct WorkerPool {
    channels: u32,
    workers: Vec<Vec<Worker>>,
}

impl WorkerPool {
    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn worker(&self, channel: u32, cpu: u32) -> Option<&Worker> {
        self.workers.get(channel as usize)?.get(cpu as usize)
    }

    /// Brings up `channels x online_cpus` workers. On any worker init
    /// failure the pool is torn down again and the first error is
    /// returned.
    pub fn start(
        &mut self,
        rt: &Arc<Runtime>,
        params: &ThreadParams,
        channels: u32,
    ) -> io::Result<()> {
        if self.channels != 0 {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "worker pool already started",
            ));
        }
        if channels == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero channels requested",
            ));
        }
        let topo = rt.topology().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "topology not initialized")
        })?;

        let online = topo.online_count() as usize;
        let barrier = Arc::new(WaitZero::new());
        barrier.arm(channels as usize * online);

        for channel in 0..channels {
            let mut row = Vec::with_capacity(topo.nr_cpu_ids() as usize);
            for cpu in 0..topo.nr_cpu_ids() {
                let shared = Arc::new(WorkerShared::new(cpu, channel));
                let mut thread = None;
                if topo.is_online(cpu) {
                    let mut p = params.clone();
                    p.one_cpu = Some(cpu);
                    p.nid = None;
                    p.name = format!("ZT({cpu}.{channel})");
                    let body = {
                        let rt = Arc::clone(rt);
                        let shared = Arc::clone(&shared);
                        let barrier = Arc::clone(&barrier);
                        move || worker_main(rt, shared, barrier)
                    };
                    let cap: Arc<dyn WorkerCap> = shared.clone();
                    match thread::spawn(Some(topo), &p, Some(cap), body) {
                        Ok(t) => thread = Some(t),
                        Err(e) => {
                            // The thread never ran; stand in for its
                            // barrier release ourselves.
                            warn!("ZT({cpu}.{channel}) create failed: {e}");
                            shared.last_err.store(
                                e.raw_os_error().unwrap_or(libc::EAGAIN),
                                std::sync::atomic::Ordering::Release,
                            );
                            shared.set_state(WorkerState::Failed);
                            barrier.release();
                        }
                    }
                }
                row.push(Worker { shared, thread });
            }
            self.workers.push(row);
        }
        self.channels = channels;

        barrier.wait();

        let mut first_err = 0;
        for row in &self.workers {
            for w in row {
                let e = w.shared.last_err();
                if e != 0 && first_err == 0 {
                    first_err = e;
                }
            }
        }
        if first_err != 0 {
            self.stop();
            return Err(io::Error::from_raw_os_error(first_err));
        }

        info!("worker pool up: {channels} channel(s) x {online} cpu(s)");
        Ok(())
    }

    /// Stops and joins every worker, channel by channel, then zeroes
    /// the pool. Idempotent.
    pub fn stop(&mut self) {
        for row in &mut self.workers {
            for w in row.iter() {
                w.shared.stop.store(true, std::sync::atomic::Ordering::Relaxed);
            }
            // One break-all per channel wakes every blocked worker on
            // that channel.
            if let Some(h) = row.iter().find_map(|w| w.shared.handle()) {
                if let Err(e) = h.break_all() {
                    warn!("break_all failed: {e}");
                }
            }
            for w in row.iter_mut() {
                if let Some(t) = w.thread.take() {
                    t.join();
                }
            }
        }
        if self.channels != 0 {
            info!("worker pool stopped");
        }
        self.workers.clear();
        self.channels = 0;
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}
