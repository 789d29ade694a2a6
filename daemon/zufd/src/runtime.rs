// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The runtime handle.
//!
//! Everything process-wide lives here — configuration, the relay
//! factory, the topology snapshot (set once by the mount controller),
//! the driver registry, the token tables and the worker pool. There are
//! no globals: a test instantiates its own `Runtime` against a fake
//! relay and gets a fully isolated stack.

use std::io;
use std::sync::{Arc, Mutex, OnceLock};

use log::info;
use nix::errno::Errno;
use topology::Topology;

use crate::backend::{FsDriver, HandleTable, InodeBinding, SbBinding};
use crate::config::Config;
use crate::mount::Mounter;
use crate::pool::WorkerPool;
use crate::thread::ThreadParams;
use crate::worker::WorkerState;
use relay::Relay;

pub struct Runtime {
    config: Config,
    relay: Box<dyn Relay>,
    topology: OnceLock<Topology>,
    drivers: Vec<Arc<dyn FsDriver>>,
    superblocks: HandleTable<SbBinding>,
    inodes: HandleTable<InodeBinding>,
    pub(crate) pool: Mutex<WorkerPool>,
    mounter: Mutex<Option<Mounter>>,
}

impl Runtime {
    pub fn new(
        config: Config,
        relay: Box<dyn Relay>,
        drivers: Vec<Arc<dyn FsDriver>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            relay,
            topology: OnceLock::new(),
            drivers,
            superblocks: HandleTable::new(),
            inodes: HandleTable::new(),
            pool: Mutex::new(WorkerPool::default()),
            mounter: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn relay(&self) -> &dyn Relay {
        self.relay.as_ref()
    }

    /// The topology snapshot; `None` until the mount controller has
    /// initialized it.
    pub fn topology(&self) -> Option<&Topology> {
        self.topology.get()
    }

    /// One-shot topology publication. A second call is a programmer
    /// error (two mount controllers).
    pub(crate) fn init_topology(&self, topo: Topology) -> io::Result<()> {
        self.topology.set(topo).map_err(|_| {
            io::Error::new(io::ErrorKind::AlreadyExists, "topology already initialized")
        })
    }

    pub fn drivers(&self) -> &[Arc<dyn FsDriver>] {
        &self.drivers
    }

    pub fn driver_for(&self, fstype: &[u8]) -> Option<Arc<dyn FsDriver>> {
        self.drivers
            .iter()
            .find(|d| d.info().fstype.as_bytes() == fstype)
            .cloned()
    }

    pub fn superblocks(&self) -> &HandleTable<SbBinding> {
        &self.superblocks
    }

    pub fn inodes(&self) -> &HandleTable<InodeBinding> {
        &self.inodes
    }

    /// Token lookups as handlers do them; a stale or garbage token is
    /// answered with `EINVAL`, never a crash.
    pub(crate) fn superblock(&self, token: u64) -> Result<Arc<SbBinding>, Errno> {
        self.superblocks.get(token).ok_or(Errno::EINVAL)
    }

    pub(crate) fn inode(&self, token: u64) -> Result<Arc<InodeBinding>, Errno> {
        self.inodes.get(token).ok_or(Errno::EINVAL)
    }

    /// Template for worker threads, derived from the frozen config.
    pub(crate) fn worker_params(&self) -> ThreadParams {
        let mut p = ThreadParams::new("ZT");
        p.policy = self.config.worker_policy();
        p
    }

    /// Spawns the mount controller. The worker grid comes up later, on
    /// the first mount event.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        let mut mounter = self.mounter.lock().unwrap();
        if mounter.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "runtime already started",
            ));
        }
        *mounter = Some(crate::mount::start(Arc::clone(self))?);
        Ok(())
    }

    /// Orderly shutdown: workers first (so nothing is executing
    /// operations), then the mount loop, then the back-ends' own
    /// unregister hooks.
    pub fn shutdown(&self) {
        self.pool.lock().unwrap().stop();
        if let Some(m) = self.mounter.lock().unwrap().take() {
            m.stop();
        }
        for d in &self.drivers {
            d.unregister();
        }
        info!("runtime shut down");
    }

    // Introspection used by tests and by operational logging.

    pub fn pool_channels(&self) -> u32 {
        self.pool.lock().unwrap().channels()
    }

    pub fn worker_state(&self, channel: u32, cpu: u32) -> Option<WorkerState> {
        let pool = self.pool.lock().unwrap();
        pool.worker(channel, cpu).map(|w| w.shared.state())
    }

    /// `(cpu, node)` a worker recorded on first loop entry.
    pub fn worker_identity(&self, channel: u32, cpu: u32) -> Option<(u32, u32)> {
        let pool = self.pool.lock().unwrap();
        pool.worker(channel, cpu)
            .and_then(|w| w.shared.observed_identity())
    }
}
