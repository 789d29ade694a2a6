// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process-wide configuration, read once at startup and immutable
//! thereafter.

use std::path::PathBuf;

use crate::thread::SchedPolicy;

/// Debug-mask bits; each enables a family of `debug!` traces.
pub const DEBUG_OPS: u32 = 1 << 0;
pub const DEBUG_MOUNT: u32 = 1 << 1;
pub const DEBUG_THREADS: u32 = 1 << 2;

/// Whether and how to pin the process's pages.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum MlockMode {
    #[default]
    None,
    /// Lock what is resident now.
    Current,
    /// Lock current and future mappings.
    All,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Control directory of the kernel shim.
    pub root: PathBuf,
    /// Debug mask ([`DEBUG_OPS`] and friends).
    pub debug: u32,
    pub mlock: MlockMode,
    /// When set, workers run under real-time round-robin scheduling at
    /// this priority.
    pub rt_priority: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from(abi::DEFAULT_MOUNT_ROOT),
            debug: 0,
            mlock: MlockMode::None,
            rt_priority: None,
        }
    }
}

impl Config {
    /// Scheduling class worker threads are created with.
    pub fn worker_policy(&self) -> SchedPolicy {
        match self.rt_priority {
            Some(priority) => SchedPolicy::RoundRobin { priority },
            None => SchedPolicy::Default,
        }
    }
}
