// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User-space filesystem runtime for the zuf kernel shim.
//!
//! The kernel relays VFS operations to this process through an anonymous
//! control device; a grid of per-CPU worker threads blocks inside the
//! kernel, executes each operation against a pluggable filesystem
//! back-end under the right CPU/NUMA identity, and folds the result back
//! into the shared op buffer. A single mount-controller thread owns the
//! process lifecycle: it captures the machine topology, announces the
//! registered back-ends, then services mount events, spinning up the
//! worker grid on the first mount.
//!
//! The pieces, roughly bottom-up:
//!
//! - [`thread`]: the one primitive every runtime thread is created
//!   through (affinity, scheduling class, thread-local identity);
//! - [`worker`] and [`pool`]: the `(channel, cpu)` worker grid;
//! - [`dispatch`]: operation code to back-end vtable routing;
//! - [`backend`]: the traits a filesystem implementation provides;
//! - [`mount`]: the mount-controller thread;
//! - [`buffer`]: kernel-shared scratch buffers for back-ends;
//! - [`runtime`]: the [`Runtime`] handle tying all of it together.
//!
//! Nothing in here is global: a [`Runtime`] owns every piece of state,
//! which is also what makes the whole stack testable against
//! an in-process fake relay.

pub mod backend;
pub mod buffer;
pub mod config;
mod dispatch;
pub mod mount;
pub mod pool;
pub mod runtime;
pub mod thread;
pub mod worker;

pub use config::{Config, MlockMode};
pub use runtime::Runtime;
