// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The zufd daemon binary: parse flags, freeze the configuration, run
//! the runtime until signalled.
//!
//! Filesystem back-ends are linked-in crates that hand their
//! [`zufd::backend::FsDriver`] to [`zufd::Runtime::new`]; the bare
//! binary runs with an empty registry, which is still a functional
//! relay endpoint (useful for shim bring-up).

use std::path::PathBuf;
use std::sync::mpsc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};
use nix::sys::mman::{mlockall, MlockAllFlags};

use relay::dev::DevRelay;
use zufd::{Config, MlockMode, Runtime};

#[derive(Debug, Parser)]
#[clap(name = "zufd", about = "user-space filesystem runtime for the zuf kernel shim")]
struct Args {
    /// Control directory of the kernel shim (default `/sys/fs/zuf`).
    #[clap(long)]
    root: Option<PathBuf>,

    /// Debug trace mask (see config::DEBUG_*).
    #[clap(long, default_value_t = 0)]
    debug: u32,

    /// Lock current and future mappings into RAM.
    #[clap(long)]
    mlock: bool,

    /// Run workers under real-time round-robin at this priority.
    #[clap(long)]
    rt_prio: Option<u16>,

    /// Verbose logging (debug level).
    #[clap(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if args.verbose {
        logger.filter_level(LevelFilter::Debug);
    }
    logger.init();

    let root = args
        .root
        .unwrap_or_else(|| PathBuf::from(abi::DEFAULT_MOUNT_ROOT));
    let config = Config {
        root: root.clone(),
        debug: args.debug,
        mlock: if args.mlock {
            MlockMode::All
        } else {
            MlockMode::None
        },
        rt_priority: args.rt_prio,
    };

    match config.mlock {
        MlockMode::None => {}
        MlockMode::Current => {
            mlockall(MlockAllFlags::MCL_CURRENT).context("mlockall(MCL_CURRENT)")?;
        }
        MlockMode::All => {
            mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE)
                .context("mlockall(MCL_CURRENT|MCL_FUTURE)")?;
        }
    }

    let relay = Box::new(DevRelay::new(root.clone()));
    let runtime = Runtime::new(config, relay, Vec::new());
    if runtime.drivers().is_empty() {
        warn!("no filesystem drivers linked in; serving protocol only");
    }

    runtime.start().context("starting mount controller")?;
    info!("zufd up, relay root {}", root.display());

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("installing signal handler")?;
    let _ = rx.recv();

    info!("signal received, shutting down");
    runtime.shutdown();
    Ok(())
}
