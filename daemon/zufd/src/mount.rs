// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The mount controller.
//!
//! One dedicated thread owns startup and the mount channel: it captures
//! the topology snapshot, announces every registered filesystem to the
//! kernel, tells the service manager we are ready, and then blocks for
//! mount events. The first MOUNT sizes the worker grid (the kernel
//! names the channel count) and starts it before the event is
//! dispatched.
//!
//! The thread presents as `(cpu 0, node 0)` regardless of where it
//! runs: per-CPU back-end state is initialized before any worker
//! exists, so nothing during setup depends on the real CPU.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use abi::{normalize_err, DdbgReq, MountOp, MountReq, OpHdr, ZufsStr, OP_BUFFER_BYTES};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use num_traits::FromPrimitive;
use relay::{Relay as _, RelayHandle};
use topology::Topology;
use zerocopy::{FromBytes, IntoBytes, KnownLayout};

use crate::backend::{InodeBinding, PmemRegion, SbBinding};
use crate::config::DEBUG_MOUNT;
use crate::runtime::Runtime;
use crate::thread::{self, ThreadParams};

struct MounterShared {
    stop: AtomicBool,
}

/// Handle on the running mount controller, owned by the runtime.
pub(crate) struct Mounter {
    shared: Arc<MounterShared>,
    thread: thread::ZtThread,
    handle: Arc<dyn RelayHandle>,
}

impl Mounter {
    /// Stops the loop: sets the flag, wakes the blocked receive with
    /// break-all, joins.
    pub(crate) fn stop(self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Err(e) = self.handle.break_all() {
            warn!("mount break_all failed: {e}");
        }
        self.thread.join();
    }
}

pub(crate) fn start(rt: Arc<Runtime>) -> io::Result<Mounter> {
    let handle = rt.relay().open()?;
    let shared = Arc::new(MounterShared {
        stop: AtomicBool::new(false),
    });
    let body = {
        let shared = Arc::clone(&shared);
        let handle = Arc::clone(&handle);
        move || mounter_main(&rt, &shared, handle.as_ref())
    };
    let thread = thread::spawn(None, &ThreadParams::new("zuf-mounter"), None, body)?;
    Ok(Mounter {
        shared,
        thread,
        handle,
    })
}

fn mounter_main(rt: &Arc<Runtime>, shared: &MounterShared, handle: &dyn RelayHandle) {
    thread::set_identity(0, 0);

    // Scratch mount buffer; u64-backed so in-place decoding stays
    // aligned.
    let mut scratch = vec![0u64; OP_BUFFER_BYTES / 8];
    let buf: &mut [u8] = scratch.as_mut_slice().as_mut_bytes();

    let map = match handle.numa_map() {
        Ok(map) => map,
        Err(e) => {
            error!("NUMA map query failed: {e}");
            return;
        }
    };
    match Topology::new(*map) {
        Ok(topo) => {
            info!(
                "topology: {} online cpu(s), {} node(s)",
                topo.online_count(),
                topo.nr_nodes()
            );
            if let Err(e) = rt.init_topology(topo) {
                error!("topology init: {e}");
                return;
            }
        }
        Err(e) => {
            error!("bad NUMA map from kernel: {e}");
            return;
        }
    }

    for driver in rt.drivers() {
        let fs = driver.info();
        let Some(fstype) = ZufsStr::new(fs.fstype.as_bytes()) else {
            error!("filesystem type name too long: {}", fs.fstype);
            return;
        };
        let reg = abi::FsRegister {
            version: fs.version,
            flags: 0,
            fstype,
        };
        if let Err(e) = handle.register_fs(&reg) {
            error!("register_fs({}) failed: {e}", fs.fstype);
            return;
        }
        info!("registered filesystem {} v{}", fs.fstype, fs.version);
    }

    // Best effort; absent service manager is not an error.
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]);

    loop {
        if shared.stop.load(Ordering::Relaxed) {
            break;
        }
        if let Err(e) = handle.receive_mount(buf) {
            if shared.stop.load(Ordering::Relaxed) {
                break;
            }
            debug!("receive_mount: {e}");
            continue;
        }
        let ret = mount_dispatch(rt, buf, handle);
        if let Ok((hdr, _)) = OpHdr::mut_from_prefix(buf) {
            hdr.err = normalize_err(ret);
        }
    }
}

fn with_req<T, F>(buf: &mut [u8], f: F) -> Result<(), Errno>
where
    T: FromBytes + IntoBytes + KnownLayout,
    F: FnOnce(&mut T) -> Result<(), Errno>,
{
    let (req, _) = T::mut_from_prefix(buf).map_err(|_| Errno::EINVAL)?;
    f(req)
}

fn mount_dispatch(rt: &Arc<Runtime>, buf: &mut [u8], handle: &dyn RelayHandle) -> i32 {
    let Ok((hdr, _)) = OpHdr::read_from_prefix(buf) else {
        return -libc::EINVAL;
    };
    let Some(op) = MountOp::from_u16(hdr.operation) else {
        warn!("unknown mount event {}", hdr.operation);
        return -libc::ENOTSUP;
    };
    if rt.config().debug & DEBUG_MOUNT != 0 {
        debug!("mount event {op:?}");
    }

    // The first MOUNT brings up the worker grid, sized by the kernel's
    // requested channel count.
    if op == MountOp::Mount {
        let channels = match MountReq::read_from_prefix(buf) {
            Ok((req, _)) => req.num_channels,
            Err(_) => return -libc::EINVAL,
        };
        let mut pool = rt.pool.lock().unwrap();
        if pool.channels() == 0 {
            if let Err(e) = pool.start(rt, &rt.worker_params(), channels) {
                error!("worker pool start ({channels} channels): {e}");
                return -e.raw_os_error().unwrap_or(libc::EIO);
            }
        }
    }

    let res = match op {
        MountOp::Mount => with_req::<MountReq, _>(buf, |req| {
            let driver = rt
                .driver_for(req.fs_type.as_bytes())
                .ok_or(Errno::ENODEV)?;
            let pmem = PmemRegion::grab(handle, req.pmem_id).map_err(|e| {
                error!("pmem grab {} failed: {e}", req.pmem_id);
                Errno::EIO
            })?;
            let mounted = driver.mount(&pmem, req.mount_flags)?;
            let sb = Arc::new(SbBinding {
                ops: mounted.ops,
                driver,
                pmem,
            });
            let root = Arc::new(InodeBinding {
                ops: mounted.root.ops,
                ino: mounted.root.ino,
                parent_ino: mounted.root.ino,
                zi_offset: mounted.root.zi_offset,
                sb: Arc::clone(&sb),
            });
            req.sb_token = rt.superblocks().insert(sb);
            req.root_zi_offset = root.zi_offset;
            req.root_token = rt.inodes().insert(root);
            req.blocksize = mounted.blocksize;
            info!("mounted (sb token {})", req.sb_token);
            Ok(())
        }),

        MountOp::Umount => with_req::<MountReq, _>(buf, |req| {
            let sb = rt
                .superblocks()
                .remove(req.sb_token)
                .ok_or(Errno::EINVAL)?;
            sb.driver.umount(&sb)?;
            info!("unmounted (sb token {})", req.sb_token);
            Ok(())
        }),

        MountOp::Remount => with_req::<MountReq, _>(buf, |req| {
            let sb = rt.superblock(req.sb_token)?;
            sb.driver.remount(&sb, req.mount_flags)
        }),

        MountOp::DdbgRead => with_req::<DdbgReq, _>(buf, |req| {
            let sb = rt.superblock(req.sb_token)?;
            let n = sb.driver.ddbg_read(&sb, &mut req.buf)?;
            req.bytes = n as u64;
            Ok(())
        }),

        MountOp::DdbgWrite => with_req::<DdbgReq, _>(buf, |req| {
            let sb = rt.superblock(req.sb_token)?;
            let len = usize::try_from(req.bytes)
                .ok()
                .filter(|&l| l <= req.buf.len())
                .ok_or(Errno::EINVAL)?;
            sb.driver.ddbg_write(&sb, &req.buf[..len])
        }),
    };

    match res {
        Ok(()) => 0,
        Err(e) => e as i32,
    }
}
