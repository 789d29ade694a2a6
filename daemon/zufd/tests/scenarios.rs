// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios against the in-process fake relay: mount-driven
//! startup, operation routing through real worker threads, shutdown
//! while blocked.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use abi::{
    EvictReq, InodeAttrs, IoReq, MountOp, MountReq, NewInodeReq, OpCode, OpHdr, ZufsStr,
};
use nix::errno::Errno;
use nix::unistd::Pid;
use relay::testing::FakeRelay;
use topology::synthetic_map;
use zerocopy::{FromBytes, IntoBytes};
use zufd::backend::{
    FsDriver, FsInfo, InodeBinding, InodeOps, Mounted, NewInode, PmemRegion, SuperblockOps,
};
use zufd::worker::WorkerState;
use zufd::{Config, Runtime};

/// CPUs this process may actually run on, capped, so the affinity pins
/// in the pool are always satisfiable.
fn test_cpus(max: usize) -> Vec<u32> {
    let set = nix::sched::sched_getaffinity(Pid::from_raw(0)).unwrap();
    (0..abi::MAX_CPUS)
        .filter(|&c| set.is_set(c).unwrap_or(false))
        .take(max)
        .map(|c| c as u32)
        .collect()
}

fn two_node_map(cpus: &[u32]) -> abi::NumaMap {
    let mid = cpus.len().div_ceil(2);
    let (a, b) = cpus.split_at(mid);
    let possible = cpus.iter().max().unwrap() + 1;
    if b.is_empty() {
        synthetic_map(possible, &[a])
    } else {
        synthetic_map(possible, &[a, b])
    }
}

#[derive(Default)]
struct Counters {
    mounts: AtomicUsize,
    umounts: AtomicUsize,
    new_inode: AtomicUsize,
    read: AtomicUsize,
    write: AtomicUsize,
    evict: AtomicUsize,
    next_ino: AtomicU64,
}

struct TestFs {
    counters: Arc<Counters>,
}

impl FsDriver for TestFs {
    fn info(&self) -> FsInfo {
        FsInfo {
            fstype: "testfs".into(),
            version: 1,
        }
    }

    fn mount(&self, _pmem: &PmemRegion, _flags: u32) -> Result<Mounted, Errno> {
        self.counters.mounts.fetch_add(1, Ordering::SeqCst);
        self.counters.next_ino.store(100, Ordering::SeqCst);
        Ok(Mounted {
            ops: Arc::new(TestSb {
                counters: Arc::clone(&self.counters),
            }),
            root: NewInode {
                ops: Arc::new(TestInode {
                    counters: Arc::clone(&self.counters),
                }),
                ino: 1,
                zi_offset: 0x100,
            },
            blocksize: 4096,
        })
    }

    fn umount(&self, _sb: &zufd::backend::SbBinding) -> Result<(), Errno> {
        self.counters.umounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct TestSb {
    counters: Arc<Counters>,
}

impl SuperblockOps for TestSb {
    fn new_inode(
        &self,
        _dir: &InodeBinding,
        _attrs: &InodeAttrs,
        _name: &[u8],
        _tmpfile: bool,
    ) -> Result<NewInode, Errno> {
        self.counters.new_inode.fetch_add(1, Ordering::SeqCst);
        let ino = self.counters.next_ino.fetch_add(1, Ordering::SeqCst);
        Ok(NewInode {
            ops: Arc::new(TestInode {
                counters: Arc::clone(&self.counters),
            }),
            ino,
            zi_offset: 0x100 + ino * 0x40,
        })
    }

    fn evict(&self, _inode: &InodeBinding) {
        self.counters.evict.fetch_add(1, Ordering::SeqCst);
    }
}

struct TestInode {
    counters: Arc<Counters>,
}

impl InodeOps for TestInode {
    fn add_dentry(
        &self,
        _dir: &InodeBinding,
        _child: &InodeBinding,
        _name: &[u8],
    ) -> Result<(), Errno> {
        Ok(())
    }

    fn read(
        &self,
        _inode: &InodeBinding,
        _pos: u64,
        buf: &mut [u8],
        _flags: u32,
    ) -> Result<usize, Errno> {
        self.counters.read.fetch_add(1, Ordering::SeqCst);
        buf.fill(0xAB);
        Ok(buf.len())
    }

    fn write(
        &self,
        _inode: &InodeBinding,
        _pos: u64,
        buf: &[u8],
        _flags: u32,
    ) -> Result<usize, Errno> {
        self.counters.write.fetch_add(1, Ordering::SeqCst);
        Ok(buf.len())
    }
}

struct Stack {
    rt: Arc<Runtime>,
    fake: FakeRelay,
    counters: Arc<Counters>,
    cpus: Vec<u32>,
}

fn stack(max_cpus: usize) -> Stack {
    let cpus = test_cpus(max_cpus);
    let fake = FakeRelay::new(two_node_map(&cpus));
    let counters = Arc::new(Counters::default());
    let driver: Arc<dyn FsDriver> = Arc::new(TestFs {
        counters: Arc::clone(&counters),
    });
    let rt = Runtime::new(Config::default(), Box::new(fake.clone()), vec![driver]);
    rt.start().unwrap();
    Stack {
        rt,
        fake,
        counters,
        cpus,
    }
}

fn mount_bytes(channels: u32, fstype: &[u8]) -> Vec<u8> {
    let req = MountReq {
        hdr: OpHdr {
            offset: 0,
            len: 0,
            operation: MountOp::Mount as u16,
            flags: 0,
            err: 0,
        },
        sb_token: 0,
        pmem_id: 7,
        root_token: 0,
        root_zi_offset: 0,
        num_channels: channels,
        mount_flags: 0,
        blocksize: 0,
        _pad: 0,
        fs_type: ZufsStr::new(fstype).unwrap(),
    };
    req.as_bytes().to_vec()
}

fn op_hdr(op: OpCode) -> OpHdr {
    OpHdr {
        offset: 0,
        len: 0,
        operation: op as u16,
        flags: 0,
        err: 0,
    }
}

#[test]
fn mount_starts_the_grid_and_ops_route() {
    let s = stack(4);

    let mport = s.fake.mount_port();
    assert_eq!(s.fake.registered_fs(), vec!["testfs".to_string()]);

    // First mount: kernel asks for one channel.
    let reply = mport.call(&mount_bytes(1, b"testfs"));
    let (mnt, _) = MountReq::read_from_prefix(&reply).unwrap();
    assert_eq!(mnt.hdr.err, 0);
    assert_ne!(mnt.sb_token, 0);
    assert_ne!(mnt.root_token, 0);
    assert_eq!(mnt.blocksize, 4096);
    assert_eq!(s.counters.mounts.load(Ordering::SeqCst), 1);

    assert_eq!(s.rt.pool_channels(), 1);
    let topo_nodes: Vec<u32> = {
        let topo = s.rt.topology().unwrap();
        s.cpus.iter().map(|&c| topo.cpu_to_node(c)).collect()
    };
    for (&cpu, &node) in s.cpus.iter().zip(&topo_nodes) {
        assert_eq!(s.rt.worker_state(0, cpu), Some(WorkerState::Ready));
        // Each worker runs under its slot's identity.
        assert_eq!(s.rt.worker_identity(0, cpu), Some((cpu, node)));
    }

    // Route a small op sequence through the first worker.
    let port = s.fake.worker_port(s.cpus[0], 0).unwrap();

    let ni = NewInodeReq {
        hdr: op_hdr(OpCode::NewInode),
        dir_token: mnt.root_token,
        token: 0,
        zi_offset: 0,
        flags: 0,
        _pad: 0,
        attrs: InodeAttrs::default(),
        name: ZufsStr::new(b"file").unwrap(),
    };
    let reply = port.call(ni.as_bytes());
    let (ni_out, _) = NewInodeReq::read_from_prefix(&reply).unwrap();
    assert_eq!(ni_out.hdr.err, 0);
    assert_ne!(ni_out.token, 0);

    port.write_app(0, b"payload-bytes!");
    let wr = IoReq {
        hdr: OpHdr {
            offset: 0,
            len: 14,
            ..op_hdr(OpCode::Write)
        },
        token: ni_out.token,
        pos: 0,
        bytes: 14,
        io_flags: 0,
        _pad: 0,
    };
    let reply = port.call(wr.as_bytes());
    let (wr_out, _) = IoReq::read_from_prefix(&reply).unwrap();
    assert_eq!(wr_out.hdr.err, 0);
    assert_eq!(wr_out.bytes, 14);

    let rd = IoReq {
        hdr: OpHdr {
            offset: 64,
            len: 8,
            ..op_hdr(OpCode::Read)
        },
        ..wr
    };
    let reply = port.call(rd.as_bytes());
    let (rd_out, _) = IoReq::read_from_prefix(&reply).unwrap();
    assert_eq!(rd_out.hdr.err, 0);
    assert_eq!(port.read_app(64, 8), vec![0xAB; 8]);

    let ev = EvictReq {
        hdr: op_hdr(OpCode::EvictInode),
        token: ni_out.token,
        flags: 0,
        _pad: 0,
    };
    let reply = port.call(ev.as_bytes());
    let (ev_out, _) = EvictReq::read_from_prefix(&reply).unwrap();
    assert_eq!(ev_out.hdr.err, 0);

    // BREAK is a no-op the worker survives.
    let reply = port.call(op_hdr(OpCode::Break).as_bytes());
    let (brk, _) = OpHdr::read_from_prefix(&reply).unwrap();
    assert_eq!(brk.err, 0);
    assert_eq!(s.rt.worker_state(0, s.cpus[0]), Some(WorkerState::Ready));
    port.call(op_hdr(OpCode::Null).as_bytes());

    assert_eq!(s.counters.new_inode.load(Ordering::SeqCst), 1);
    assert_eq!(s.counters.write.load(Ordering::SeqCst), 1);
    assert_eq!(s.counters.read.load(Ordering::SeqCst), 1);
    assert_eq!(s.counters.evict.load(Ordering::SeqCst), 1);

    // Unmount, then shut the whole runtime down while every worker is
    // blocked; that must complete promptly and wake each exactly once.
    let mut um = MountReq::read_from_prefix(&mount_bytes(0, b"testfs"))
        .unwrap()
        .0;
    um.hdr.operation = MountOp::Umount as u16;
    um.sb_token = mnt.sb_token;
    let reply = mport.call(um.as_bytes());
    let (um_out, _) = MountReq::read_from_prefix(&reply).unwrap();
    assert_eq!(um_out.hdr.err, 0);
    assert_eq!(s.counters.umounts.load(Ordering::SeqCst), 1);

    let ports: Vec<_> = s
        .cpus
        .iter()
        .map(|&c| s.fake.worker_port(c, 0).unwrap())
        .collect();
    let rt = Arc::clone(&s.rt);
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        rt.shutdown();
        tx.send(()).unwrap();
    });
    rx.recv_timeout(Duration::from_secs(1))
        .expect("shutdown must complete within the bound");

    assert_eq!(s.rt.pool_channels(), 0);
    for port in &ports {
        assert_eq!(port.break_wakeups(), 1);
    }
}

#[test]
fn unknown_fstype_is_enodev_but_grid_still_starts() {
    let s = stack(1);
    let mport = s.fake.mount_port();

    let reply = mport.call(&mount_bytes(1, b"nope"));
    let (mnt, _) = MountReq::read_from_prefix(&reply).unwrap();
    assert_eq!(mnt.hdr.err, -libc::ENODEV);
    // The grid is sized by the first MOUNT even when the mount itself
    // fails.
    assert_eq!(s.rt.pool_channels(), 1);

    s.rt.shutdown();
}

#[test]
fn second_mount_reuses_the_grid() {
    let s = stack(1);
    let mport = s.fake.mount_port();

    let (a, _) = MountReq::read_from_prefix(&mport.call(&mount_bytes(2, b"testfs")))
        .unwrap();
    assert_eq!(a.hdr.err, 0);
    assert_eq!(s.rt.pool_channels(), 2);

    let (b, _) = MountReq::read_from_prefix(&mport.call(&mount_bytes(7, b"testfs")))
        .unwrap();
    assert_eq!(b.hdr.err, 0);
    // Channel count is fixed at first mount.
    assert_eq!(s.rt.pool_channels(), 2);
    assert_ne!(a.sb_token, b.sb_token);
    assert_ne!(a.root_token, b.root_token);

    s.rt.shutdown();
}

#[test]
fn debug_channel_defaults_to_enotsup() {
    let s = stack(1);
    let mport = s.fake.mount_port();

    let (mnt, _) = MountReq::read_from_prefix(&mport.call(&mount_bytes(1, b"testfs")))
        .unwrap();
    assert_eq!(mnt.hdr.err, 0);

    let ddbg = abi::DdbgReq {
        hdr: OpHdr {
            offset: 0,
            len: 0,
            operation: MountOp::DdbgRead as u16,
            flags: 0,
            err: 0,
        },
        sb_token: mnt.sb_token,
        bytes: 0,
        buf: [0; abi::DDBG_PAYLOAD],
    };
    let reply = mport.call(ddbg.as_bytes());
    let (out, _) = OpHdr::read_from_prefix(&reply).unwrap();
    assert_eq!(out.err, -libc::ENOTSUP);

    s.rt.shutdown();
}
