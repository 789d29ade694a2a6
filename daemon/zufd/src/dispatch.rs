// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The operation demultiplexer.
//!
//! A pure function from the op buffer (header plus op-specific request
//! struct, decoded in place) and the worker's app window to a result
//! code. Routing is a dense match over [`OpCode`], one handler per
//! code; the absent-entry policies live in the default bodies of the
//! back-end traits, so a handler just calls the vtable.
//!
//! Every result is folded through [`abi::normalize_err`] into the
//! header before returning: the kernel only ever sees `err <= 0`.

use abi::{
    normalize_err, BlockReq, CloneReq, DentryReq, EvictReq, FallocateReq, FreeInodeReq, IoReq,
    IoctlReq, LlseekReq, LookupReq, MmapCloseReq, NewInodeReq, OpCode, OpHdr, ReaddirReq,
    RenameReq, SetattrReq, StatfsReq, SymlinkReq, SyncReq, XattrReq, EvictFlags, NewInodeFlags,
};
use log::{debug, warn};
use nix::errno::Errno;
use num_traits::FromPrimitive;
use relay::Window;
use zerocopy::{FromBytes, IntoBytes, KnownLayout};

use crate::backend::InodeBinding;
use crate::config::DEBUG_OPS;
use crate::runtime::Runtime;
use std::sync::Arc;

/// Decodes the request struct for the current op and runs `f` on it.
fn with_req<T, F>(opbuf: &mut [u8], f: F) -> Result<(), Errno>
where
    T: FromBytes + IntoBytes + KnownLayout,
    F: FnOnce(&mut T) -> Result<(), Errno>,
{
    let (req, _) = T::mut_from_prefix(opbuf).map_err(|_| Errno::EINVAL)?;
    f(req)
}

/// Payload slice for a data-bearing op: `app + hdr.offset`, `hdr.len`
/// bytes, bounds-checked against the mapped window.
fn payload(app: &Window, offset: u64, len: u64) -> Result<&mut [u8], Errno> {
    let offset = usize::try_from(offset).map_err(|_| Errno::EFAULT)?;
    let len = usize::try_from(len).map_err(|_| Errno::EFAULT)?;
    if offset.checked_add(len).map_or(true, |end| end > app.len()) {
        return Err(Errno::EFAULT);
    }
    // In bounds per the check above; the kernel owns the other side of
    // this memory but hands it to us for the duration of the op.
    Ok(unsafe { std::slice::from_raw_parts_mut(app.as_mut_ptr().add(offset), len) })
}

/// Runs one operation out of `opbuf` and folds the normalized result
/// into the header. Returns the value written to `hdr.err`.
pub(crate) fn dispatch(rt: &Runtime, opbuf: &mut [u8], app: &Window) -> i32 {
    let Ok((hdr, _)) = OpHdr::read_from_prefix(opbuf) else {
        return -libc::EINVAL;
    };

    let ret = match OpCode::from_u16(hdr.operation) {
        Some(op) => {
            if rt.config().debug & DEBUG_OPS != 0 {
                debug!("op {op:?} offset={} len={}", hdr.offset, hdr.len);
            }
            match run_op(rt, op, &hdr, opbuf, app) {
                Ok(()) => 0,
                Err(e) => e as i32,
            }
        }
        None => {
            warn!("unknown operation code {}", hdr.operation);
            libc::ENOTSUP
        }
    };

    let err = normalize_err(ret);
    if let Ok((hdr, _)) = OpHdr::mut_from_prefix(opbuf) {
        hdr.err = err;
    }
    err
}

fn run_op(
    rt: &Runtime,
    op: OpCode,
    hdr: &OpHdr,
    opbuf: &mut [u8],
    app: &Window,
) -> Result<(), Errno> {
    match op {
        OpCode::Null | OpCode::Break => Ok(()),

        OpCode::Statfs => with_req::<StatfsReq, _>(opbuf, |req| {
            let sb = rt.superblock(req.sb_token)?;
            req.stats = sb.ops.statfs()?;
            Ok(())
        }),

        OpCode::NewInode => with_req::<NewInodeReq, _>(opbuf, |req| {
            let dir = rt.inode(req.dir_token)?;
            let tmpfile =
                NewInodeFlags::from_bits_truncate(req.flags).contains(NewInodeFlags::TMPFILE);
            let sb = Arc::clone(&dir.sb);
            let new = sb.ops.new_inode(&dir, &req.attrs, req.name.as_bytes(), tmpfile)?;
            let binding = Arc::new(InodeBinding {
                ops: new.ops,
                ino: new.ino,
                parent_ino: if tmpfile { 0 } else { dir.ino },
                zi_offset: new.zi_offset,
                sb: Arc::clone(&sb),
            });
            if !tmpfile {
                if let Err(e) = dir.ops.add_dentry(&dir, &binding, req.name.as_bytes()) {
                    // Dentry insert failed: take the allocation back.
                    sb.ops.free_inode(&binding);
                    return Err(e);
                }
            }
            req.zi_offset = binding.zi_offset;
            req.token = rt.inodes().insert(binding);
            Ok(())
        }),

        OpCode::FreeInode => with_req::<FreeInodeReq, _>(opbuf, |req| {
            let inode = rt.inodes().remove(req.token).ok_or(Errno::EINVAL)?;
            inode.sb.ops.free_inode(&inode);
            Ok(())
        }),

        OpCode::EvictInode => with_req::<EvictReq, _>(opbuf, |req| {
            let inode = rt.inodes().remove(req.token).ok_or(Errno::EINVAL)?;
            let race =
                EvictFlags::from_bits_truncate(req.flags).contains(EvictFlags::LOOKUP_RACE);
            if !race {
                inode.sb.ops.evict(&inode);
            }
            Ok(())
        }),

        OpCode::Lookup => with_req::<LookupReq, _>(opbuf, |req| {
            let dir = rt.inode(req.dir_token)?;
            match req.name.as_bytes() {
                b"." => {
                    req.ino = dir.ino;
                    req.token = req.dir_token;
                    req.zi_offset = dir.zi_offset;
                }
                b".." => {
                    req.ino = dir.parent_ino;
                    req.token = 0;
                    req.zi_offset = 0;
                }
                name => {
                    let found = dir.ops.lookup(&dir, name)?.ok_or(Errno::ENOENT)?;
                    let binding = Arc::new(InodeBinding {
                        ops: found.ops,
                        ino: found.ino,
                        parent_ino: dir.ino,
                        zi_offset: found.zi_offset,
                        sb: Arc::clone(&dir.sb),
                    });
                    req.ino = binding.ino;
                    req.zi_offset = binding.zi_offset;
                    req.token = rt.inodes().insert(binding);
                }
            }
            Ok(())
        }),

        OpCode::AddDentry => with_req::<DentryReq, _>(opbuf, |req| {
            let dir = rt.inode(req.dir_token)?;
            let child = rt.inode(req.child_token)?;
            dir.ops.add_dentry(&dir, &child, req.name.as_bytes())
        }),

        OpCode::RemoveDentry => with_req::<DentryReq, _>(opbuf, |req| {
            let dir = rt.inode(req.dir_token)?;
            let child = rt.inode(req.child_token)?;
            dir.ops.remove_dentry(&dir, &child, req.name.as_bytes())
        }),

        OpCode::Rename => with_req::<RenameReq, _>(opbuf, |req| {
            let old_dir = rt.inode(req.old_dir_token)?;
            let new_dir = rt.inode(req.new_dir_token)?;
            old_dir.ops.rename(
                &old_dir,
                &new_dir,
                req.old_name.as_bytes(),
                req.new_name.as_bytes(),
                req.flags,
            )
        }),

        OpCode::Readdir => {
            let buf = payload(app, hdr.offset, hdr.len)?;
            with_req::<ReaddirReq, _>(opbuf, |req| {
                let dir = rt.inode(req.dir_token)?;
                let (cookie, written) = dir.ops.readdir(&dir, req.cookie, buf)?;
                req.cookie = cookie;
                req.written = written as u64;
                Ok(())
            })
        }

        OpCode::Read => {
            let buf = payload(app, hdr.offset, hdr.len)?;
            with_req::<IoReq, _>(opbuf, |req| {
                let inode = rt.inode(req.token)?;
                let n = inode.ops.read(&inode, req.pos, buf, req.io_flags)?;
                req.bytes = n as u64;
                Ok(())
            })
        }

        OpCode::Write => {
            let buf = payload(app, hdr.offset, hdr.len)?;
            with_req::<IoReq, _>(opbuf, |req| {
                let inode = rt.inode(req.token)?;
                let n = inode.ops.write(&inode, req.pos, buf, req.io_flags)?;
                req.bytes = n as u64;
                Ok(())
            })
        }

        OpCode::PreRead => with_req::<IoReq, _>(opbuf, |req| {
            let inode = rt.inode(req.token)?;
            inode.ops.pre_read(&inode, req.pos, req.bytes)
        }),

        OpCode::GetBlock => with_req::<BlockReq, _>(opbuf, |req| {
            let inode = rt.inode(req.token)?;
            let mapping = inode.ops.get_block(&inode, req.index, req.rw != 0)?;
            req.bno = mapping.bno;
            req.flags = mapping.flags;
            Ok(())
        }),

        OpCode::PutBlock => with_req::<BlockReq, _>(opbuf, |req| {
            let inode = rt.inode(req.token)?;
            inode.ops.put_block(&inode, req.index)
        }),

        OpCode::MmapClose => with_req::<MmapCloseReq, _>(opbuf, |req| {
            let inode = rt.inode(req.token)?;
            inode.ops.mmap_close(&inode)
        }),

        OpCode::GetSymlink => with_req::<SymlinkReq, _>(opbuf, |req| {
            let inode = rt.inode(req.token)?;
            req.sym_offset = inode.ops.get_symlink(&inode)?;
            Ok(())
        }),

        OpCode::Setattr => with_req::<SetattrReq, _>(opbuf, |req| {
            let inode = rt.inode(req.token)?;
            inode
                .ops
                .setattr(&inode, req.mask, &req.attrs, req.truncate_size)
        }),

        OpCode::Sync => with_req::<SyncReq, _>(opbuf, |req| {
            let inode = rt.inode(req.token)?;
            inode.ops.sync(&inode, req.pos, req.bytes)
        }),

        OpCode::Fallocate => with_req::<FallocateReq, _>(opbuf, |req| {
            let inode = rt.inode(req.token)?;
            inode.ops.fallocate(&inode, req.mode, req.pos, req.bytes)
        }),

        OpCode::Llseek => with_req::<LlseekReq, _>(opbuf, |req| {
            let inode = rt.inode(req.token)?;
            req.offset = inode.ops.llseek(&inode, req.offset, req.whence)?;
            Ok(())
        }),

        OpCode::Ioctl => {
            let arg = payload(app, hdr.offset, hdr.len)?;
            with_req::<IoctlReq, _>(opbuf, |req| {
                let inode = rt.inode(req.token)?;
                inode.ops.ioctl(&inode, req.cmd, arg)
            })
        }

        OpCode::XattrGet => {
            let buf = payload(app, hdr.offset, hdr.len)?;
            with_req::<XattrReq, _>(opbuf, |req| {
                let inode = rt.inode(req.token)?;
                let n = inode.ops.getxattr(&inode, req.name.as_bytes(), buf)?;
                req.value_bytes = n as u32;
                Ok(())
            })
        }

        OpCode::XattrSet => {
            let buf = payload(app, hdr.offset, hdr.len)?;
            with_req::<XattrReq, _>(opbuf, |req| {
                let inode = rt.inode(req.token)?;
                let len = usize::try_from(req.value_bytes).map_err(|_| Errno::EINVAL)?;
                let value = buf.get(..len).ok_or(Errno::EINVAL)?;
                inode
                    .ops
                    .setxattr(&inode, req.name.as_bytes(), value, req.flags)
            })
        }

        OpCode::XattrList => {
            let buf = payload(app, hdr.offset, hdr.len)?;
            with_req::<XattrReq, _>(opbuf, |req| {
                let inode = rt.inode(req.token)?;
                let n = inode.ops.listxattr(&inode, buf)?;
                req.value_bytes = n as u32;
                Ok(())
            })
        }

        OpCode::Clone => with_req::<CloneReq, _>(opbuf, clone_like(rt, true)),
        OpCode::Copy => with_req::<CloneReq, _>(opbuf, clone_like(rt, false)),
    }
}

fn clone_like(rt: &Runtime, reflink: bool) -> impl FnOnce(&mut CloneReq) -> Result<(), Errno> + '_ {
    move |req| {
        let src = rt.inode(req.src_token)?;
        let dst = rt.inode(req.dst_token)?;
        if reflink {
            src.ops
                .clone_range(&src, &dst, req.pos_in, req.pos_out, req.bytes, req.flags)
        } else {
            src.ops
                .copy_range(&src, &dst, req.pos_in, req.pos_out, req.bytes, req.flags)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        FsDriver, FsInfo, InodeOps, Mounted, NewInode, PmemRegion, SbBinding, SuperblockOps,
    };
    use crate::Config;
    use abi::{InodeAttrs, ZufsStr};
    use relay::testing::FakeRelay;
    use relay::{Relay as _, RelayHandle as _};
    use std::sync::atomic::{AtomicUsize, Ordering as AtOrd};
    use topology::synthetic_map;
    use zerocopy::Immutable;

    #[derive(Default)]
    struct Counters {
        new_inode: AtomicUsize,
        add_dentry: AtomicUsize,
        read: AtomicUsize,
        write: AtomicUsize,
        evict: AtomicUsize,
        free: AtomicUsize,
    }

    struct StubDriver;

    impl FsDriver for StubDriver {
        fn info(&self) -> FsInfo {
            FsInfo {
                fstype: "stubfs".into(),
                version: 1,
            }
        }

        fn mount(&self, _pmem: &PmemRegion, _flags: u32) -> Result<Mounted, Errno> {
            Err(Errno::ENODEV)
        }
    }

    struct StubSb {
        counters: Arc<Counters>,
    }

    impl SuperblockOps for StubSb {
        fn new_inode(
            &self,
            _dir: &InodeBinding,
            _attrs: &abi::InodeAttrs,
            _name: &[u8],
            _tmpfile: bool,
        ) -> Result<NewInode, Errno> {
            self.counters.new_inode.fetch_add(1, AtOrd::SeqCst);
            Ok(NewInode {
                ops: Arc::new(StubInode {
                    counters: Arc::clone(&self.counters),
                }),
                ino: 100,
                zi_offset: 0x1000,
            })
        }

        fn free_inode(&self, _inode: &InodeBinding) {
            self.counters.free.fetch_add(1, AtOrd::SeqCst);
        }

        fn evict(&self, _inode: &InodeBinding) {
            self.counters.evict.fetch_add(1, AtOrd::SeqCst);
        }
    }

    struct StubInode {
        counters: Arc<Counters>,
    }

    impl InodeOps for StubInode {
        fn lookup(
            &self,
            _dir: &InodeBinding,
            _name: &[u8],
        ) -> Result<Option<NewInode>, Errno> {
            // Nothing on disk: every real name misses.
            Ok(None)
        }

        fn add_dentry(
            &self,
            _dir: &InodeBinding,
            _child: &InodeBinding,
            name: &[u8],
        ) -> Result<(), Errno> {
            if name == b"boom" {
                return Err(Errno::ENOSPC);
            }
            self.counters.add_dentry.fetch_add(1, AtOrd::SeqCst);
            Ok(())
        }

        fn read(
            &self,
            _inode: &InodeBinding,
            _pos: u64,
            buf: &mut [u8],
            _flags: u32,
        ) -> Result<usize, Errno> {
            self.counters.read.fetch_add(1, AtOrd::SeqCst);
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
            self.counters.write.fetch_add(1, AtOrd::SeqCst);
            Ok(buf.len())
        }
    }

    struct Fixture {
        rt: Arc<Runtime>,
        app: Window,
        counters: Arc<Counters>,
        dir_token: u64,
    }

    fn fixture() -> Fixture {
        let fake = FakeRelay::new(synthetic_map(2, &[&[0, 1]]));
        let rt = Runtime::new(Config::default(), Box::new(fake), Vec::new());
        let handle = rt.relay().open().unwrap();
        let app = handle.map_app_window().unwrap();
        let counters = Arc::new(Counters::default());

        let pmem = PmemRegion::grab(handle.as_ref(), 1).unwrap();
        let sb = Arc::new(SbBinding {
            ops: Arc::new(StubSb {
                counters: Arc::clone(&counters),
            }),
            driver: Arc::new(StubDriver),
            pmem,
        });
        let dir = Arc::new(InodeBinding {
            ops: Arc::new(StubInode {
                counters: Arc::clone(&counters),
            }),
            ino: 5,
            parent_ino: 3,
            zi_offset: 0x500,
            sb,
        });
        let dir_token = rt.inodes().insert(dir);
        Fixture {
            rt,
            app,
            counters,
            dir_token,
        }
    }

    fn hdr(op: OpCode) -> OpHdr {
        OpHdr {
            offset: 0,
            len: 0,
            operation: op as u16,
            flags: 0,
            err: 0,
        }
    }

    fn run<T: IntoBytes + Immutable>(fx: &Fixture, req: &T) -> (i32, Vec<u8>) {
        let mut scratch = vec![0u64; 512];
        let buf: &mut [u8] = scratch.as_mut_slice().as_mut_bytes();
        let raw = req.as_bytes();
        buf[..raw.len()].copy_from_slice(raw);
        let err = dispatch(&fx.rt, buf, &fx.app);
        (err, buf.to_vec())
    }

    fn name(s: &[u8]) -> ZufsStr {
        ZufsStr::new(s).unwrap()
    }

    #[test]
    fn routes_to_the_right_handlers() {
        let fx = fixture();

        let req = NewInodeReq {
            hdr: hdr(OpCode::NewInode),
            dir_token: fx.dir_token,
            token: 0,
            zi_offset: 0,
            flags: 0,
            _pad: 0,
            attrs: InodeAttrs::default(),
            name: name(b"f"),
        };
        let (err, reply) = run(&fx, &req);
        assert_eq!(err, 0);
        let (got, _) = NewInodeReq::read_from_prefix(&reply).unwrap();
        assert_ne!(got.token, 0);
        assert_eq!(got.zi_offset, 0x1000);

        let io = IoReq {
            hdr: OpHdr {
                offset: 64,
                len: 16,
                ..hdr(OpCode::Write)
            },
            token: got.token,
            pos: 0,
            bytes: 16,
            io_flags: 0,
            _pad: 0,
        };
        assert_eq!(run(&fx, &io).0, 0);

        let io = IoReq {
            hdr: OpHdr {
                offset: 64,
                len: 16,
                ..hdr(OpCode::Read)
            },
            ..io
        };
        let (err, reply) = run(&fx, &io);
        assert_eq!(err, 0);
        let (got_io, _) = IoReq::read_from_prefix(&reply).unwrap();
        assert_eq!(got_io.bytes, 16);

        let ev = EvictReq {
            hdr: hdr(OpCode::EvictInode),
            token: got.token,
            flags: 0,
            _pad: 0,
        };
        assert_eq!(run(&fx, &ev).0, 0);

        assert_eq!(fx.counters.new_inode.load(AtOrd::SeqCst), 1);
        assert_eq!(fx.counters.add_dentry.load(AtOrd::SeqCst), 1);
        assert_eq!(fx.counters.write.load(AtOrd::SeqCst), 1);
        assert_eq!(fx.counters.read.load(AtOrd::SeqCst), 1);
        assert_eq!(fx.counters.evict.load(AtOrd::SeqCst), 1);
    }

    #[test]
    fn absent_entries_follow_the_table() {
        let fx = fixture();

        let rn = RenameReq {
            hdr: hdr(OpCode::Rename),
            old_dir_token: fx.dir_token,
            new_dir_token: fx.dir_token,
            flags: 0,
            _pad: 0,
            old_name: name(b"a"),
            new_name: name(b"b"),
        };
        assert_eq!(run(&fx, &rn).0, -libc::ENOTSUP);

        let xg = XattrReq {
            hdr: hdr(OpCode::XattrGet),
            token: fx.dir_token,
            value_bytes: 0,
            flags: 0,
            name: name(b"user.x"),
        };
        assert_eq!(run(&fx, &xg).0, -libc::ENOTSUP);

        let pb = BlockReq {
            hdr: hdr(OpCode::PutBlock),
            token: fx.dir_token,
            index: 0,
            bno: 0,
            rw: 0,
            flags: 0,
        };
        assert_eq!(run(&fx, &pb).0, 0);

        // get_block is required; absence is an I/O error, not ENOTSUP.
        let gb = BlockReq {
            hdr: hdr(OpCode::GetBlock),
            ..pb
        };
        let (err, reply) = run(&fx, &gb);
        assert_eq!(err, -libc::EIO);
        let (got, _) = OpHdr::read_from_prefix(&reply).unwrap();
        assert_eq!(got.err, -libc::EIO);
    }

    #[test]
    fn lookup_specials() {
        let fx = fixture();

        let lk = |n: &[u8]| LookupReq {
            hdr: hdr(OpCode::Lookup),
            dir_token: fx.dir_token,
            ino: 0,
            token: 0,
            zi_offset: 0,
            name: name(n),
        };

        let (err, reply) = run(&fx, &lk(b"."));
        assert_eq!(err, 0);
        let (got, _) = LookupReq::read_from_prefix(&reply).unwrap();
        assert_eq!(got.ino, 5);
        assert_eq!(got.token, fx.dir_token);
        assert_eq!(got.zi_offset, 0x500);

        let (err, reply) = run(&fx, &lk(b".."));
        assert_eq!(err, 0);
        let (got, _) = LookupReq::read_from_prefix(&reply).unwrap();
        assert_eq!(got.ino, 3);
        assert_eq!(got.token, 0);

        assert_eq!(run(&fx, &lk(b"x")).0, -libc::ENOENT);
    }

    #[test]
    fn unknown_op_is_logged_not_fatal() {
        let fx = fixture();
        let bad = OpHdr {
            operation: 0x7777,
            ..hdr(OpCode::Null)
        };
        let (err, reply) = run(&fx, &bad);
        assert_eq!(err, -libc::ENOTSUP);
        let (got, _) = OpHdr::read_from_prefix(&reply).unwrap();
        assert!(got.err <= 0);
    }

    #[test]
    fn stale_tokens_are_einval() {
        let fx = fixture();
        let fr = FreeInodeReq {
            hdr: hdr(OpCode::FreeInode),
            token: 0xDEAD,
        };
        assert_eq!(run(&fx, &fr).0, -libc::EINVAL);
    }

    #[test]
    fn free_inode_releases_the_handle() {
        let fx = fixture();
        let fr = FreeInodeReq {
            hdr: hdr(OpCode::FreeInode),
            token: fx.dir_token,
        };
        assert_eq!(run(&fx, &fr).0, 0);
        assert_eq!(fx.counters.free.load(AtOrd::SeqCst), 1);
        // Token is gone; a second free is a stale token.
        assert_eq!(run(&fx, &fr).0, -libc::EINVAL);
    }

    #[test]
    fn lookup_race_skips_evict_hook() {
        let fx = fixture();
        let ev = EvictReq {
            hdr: hdr(OpCode::EvictInode),
            token: fx.dir_token,
            flags: abi::EvictFlags::LOOKUP_RACE.bits(),
            _pad: 0,
        };
        assert_eq!(run(&fx, &ev).0, 0);
        assert_eq!(fx.counters.evict.load(AtOrd::SeqCst), 0);
        assert!(fx.rt.inodes().is_empty());
    }

    #[test]
    fn tmpfile_skips_dentry_and_parent() {
        let fx = fixture();
        let req = NewInodeReq {
            hdr: hdr(OpCode::NewInode),
            dir_token: fx.dir_token,
            token: 0,
            zi_offset: 0,
            flags: abi::NewInodeFlags::TMPFILE.bits(),
            _pad: 0,
            attrs: InodeAttrs::default(),
            name: name(b""),
        };
        let (err, reply) = run(&fx, &req);
        assert_eq!(err, 0);
        let (got, _) = NewInodeReq::read_from_prefix(&reply).unwrap();
        let inode = fx.rt.inodes().get(got.token).unwrap();
        assert_eq!(inode.parent_ino, 0);
        assert_eq!(fx.counters.add_dentry.load(AtOrd::SeqCst), 0);
    }

    #[test]
    fn failed_dentry_rolls_back_the_allocation() {
        let fx = fixture();
        let req = NewInodeReq {
            hdr: hdr(OpCode::NewInode),
            dir_token: fx.dir_token,
            token: 0,
            zi_offset: 0,
            flags: 0,
            _pad: 0,
            attrs: InodeAttrs::default(),
            name: name(b"boom"),
        };
        let before = fx.rt.inodes().len();
        assert_eq!(run(&fx, &req).0, -libc::ENOSPC);
        assert_eq!(fx.counters.free.load(AtOrd::SeqCst), 1);
        assert_eq!(fx.rt.inodes().len(), before);
    }

    #[test]
    fn payload_out_of_window_is_efault() {
        let fx = fixture();
        let io = IoReq {
            hdr: OpHdr {
                offset: u64::MAX - 8,
                len: 64,
                ..hdr(OpCode::Read)
            },
            token: fx.dir_token,
            pos: 0,
            bytes: 64,
            io_flags: 0,
            _pad: 0,
        };
        assert_eq!(run(&fx, &io).0, -libc::EFAULT);
        assert_eq!(fx.counters.read.load(AtOrd::SeqCst), 0);
    }

    #[test]
    fn dispatch_outside_a_worker_answers_no_signal() {
        assert!(!crate::worker::signal_pending());
    }
}
