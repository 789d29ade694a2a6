// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Relay ABI definitions, shared between the kernel shim and the
//! user-space runtime.
//!
//! Everything the two sides exchange is defined here: the ioctl payload
//! structs, the operation header, the per-operation request structs that
//! use the header as their prefix, and the constants that size the mapped
//! windows. The kernel shim carries a C rendition of the same layouts;
//! changing anything in this file is an ABI break.
//!
//! All structs are `repr(C)` with explicit padding so that they derive
//! the zerocopy traits and can be read in place from the shared op
//! buffer without copies.

use num_derive::FromPrimitive;
use static_assertions::{const_assert, const_assert_eq};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Default location of the kernel shim's control directory. The
/// anonymous control device is created under this path.
pub const DEFAULT_MOUNT_ROOT: &str = "/sys/fs/zuf";

/// Size of the "application" window each worker maps at offset 0 of its
/// relay handle. Operation payload data (read/write buffers, readdir
/// pages) lives here, addressed by [`OpHdr::offset`].
pub const APP_REGION_BYTES: usize = 4 << 20;

/// Size of the op-buffer window, mapped at offset [`APP_REGION_BYTES`].
/// Holds the current operation header and request struct.
pub const OP_BUFFER_BYTES: usize = 16 << 10;

/// File offset at which a grabbed pmem region becomes mappable on a
/// relay handle. Far above the two fixed windows.
pub const PMEM_WINDOW_OFFSET: u64 = 1 << 30;

/// Longest name the relay will carry in a [`ZufsStr`].
pub const NAME_MAX: usize = 255;

/// Payload capacity of a debug-channel request.
pub const DDBG_PAYLOAD: usize = 512;

/// CPUs representable in a [`CpuMask`]. Must match the kernel's
/// `CPU_SETSIZE`; the assertion below pins it to the libc type.
pub const MAX_CPUS: usize = 1024;

/// `u64` words backing a [`CpuMask`].
pub const CPU_MASK_WORDS: usize = MAX_CPUS / 64;

/// Upper bound on NUMA nodes in a [`NumaMap`]. Sized so the whole map
/// stays within one page, which is what the kernel hands back.
pub const NUMA_MAP_MAX_NODES: usize = 31;

const_assert_eq!(
    core::mem::size_of::<CpuMask>(),
    core::mem::size_of::<libc::cpu_set_t>()
);
const_assert!(core::mem::size_of::<NumaMap>() <= 4096);

/// Ioctl identity. Sequence numbers below are offsets under this magic.
pub const IOC_MAGIC: u8 = b'Z';

pub const IOC_NUMA_MAP: u8 = 0x11;
pub const IOC_REGISTER_FS: u8 = 0x12;
pub const IOC_ZT_INIT: u8 = 0x13;
pub const IOC_WAIT_OP: u8 = 0x14;
pub const IOC_BREAK_ALL: u8 = 0x15;
pub const IOC_RECV_MOUNT: u8 = 0x16;
pub const IOC_GRAB_PMEM: u8 = 0x17;
pub const IOC_ALLOC_BUFFER: u8 = 0x18;

/// Folds a handler result into the kernel's sign convention: positive
/// errno values become negative, everything else passes through.
/// Idempotent by construction.
pub const fn normalize_err(err: i32) -> i32 {
    if err > 0 {
        -err
    } else {
        err
    }
}

/// Operation codes the kernel dispatches to worker threads.
///
/// The discriminants are wire values; they appear in
/// [`OpHdr::operation`] and must never be renumbered.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u16)]
pub enum OpCode {
    Null = 0,
    Statfs = 1,
    NewInode = 2,
    FreeInode = 3,
    EvictInode = 4,
    Lookup = 5,
    AddDentry = 6,
    RemoveDentry = 7,
    Rename = 8,
    Readdir = 9,
    Clone = 10,
    Copy = 11,
    Read = 12,
    PreRead = 13,
    Write = 14,
    GetBlock = 15,
    PutBlock = 16,
    MmapClose = 17,
    GetSymlink = 18,
    Setattr = 19,
    Sync = 20,
    Fallocate = 21,
    Llseek = 22,
    Ioctl = 23,
    XattrGet = 24,
    XattrSet = 25,
    XattrList = 26,
    /// Poison pill delivered during shutdown. Handled as a successful
    /// no-op; the worker's stop flag, not this code, ends the loop.
    Break = 27,
}

/// Event codes delivered on the mount channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u16)]
pub enum MountOp {
    Mount = 1,
    Umount = 2,
    Remount = 3,
    DdbgRead = 4,
    DdbgWrite = 5,
}

bitflags::bitflags! {
    /// Kernel-owned bits in [`OpHdr::flags`]. `INTR` is set when the
    /// issuing task has a signal pending and would like the operation
    /// interrupted; the kernel may flip it while the handler runs, so
    /// readers must treat the header word as volatile.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct HdrFlags: u16 {
        const INTR = 1 << 0;
    }
}

bitflags::bitflags! {
    /// [`NewInodeReq::flags`].
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct NewInodeFlags: u32 {
        /// The inode is an unlinked temporary; no dentry is inserted.
        const TMPFILE = 1 << 0;
    }
}

bitflags::bitflags! {
    /// [`EvictReq::flags`].
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct EvictFlags: u32 {
        /// This eviction lost a lookup race; the back-end's `evict`
        /// hook must not run.
        const LOOKUP_RACE = 1 << 0;
    }
}

bitflags::bitflags! {
    /// [`SetattrReq::mask`] bits naming the attributes being changed.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct SetattrMask: u32 {
        const SIZE = 1 << 0;
        const MODE = 1 << 1;
        const UID = 1 << 2;
        const GID = 1 << 3;
    }
}

/// Byte offset of [`OpHdr::flags`] within the header, for volatile
/// access to a live (kernel-shared) header.
pub const HDR_FLAGS_OFFSET: usize = 18;

/// Common prefix of every request struct in the op buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct OpHdr {
    /// Offset of this operation's payload inside the worker's app
    /// window. Only meaningful for data-bearing operations.
    pub offset: u64,
    /// Payload length in the app window.
    pub len: u64,
    /// An [`OpCode`] on worker channels, a [`MountOp`] on the mount
    /// channel.
    pub operation: u16,
    /// Kernel-owned flag word ([`HdrFlags`]). May change while the
    /// operation is in flight.
    pub flags: u16,
    /// Result slot. Written by the runtime before re-entering the
    /// kernel; always `<= 0` (see [`normalize_err`]).
    pub err: i32,
}

const_assert_eq!(core::mem::size_of::<OpHdr>(), 24);

/// Length-prefixed, fixed-capacity name as the kernel encodes dentry
/// and filesystem-type names.
#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ZufsStr {
    pub len: u8,
    pub bytes: [u8; NAME_MAX],
}

impl ZufsStr {
    /// Builds a wire name; `None` if `name` exceeds [`NAME_MAX`].
    pub fn new(name: &[u8]) -> Option<Self> {
        if name.len() > NAME_MAX {
            return None;
        }
        let mut s = Self {
            len: name.len() as u8,
            bytes: [0; NAME_MAX],
        };
        s.bytes[..name.len()].copy_from_slice(name);
        Some(s)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PartialEq for ZufsStr {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for ZufsStr {}

impl core::fmt::Debug for ZufsStr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Attributes carried on inode creation and setattr.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct InodeAttrs {
    pub size: u64,
    pub rdev: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
}

/// Filesystem statistics, filled by the STATFS handler.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct StatfsData {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub fsid: u64,
    pub bsize: u32,
    pub frsize: u32,
    pub namelen: u32,
    pub flags: u32,
}

macro_rules! wire_struct {
    ($(#[$attr:meta])* pub struct $name:ident { $($body:tt)* }) => {
        $(#[$attr])*
        #[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
        #[repr(C)]
        pub struct $name { $($body)* }
    };
}

wire_struct! {
    /// STATFS: superblock statistics into `stats`.
    pub struct StatfsReq {
        pub hdr: OpHdr,
        pub sb_token: u64,
        pub stats: StatfsData,
    }
}

wire_struct! {
    /// NEW_INODE: allocate an inode under `dir_token`. The runtime
    /// answers with the new handle token and the on-medium inode offset.
    pub struct NewInodeReq {
        pub hdr: OpHdr,
        pub dir_token: u64,
        /// Out: handle token for the new inode.
        pub token: u64,
        /// Out: on-medium inode offset inside the pmem region.
        pub zi_offset: u64,
        /// [`NewInodeFlags`] bits.
        pub flags: u32,
        pub _pad: u32,
        pub attrs: InodeAttrs,
        pub name: ZufsStr,
    }
}

wire_struct! {
    /// FREE_INODE: final teardown of a handle.
    pub struct FreeInodeReq {
        pub hdr: OpHdr,
        pub token: u64,
    }
}

wire_struct! {
    /// EVICT_INODE: the kernel dropped its reference.
    pub struct EvictReq {
        pub hdr: OpHdr,
        pub token: u64,
        /// [`EvictFlags`] bits.
        pub flags: u32,
        pub _pad: u32,
    }
}

wire_struct! {
    /// LOOKUP: resolve `name` under `dir_token`.
    pub struct LookupReq {
        pub hdr: OpHdr,
        pub dir_token: u64,
        /// Out: inode number of the result. For `".."` this is the only
        /// field filled; the kernel resolves the rest from its cache.
        pub ino: u64,
        /// Out: handle token, 0 when only `ino` is meaningful.
        pub token: u64,
        /// Out: on-medium inode offset, 0 when `token` is 0.
        pub zi_offset: u64,
        pub name: ZufsStr,
    }
}

wire_struct! {
    /// ADD_DENTRY / REMOVE_DENTRY.
    pub struct DentryReq {
        pub hdr: OpHdr,
        pub dir_token: u64,
        pub child_token: u64,
        pub name: ZufsStr,
    }
}

wire_struct! {
    /// RENAME between two directories.
    pub struct RenameReq {
        pub hdr: OpHdr,
        pub old_dir_token: u64,
        pub new_dir_token: u64,
        pub flags: u32,
        pub _pad: u32,
        pub old_name: ZufsStr,
        pub new_name: ZufsStr,
    }
}

wire_struct! {
    /// READDIR: directory entries into the app window at
    /// `hdr.offset`/`hdr.len`, encoded as [`DirEntHdr`] records.
    pub struct ReaddirReq {
        pub hdr: OpHdr,
        pub dir_token: u64,
        /// In: resume cookie. Out: cookie to continue from.
        pub cookie: u64,
        /// Out: bytes of entry records produced.
        pub written: u64,
    }
}

wire_struct! {
    /// READ / PRE_READ / WRITE. Payload in the app window.
    pub struct IoReq {
        pub hdr: OpHdr,
        pub token: u64,
        pub pos: u64,
        /// In: requested bytes. Out: bytes handled.
        pub bytes: u64,
        pub io_flags: u32,
        pub _pad: u32,
    }
}

wire_struct! {
    /// GET_BLOCK / PUT_BLOCK: block-granular mapping for mmap faults.
    pub struct BlockReq {
        pub hdr: OpHdr,
        pub token: u64,
        /// File block index being faulted.
        pub index: u64,
        /// Out: physical block number inside the pmem region.
        pub bno: u64,
        /// 0 = read fault, 1 = write fault.
        pub rw: u32,
        /// Out: back-end mapping flags.
        pub flags: u32,
    }
}

wire_struct! {
    /// MMAP_CLOSE: last mapping over the inode went away.
    pub struct MmapCloseReq {
        pub hdr: OpHdr,
        pub token: u64,
    }
}

wire_struct! {
    /// GET_SYMLINK: on-medium offset of the link body.
    pub struct SymlinkReq {
        pub hdr: OpHdr,
        pub token: u64,
        /// Out.
        pub sym_offset: u64,
    }
}

wire_struct! {
    /// SETATTR with a [`SetattrMask`] of changed attributes.
    pub struct SetattrReq {
        pub hdr: OpHdr,
        pub token: u64,
        pub truncate_size: u64,
        pub mask: u32,
        pub _pad: u32,
        pub attrs: InodeAttrs,
    }
}

wire_struct! {
    /// SYNC a byte range.
    pub struct SyncReq {
        pub hdr: OpHdr,
        pub token: u64,
        pub pos: u64,
        pub bytes: u64,
        pub flags: u32,
        pub _pad: u32,
    }
}

wire_struct! {
    /// FALLOCATE a byte range with the VFS mode word.
    pub struct FallocateReq {
        pub hdr: OpHdr,
        pub token: u64,
        pub pos: u64,
        pub bytes: u64,
        pub mode: u32,
        pub _pad: u32,
    }
}

wire_struct! {
    /// LLSEEK (SEEK_HOLE/SEEK_DATA handling lives in the back-end).
    pub struct LlseekReq {
        pub hdr: OpHdr,
        pub token: u64,
        /// In: start offset. Out: resolved offset.
        pub offset: i64,
        pub whence: u32,
        pub _pad: u32,
    }
}

wire_struct! {
    /// IOCTL relayed from the VFS; argument bytes in the app window.
    pub struct IoctlReq {
        pub hdr: OpHdr,
        pub token: u64,
        pub cmd: u32,
        pub arg_bytes: u32,
    }
}

wire_struct! {
    /// XATTR_GET / XATTR_SET / XATTR_LIST; value bytes in the app window.
    pub struct XattrReq {
        pub hdr: OpHdr,
        pub token: u64,
        /// In: capacity or value length. Out: value length.
        pub value_bytes: u32,
        pub flags: u32,
        pub name: ZufsStr,
    }
}

wire_struct! {
    /// CLONE / COPY of a byte range between two inodes.
    pub struct CloneReq {
        pub hdr: OpHdr,
        pub src_token: u64,
        pub dst_token: u64,
        pub pos_in: u64,
        pub pos_out: u64,
        pub bytes: u64,
        pub flags: u32,
        pub _pad: u32,
    }
}

wire_struct! {
    /// Mount-channel event. MOUNT fills the `Out` fields; UMOUNT and
    /// REMOUNT identify the superblock by `sb_token`.
    pub struct MountReq {
        pub hdr: OpHdr,
        /// Out on MOUNT, in otherwise.
        pub sb_token: u64,
        pub pmem_id: u64,
        /// Out: root inode handle token.
        pub root_token: u64,
        /// Out: root inode on-medium offset.
        pub root_zi_offset: u64,
        /// Worker channels the kernel wants; consumed on first MOUNT.
        pub num_channels: u32,
        pub mount_flags: u32,
        /// Out: filesystem block size.
        pub blocksize: u32,
        pub _pad: u32,
        pub fs_type: ZufsStr,
    }
}

wire_struct! {
    /// DDBG_READ / DDBG_WRITE: filesystem debug channel.
    pub struct DdbgReq {
        pub hdr: OpHdr,
        pub sb_token: u64,
        /// In: capacity (read) or message length (write). Out: bytes.
        pub bytes: u64,
        pub buf: [u8; DDBG_PAYLOAD],
    }
}

const_assert!(core::mem::size_of::<MountReq>() <= OP_BUFFER_BYTES);
const_assert!(core::mem::size_of::<RenameReq>() <= OP_BUFFER_BYTES);
const_assert!(core::mem::size_of::<DdbgReq>() <= OP_BUFFER_BYTES);

// ---------------------------------------------------------------------
// Ioctl payloads.

/// One node's CPU set, bit `c` = logical CPU `c`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CpuMask {
    pub bits: [u64; CPU_MASK_WORDS],
}

impl CpuMask {
    pub const EMPTY: Self = Self {
        bits: [0; CPU_MASK_WORDS],
    };

    pub fn is_set(&self, cpu: u32) -> bool {
        let cpu = cpu as usize;
        cpu < MAX_CPUS && self.bits[cpu / 64] & (1 << (cpu % 64)) != 0
    }

    pub fn set(&mut self, cpu: u32) {
        let cpu = cpu as usize;
        assert!(cpu < MAX_CPUS);
        self.bits[cpu / 64] |= 1 << (cpu % 64);
    }

    pub fn union_with(&mut self, other: &Self) {
        for (w, o) in self.bits.iter_mut().zip(other.bits.iter()) {
            *w |= o;
        }
    }

    pub fn intersects(&self, other: &Self) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(a, b)| a & b != 0)
    }

    pub fn count(&self) -> u32 {
        self.bits.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    /// Iterates set bits in ascending CPU order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..MAX_CPUS as u32).filter(move |&c| self.is_set(c))
    }

    /// Index of the highest set bit plus one, the conventional
    /// `nr_cpu_ids` bound.
    pub fn highest_plus_one(&self) -> u32 {
        (0..MAX_CPUS as u32)
            .rev()
            .find(|&c| self.is_set(c))
            .map_or(0, |c| c + 1)
    }
}

/// NUMA map as the kernel reports it: per-node CPU masks plus totals.
/// Exactly one page is exchanged; see the size assertion above.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct NumaMap {
    pub possible_cpus: u32,
    pub possible_nodes: u32,
    pub masks: [CpuMask; NUMA_MAP_MAX_NODES],
}

impl NumaMap {
    pub const EMPTY: Self = Self {
        possible_cpus: 0,
        possible_nodes: 0,
        masks: [CpuMask::EMPTY; NUMA_MAP_MAX_NODES],
    };
}

/// ZT_INIT payload: claims `(cpu, channel)` on the issuing handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ZtInit {
    pub cpu: u32,
    pub channel: u32,
    pub opb_bytes: u32,
    pub _pad: u32,
}

/// GRAB_PMEM payload: binds the pmem device `pmem_id` to the issuing
/// handle and reports its geometry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct PmemGrab {
    pub pmem_id: u64,
    /// Out: kernel-side identity of the grabbed region.
    pub pmem_kern_id: u64,
    /// Out: region size in blocks.
    pub blocks: u64,
    /// Out: block size in bytes.
    pub blocksize: u32,
    pub _pad: u32,
}

/// ALLOC_BUFFER payload; the ioctl's return value is a new fd carrying
/// the buffer, mappable at offset 0.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct AllocBuffer {
    pub max_bytes: u32,
    pub init_bytes: u32,
}

/// REGISTER_FS payload announcing one filesystem implementation.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FsRegister {
    pub version: u32,
    pub flags: u32,
    pub fstype: ZufsStr,
}

// ---------------------------------------------------------------------
// Readdir record encoding.

/// Fixed prefix of one directory entry in the app window. The name
/// follows immediately; records are padded to 8 bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DirEntHdr {
    pub ino: u64,
    /// Cookie that resumes iteration *after* this entry.
    pub cookie: u64,
    /// A `DT_*` file type.
    pub kind: u16,
    pub name_len: u16,
    pub _pad: u32,
}

/// A decoded directory entry.
#[derive(Debug, Eq, PartialEq)]
pub struct DirEnt<'a> {
    pub ino: u64,
    pub cookie: u64,
    pub kind: u16,
    pub name: &'a [u8],
}

const fn dirent_record_len(name_len: usize) -> usize {
    (core::mem::size_of::<DirEntHdr>() + name_len + 7) & !7
}

/// Appends one entry to a readdir buffer. `used` is the byte count
/// already produced; returns the new count, or `None` when the entry
/// does not fit (the conventional "buffer full" stop condition).
pub fn put_dirent(
    buf: &mut [u8],
    used: usize,
    ino: u64,
    cookie: u64,
    kind: u16,
    name: &[u8],
) -> Option<usize> {
    let rec = dirent_record_len(name.len());
    if name.len() > NAME_MAX || used + rec > buf.len() {
        return None;
    }
    let hdr = DirEntHdr {
        ino,
        cookie,
        kind,
        name_len: name.len() as u16,
        _pad: 0,
    };
    let out = &mut buf[used..used + rec];
    out[..core::mem::size_of::<DirEntHdr>()].copy_from_slice(hdr.as_bytes());
    let name_at = core::mem::size_of::<DirEntHdr>();
    out[name_at..name_at + name.len()].copy_from_slice(name);
    for b in &mut out[name_at + name.len()..] {
        *b = 0;
    }
    Some(used + rec)
}

/// Iterates the entries previously produced by [`put_dirent`]. Pass
/// exactly the `written` bytes reported by the handler.
pub fn read_dirents(buf: &[u8]) -> impl Iterator<Item = DirEnt<'_>> {
    let mut pos = 0;
    core::iter::from_fn(move || {
        let rest = buf.get(pos..)?;
        let (hdr, tail) = DirEntHdr::read_from_prefix(rest).ok()?;
        let name = tail.get(..usize::from(hdr.name_len))?;
        pos += dirent_record_len(name.len());
        Some(DirEnt {
            ino: hdr.ino,
            cookie: hdr.cookie,
            kind: hdr.kind,
            name,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn normalize_is_idempotent() {
        for e in [-40, -1, 0, 1, 17, libc::ENOTTY] {
            let n = normalize_err(e);
            assert!(n <= 0);
            assert_eq!(normalize_err(n), n);
        }
        assert_eq!(normalize_err(5), -5);
        assert_eq!(normalize_err(-5), -5);
        assert_eq!(normalize_err(0), 0);
    }

    #[test]
    fn op_codes_round_trip() {
        for raw in 0..=27u16 {
            let op = OpCode::from_u16(raw).expect("dense code space");
            assert_eq!(op as u16, raw);
        }
        assert_eq!(OpCode::from_u16(28), None);
        assert_eq!(OpCode::from_u16(u16::MAX), None);
    }

    #[test]
    fn hdr_flags_offset_matches_layout() {
        assert_eq!(core::mem::offset_of!(OpHdr, flags), HDR_FLAGS_OFFSET);
    }

    #[test]
    fn zufs_str_bounds() {
        let s = ZufsStr::new(b"hello").unwrap();
        assert_eq!(s.as_bytes(), b"hello");
        assert!(ZufsStr::new(&[b'x'; NAME_MAX]).is_some());
        assert!(ZufsStr::new(&[b'x'; NAME_MAX + 1]).is_none());
        assert!(ZufsStr::new(b"").unwrap().is_empty());
    }

    #[test]
    fn cpu_mask_basics() {
        let mut m = CpuMask::EMPTY;
        assert!(m.is_empty());
        m.set(0);
        m.set(63);
        m.set(64);
        m.set(1023);
        assert_eq!(m.count(), 4);
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![0, 63, 64, 1023]);
        assert_eq!(m.highest_plus_one(), 1024);
        assert!(!m.is_set(1));
        assert!(!m.is_set(u32::MAX));
    }

    #[test]
    fn dirent_round_trip() {
        let mut buf = [0u8; 256];
        let mut used = 0;
        used = put_dirent(&mut buf, used, 7, 1, libc::DT_REG as u16, b"a").unwrap();
        used = put_dirent(&mut buf, used, 9, 2, libc::DT_DIR as u16, b"subdir").unwrap();
        let got: Vec<_> = read_dirents(&buf[..used]).collect();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].ino, 7);
        assert_eq!(got[0].name, b"a");
        assert_eq!(got[1].cookie, 2);
        assert_eq!(got[1].name, b"subdir");
    }

    #[test]
    fn dirent_stops_when_full() {
        let mut buf = [0u8; 40];
        let used = put_dirent(&mut buf, 0, 1, 1, 0, b"name").unwrap();
        assert!(put_dirent(&mut buf, used, 2, 2, 0, b"next").is_none());
    }
}
