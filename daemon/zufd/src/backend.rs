// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The interface a filesystem back-end plugs into.
//!
//! A back-end provides three vtables: [`FsDriver`] (one per filesystem
//! type), [`SuperblockOps`] (one per mounted superblock) and
//! [`InodeOps`] (per inode, usually shared). Every entry except inode
//! allocation is optional; the default method bodies encode the
//! per-operation absent policy the dispatcher relies on (`ENOTSUP` for
//! most, success for the handful the VFS treats as advisory, `EIO` for
//! `get_block`, which a pmem filesystem cannot function without). A
//! back-end "leaves an entry unset" by simply not overriding it.
//!
//! The kernel refers to superblocks and inodes by pointer-sized tokens.
//! Tokens are issued from a [`HandleTable`] — monotonically increasing,
//! never-reused 64-bit ids, with 0 reserved as "no handle" — and stay
//! valid from `NEW_INODE`/`LOOKUP` until the matching `FREE_INODE` or
//! `EVICT_INODE`.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use abi::{InodeAttrs, StatfsData};
use nix::errno::Errno;
use relay::{RelayHandle, Window};

/// Linux spells `ENOTSUP` as `EOPNOTSUPP`; the operation tables speak
/// the former.
pub const ENOTSUP: Errno = Errno::EOPNOTSUPP;

/// Registration info for one filesystem type.
#[derive(Clone, Debug)]
pub struct FsInfo {
    pub fstype: String,
    pub version: u32,
}

/// What a back-end hands the runtime for a freshly materialized inode.
pub struct NewInode {
    pub ops: Arc<dyn InodeOps>,
    pub ino: u64,
    /// On-medium inode offset inside the superblock's pmem region.
    pub zi_offset: u64,
}

/// Result of a `GET_BLOCK` fault.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockMapping {
    pub bno: u64,
    pub flags: u32,
}

/// What a successful mount returns to the runtime.
pub struct Mounted {
    pub ops: Arc<dyn SuperblockOps>,
    pub root: NewInode,
    pub blocksize: u32,
}

/// One filesystem implementation, registered with the kernel at
/// startup.
pub trait FsDriver: Send + Sync {
    fn info(&self) -> FsInfo;

    /// Builds a superblock over a freshly grabbed pmem region.
    fn mount(&self, pmem: &PmemRegion, flags: u32) -> Result<Mounted, Errno>;

    fn umount(&self, _sb: &SbBinding) -> Result<(), Errno> {
        Ok(())
    }

    fn remount(&self, _sb: &SbBinding, _flags: u32) -> Result<(), Errno> {
        Err(ENOTSUP)
    }

    /// Debug channel read; answers `DDBG_READ` mount events.
    fn ddbg_read(&self, _sb: &SbBinding, _buf: &mut [u8]) -> Result<usize, Errno> {
        Err(ENOTSUP)
    }

    /// Debug channel write.
    fn ddbg_write(&self, _sb: &SbBinding, _msg: &[u8]) -> Result<(), Errno> {
        Err(ENOTSUP)
    }

    /// Called once during runtime shutdown, after the mount loop has
    /// stopped.
    fn unregister(&self) {}
}

/// Per-superblock operations.
pub trait SuperblockOps: Send + Sync {
    fn statfs(&self) -> Result<StatfsData, Errno> {
        Err(ENOTSUP)
    }

    /// Allocates an on-medium inode under `dir`. Required: there is no
    /// meaningful filesystem without it.
    fn new_inode(
        &self,
        dir: &InodeBinding,
        attrs: &InodeAttrs,
        name: &[u8],
        tmpfile: bool,
    ) -> Result<NewInode, Errno>;

    /// Releases back-end state for an inode whose handle is going away.
    /// Also used to roll back an allocation whose dentry insert failed.
    fn free_inode(&self, _inode: &InodeBinding) {}

    /// The kernel dropped its last reference outside a lookup race.
    fn evict(&self, _inode: &InodeBinding) {}
}

/// Per-inode operations.
pub trait InodeOps: Send + Sync {
    fn lookup(&self, _dir: &InodeBinding, _name: &[u8]) -> Result<Option<NewInode>, Errno> {
        Err(ENOTSUP)
    }

    fn add_dentry(
        &self,
        _dir: &InodeBinding,
        _child: &InodeBinding,
        _name: &[u8],
    ) -> Result<(), Errno> {
        Err(ENOTSUP)
    }

    fn remove_dentry(
        &self,
        _dir: &InodeBinding,
        _child: &InodeBinding,
        _name: &[u8],
    ) -> Result<(), Errno> {
        Err(ENOTSUP)
    }

    fn rename(
        &self,
        _old_dir: &InodeBinding,
        _new_dir: &InodeBinding,
        _old_name: &[u8],
        _new_name: &[u8],
        _flags: u32,
    ) -> Result<(), Errno> {
        Err(ENOTSUP)
    }

    /// Fills `buf` with [`abi::put_dirent`]-encoded entries starting at
    /// `cookie`; returns the continuation cookie and bytes produced.
    fn readdir(
        &self,
        _dir: &InodeBinding,
        _cookie: u64,
        _buf: &mut [u8],
    ) -> Result<(u64, usize), Errno> {
        Err(ENOTSUP)
    }

    fn read(
        &self,
        _inode: &InodeBinding,
        _pos: u64,
        _buf: &mut [u8],
        _flags: u32,
    ) -> Result<usize, Errno> {
        Err(ENOTSUP)
    }

    /// Readahead hint preceding a mapped read.
    fn pre_read(&self, _inode: &InodeBinding, _pos: u64, _bytes: u64) -> Result<(), Errno> {
        Err(ENOTSUP)
    }

    fn write(
        &self,
        _inode: &InodeBinding,
        _pos: u64,
        _buf: &[u8],
        _flags: u32,
    ) -> Result<usize, Errno> {
        Err(ENOTSUP)
    }

    /// Block mapping for a page fault. The one entry a pmem filesystem
    /// cannot do without, hence the `EIO` default.
    fn get_block(
        &self,
        _inode: &InodeBinding,
        _index: u64,
        _write_fault: bool,
    ) -> Result<BlockMapping, Errno> {
        Err(Errno::EIO)
    }

    fn put_block(&self, _inode: &InodeBinding, _index: u64) -> Result<(), Errno> {
        Ok(())
    }

    fn mmap_close(&self, _inode: &InodeBinding) -> Result<(), Errno> {
        Ok(())
    }

    /// On-medium offset of the symlink body.
    fn get_symlink(&self, _inode: &InodeBinding) -> Result<u64, Errno> {
        Err(ENOTSUP)
    }

    fn setattr(
        &self,
        _inode: &InodeBinding,
        _mask: u32,
        _attrs: &InodeAttrs,
        _truncate_size: u64,
    ) -> Result<(), Errno> {
        Ok(())
    }

    fn sync(&self, _inode: &InodeBinding, _pos: u64, _bytes: u64) -> Result<(), Errno> {
        Ok(())
    }

    fn fallocate(
        &self,
        _inode: &InodeBinding,
        _mode: u32,
        _pos: u64,
        _bytes: u64,
    ) -> Result<(), Errno> {
        Err(ENOTSUP)
    }

    fn llseek(&self, _inode: &InodeBinding, _offset: i64, _whence: u32) -> Result<i64, Errno> {
        Err(ENOTSUP)
    }

    fn ioctl(&self, _inode: &InodeBinding, _cmd: u32, _arg: &mut [u8]) -> Result<(), Errno> {
        Err(Errno::ENOTTY)
    }

    fn getxattr(
        &self,
        _inode: &InodeBinding,
        _name: &[u8],
        _buf: &mut [u8],
    ) -> Result<usize, Errno> {
        Err(ENOTSUP)
    }

    fn setxattr(
        &self,
        _inode: &InodeBinding,
        _name: &[u8],
        _value: &[u8],
        _flags: u32,
    ) -> Result<(), Errno> {
        Err(ENOTSUP)
    }

    fn listxattr(&self, _inode: &InodeBinding, _buf: &mut [u8]) -> Result<usize, Errno> {
        Err(ENOTSUP)
    }

    fn clone_range(
        &self,
        _src: &InodeBinding,
        _dst: &InodeBinding,
        _pos_in: u64,
        _pos_out: u64,
        _bytes: u64,
        _flags: u32,
    ) -> Result<(), Errno> {
        Err(ENOTSUP)
    }

    fn copy_range(
        &self,
        _src: &InodeBinding,
        _dst: &InodeBinding,
        _pos_in: u64,
        _pos_out: u64,
        _bytes: u64,
        _flags: u32,
    ) -> Result<(), Errno> {
        Err(ENOTSUP)
    }
}

/// A mounted superblock as the runtime tracks it.
pub struct SbBinding {
    pub ops: Arc<dyn SuperblockOps>,
    pub driver: Arc<dyn FsDriver>,
    pub pmem: PmemRegion,
}

/// A live inode handle as the runtime tracks it.
pub struct InodeBinding {
    pub ops: Arc<dyn InodeOps>,
    pub ino: u64,
    /// Ino of the directory this inode was materialized under; answers
    /// `LOOKUP ".."`. Zero for tmpfiles and the root's own parent.
    pub parent_ino: u64,
    /// On-medium inode offset inside the superblock's pmem region.
    pub zi_offset: u64,
    pub sb: Arc<SbBinding>,
}

/// A pmem region bound to a superblock: the mapped window plus the
/// offset translation the rest of the system speaks in.
pub struct PmemRegion {
    win: Window,
    pub kern_id: u64,
    pub blocks: u64,
    pub blocksize: u32,
}

impl PmemRegion {
    /// Grabs and maps the pmem device `pmem_id` on `handle`.
    pub fn grab(handle: &dyn RelayHandle, pmem_id: u64) -> io::Result<Self> {
        let (grab, win) = handle.grab_pmem(pmem_id)?;
        Ok(Self {
            win,
            kern_id: grab.pmem_kern_id,
            blocks: grab.blocks,
            blocksize: grab.blocksize,
        })
    }

    pub fn len(&self) -> usize {
        self.win.len()
    }

    pub fn is_empty(&self) -> bool {
        self.win.is_empty()
    }

    pub fn base(&self) -> *mut u8 {
        self.win.as_mut_ptr()
    }

    /// Translates a pointer into the mapped region to its on-medium
    /// offset; `None` if the pointer is not inside the region.
    pub fn offset_of(&self, ptr: *const u8) -> Option<u64> {
        let base = self.base() as usize;
        let p = ptr as usize;
        if (base..base + self.len()).contains(&p) {
            Some((p - base) as u64)
        } else {
            None
        }
    }

    /// Pointer to the byte at `offset`, bounds-checked against the
    /// region.
    pub fn at(&self, offset: u64, len: usize) -> Option<*mut u8> {
        let offset = usize::try_from(offset).ok()?;
        if offset.checked_add(len)? <= self.len() {
            // Bounds were just checked against the mapping.
            Some(unsafe { self.base().add(offset) })
        } else {
            None
        }
    }
}

/// Issues the pointer-sized tokens the kernel stores for superblocks
/// and inodes. Ids are never reused and 0 is never issued.
pub struct HandleTable<T> {
    next: AtomicU64,
    map: Mutex<HashMap<u64, Arc<T>>>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
            map: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, value: Arc<T>) -> u64 {
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        self.map.lock().unwrap().insert(token, value);
        token
    }

    pub fn get(&self, token: u64) -> Option<Arc<T>> {
        self.map.lock().unwrap().get(&token).cloned()
    }

    pub fn remove(&self, token: u64) -> Option<Arc<T>> {
        self.map.lock().unwrap().remove(&token)
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_nonzero() {
        let table = HandleTable::<u32>::new();
        let a = table.insert(Arc::new(1));
        let b = table.insert(Arc::new(2));
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
        assert_eq!(*table.get(a).unwrap(), 1);
    }

    #[test]
    fn removed_tokens_are_not_reissued() {
        let table = HandleTable::<u32>::new();
        let a = table.insert(Arc::new(1));
        table.remove(a).unwrap();
        assert!(table.get(a).is_none());
        let b = table.insert(Arc::new(2));
        assert_ne!(a, b);
        assert_eq!(table.len(), 1);
    }
}
