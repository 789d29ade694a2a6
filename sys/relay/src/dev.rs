// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The real control device.
//!
//! Each [`DevRelay::open`] creates a fresh anonymous file under the
//! shim's control directory (`O_TMPFILE`, read-write); the shim hands
//! out per-open state, which is why every worker owns its own handle.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use abi::{
    AllocBuffer, FsRegister, NumaMap, PmemGrab, ZtInit, APP_REGION_BYTES, OP_BUFFER_BYTES,
    PMEM_WINDOW_OFFSET,
};
use log::debug;
use memmap2::{Advice, MmapOptions};

use crate::{Relay, RelayHandle, Window};

mod ioc {
    use abi::*;

    nix::ioctl_read!(numa_map, IOC_MAGIC, IOC_NUMA_MAP, NumaMap);
    nix::ioctl_write_ptr!(register_fs, IOC_MAGIC, IOC_REGISTER_FS, FsRegister);
    nix::ioctl_write_ptr!(zt_init, IOC_MAGIC, IOC_ZT_INIT, ZtInit);
    nix::ioctl_none!(wait_op, IOC_MAGIC, IOC_WAIT_OP);
    nix::ioctl_none!(break_all, IOC_MAGIC, IOC_BREAK_ALL);
    nix::ioctl_readwrite!(recv_mount, IOC_MAGIC, IOC_RECV_MOUNT, [u8; OP_BUFFER_BYTES]);
    nix::ioctl_readwrite!(grab_pmem, IOC_MAGIC, IOC_GRAB_PMEM, PmemGrab);
    nix::ioctl_readwrite!(alloc_buffer, IOC_MAGIC, IOC_ALLOC_BUFFER, AllocBuffer);
}

fn os_err(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// Opens handles on the kernel shim rooted at a control directory
/// (default `/sys/fs/zuf`).
pub struct DevRelay {
    root: PathBuf,
}

impl DevRelay {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Relay for DevRelay {
    fn open(&self) -> io::Result<Arc<dyn RelayHandle>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_TMPFILE)
            .open(&self.root)?;
        debug!("opened relay handle fd={}", file.as_raw_fd());
        Ok(Arc::new(DevHandle { file }))
    }
}

struct DevHandle {
    file: File,
}

impl DevHandle {
    fn map(&self, offset: u64, len: usize) -> io::Result<Window> {
        let raw = MmapOptions::new()
            .offset(offset)
            .len(len)
            .map_raw(&self.file)?;
        // Keep kernel-shared windows out of core dumps.
        raw.advise(Advice::DontDump)?;
        Ok(Window::from_mmap(raw))
    }
}

impl RelayHandle for DevHandle {
    fn numa_map(&self) -> io::Result<Box<NumaMap>> {
        let mut map = Box::new(NumaMap::EMPTY);
        unsafe { ioc::numa_map(self.file.as_raw_fd(), &mut *map) }.map_err(os_err)?;
        Ok(map)
    }

    fn register_fs(&self, info: &FsRegister) -> io::Result<()> {
        unsafe { ioc::register_fs(self.file.as_raw_fd(), info) }.map_err(os_err)?;
        Ok(())
    }

    fn register_worker(&self, cpu: u32, channel: u32, opb_bytes: u32) -> io::Result<()> {
        let init = ZtInit {
            cpu,
            channel,
            opb_bytes,
            _pad: 0,
        };
        unsafe { ioc::zt_init(self.file.as_raw_fd(), &init) }.map_err(os_err)?;
        Ok(())
    }

    fn map_app_window(&self) -> io::Result<Window> {
        self.map(0, APP_REGION_BYTES)
    }

    fn map_op_window(&self) -> io::Result<Window> {
        self.map(APP_REGION_BYTES as u64, OP_BUFFER_BYTES)
    }

    fn wait_for_op(&self) -> io::Result<()> {
        unsafe { ioc::wait_op(self.file.as_raw_fd()) }.map_err(os_err)?;
        Ok(())
    }

    fn receive_mount(&self, buf: &mut [u8]) -> io::Result<()> {
        let buf: &mut [u8; OP_BUFFER_BYTES] = buf
            .try_into()
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        unsafe { ioc::recv_mount(self.file.as_raw_fd(), buf) }.map_err(os_err)?;
        Ok(())
    }

    fn break_all(&self) -> io::Result<()> {
        unsafe { ioc::break_all(self.file.as_raw_fd()) }.map_err(os_err)?;
        Ok(())
    }

    fn grab_pmem(&self, pmem_id: u64) -> io::Result<(PmemGrab, Window)> {
        let mut grab = PmemGrab {
            pmem_id,
            pmem_kern_id: 0,
            blocks: 0,
            blocksize: 0,
            _pad: 0,
        };
        unsafe { ioc::grab_pmem(self.file.as_raw_fd(), &mut grab) }.map_err(os_err)?;
        let bytes = grab
            .blocks
            .checked_mul(u64::from(grab.blocksize))
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidData))?;
        let window = self.map(PMEM_WINDOW_OFFSET, bytes as usize)?;
        Ok((grab, window))
    }

    fn alloc_buffer(&self, bytes: usize) -> io::Result<Window> {
        let mut ab = AllocBuffer {
            max_bytes: bytes as u32,
            init_bytes: bytes as u32,
        };
        let fd = unsafe { ioc::alloc_buffer(self.file.as_raw_fd(), &mut ab) }.map_err(os_err)?;
        let buf_file = unsafe { File::from_raw_fd(fd) };
        let raw = MmapOptions::new().len(bytes).map_raw(&buf_file)?;
        raw.advise(Advice::DontDump)?;
        Ok(Window::from_mmap(raw))
    }
}
