// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-shared scratch buffers for back-ends.
//!
//! The shim carves a buffer out of kernel memory (the alloc ioctl
//! answers with a fresh fd) and the runtime maps it in. Back-ends use
//! these for data they want visible on both sides without a copy, e.g.
//! staged readdir pages.

use std::io;

use relay::{RelayHandle, Window};

pub struct SharedBuffer {
    win: Window,
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer").finish_non_exhaustive()
    }
}

impl SharedBuffer {
    /// Allocates and maps `bytes` of kernel-shared memory on `handle`.
    pub fn alloc(handle: &dyn RelayHandle, bytes: usize) -> io::Result<Self> {
        if bytes == 0 {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        let win = handle.alloc_buffer(bytes)?;
        Ok(Self { win })
    }

    pub fn len(&self) -> usize {
        self.win.len()
    }

    pub fn is_empty(&self) -> bool {
        self.win.is_empty()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.win.as_mut_ptr()
    }

    /// The buffer as a byte slice. The caller owns coordination with
    /// whatever the kernel side does with the same pages.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // Exclusive &mut self guards the user-space side.
        unsafe { self.win.bytes_mut() }
    }
}
