// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared memory handle used for result buffers.
// Delegates to platform::PlatformShm.

use std::io;

use crate::platform::PlatformShm;

/// Open mode for shared memory segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOpenMode {
    /// Create exclusively — fail if already exists.
    Create,
    /// Open existing — fail if it does not exist.
    Open,
    /// Create if missing, open if it already exists.
    CreateOrOpen,
}

/// A named, inter-process shared memory region holding one result buffer.
///
/// Dropping the handle unmaps but never unlinks: the broker protocol gives
/// unlink authority to exactly one party (the final owner of the result),
/// which calls [`ShmHandle::unlink`] or [`ShmHandle::unlink_by_name`].
pub struct ShmHandle {
    inner: PlatformShm,
}

impl ShmHandle {
    /// Acquire a named shared memory region of `size` bytes.
    pub fn acquire(name: &str, size: usize, mode: ShmOpenMode) -> io::Result<Self> {
        let platform_mode = match mode {
            ShmOpenMode::Create => crate::platform::posix::ShmMode::Create,
            ShmOpenMode::Open => crate::platform::posix::ShmMode::Open,
            ShmOpenMode::CreateOrOpen => crate::platform::posix::ShmMode::CreateOrOpen,
        };
        let inner = PlatformShm::acquire(name, size, platform_mode)?;
        Ok(Self { inner })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    /// Mapped length in bytes.
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// The platform name used to open the segment.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// View the region as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.inner.as_ptr(), self.inner.size()) }
    }

    /// View the region as a mutable byte slice.
    ///
    /// # Safety
    /// The caller must ensure no other process writes the region
    /// concurrently. The broker protocol guarantees one writer (the worker)
    /// followed by one reader (the client), never both at once.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.inner.as_mut_ptr(), self.inner.size())
    }

    /// Force-remove the backing object. Mappings stay valid until dropped.
    pub fn unlink(&self) {
        self.inner.unlink();
    }

    /// Remove a named segment without an open handle (no-op if absent).
    pub fn unlink_by_name(name: &str) {
        PlatformShm::unlink_by_name(name);
    }
}
