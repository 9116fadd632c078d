// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! `CodeStorage`: a page-aligned, bump-allocated, executable memory
//! region. Generated code must not move once emitted, since intra-trace
//! branch displacements are patched assuming stable addresses, so this
//! is deliberately grow-never.

use memmap2::{Mmap, MmapMut};

use crate::error::{RewriterError, Result};

/// Rounds `size` up to the next multiple of the system page size.
fn round_up_to_page(size: usize, page_size: usize) -> usize {
    let page_size = page_size.max(1);
    size.div_ceil(page_size) * page_size
}

enum Region {
    /// Writable, not yet executable: the state during the generator's
    /// emit pass.
    Writable(MmapMut),
    /// Read-execute, set once by `finalize_executable`. The rewriter
    /// must never write to it again.
    Executable(Mmap),
}

/// An executable region bump-allocated in page-sized chunks. `reserve`
/// hands back a byte offset without advancing the write cursor;
/// `commit` advances it once the caller knows how many bytes it
/// actually wrote. Freeing releases the whole region at once.
pub struct CodeStorage {
    region: Option<Region>,
    capacity: usize,
    used: usize,
    reserved: usize,
}

impl CodeStorage {
    /// Allocates a fresh writable region of at least `size` bytes,
    /// rounded up to a page multiple.
    pub fn allocate(size: usize) -> Result<Self> {
        let page_size = page_size();
        let capacity = round_up_to_page(size.max(1), page_size);
        let map = MmapMut::map_anon(capacity).map_err(|e| {
            RewriterError::Misconfiguration(format!("failed to map executable region: {e}"))
        })?;
        tracing::debug!(capacity, "allocated code storage region");
        Ok(CodeStorage {
            region: Some(Region::Writable(map)),
            capacity,
            used: 0,
            reserved: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }

    /// The region's base virtual address. Stable across `finalize_executable`:
    /// `mprotect` changes permissions in place, it does not relocate the
    /// mapping, so callers may compute addresses before finalizing.
    pub fn base_addr(&self) -> u64 {
        match self.region.as_ref().expect("code storage already freed") {
            Region::Writable(map) => map.as_ptr() as u64,
            Region::Executable(map) => map.as_ptr() as u64,
        }
    }

    /// Reserves `size` bytes for the next emission pass without
    /// advancing `used`. Returns the byte offset the reservation starts
    /// at. Fails if the region cannot hold `size` more bytes.
    pub fn reserve(&mut self, size: usize) -> Result<usize> {
        if size > self.remaining() {
            return Err(RewriterError::StorageExhausted {
                reserved: self.remaining(),
                needed: size,
            });
        }
        self.reserved = size;
        Ok(self.used)
    }

    /// A mutable view of the currently reserved window, for the
    /// generator's emit pass to write bytes into directly.
    pub fn reserved_slice_mut(&mut self) -> &mut [u8] {
        let start = self.used;
        let end = start + self.reserved;
        match self.region.as_mut().expect("code storage already freed") {
            Region::Writable(map) => &mut map[start..end],
            Region::Executable(_) => panic!("cannot write to a finalized code storage region"),
        }
    }

    /// Advances `used` by `written` bytes (<= the last `reserve` call).
    /// Fails fatally if `written` exceeds the reservation; no partial
    /// function is ever returned.
    pub fn commit(&mut self, written: usize) -> Result<()> {
        if written > self.reserved {
            return Err(RewriterError::StorageExhausted {
                reserved: self.reserved,
                needed: written,
            });
        }
        self.used += written;
        self.reserved = 0;
        Ok(())
    }

    /// Switches the region to read-execute so the just-emitted bytes
    /// become callable, and returns the region's absolute base address.
    /// Idempotent: calling this twice just returns the same address.
    pub fn finalize_executable(&mut self) -> Result<u64> {
        let region = self.region.take().expect("code storage already freed");
        let exec = match region {
            Region::Writable(map) => map.make_exec().map_err(|(_, e)| {
                RewriterError::Misconfiguration(format!("failed to mark region executable: {e}"))
            })?,
            Region::Executable(map) => map,
        };
        let base = exec.as_ptr() as u64;
        self.region = Some(Region::Executable(exec));
        Ok(base)
    }

    /// Releases the region. Invalidates any function pointer previously
    /// returned from it — the host is responsible for not calling into
    /// freed code; this type keeps no internal reference count.
    pub fn free(self) {
        drop(self);
    }
}

fn page_size() -> usize {
    #[cfg(unix)]
    {
        let r = unsafe { sysconf(_SC_PAGESIZE) };
        if r > 0 {
            return r as usize;
        }
    }
    4096
}

#[cfg(unix)]
const _SC_PAGESIZE: i32 = 30;

#[cfg(unix)]
extern "C" {
    fn sysconf(name: i32) -> i64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_rounds_to_page_size() {
        let storage = CodeStorage::allocate(1).unwrap();
        assert!(storage.capacity() >= 1);
        assert_eq!(storage.capacity() % page_size(), 0);
    }

    #[test]
    fn commit_cannot_exceed_reservation() {
        let mut storage = CodeStorage::allocate(64).unwrap();
        storage.reserve(8).unwrap();
        let err = storage.commit(9).unwrap_err();
        assert!(matches!(err, RewriterError::StorageExhausted { .. }));
    }

    #[test]
    fn reserve_fails_past_capacity() {
        let mut storage = CodeStorage::allocate(1).unwrap();
        let cap = storage.capacity();
        let err = storage.reserve(cap + 1).unwrap_err();
        assert!(matches!(err, RewriterError::StorageExhausted { .. }));
    }

    #[test]
    fn finalize_then_execute_identity_function() {
        let mut storage = CodeStorage::allocate(16).unwrap();
        storage.reserve(4).unwrap();
        // `C3` repeated: RET; RET; RET; RET — any prefix is a valid entry.
        storage.reserved_slice_mut().copy_from_slice(&[0xC3, 0xC3, 0xC3, 0xC3]);
        storage.commit(4).unwrap();
        let base = storage.finalize_executable().unwrap();
        let f: extern "C" fn() = unsafe { std::mem::transmute(base as *const ()) };
        f();
    }
}
