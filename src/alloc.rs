// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Space memory manager.
//!
//! Every space owns one of these. It hands out raw, 8-byte-aligned blocks
//! from a list of heap chunks and recycles freed blocks through size-class
//! free lists. Memory is never returned to the system while the space is
//! alive; everything is released at once when the manager is dropped.
//!
//! Propagation creates and discards small auxiliary objects (above all
//! subscription arrays) at a very high rate; the per-space pool amortizes
//! that churn to a bump-pointer increment in the common case.
//!
//! # Safety
//!
//! Blocks handed out by [`SpaceAlloc::ralloc`] are valid until freed or
//! until the manager is dropped, whichever comes first. Free-list links are
//! stored in the first word of freed blocks, which is why the minimum block
//! size is 8 bytes. All pointers into the pool are owned by exactly one
//! space; the manager is `Send` because a space is only ever touched by one
//! thread at a time.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

/// Size of the first heap chunk.
const CHUNK_START: usize = 2 * 1024;
/// Chunk sizes double up to this cap.
const CHUNK_MAX: usize = 64 * 1024;
/// Largest block size served by the size-class free lists.
const FL_MAX: usize = 128;
/// Number of size classes (8, 16, .., 128).
const N_CLASSES: usize = FL_MAX / 8;

/// Round a size up to the 8-byte allocation granule.
#[inline]
fn round_up(s: usize) -> usize {
    (s.max(8) + 7) & !7
}

#[inline]
fn class_of(s: usize) -> usize {
    debug_assert!(s >= 8 && s <= FL_MAX && s % 8 == 0);
    s / 8 - 1
}

struct Chunk {
    ptr: NonNull<u8>,
    size: usize,
}

/// Scoped allocator backing all intra-space allocations.
pub struct SpaceAlloc {
    chunks: Vec<Chunk>,
    /// Bump offset into the last chunk.
    cur: usize,
    /// Per-class intrusive free lists; the link lives in the block itself.
    free: [Option<NonNull<u8>>; N_CLASSES],
    /// First-fit reuse pool for blocks larger than the free-list classes.
    pool: Vec<(NonNull<u8>, usize)>,
    /// Size the next chunk will get.
    next_chunk: usize,
    /// Total bytes held in chunks.
    allocated: usize,
    /// Contiguous area the last clone rebuilt subscription arrays into,
    /// as an address range. Arrays inside it grow mildly (+4 slots);
    /// arrays outside grow geometrically.
    sub_region: Option<(usize, usize)>,
}

// One space, one thread at a time; all pointers are into chunks owned here.
unsafe impl Send for SpaceAlloc {}

impl SpaceAlloc {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            cur: 0,
            free: [None; N_CLASSES],
            pool: Vec::new(),
            next_chunk: CHUNK_START,
            allocated: 0,
            sub_region: None,
        }
    }

    /// Allocate `s` bytes (rounded up to the granule) from the space pool.
    pub fn ralloc(&mut self, s: usize) -> NonNull<u8> {
        let s = round_up(s);
        if s <= FL_MAX {
            let c = class_of(s);
            if let Some(head) = self.free[c] {
                // Pop the class free list; the next link sits in the block.
                let next = unsafe { head.as_ptr().cast::<*mut u8>().read() };
                self.free[c] = NonNull::new(next);
                return head;
            }
        } else if let Some(pos) = self.pool.iter().position(|&(_, n)| n >= s) {
            let (p, n) = self.pool.swap_remove(pos);
            if n > s {
                // Return the tail to the pool so first-fit slack is bounded.
                let tail = unsafe { NonNull::new_unchecked(p.as_ptr().add(s)) };
                self.rfree(tail, n - s);
            }
            return p;
        }
        self.bump(s)
    }

    /// Return a block of `s` bytes for later reuse within this space.
    pub fn rfree(&mut self, p: NonNull<u8>, s: usize) {
        let s = round_up(s);
        if s <= FL_MAX {
            let c = class_of(s);
            let head = self.free[c].map_or(std::ptr::null_mut(), |h| h.as_ptr());
            unsafe { p.as_ptr().cast::<*mut u8>().write(head) };
            self.free[c] = Some(p);
        } else {
            self.pool.push((p, s));
        }
    }

    /// Reallocate a block from `n` to `m` bytes.
    ///
    /// Grows by copy-and-free, shrinks by freeing the tail.
    pub fn rrealloc(&mut self, b: NonNull<u8>, n: usize, m: usize) -> NonNull<u8> {
        let n = round_up(n);
        let m = round_up(m);
        if n < m {
            let p = self.ralloc(m);
            unsafe {
                std::ptr::copy_nonoverlapping(b.as_ptr(), p.as_ptr(), n);
            }
            self.rfree(b, n);
            p
        } else {
            if n - m >= 8 {
                let tail = unsafe { NonNull::new_unchecked(b.as_ptr().add(m)) };
                self.rfree(tail, n - m);
            }
            b
        }
    }

    /// Allocate one block from the fixed-size free list for size `S`.
    pub fn fl_alloc<const S: usize>(&mut self) -> NonNull<u8> {
        self.ralloc(S)
    }

    /// Return a chain of fixed-size blocks to the free list for size `S`.
    ///
    /// The blocks from `f` to `l` must already be linked through their first
    /// word (see [`Self::fl_link`]); `l` becomes the tail of the class list.
    pub fn fl_dispose<const S: usize>(&mut self, f: NonNull<u8>, l: NonNull<u8>) {
        let s = round_up(S);
        debug_assert!(s <= FL_MAX);
        let c = class_of(s);
        let head = self.free[c].map_or(std::ptr::null_mut(), |h| h.as_ptr());
        unsafe { l.as_ptr().cast::<*mut u8>().write(head) };
        self.free[c] = Some(f);
    }

    /// Link `a` to `b` through `a`'s first word, for use with
    /// [`Self::fl_dispose`].
    pub fn fl_link(a: NonNull<u8>, b: NonNull<u8>) {
        unsafe { a.as_ptr().cast::<*mut u8>().write(b.as_ptr()) };
    }

    /// Total bytes of heap memory held by this space.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Allocate the contiguous region a clone rebuilds subscription arrays
    /// into, and remember its bounds for the growth-policy test.
    pub fn alloc_sub_region(&mut self, bytes: usize) -> NonNull<u8> {
        if bytes == 0 {
            self.sub_region = None;
            return NonNull::dangling();
        }
        let p = self.ralloc(bytes);
        self.sub_region = Some((p.as_ptr() as usize, round_up(bytes)));
        p
    }

    /// Whether `p` points into the subscription region of the last clone.
    pub fn in_sub_region(&self, p: NonNull<u8>) -> bool {
        match self.sub_region {
            Some((start, len)) => {
                let a = p.as_ptr() as usize;
                a >= start && a < start + len
            }
            None => false,
        }
    }

    fn bump(&mut self, s: usize) -> NonNull<u8> {
        let fits = self
            .chunks
            .last()
            .map(|c| self.cur + s <= c.size)
            .unwrap_or(false);
        if !fits {
            let size = self.next_chunk.max(s);
            self.next_chunk = (self.next_chunk * 2).min(CHUNK_MAX);
            let layout = Layout::from_size_align(size, 8).expect("chunk layout");
            let raw = unsafe { alloc(layout) };
            let ptr = NonNull::new(raw).expect("space chunk allocation failed");
            self.allocated += size;
            self.chunks.push(Chunk { ptr, size });
            self.cur = 0;
        }
        let chunk = self.chunks.last().expect("chunk present after grow");
        let p = unsafe { NonNull::new_unchecked(chunk.ptr.as_ptr().add(self.cur)) };
        self.cur += s;
        p
    }
}

impl Default for SpaceAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SpaceAlloc {
    fn drop(&mut self) {
        for c in &self.chunks {
            let layout = Layout::from_size_align(c.size, 8).expect("chunk layout");
            unsafe { dealloc(c.ptr.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for SpaceAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceAlloc")
            .field("chunks", &self.chunks.len())
            .field("allocated", &self.allocated)
            .finish()
    }
}
