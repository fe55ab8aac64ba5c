//! Lock-free single-producer / single-consumer byte ring.
//!
//! The ring carries raw transport bytes and has no notion of samples. One
//! thread pushes (the cadence/delivery thread), one thread pops (the
//! transport worker). Capacity is always a power of two so positions wrap
//! with a mask, and one slot stays empty to tell "full" from "empty":
//! `available() + free_space() == capacity() - 1`.
//!
//! Cursor loads are `Acquire` and stores `Release`, so a byte written before
//! a write-cursor store is visible to the consumer that observes it, and the
//! producer never overwrites bytes the consumer has not released.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Fixed-capacity SPSC byte ring.
///
/// `push` may only be called from one thread at a time, and likewise
/// `pop`/`direct_read_region`. `direct_write_region` needs `&mut self`. Operations that rewrite the
/// whole storage need exclusive access.
pub struct RingChannel {
    storage: Box<[UnsafeCell<u8>]>,
    size: AtomicUsize,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
    silence: AtomicU8,
}

// SAFETY: bytes are only touched through the SPSC protocol above: the
// producer writes strictly inside the free region and the consumer reads
// strictly inside the available region; the cursors publish ownership.
unsafe impl Sync for RingChannel {}

fn round_capacity(capacity: usize) -> usize {
    capacity.max(2).next_power_of_two()
}

fn alloc_storage(len: usize, fill: u8) -> Box<[UnsafeCell<u8>]> {
    let bytes: Box<[u8]> = vec![fill; len].into_boxed_slice();
    // SAFETY: `UnsafeCell<u8>` is `repr(transparent)` over `u8`.
    unsafe { Box::from_raw(Box::into_raw(bytes) as *mut [UnsafeCell<u8>]) }
}

impl RingChannel {
    /// Allocate a ring of at least `capacity` bytes, filled with `silence`.
    pub fn new(capacity: usize, silence: u8) -> Self {
        let size = round_capacity(capacity);
        Self {
            storage: alloc_storage(size, silence),
            size: AtomicUsize::new(size),
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            silence: AtomicU8::new(silence),
        }
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.storage.as_ptr())
    }

    /// Capacity in bytes (power of two). Usable space is one byte less.
    pub fn capacity(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Largest capacity reachable without reallocating.
    pub fn storage_len(&self) -> usize {
        self.storage.len()
    }

    pub fn silence_byte(&self) -> u8 {
        self.silence.load(Ordering::Relaxed)
    }

    /// Bytes ready for the consumer.
    pub fn available(&self) -> usize {
        let mask = self.capacity() - 1;
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        w.wrapping_sub(r) & mask
    }

    /// Bytes the producer may write.
    pub fn free_space(&self) -> usize {
        let mask = self.capacity() - 1;
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        r.wrapping_sub(w).wrapping_sub(1) & mask
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Reset both cursors. Storage content is left as is.
    pub fn clear(&self) {
        self.write_pos.store(0, Ordering::Release);
        self.read_pos.store(0, Ordering::Release);
    }

    /// Round `capacity` up, reset the cursors and fill with `silence`.
    ///
    /// Reallocates only when the new capacity exceeds the current storage.
    pub fn resize(&mut self, capacity: usize, silence: u8) {
        let size = round_capacity(capacity);
        if size > self.storage.len() {
            self.storage = alloc_storage(size, silence);
        }
        // SAFETY: `&mut self` excludes every other access.
        unsafe { self.reset_shared(size, silence) };
    }

    /// Rewrite the whole active storage with the silence byte. Cursors stay.
    pub fn fill_with_silence(&mut self) {
        let silence = self.silence_byte();
        let size = self.capacity();
        // SAFETY: `&mut self` excludes every other access.
        unsafe { ptr::write_bytes(self.base(), silence, size) };
    }

    /// Shared-reference variant of [`RingChannel::resize`] that never
    /// reallocates: the capacity is clamped to the existing storage.
    ///
    /// # Safety
    /// No push, pop or outstanding region may be active on another thread
    /// for the duration of the call.
    pub(crate) unsafe fn reset_shared(&self, capacity: usize, silence: u8) {
        let size = round_capacity(capacity).min(self.storage.len());
        self.silence.store(silence, Ordering::Relaxed);
        self.size.store(size, Ordering::Release);
        self.clear();
        // SAFETY: guaranteed by the caller; `size <= storage.len()`.
        unsafe { ptr::write_bytes(self.base(), silence, size) };
    }

    /// Copy up to `data.len()` bytes in; returns the count written.
    pub fn push(&self, data: &[u8]) -> usize {
        let size = self.capacity();
        let mask = size - 1;
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        let free = r.wrapping_sub(w).wrapping_sub(1) & mask;
        let len = data.len().min(free);
        if len == 0 {
            return 0;
        }

        let first = len.min(size - w);
        // SAFETY: `[w, w + len)` mod size lies in the free region owned by
        // the producer; both spans are within `size <= storage.len()`.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(w), first);
            if len > first {
                ptr::copy_nonoverlapping(data.as_ptr().add(first), self.base(), len - first);
            }
        }
        self.write_pos.store((w + len) & mask, Ordering::Release);
        len
    }

    /// Copy up to `dest.len()` bytes out; returns the count read.
    pub fn pop(&self, dest: &mut [u8]) -> usize {
        let size = self.capacity();
        let mask = size - 1;
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        let avail = w.wrapping_sub(r) & mask;
        let len = dest.len().min(avail);
        if len == 0 {
            return 0;
        }

        let first = len.min(size - r);
        // SAFETY: `[r, r + len)` mod size lies in the available region,
        // which the producer does not touch until the read cursor moves.
        unsafe {
            ptr::copy_nonoverlapping(self.base().add(r), dest.as_mut_ptr(), first);
            if len > first {
                ptr::copy_nonoverlapping(self.base(), dest.as_mut_ptr().add(first), len - first);
            }
        }
        self.read_pos.store((r + len) & mask, Ordering::Release);
        len
    }

    /// Contiguous writable span of at least `needed` bytes, or `None` if the
    /// free space is smaller or would wrap.
    ///
    /// Takes `&mut self`: a mutable span may not coexist with another
    /// region or a push on the same ring.
    ///
    /// ```compile_fail
    /// let mut ring = stream_core::ring::RingChannel::new(64, 0);
    /// let a = ring.direct_write_region(8).unwrap();
    /// let b = ring.direct_write_region(8).unwrap();
    /// a.commit(8);
    /// b.commit(8);
    /// ```
    pub fn direct_write_region(&mut self, needed: usize) -> Option<WriteRegion<'_>> {
        let size = self.capacity();
        let mask = size - 1;
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        let free = r.wrapping_sub(w).wrapping_sub(1) & mask;
        let contiguous = (size - w).min(free);
        if contiguous < needed {
            return None;
        }
        let ring: &Self = self;
        // SAFETY: the span is inside the free region, and the exclusive
        // borrow held by the region keeps every other writer out.
        let span = unsafe { std::slice::from_raw_parts_mut(ring.base().add(w), contiguous) };
        Some(WriteRegion { ring, span })
    }

    /// Contiguous readable span of at least `needed` bytes. `None` on
    /// underrun and also when the data wraps; use [`RingChannel::pop`] then.
    pub fn direct_read_region(&self, needed: usize) -> Option<ReadRegion<'_>> {
        let size = self.capacity();
        let mask = size - 1;
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        let total = w.wrapping_sub(r) & mask;
        if total < needed {
            return None;
        }
        let contiguous = (size - r).min(total);
        if contiguous < needed {
            return None;
        }
        // SAFETY: the span is inside the consumer-owned available region.
        let span = unsafe { std::slice::from_raw_parts(self.base().add(r), contiguous) };
        Some(ReadRegion { ring: self, span })
    }

    fn commit_write(&self, n: usize) {
        let mask = self.capacity() - 1;
        let w = self.write_pos.load(Ordering::Acquire);
        self.write_pos.store((w + n) & mask, Ordering::Release);
    }

    fn advance_read(&self, n: usize) {
        let mask = self.capacity() - 1;
        let r = self.read_pos.load(Ordering::Acquire);
        self.read_pos.store((r + n) & mask, Ordering::Release);
    }
}

/// Writable span borrowed from the ring. Dropping it without
/// [`WriteRegion::commit`] publishes nothing.
pub struct WriteRegion<'a> {
    ring: &'a RingChannel,
    span: &'a mut [u8],
}

impl WriteRegion<'_> {
    /// Publish the first `n` bytes (clamped to the span).
    pub fn commit(self, n: usize) {
        self.ring.commit_write(n.min(self.span.len()));
    }
}

impl Deref for WriteRegion<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.span
    }
}

impl DerefMut for WriteRegion<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.span
    }
}

/// Readable span borrowed from the ring. Dropping it without
/// [`ReadRegion::advance`] leaves the bytes queued.
pub struct ReadRegion<'a> {
    ring: &'a RingChannel,
    span: &'a [u8],
}

impl ReadRegion<'_> {
    /// Consume the first `n` bytes (clamped to the span).
    pub fn advance(self, n: usize) {
        self.ring.advance_read(n.min(self.span.len()));
    }
}

impl Deref for ReadRegion<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.span
    }
}
