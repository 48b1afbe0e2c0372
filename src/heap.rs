//! Work heap lending block-aligned buffers to the compute phases.
//!
//! All intermediate buffers are carved from one pre-allocated region. A
//! producer that calls [`WorkHeap::allocate`] owns the returned
//! [`HeapBuffer`] exclusively until it hands the token to the queue's
//! `release_buffer` command; the dispatcher then stages the block on a
//! pending list. Pending blocks fold back into the free list when a
//! producer calls [`WorkHeap::complete_pending_releases`] or when an
//! allocation has to hunt for space. This braiding of buffer lifetimes
//! with in-flight I/O is what lets producers keep allocating while writes
//! they no longer care about drain in the background.
//!
//! The one correctness invariant is no double hand-out: between `allocate`
//! returning a block and `release` accepting it back, no other caller can
//! receive an overlapping region.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::{Condvar, Mutex};

use crate::buffer::AlignedBuffer;

/// A contiguous span of the heap region, by offset.
#[derive(Clone, Copy, Debug)]
struct Span {
    offset: usize,
    len: usize,
}

impl Span {
    fn end(&self) -> usize {
        self.offset + self.len
    }
}

struct HeapState {
    region: AlignedBuffer,
    /// Free spans, sorted by offset, coalesced.
    free: Vec<Span>,
    /// Spans released by the dispatcher, not yet folded into `free`.
    pending: Vec<Span>,
    /// Outstanding allocations, offset -> length.
    live: BTreeMap<usize, usize>,
}

pub struct WorkHeap {
    state: Mutex<HeapState>,
    released: Condvar,
}

/// Ownership token for a heap allocation.
///
/// The token is move-only; dropping it without releasing leaks the span
/// until the next heap reset. Producers normally thread it back through
/// the queue's `release_buffer` command.
pub struct HeapBuffer {
    ptr: NonNull<u8>,
    offset: usize,
    len: usize,
}

unsafe impl Send for HeapBuffer {}

impl HeapBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    /// An unowned view for shipping inside a command. The caller must keep
    /// this token alive until the command completes; the queue's FIFO
    /// release convention guarantees it.
    pub(crate) fn view(&self) -> BufferView {
        BufferView {
            ptr: self.ptr.as_ptr(),
            len: self.len,
        }
    }
}

impl Deref for HeapBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for HeapBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl std::fmt::Debug for HeapBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapBuffer")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Unowned `(ptr, len)` view of a live [`HeapBuffer`], carried by write and
/// read commands. The backing token must stay allocated until the command
/// executes.
#[derive(Clone, Copy)]
pub struct BufferView {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for BufferView {}

impl BufferView {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Caller must uphold the view contract: the backing buffer is live
    /// and not mutated concurrently.
    pub(crate) unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }

    pub(crate) unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }

    /// A view over memory the queue itself keeps alive (the retained plot
    /// header); same liveness contract as a heap-backed view.
    pub(crate) fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }
}

impl std::fmt::Debug for BufferView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferView")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl WorkHeap {
    /// Creates a heap over a fresh page-aligned region of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(HeapState {
                region: AlignedBuffer::new(capacity, 4096),
                free: vec![Span {
                    offset: 0,
                    len: capacity,
                }],
                pending: Vec::new(),
                live: BTreeMap::new(),
            }),
            released: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().unwrap().region.len()
    }

    /// Bytes currently free, not counting pending releases.
    pub fn free_size(&self) -> usize {
        self.state.lock().unwrap().free.iter().map(|s| s.len).sum()
    }

    /// Carves a buffer of at least `len` bytes whose address and length are
    /// multiples of `align`. Drains pending releases when space is tight
    /// and blocks until the dispatcher releases enough otherwise.
    pub fn allocate(&self, len: usize, align: usize) -> HeapBuffer {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        let size = round_up(len.max(1), align);

        let mut state = self.state.lock().unwrap();
        loop {
            state.fold_pending();

            if let Some(span) = state.carve(size, align) {
                state.live.insert(span.offset, span.len);
                let ptr = unsafe { state.region.as_ptr().add(span.offset) as *mut u8 };
                return HeapBuffer {
                    ptr: NonNull::new(ptr).expect("heap region pointer is null"),
                    offset: span.offset,
                    len: span.len,
                };
            }

            tracing::warn!(
                requested = size,
                free = state.free.iter().map(|s| s.len).sum::<usize>(),
                "work heap exhausted, waiting for buffer releases"
            );
            state = self.released.wait(state).unwrap();
        }
    }

    /// Dispatcher-side: returns a buffer to the heap. The span lands on the
    /// pending list; producers observe it via `complete_pending_releases`
    /// or a subsequent allocation. Panics on a double or foreign release.
    pub fn release(&self, buffer: HeapBuffer) {
        let mut state = self.state.lock().unwrap();
        let len = state
            .live
            .remove(&buffer.offset())
            .expect("released a buffer the heap does not own");
        debug_assert_eq!(len, buffer.len());

        state.pending.push(Span {
            offset: buffer.offset(),
            len,
        });
        self.released.notify_all();
    }

    /// Producer-side: folds every release announced by the dispatcher into
    /// the free list.
    pub fn complete_pending_releases(&self) {
        self.state.lock().unwrap().fold_pending();
    }

    /// Rebinds the heap to a fresh region of `capacity` bytes between
    /// passes. Panics if any allocation is still live.
    pub fn reset(&self, capacity: usize) {
        let mut state = self.state.lock().unwrap();
        state.fold_pending();
        assert!(
            state.live.is_empty(),
            "heap reset with {} live allocations",
            state.live.len()
        );

        state.region = AlignedBuffer::new(capacity, 4096);
        state.free = vec![Span {
            offset: 0,
            len: capacity,
        }];
    }
}

impl HeapState {
    fn fold_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        self.free.extend(pending);
        self.free.sort_by_key(|s| s.offset);

        // Coalesce adjacent spans.
        let mut merged: Vec<Span> = Vec::with_capacity(self.free.len());
        for span in self.free.drain(..) {
            match merged.last_mut() {
                Some(last) if last.end() == span.offset => last.len += span.len,
                _ => merged.push(span),
            }
        }
        self.free = merged;
    }

    /// First-fit carve of `size` bytes at an `align`-multiple offset.
    fn carve(&mut self, size: usize, align: usize) -> Option<Span> {
        for i in 0..self.free.len() {
            let span = self.free[i];
            let start = round_up(span.offset, align);
            if start + size > span.end() {
                continue;
            }

            let taken = Span { offset: start, len: size };
            let lead = Span {
                offset: span.offset,
                len: start - span.offset,
            };
            let tail = Span {
                offset: taken.end(),
                len: span.end() - taken.end(),
            };

            self.free.remove(i);
            if tail.len > 0 {
                self.free.insert(i, tail);
            }
            if lead.len > 0 {
                self.free.insert(i, lead);
            }
            return Some(taken);
        }
        None
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}
