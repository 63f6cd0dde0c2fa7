//! Pooled block allocator feeding per-operation state and scratch storage.
//!
//! Blocks come from segregated free lists, one list per size class; an
//! empty list is refilled by slicing a bulk chunk obtained from the system
//! allocator. Allocate/release of a pooled block is O(1) and touches no
//! global allocator state. Thread safety is a construction-time choice of
//! [`PoolSync`] policy, so a pool declared single-threaded pays no
//! synchronization cost.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::cell::RefCell;
use std::ptr::NonNull;

use parking_lot::Mutex;

/// Block alignment and size-class granularity, in bytes.
pub const ALIGN: usize = 16;

/// Largest size class served from the free lists; bigger requests bypass
/// the pool and go straight to the system allocator.
pub const DEFAULT_MAX_CLASS: usize = 4096;

// Each refill takes 2x the requested block plus this fraction of
// everything handed out so far, so steady consumers see progressively
// larger chunks and fewer refills.
const GROWTH_DIVISOR: usize = 8;

/// Free blocks of one size class, threaded through the blocks themselves.
struct FreeList {
    head: Option<NonNull<u8>>,
    block: usize,
    free: usize,
}

impl FreeList {
    fn new(block: usize) -> Self {
        debug_assert!(block >= ALIGN && block % ALIGN == 0);
        FreeList {
            head: None,
            block,
            free: 0,
        }
    }

    fn push(&mut self, ptr: NonNull<u8>) {
        let next = self.head.map_or(std::ptr::null_mut(), NonNull::as_ptr);
        // A free block is at least ALIGN bytes, room enough for the link.
        unsafe { ptr.as_ptr().cast::<*mut u8>().write(next) };
        self.head = Some(ptr);
        self.free += 1;
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        let ptr = self.head.take()?;
        let next = unsafe { ptr.as_ptr().cast::<*mut u8>().read() };
        self.head = NonNull::new(next);
        self.free -= 1;
        Some(ptr)
    }
}

enum Shape {
    /// One class per ALIGN step up to `max_class`.
    Segregated { max_class: usize },
    /// Single-class parameterization of the same algorithm.
    Fixed { block: usize },
}

/// The lists, chunk registry, and counters behind a pool; wrapped by the
/// chosen [`PoolSync`] policy.
pub struct PoolState {
    shape: Shape,
    classes: Vec<FreeList>,
    chunks: Vec<(NonNull<u8>, Layout)>,
    total_handed: usize,
    outstanding: usize,
}

// The state owns every pointer it holds.
unsafe impl Send for PoolState {}

impl PoolState {
    fn segregated(max_class: usize) -> Self {
        assert!(max_class >= ALIGN && max_class % ALIGN == 0);
        let classes = (1..=max_class / ALIGN)
            .map(|i| FreeList::new(i * ALIGN))
            .collect();
        PoolState {
            shape: Shape::Segregated { max_class },
            classes,
            chunks: Vec::new(),
            total_handed: 0,
            outstanding: 0,
        }
    }

    fn fixed(block_size: usize) -> Self {
        let block = round_up(block_size.max(1));
        PoolState {
            shape: Shape::Fixed { block },
            classes: vec![FreeList::new(block)],
            chunks: Vec::new(),
            total_handed: 0,
            outstanding: 0,
        }
    }

    fn class_of(&self, size: usize) -> Option<usize> {
        match self.shape {
            Shape::Segregated { max_class } => {
                let rounded = round_up(size.max(1));
                if rounded > max_class {
                    None
                } else {
                    Some(rounded / ALIGN - 1)
                }
            }
            Shape::Fixed { block } => {
                if size.max(1) <= block {
                    Some(0)
                } else {
                    None
                }
            }
        }
    }

    fn allocate(&mut self, size: usize) -> NonNull<u8> {
        match self.class_of(size) {
            Some(class) => {
                if self.classes[class].head.is_none() {
                    self.grow(class);
                }
                self.outstanding += 1;
                self.classes[class].pop().unwrap()
            }
            None => oversize_alloc(size),
        }
    }

    fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        match self.class_of(size) {
            Some(class) => {
                self.classes[class].push(ptr);
                self.outstanding -= 1;
            }
            None => oversize_free(ptr, size),
        }
    }

    /// Refill a class from the backing allocator.
    fn grow(&mut self, class: usize) {
        let block = self.classes[class].block;
        let want = 2 * block + self.total_handed / GROWTH_DIVISOR;
        let blocks = (want / block).max(2);
        let layout = layout_for(blocks * block);

        let (ptr, layout, blocks) = match NonNull::new(unsafe { alloc(layout) }) {
            Some(ptr) => (ptr, layout, blocks),
            None => {
                // Bulk refill failed; fall back once to a plain
                // single-block request before declaring out-of-memory.
                tracing::debug!(block, want, "bulk refill failed, falling back");
                let layout = layout_for(block);
                match NonNull::new(unsafe { alloc(layout) }) {
                    Some(ptr) => (ptr, layout, 1),
                    None => handle_alloc_error(layout),
                }
            }
        };

        self.chunks.push((ptr, layout));
        self.total_handed += layout.size();
        for i in 0..blocks {
            let block_ptr = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(i * block)) };
            self.classes[class].push(block_ptr);
        }
        tracing::trace!(block, blocks, total = self.total_handed, "size class refilled");
    }
}

impl Drop for PoolState {
    fn drop(&mut self) {
        // Release every recorded chunk en masse; outstanding blocks from
        // those chunks become invalid, per the shutdown contract.
        for (ptr, layout) in self.chunks.drain(..) {
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }
    }
}

fn round_up(size: usize) -> usize {
    (size + ALIGN - 1) / ALIGN * ALIGN
}

fn layout_for(size: usize) -> Layout {
    // ALIGN is a power of two and pool sizes never approach isize::MAX.
    Layout::from_size_align(size, ALIGN).expect("invalid pool layout")
}

fn oversize_alloc(size: usize) -> NonNull<u8> {
    let layout = layout_for(size);
    match NonNull::new(unsafe { alloc(layout) }) {
        Some(ptr) => ptr,
        None => handle_alloc_error(layout),
    }
}

fn oversize_free(ptr: NonNull<u8>, size: usize) {
    unsafe { dealloc(ptr.as_ptr(), layout_for(size)) };
}

/// Construction-time thread-safety policy for a [`Pool`].
pub trait PoolSync {
    fn new(state: PoolState) -> Self;
    fn with<R>(&self, f: impl FnOnce(&mut PoolState) -> R) -> R;
}

/// Mutex-protected policy; the pool may be shared across threads.
pub struct Locked(Mutex<PoolState>);

impl PoolSync for Locked {
    fn new(state: PoolState) -> Self {
        Locked(Mutex::new(state))
    }

    fn with<R>(&self, f: impl FnOnce(&mut PoolState) -> R) -> R {
        f(&mut self.0.lock())
    }
}

/// Declared single-threaded policy; no lock is taken anywhere.
pub struct Unlocked(RefCell<PoolState>);

impl PoolSync for Unlocked {
    fn new(state: PoolState) -> Self {
        Unlocked(RefCell::new(state))
    }

    fn with<R>(&self, f: impl FnOnce(&mut PoolState) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }
}

/// Segregated free-list pool with a caller-selected [`PoolSync`] policy.
pub struct Pool<S: PoolSync = Locked> {
    sync: S,
}

/// Pool shareable across threads.
pub type SharedPool = Pool<Locked>;

/// Pool for a declared single-threaded consumer.
pub type LocalPool = Pool<Unlocked>;

impl<S: PoolSync> Pool<S> {
    /// Pool with classes up to [`DEFAULT_MAX_CLASS`].
    pub fn new() -> Self {
        Self::with_max_class(DEFAULT_MAX_CLASS)
    }

    /// Pool with classes up to `max_class` bytes (multiple of [`ALIGN`]).
    pub fn with_max_class(max_class: usize) -> Self {
        Pool {
            sync: S::new(PoolState::segregated(max_class)),
        }
    }

    /// Single-size parameterization: one class of `block_size` bytes.
    ///
    /// Same algorithm, one free list; this is the shape backing
    /// per-operation scratch storage.
    pub fn fixed(block_size: usize) -> Self {
        Pool {
            sync: S::new(PoolState::fixed(block_size)),
        }
    }

    /// Hand out a block of at least `size` bytes.
    ///
    /// Sizes within the pool's classes come from the free lists; larger
    /// requests bypass the pool to the system allocator. Either way the
    /// block must come back through [`deallocate`](Self::deallocate) with
    /// the same `size`.
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        self.sync.with(|state| state.allocate(size))
    }

    /// Return a block obtained from [`allocate`](Self::allocate).
    ///
    /// `size` must be the size passed to the matching allocate call; it
    /// selects the free list the block returns to. The block must not be
    /// touched again until re-allocated.
    pub fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        self.sync.with(|state| state.deallocate(ptr, size));
    }

    /// Cumulative bytes obtained from the backing allocator.
    pub fn allocated_bytes(&self) -> usize {
        self.sync.with(|state| state.total_handed)
    }

    /// Pooled blocks currently handed out.
    pub fn outstanding(&self) -> usize {
        self.sync.with(|state| state.outstanding)
    }

    /// Free blocks currently available for `size` without a refill.
    pub fn free_blocks(&self, size: usize) -> usize {
        self.sync.with(|state| {
            state
                .class_of(size)
                .map_or(0, |class| state.classes[class].free)
        })
    }
}

impl<S: PoolSync> Default for Pool<S> {
    fn default() -> Self {
        Self::new()
    }
}
