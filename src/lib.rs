//! A segregated free-list heap allocator over a single fixed-size backing
//! region (`HEAP_SIZE` bytes), with best-fit placement, bidirectional
//! coalescing, optional guard bytes and boundary tags, operational
//! statistics, and leak tracking.
//!
//! The [`Heap`] type is an independent, instantiable allocator; the free
//! functions at the crate root (`allocate`, `free`, `reallocate`, …) are a
//! thin wrapper around one process-wide singleton, kept only for API parity
//! with the crate's global-function surface — the core logic in [`heap`]
//! never depends on that singleton existing.

mod block;
mod config;
mod diagnostics;
mod free_list;
mod heap;
mod leak;
mod origin;
mod region;
mod size_class;
mod stats;
mod used_list;

use std::sync::OnceLock;

pub use config::{ALIGNMENT, HEAP_SIZE, NUM_CLASSES, SIZE_CLASS_BOUNDS};
pub use diagnostics::{CapturingSink, DiagnosticEvent, DiagnosticSink, StderrSink};
#[cfg(feature = "leak-detection")]
pub use leak::AllocationRecord;
pub use origin::Origin;
pub use size_class::class_of;
pub use stats::Stats;

use heap::HeapInner;

#[cfg(feature = "thread-safe")]
struct Guard(std::sync::Mutex<HeapInner>);

#[cfg(feature = "thread-safe")]
impl Guard {
    fn new() -> Self {
        Self(std::sync::Mutex::new(HeapInner::new()))
    }

    fn with<R>(&self, f: impl FnOnce(&mut HeapInner) -> R) -> R {
        let mut inner = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut inner)
    }
}

/// With `thread-safe` off there is no lock: the embedder accepts responsibility
/// for never driving this allocator from more than one thread.
#[cfg(not(feature = "thread-safe"))]
struct Guard(std::cell::UnsafeCell<HeapInner>);

#[cfg(not(feature = "thread-safe"))]
unsafe impl Sync for Guard {}

#[cfg(not(feature = "thread-safe"))]
impl Guard {
    fn new() -> Self {
        Self(std::cell::UnsafeCell::new(HeapInner::new()))
    }

    fn with<R>(&self, f: impl FnOnce(&mut HeapInner) -> R) -> R {
        // SAFETY: the `thread-safe` feature is off; the embedder guarantees
        // single-threaded access to this allocator instance.
        let inner = unsafe { &mut *self.0.get() };
        f(inner)
    }
}

/// An independent heap allocator instance.
///
/// Most programs only need the crate-root free functions, which share one
/// process-wide instance; construct a `Heap` directly to run more than one
/// isolated allocator side by side (tests do this to avoid cross-test state).
pub struct Heap {
    guard: Guard,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self { guard: Guard::new() }
    }

    /// Acquires the backing region and installs the first free block.
    /// Idempotent: a second call while already initialized is a no-op.
    pub fn initialize(&self) {
        self.guard.with(HeapInner::initialize);
    }

    /// Releases the backing region and drops every leak record. Safe to call
    /// on an already-uninitialized heap.
    pub fn cleanup(&self) {
        self.guard.with(HeapInner::cleanup);
    }

    /// Allocates `size` bytes, zero-initialized. Returns a null pointer on
    /// `size == 0` or when no sufficiently large block is available.
    #[track_caller]
    pub fn allocate(&self, size: usize) -> *mut u8 {
        let origin = Origin::capture();
        self.guard.with(|inner| inner.allocate(size, origin))
    }

    /// Releases a pointer previously returned by [`Heap::allocate`],
    /// [`Heap::reallocate`], or [`Heap::zero_allocate`] on this same
    /// instance. A null, already-freed, or foreign pointer is reported to
    /// the diagnostic sink and otherwise ignored — this never panics.
    pub fn free(&self, ptr: *mut u8) {
        self.guard.with(|inner| inner.free(ptr));
    }

    /// Resizes a previous allocation, preserving its content up to
    /// `min(old, new)` bytes. `ptr == null` behaves as [`Heap::allocate`];
    /// `new_size == 0` behaves as [`Heap::free`] and returns null.
    #[track_caller]
    pub fn reallocate(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        let origin = Origin::capture();
        self.guard.with(|inner| inner.reallocate(ptr, new_size, origin))
    }

    /// Allocates space for `count` elements of `element_size` bytes each,
    /// zero-initialized. Returns null on `count * element_size` overflow.
    #[track_caller]
    pub fn zero_allocate(&self, count: usize, element_size: usize) -> *mut u8 {
        let origin = Origin::capture();
        self.guard
            .with(|inner| inner.zero_allocate(count, element_size, origin))
    }

    /// The originally requested size of a live allocation, or `0` if `ptr`
    /// is null, freed, or not owned by this heap.
    pub fn size_of(&self, ptr: *mut u8) -> usize {
        self.guard.with(|inner| inner.size_of(ptr))
    }

    /// A snapshot of the current operational statistics.
    pub fn stats(&self) -> Stats {
        self.guard.with(|inner| inner.stats())
    }

    /// Every allocation still outstanding, with its requested size and call
    /// site. Populated only while the `leak-detection` feature is enabled.
    #[cfg(feature = "leak-detection")]
    pub fn leaked_allocations(&self) -> Vec<(usize, AllocationRecord)> {
        self.guard.with(|inner| inner.leaked_allocations())
    }

    /// Installs a custom diagnostic sink, replacing the default one that
    /// writes to stderr. Tests typically install a [`CapturingSink`] to
    /// assert on emitted diagnostics deterministically.
    pub fn set_diagnostic_sink(&self, sink: Box<dyn DiagnosticSink>) {
        self.guard.with(|inner| inner.set_diagnostic_sink(sink));
    }

    /// Whether [`Heap::initialize`] has run (and [`Heap::cleanup`] hasn't
    /// run since).
    pub fn is_initialized(&self) -> bool {
        self.guard.with(|inner| inner.is_initialized())
    }
}

static GLOBAL: OnceLock<Heap> = OnceLock::new();

fn global() -> &'static Heap {
    GLOBAL.get_or_init(Heap::new)
}

/// See [`Heap::initialize`], applied to the process-wide instance.
pub fn initialize() {
    global().initialize();
}

/// See [`Heap::cleanup`], applied to the process-wide instance.
pub fn cleanup() {
    global().cleanup();
}

/// See [`Heap::allocate`], applied to the process-wide instance.
#[track_caller]
pub fn allocate(size: usize) -> *mut u8 {
    global().allocate(size)
}

/// See [`Heap::free`], applied to the process-wide instance.
pub fn free(ptr: *mut u8) {
    global().free(ptr);
}

/// See [`Heap::reallocate`], applied to the process-wide instance.
#[track_caller]
pub fn reallocate(ptr: *mut u8, new_size: usize) -> *mut u8 {
    global().reallocate(ptr, new_size)
}

/// See [`Heap::zero_allocate`], applied to the process-wide instance.
#[track_caller]
pub fn zero_allocate(count: usize, element_size: usize) -> *mut u8 {
    global().zero_allocate(count, element_size)
}

/// See [`Heap::size_of`], applied to the process-wide instance.
pub fn size_of(ptr: *mut u8) -> usize {
    global().size_of(ptr)
}

/// See [`Heap::stats`], applied to the process-wide instance.
pub fn stats() -> Stats {
    global().stats()
}
