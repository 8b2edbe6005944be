//! Diagnostic sink for conditions the allocator observes but does not treat
//! as fatal (corruption, double free, stats drift). The sink is a boxed
//! trait object stored behind the heap's own lock, since every diagnostic is
//! already reported from inside a locked section.

use std::fmt;

/// One reportable condition observed while mutating or inspecting the heap.
/// Every variant corresponds to a distinct error condition the allocator can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticEvent {
    /// `initialize()` could not obtain the backing region from the host allocator.
    RegionAcquisitionFailed,
    /// A header's start or end sentinel did not read its expected constant.
    SentinelCorruption { location: &'static str },
    /// A footer's sentinel did not read its expected constant, or its `size`/`free`
    /// fields disagree with the header they mirror (boundary-tags only).
    FooterCorruption { location: &'static str },
    /// A pointer handed to `free`/`reallocate`/`size_of` does not translate to any
    /// block within the backing region.
    OutOfBounds { location: &'static str },
    /// `free()` was called on a pointer whose block is already marked free.
    DoubleFree { alloc_id: u32 },
    /// A guard band failed verification at `free()` time (memory-guards only).
    BufferOverrun { alloc_id: u32 },
    /// `check_heap_integrity()` found a counter that disagrees with a direct tally.
    StatsDrift { kind: &'static str, expected: u64, observed: u64 },
}

impl fmt::Display for DiagnosticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegionAcquisitionFailed => {
                write!(f, "failed to acquire backing region from host allocator")
            }
            Self::SentinelCorruption { location } => {
                write!(f, "memory corruption at {location}: header sentinel mismatch")
            }
            Self::FooterCorruption { location } => {
                write!(f, "memory corruption at {location}: footer mismatch")
            }
            Self::OutOfBounds { location } => {
                write!(f, "pointer at {location} does not belong to this heap")
            }
            Self::DoubleFree { alloc_id } => {
                write!(f, "double free detected (alloc id {alloc_id})")
            }
            Self::BufferOverrun { alloc_id } => {
                write!(f, "buffer overrun detected (alloc id {alloc_id})")
            }
            Self::StatsDrift { kind, expected, observed } => {
                write!(f, "heap stats drift in {kind}: {expected} expected, {observed} observed")
            }
        }
    }
}

/// Anything that can receive heap diagnostics.
///
/// Implementers should be non-blocking: this is invoked while
/// the heap's mutex is held.
pub trait DiagnosticSink: Send {
    fn report(&mut self, event: DiagnosticEvent);
}

/// Default sink: one line to stderr per event.
pub struct StderrSink;

impl DiagnosticSink for StderrSink {
    fn report(&mut self, event: DiagnosticEvent) {
        eprintln!("blockheap: {event}");
    }
}

/// Captures every event in order; install via [`crate::Heap::set_diagnostic_sink`]
/// to assert on diagnostics deterministically in tests.
///
/// Cloning shares the underlying event log, so a test can keep a handle after
/// handing a boxed clone to the heap.
#[derive(Clone, Default)]
pub struct CapturingSink {
    events: std::sync::Arc<std::sync::Mutex<Vec<DiagnosticEvent>>>,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of every event reported so far, in order.
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

impl DiagnosticSink for CapturingSink {
    fn report(&mut self, event: DiagnosticEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}
