use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A span identifier, unique within the process.
///
/// Mirrors `tracing_core::span::Id` in spirit: a thin newtype over a
/// monotonically increasing counter, cheap to copy and compare.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct SpanId(u64);

impl SpanId {
    pub const fn from_u64(id: u64) -> Self {
        SpanId(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({})", self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-wide allocator for [`SpanId`]s.
///
/// One instance lives for the life of the process (see
/// `scope::next_span_id`); spans never reuse an id, which keeps the
/// assembler's span-id-keyed tree construction (spec §4.8) unambiguous even
/// across concurrent scopes.
#[derive(Debug, Default)]
pub(crate) struct SpanIdAllocator {
    next: AtomicU64,
}

impl SpanIdAllocator {
    pub(crate) const fn new() -> Self {
        SpanIdAllocator {
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn alloc(&self) -> SpanId {
        SpanId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
