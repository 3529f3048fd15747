use crate::id::SpanId;

/// An open span on a [`Scope`](crate::Scope)'s stack.
///
/// Spans exist only on the stack inside a scope; nothing outside the scope
/// engine ever holds one past its exit emission (spec §3 Invariants).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub id: SpanId,
    pub parent: Option<SpanId>,
    pub depth: usize,
    /// Set while the span's continuation is suspended waiting on a thenable;
    /// a forked scope (spec §4.5 `fork-for-unawaited`) excludes suspended
    /// spans from the copy it hands to the callee, since the callee's own
    /// work is not nested under the caller's still-pending resolution.
    pub suspended: bool,
}

impl Span {
    pub fn new(id: SpanId, parent: Option<SpanId>, depth: usize) -> Self {
        Span {
            id,
            parent,
            depth,
            suspended: false,
        }
    }
}
