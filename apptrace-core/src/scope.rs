//! The scope engine (spec §4.5): a per-logical-request task-local store
//! holding the active span stack, the un-awaited bookkeeping queues, and the
//! machinery to fork an independent copy when a call's continuation needs to
//! run isolated from whatever else happens to be interleaved on the same
//! cooperative event loop.
//!
//! The engine assumes a single-threaded cooperative executor (spec §5): a
//! [`Scope`] is an `Rc<RefCell<..>>`, not an `Arc<Mutex<..>>`, and "current
//! scope" is thread-local state, mirroring how `tracing_core::dispatch`
//! keeps a thread-local default collector rather than a process-global one
//! guarded by a lock.

use crate::event::{FunctionKind, Phase, Snapshot, TraceEvent};
use crate::id::{SpanId, SpanIdAllocator};
use crate::span::Span;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

type Clock = Arc<dyn Fn() -> u64>;

fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct ScopeInner {
    scope_id: String,
    depth: usize,
    stack: Vec<Span>,
    pending_unawaited: VecDeque<()>,
    frame_unawaited: Vec<bool>,
    ids: Arc<SpanIdAllocator>,
    clock: Clock,
}

/// The result of opening a span: the [`Span`] handle the caller must later
/// pass back to [`Scope::exit`], and the enter [`TraceEvent`] ready to
/// publish on the event bus.
pub struct EnterOutcome {
    pub span: Span,
    pub event: TraceEvent,
}

/// The facts the dispatcher has gathered about how a call finished, handed
/// to [`Scope::exit`] to build the matching exit event.
#[derive(Debug, Clone, Default)]
pub struct ExitDetail {
    pub result: Option<Snapshot>,
    pub error: Option<Snapshot>,
    pub threw: bool,
    /// True if this exit closes an un-awaited call's span in the caller's
    /// timeline (spec §4.4 "Un-awaited handling", step 2).
    pub unawaited: bool,
}

/// Identifying fields needed to build an exit event; duplicated from the
/// matching enter rather than stored on [`Span`] itself, since spec §3 keeps
/// `Span` down to `{id, parent, depth, suspended}`.
#[derive(Debug, Clone)]
pub struct ExitMeta {
    pub name: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub kind: FunctionKind,
}

/// A task-local scope: the active span stack for one logical request plus
/// its un-awaited bookkeeping (spec §3 "Scope").
#[derive(Clone)]
pub struct Scope(Rc<RefCell<ScopeInner>>);

thread_local! {
    static CURRENT: RefCell<Option<Scope>> = RefCell::new(None);
}

impl Scope {
    fn new_with_clock(scope_id: impl Into<String>, clock: Clock) -> Self {
        Scope(Rc::new(RefCell::new(ScopeInner {
            scope_id: scope_id.into(),
            depth: 0,
            stack: Vec::new(),
            pending_unawaited: VecDeque::new(),
            frame_unawaited: Vec::new(),
            ids: Arc::new(SpanIdAllocator::new()),
            clock,
        })))
    }

    pub fn new(scope_id: impl Into<String>) -> Self {
        Scope::new_with_clock(scope_id, Arc::new(wall_clock_millis))
    }

    #[doc(hidden)]
    pub fn new_for_test(scope_id: impl Into<String>, clock: impl Fn() -> u64 + 'static) -> Self {
        Scope::new_with_clock(scope_id, Arc::new(clock))
    }

    pub fn scope_id(&self) -> String {
        self.0.borrow().scope_id.clone()
    }

    pub fn depth(&self) -> usize {
        self.0.borrow().depth
    }

    /// `open(scopeId, fn)` (spec §4.5): runs `f` with a fresh scope installed
    /// as current for the duration of the call, restoring whatever was
    /// current beforehand even if `f` panics.
    pub fn open<F, R>(scope_id: impl Into<String>, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        Scope::new(scope_id).enter_as_current(f)
    }

    /// Installs `self` as the thread's current scope for the duration of
    /// `f`, restoring the previous current scope afterward.
    pub fn enter_as_current<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let previous = CURRENT.with(|c| c.borrow_mut().replace(self.clone()));
        struct Restore(Option<Scope>);
        impl Drop for Restore {
            fn drop(&mut self) {
                CURRENT.with(|c| *c.borrow_mut() = self.0.take());
            }
        }
        let _restore = Restore(previous);
        f()
    }

    pub fn current() -> Option<Scope> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// `enter(label, meta, args)` (spec §4.5).
    pub fn enter(
        &self,
        name: impl Into<String>,
        file: Option<String>,
        line: Option<u32>,
        kind: FunctionKind,
        args: Option<Vec<Snapshot>>,
    ) -> EnterOutcome {
        let mut inner = self.0.borrow_mut();
        inner.depth += 1;
        let frame_unawaited = inner.pending_unawaited.pop_front().is_some();
        inner.frame_unawaited.push(frame_unawaited);
        let parent = inner.stack.last().map(|s| s.id);
        let id = inner.ids.alloc();
        let span = Span::new(id, parent, inner.depth);
        inner.stack.push(span.clone());
        let event = TraceEvent {
            phase: Phase::Enter,
            t: (inner.clock)(),
            name: name.into(),
            file,
            line,
            kind,
            scope_id: inner.scope_id.clone(),
            depth: span.depth,
            span_id: span.id,
            parent_span_id: parent,
            args,
            result: None,
            error: None,
            threw: false,
            unawaited: frame_unawaited,
        };
        EnterOutcome { span, event }
    }

    /// `exit(meta, detail)` (spec §4.5). Pops the frame's pending
    /// un-awaited flag and the span itself off the stack; the depth
    /// counter is decremented only after the span is popped, matching the
    /// ordering spec §4.5 calls out explicitly.
    pub fn exit(&self, span: &Span, meta: ExitMeta, detail: ExitDetail) -> TraceEvent {
        let mut inner = self.0.borrow_mut();
        let frame_unawaited = inner.frame_unawaited.pop().unwrap_or(false);
        if let Some(top) = inner.stack.last() {
            if top.id == span.id {
                inner.stack.pop();
            } else if let Some(pos) = inner.stack.iter().position(|s| s.id == span.id) {
                // Out-of-order exit (e.g. a synthetic balance from a crashed
                // continuation elsewhere); remove by id rather than assume
                // stack discipline. Never panics the host (spec §7).
                inner.stack.remove(pos);
            }
        }
        inner.depth = inner.depth.saturating_sub(1);
        let effective_unawaited = detail.unawaited || frame_unawaited;
        TraceEvent {
            phase: Phase::Exit,
            t: (inner.clock)(),
            name: meta.name,
            file: meta.file,
            line: meta.line,
            kind: meta.kind,
            scope_id: inner.scope_id.clone(),
            depth: span.depth,
            span_id: span.id,
            parent_span_id: span.parent,
            args: None,
            result: detail.result,
            error: detail.error,
            threw: detail.threw,
            unawaited: effective_unawaited,
        }
    }

    /// Marks the span currently on top of the stack as suspended: its
    /// continuation is pending on a thenable and other, unrelated
    /// continuations may interleave before it resolves.
    pub fn mark_top_suspended(&self) {
        let mut inner = self.0.borrow_mut();
        if let Some(top) = inner.stack.last_mut() {
            top.suspended = true;
        }
    }

    /// Queues a marker consumed by the next call to [`Scope::enter`]; used
    /// by the dispatcher right before invoking a callee it has determined
    /// is un-awaited, so that callee's own body-traced enter picks up the
    /// un-awaited flag even though the fact was only knowable at the call
    /// site (spec §4.5 `enter`: "pop any pending un-awaited marker").
    pub fn push_pending_unawaited(&self) {
        self.0.borrow_mut().pending_unawaited.push_back(());
    }

    /// `fork-for-unawaited(store)` (spec §4.5): produces a sibling scope
    /// sharing the scope id, the span id allocator (ids stay globally
    /// unique), and the clock, but with an independent span stack that
    /// excludes any span marked suspended. Used both when an un-awaited
    /// callee actually runs and, more generally, whenever a continuation is
    /// attached to any thenable return (spec §4.4 "Disposing the call"),
    /// so that continuation's eventual exit reflects the stack as it stood
    /// at the moment of suspension rather than whatever happens to be
    /// current when the thenable settles.
    pub fn fork_for_unawaited(&self) -> Scope {
        let inner = self.0.borrow();
        let stack: Vec<Span> = inner.stack.iter().filter(|s| !s.suspended).cloned().collect();
        Scope(Rc::new(RefCell::new(ScopeInner {
            scope_id: inner.scope_id.clone(),
            depth: stack.len(),
            stack,
            // Carried over rather than reset: the dispatcher calls
            // `push_pending_unawaited` on the pre-fork scope right before
            // forking for a body-traced un-awaited callee, and expects the
            // callee's own `enter()` — which runs against the forked scope —
            // to see and consume that marker (spec §4.5 `enter`: "pop any
            // pending un-awaited marker").
            pending_unawaited: inner.pending_unawaited.clone(),
            frame_unawaited: Vec::new(),
            ids: inner.ids.clone(),
            clock: inner.clock.clone(),
        })))
    }

    /// Alias for [`Scope::fork_for_unawaited`] used at the call sites that
    /// fork for an ordinary (awaited) thenable continuation rather than a
    /// fire-and-forget call; the underlying operation is identical.
    pub fn fork_at_suspension(&self) -> Scope {
        self.fork_for_unawaited()
    }

    /// Wraps `inner` so every poll runs with `self` installed as the
    /// current scope, restoring whatever was current immediately after —
    /// the same adapter `tracing_futures::Instrument` provides for a
    /// `Span`, generalized from "attach once, valid until the future
    /// drops" to "reinstall on every poll," since an executor may
    /// interleave arbitrarily many other tasks' polls on this thread
    /// between two polls of this one (spec §5: "no critical section is
    /// ever held across a suspension").
    pub fn instrument<F: Future>(&self, inner: F) -> Instrumented<F> {
        Instrumented {
            scope: self.clone(),
            inner,
        }
    }
}

/// See [`Scope::instrument`].
pub struct Instrumented<F> {
    scope: Scope,
    inner: F,
}

impl<F: Future> Future for Instrumented<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: we only ever hand out a pinned reference to `inner` and
        // never move it out from under the pin; `scope` is `Unpin` (it's
        // just an `Rc`) so projecting it by value is sound.
        let this = unsafe { self.get_unchecked_mut() };
        let scope = this.scope.clone();
        let fut = unsafe { Pin::new_unchecked(&mut this.inner) };
        scope.enter_as_current(|| fut.poll(cx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind() -> FunctionKind {
        FunctionKind::Function
    }

    #[test]
    fn enter_increments_depth_and_sets_parent() {
        let scope = Scope::new_for_test("s1", || 0);
        let outer = scope.enter("outer", None, None, kind(), None);
        assert_eq!(outer.event.depth, 1);
        assert_eq!(outer.event.parent_span_id, None);

        let inner = scope.enter("inner", None, None, kind(), None);
        assert_eq!(inner.event.depth, 2);
        assert_eq!(inner.event.parent_span_id, Some(outer.span.id));

        let exit_inner = scope.exit(
            &inner.span,
            ExitMeta {
                name: "inner".into(),
                file: None,
                line: None,
                kind: kind(),
            },
            ExitDetail::default(),
        );
        assert_eq!(exit_inner.depth, 2);
        assert_eq!(scope.depth(), 1);

        let exit_outer = scope.exit(
            &outer.span,
            ExitMeta {
                name: "outer".into(),
                file: None,
                line: None,
                kind: kind(),
            },
            ExitDetail::default(),
        );
        assert_eq!(exit_outer.depth, 1);
        assert_eq!(scope.depth(), 0);
    }

    #[test]
    fn pending_unawaited_marker_is_consumed_by_next_enter() {
        let scope = Scope::new_for_test("s1", || 0);
        scope.push_pending_unawaited();
        let outcome = scope.enter("callee", None, None, kind(), None);
        assert!(outcome.event.unawaited);

        // a subsequent enter with no marker queued is not flagged
        let next = scope.enter("sibling", None, None, kind(), None);
        assert!(!next.event.unawaited);
    }

    #[test]
    fn fork_excludes_suspended_spans_but_keeps_others() {
        let scope = Scope::new_for_test("s1", || 0);
        let a = scope.enter("a", None, None, kind(), None);
        scope.mark_top_suspended();
        let b = scope.enter("b", None, None, kind(), None);

        let forked = scope.fork_for_unawaited();
        assert_eq!(forked.scope_id(), "s1");
        // `a` was suspended and is excluded; `b` was not and is retained.
        let c = forked.enter("c", None, None, kind(), None);
        assert_eq!(c.event.parent_span_id, Some(b.span.id));
        assert_ne!(c.event.parent_span_id, Some(a.span.id));
    }

    #[test]
    fn pending_unawaited_marker_survives_fork_for_body_traced_callee() {
        // Mirrors the dispatcher's body-traced + un-awaited path: push the
        // marker on the caller's scope, fork (as happens right before
        // invoking the callee), then enter on the *forked* scope — the
        // callee's own body-traced enter must still see the marker.
        let scope = Scope::new_for_test("s1", || 0);
        scope.push_pending_unawaited();
        let forked = scope.fork_for_unawaited();
        let outcome = forked.enter("callee", None, None, kind(), None);
        assert!(outcome.event.unawaited);
    }

    #[test]
    fn current_scope_is_restored_after_open() {
        assert!(Scope::current().is_none());
        Scope::open("s1", || {
            assert_eq!(Scope::current().unwrap().scope_id(), "s1");
        });
        assert!(Scope::current().is_none());
    }
}
