use apptrace_core::Snapshot;
use futures::future::LocalBoxFuture;
use std::rc::Rc;

/// Lets the dispatcher capture a sanitized snapshot of a value without
/// consuming or otherwise touching the value itself — the mechanism by
/// which the dispatcher observes return values without ever editing them
/// (spec §7: "never changes observable return values").
pub trait ToSnapshot {
    fn to_snapshot(&self) -> Snapshot;
}

impl ToSnapshot for Snapshot {
    fn to_snapshot(&self) -> Snapshot {
        self.clone()
    }
}

impl ToSnapshot for () {
    fn to_snapshot(&self) -> Snapshot {
        Snapshot::Undefined
    }
}

/// A finalizer the dispatcher registers on a [`DeferredQuery`] instead of
/// attaching a continuation to it directly — attaching `.then` to a query
/// builder would force it to execute (spec §4.9 design note), which the
/// dispatcher must never do.
pub type QueryFinalizer<T> = Box<dyn FnOnce(Result<T, Snapshot>)>;

/// A deferred-execution object whose resolution is triggered by an external
/// `exec`-equivalent call rather than by the dispatcher polling a future.
///
/// The ORM plugin (out of scope, spec §6) is the real implementation of
/// this trait in production: it stores the dispatcher's finalizer alongside
/// the query and drains it once its own `exec` resolves. Tests in this
/// workspace use [`crate::dispatch`]'s own manual test double.
pub trait DeferredQuery<T>: std::fmt::Debug {
    /// A summary of the query suitable for the `exit` event's `result`
    /// field — filter/operation/model, never the resolved data (spec
    /// §4.7.1: "ORM query builders: represent as a summary of
    /// filter/update/options/model/operation").
    fn summary(&self) -> Snapshot;

    fn enqueue_finalizer(&self, finalizer: QueryFinalizer<T>);
}

/// What invoking a traced callee actually produced, as observed by the
/// dispatcher. `T` is whatever value type the embedder's call-site glue
/// uses to represent a JS value; it flows through untouched in every
/// variant here.
pub enum CallOutcome<T> {
    /// Returned synchronously, no exception.
    Value(T),
    /// Threw synchronously.
    Threw(Snapshot),
    /// Returned a thenable that is not also recognized as a query builder.
    Thenable(LocalBoxFuture<'static, Result<T, Snapshot>>),
    /// Returned a thenable whose surface also looks like a deferred query
    /// (has `exec` + a model reference, or is explicitly marked as one).
    QueryBuilder(Rc<dyn DeferredQuery<T>>),
}
