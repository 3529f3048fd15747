use apptrace_core::Scope;

/// Wraps a callback argument so that whichever scope is current at the
/// moment the callback is *invoked* (often long after the call that
/// received it has returned — timers, event listeners, array-iteration
/// callbacks run by native code) is the scope that was current when the
/// callback was *handed to* the dispatcher, not whatever happens to be
/// current when the host gets around to calling it.
///
/// This mirrors the wrapping `tracing`'s own `Instrumented` future adapter
/// does for a stored span, generalized from "a future polled later" to
/// "any closure invoked later," since this SDK's callback arguments are
/// plain closures rather than futures (spec §4.4, "callback-argument scope
/// isolation").
pub struct IsolatedCallback<F> {
    scope: Option<Scope>,
    inner: F,
}

impl<F> IsolatedCallback<F> {
    /// Captures the scope current at construction time, if any. A callback
    /// built with no current scope (e.g. constructed at module load, before
    /// any request has opened one) runs with whatever scope is current when
    /// it's eventually invoked, same as an unwrapped callback would.
    pub fn new(inner: F) -> Self {
        IsolatedCallback {
            scope: Scope::current(),
            inner,
        }
    }
}

impl<F, R> IsolatedCallback<F>
where
    F: FnOnce() -> R,
{
    /// Runs the wrapped closure with the captured scope installed as
    /// current, restoring whatever scope was actually current beforehand
    /// once the closure returns.
    pub fn call(self) -> R {
        match self.scope {
            Some(scope) => scope.enter_as_current(self.inner),
            None => (self.inner)(),
        }
    }
}

impl<F, A, R> IsolatedCallback<F>
where
    F: FnOnce(A) -> R,
{
    /// Same as [`IsolatedCallback::call`] but for a unary callback, the
    /// shape most host-provided callback arguments take (an array
    /// iteration callback, a timer callback receiving no arguments is just
    /// `call` with `A = ()`).
    pub fn call_with(self, arg: A) -> R {
        match self.scope {
            Some(scope) => scope.enter_as_current(move || (self.inner)(arg)),
            None => (self.inner)(arg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn callback_runs_with_scope_captured_at_construction() {
        let seen = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();

        let cb = Scope::open("outer", || {
            let captured = IsolatedCallback::new(move || {
                *seen2.borrow_mut() = Scope::current().map(|s| s.scope_id());
            });
            captured
        });

        assert!(Scope::current().is_none());
        cb.call();
        assert_eq!(*seen.borrow(), Some("outer".to_string()));
    }

    #[test]
    fn callback_with_no_captured_scope_runs_with_whatever_is_current_later() {
        let cb = IsolatedCallback::new(|| Scope::current().map(|s| s.scope_id()));
        let result = Scope::open("later", || cb.call());
        assert_eq!(result, Some("later".to_string()));
    }
}
