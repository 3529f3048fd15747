//! The call dispatcher (spec §4.4, C4): the single entry point every
//! rewritten call site is routed through by `apptrace-transform`.
//!
//! `apptrace-core` supplies the data model and the scope engine;
//! this crate supplies the decision logic that sits between "a call just
//! happened" and "an enter/exit pair landed on the event bus, correctly
//! attached to whatever deferred work that call produced."

mod callback;
mod deferred;
mod dispatch;

pub use callback::IsolatedCallback;
pub use deferred::{CallOutcome, DeferredQuery, ToSnapshot};
pub use dispatch::{dispatch, CalleeInfo, CallMeta, DispatchOutcome};

pub use apptrace_core::{FunctionKind, Scope, Snapshot};
