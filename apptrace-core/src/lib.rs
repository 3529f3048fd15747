//! Core primitives shared by every `apptrace` crate.
//!
//! This crate owns the data model described by the tracing specification's
//! "Data model" section — [`TraceEvent`], [`Span`], [`Scope`], and
//! [`FunctionOrigin`] — plus the scope engine that keeps a per-logical-request
//! span stack consistent across synchronous calls, forked scopes, and
//! deliberately un-awaited work.
//!
//! Nothing in this crate knows how to parse source, dispatch a call, or talk
//! HTTP; those are the concerns of `apptrace-transform`, `apptrace`, and
//! `apptrace-collector` respectively. This crate is the shared vocabulary.

pub mod bus;
mod error;
mod event;
mod id;
mod origin;
pub mod scope;
mod span;

pub use bus::{publish, subscribe, unsubscribe, SubscriberId};
pub use error::CoreError;
pub use event::{FunctionKind, Phase, Snapshot, TraceEvent};
pub use id::SpanId;
pub use origin::{FunctionOrigin, OriginCell};
pub use scope::{EnterOutcome, ExitDetail, ExitMeta, Instrumented, Scope};
pub use span::Span;
