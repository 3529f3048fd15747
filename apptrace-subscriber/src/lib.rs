//! `apptrace-core`'s event bus (C6) is deliberately minimal: FIFO fan-out
//! and a re-entrancy guard, nothing more. This crate is the layer on top —
//! what `tracing-subscriber` is to `tracing-core` — supplying the
//! declarative filter rules and the console logger that spec §4.6
//! describes, scoped to this SDK's filtering and formatting needs rather
//! than `tracing-subscriber`'s general `Layer`/`Registry` composition.

pub mod console;
pub mod filter;

pub use console::ConsoleLogger;
pub use filter::{CompoundRule, FilePattern, FilterSet, RuleField};

use apptrace_core::{subscribe, unsubscribe, SubscriberId, TraceEvent};
use std::rc::Rc;

/// Subscribes a filtered callback: events [`FilterSet::should_drop`] flags
/// are never forwarded to `on_event`. This is the composition point between
/// the bus's raw fan-out and whatever downstream consumer (console logger,
/// per-request collector) wants a filtered view.
pub fn subscribe_filtered(
    filter: FilterSet,
    on_event: impl Fn(&TraceEvent) + 'static,
) -> SubscriberId {
    subscribe(move |event| {
        if !filter.should_drop(event) {
            on_event(event);
        }
    })
}

/// Installs a [`ConsoleLogger`] writing to `writer`, gated by `filter`.
/// Returns the subscriber id so the caller can [`unsubscribe`] it (e.g. when
/// `TRACE_QUIET` flips at runtime).
pub fn install_console_logger<W: std::io::Write + 'static>(
    filter: FilterSet,
    writer: W,
) -> SubscriberId {
    let logger = Rc::new(ConsoleLogger::new(writer));
    subscribe_filtered(filter, move |event| logger.on_event(event))
}

pub fn remove(id: SubscriberId) {
    unsubscribe(id);
}
