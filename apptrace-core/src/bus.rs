//! The process-wide event bus (spec §4.6, C6): single-process fan-out of
//! [`TraceEvent`]s to whichever subscribers are currently registered.
//!
//! The bus itself only does FIFO fan-out and re-entrancy guarding; filtering
//! (file/kind/library rules) and the console logger's repeat-coalescing live
//! in `apptrace-subscriber`, one layer up — the same split `tracing-core`
//! draws between its bare `Collect` dispatch and `tracing-subscriber`'s
//! richer `Layer` composition.

use crate::event::TraceEvent;
use std::cell::RefCell;
use std::rc::Rc;

/// A handle returned by [`subscribe`]; pass it to [`unsubscribe`] to stop
/// receiving events. Dropping the handle does not unsubscribe by itself —
/// callers must call `unsubscribe` explicitly, mirroring how the middleware
/// (C7) subscribes at request start and unsubscribes at flush rather than
/// relying on drop order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

struct BusInner {
    next_id: u64,
    subscribers: Vec<(u64, Rc<dyn Fn(&TraceEvent)>)>,
    emitting: bool,
}

impl BusInner {
    fn new() -> Self {
        BusInner {
            next_id: 1,
            subscribers: Vec::new(),
            emitting: false,
        }
    }
}

thread_local! {
    static BUS: RefCell<BusInner> = RefCell::new(BusInner::new());
}

/// Registers `callback` to receive every future [`TraceEvent`] published on
/// this thread's bus, in FIFO order relative to other subscribers.
pub fn subscribe(callback: impl Fn(&TraceEvent) + 'static) -> SubscriberId {
    BUS.with(|bus| {
        let mut bus = bus.borrow_mut();
        let id = bus.next_id;
        bus.next_id += 1;
        bus.subscribers.push((id, Rc::new(callback)));
        SubscriberId(id)
    })
}

/// Removes a subscriber. A removed subscriber never receives events
/// published after this call returns, even if the removal happens from
/// inside another subscriber's callback.
pub fn unsubscribe(id: SubscriberId) {
    BUS.with(|bus| {
        bus.borrow_mut().subscribers.retain(|(sid, _)| *sid != id.0);
    });
}

/// Publishes `event` to every currently registered subscriber.
///
/// Re-entrant publication (a subscriber that itself publishes, directly or
/// transitively) is dropped rather than recursed into — the `EMITTING`
/// guard spec §4.6 calls for — so a console logger subscriber that happens
/// to call code which is itself instrumented cannot spiral.
pub fn publish(event: TraceEvent) {
    BUS.with(|bus| {
        let snapshot = {
            let mut inner = bus.borrow_mut();
            if inner.emitting {
                return;
            }
            inner.emitting = true;
            inner.subscribers.iter().map(|(_, cb)| cb.clone()).collect::<Vec<_>>()
        };
        for cb in &snapshot {
            cb(&event);
        }
        bus.borrow_mut().emitting = false;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{FunctionKind, Phase};
    use crate::id::SpanId;
    use std::cell::Cell;
    use std::rc::Rc as StdRc;

    fn sample_event() -> TraceEvent {
        TraceEvent {
            phase: Phase::Enter,
            t: 0,
            name: "f".into(),
            file: None,
            line: None,
            kind: FunctionKind::Function,
            scope_id: "s".into(),
            depth: 1,
            span_id: SpanId::from_u64(1),
            parent_span_id: None,
            args: None,
            result: None,
            error: None,
            threw: false,
            unawaited: false,
        }
    }

    #[test]
    fn subscribers_receive_in_fifo_order_and_removed_ones_do_not() {
        let order = StdRc::new(RefCell::new(Vec::new()));
        let o1 = order.clone();
        let id1 = subscribe(move |_| o1.borrow_mut().push(1));
        let o2 = order.clone();
        let _id2 = subscribe(move |_| o2.borrow_mut().push(2));

        publish(sample_event());
        assert_eq!(*order.borrow(), vec![1, 2]);

        unsubscribe(id1);
        order.borrow_mut().clear();
        publish(sample_event());
        assert_eq!(*order.borrow(), vec![2]);
        unsubscribe(_id2);
    }

    #[test]
    fn reentrant_publish_is_dropped_not_recursed() {
        let depth = StdRc::new(Cell::new(0));
        let max_depth = StdRc::new(Cell::new(0));
        let d = depth.clone();
        let m = max_depth.clone();
        let id = subscribe(move |_| {
            d.set(d.get() + 1);
            if d.get() > m.get() {
                m.set(d.get());
            }
            publish(sample_event());
            d.set(d.get() - 1);
        });
        publish(sample_event());
        assert_eq!(max_depth.get(), 1);
        unsubscribe(id);
    }
}
