use crate::deferred::{CallOutcome, ToSnapshot};
use apptrace_core::{scope::ExitMeta, Scope};
use apptrace_core::{FunctionKind, Snapshot};
use futures::future::LocalBoxFuture;
use std::rc::Rc;

/// Everything the dispatcher needs to know about the value it was asked to
/// call, as gathered by the origin tagger (C3) and the call-site rewrite
/// (C1). In a real embedding this is derived from the callee's
/// [`apptrace_core::OriginCell`] plus whatever the host's value
/// representation can tell us about callability; none of it is guessed.
#[derive(Debug, Clone)]
pub struct CalleeInfo {
    pub callable: bool,
    pub is_native: bool,
    pub skip_wrap: bool,
    pub body_traced: bool,
    pub is_app: bool,
    pub display_name: Option<String>,
    pub defining_file: Option<String>,
    pub kind_hint: FunctionKind,
}

impl CalleeInfo {
    pub fn plain(display_name: impl Into<String>, kind_hint: FunctionKind) -> Self {
        CalleeInfo {
            callable: true,
            is_native: false,
            skip_wrap: false,
            body_traced: false,
            is_app: false,
            display_name: Some(display_name.into()),
            defining_file: None,
            kind_hint,
        }
    }
}

/// The call-site facts the transformer's rewrite bakes in literally (spec
/// §4.1 "Call-site wrap"): the property/identifier label, the call's
/// source position, and whether the call expression sits in an awaited
/// position.
#[derive(Debug, Clone, Default)]
pub struct CallMeta {
    pub label: Option<String>,
    pub call_file: Option<String>,
    pub call_line: Option<u32>,
    pub unawaited: bool,
}

/// What the call-site glue does with the dispatcher's verdict: either the
/// call already finished (possibly having thrown), or there's deferred work
/// the caller's own code should `.await` or otherwise hold onto, unchanged
/// from what the callee itself returned.
pub enum DispatchOutcome<T> {
    Ready(Result<T, Snapshot>),
    ReadyBuilder(Rc<dyn crate::deferred::DeferredQuery<T>>),
    Pending(LocalBoxFuture<'static, Result<T, Snapshot>>),
    /// The call was un-awaited and its continuation has already been
    /// spawned; there is nothing left for the caller to hold onto.
    Fired,
}

fn resolve_label(meta: &CallMeta, callee: &CalleeInfo) -> String {
    meta.label
        .clone()
        .or_else(|| callee.display_name.clone())
        .unwrap_or_else(|| "(anonymous)".to_string())
}

fn resolve_file(meta: &CallMeta, callee: &CalleeInfo) -> Option<String> {
    callee.defining_file.clone().or_else(|| meta.call_file.clone())
}

/// The dispatcher (spec §4.4): receives every rewritten call, decides
/// whether to trace it, and arranges for the span to close correctly no
/// matter what shape the callee's return takes.
///
/// `invoke` is called exactly once, synchronously, to actually perform the
/// call — the dispatcher never calls it more than once and never calls it
/// lazily from inside a spawned task, so argument evaluation order matches
/// what the call-site rewrite already fixed (spec §4.1, "preserves
/// evaluation order").
pub fn dispatch<T, F>(
    callee: CalleeInfo,
    meta: CallMeta,
    args: Option<Vec<Snapshot>>,
    invoke: F,
) -> DispatchOutcome<T>
where
    T: ToSnapshot + 'static,
    F: FnOnce() -> CallOutcome<T>,
{
    // Early exit: not callable, or explicitly marked to skip wrapping
    // (spec §4.4 "Early exits").
    if !callee.callable || callee.skip_wrap {
        return run_untraced(invoke);
    }

    let scope = match Scope::current() {
        Some(scope) => scope,
        None => return run_untraced(invoke),
    };

    if meta.unawaited {
        scope.push_pending_unawaited();
    }

    if callee.body_traced {
        // The callee emits its own enter/exit; the dispatcher must not
        // double-emit. It only arranges the fork a fire-and-forget call
        // needs so the callee's children don't leak into the caller.
        if meta.unawaited {
            let forked = scope.fork_for_unawaited();
            return forked.enter_as_current(|| run_untraced(invoke));
        }
        return run_untraced(invoke);
    }

    let label = resolve_label(&meta, &callee);
    let file = resolve_file(&meta, &callee);
    let outcome = scope.enter(label.clone(), file.clone(), meta.call_line, callee.kind_hint, args);
    apptrace_core::publish(outcome.event);
    let span = outcome.span;
    let exit_meta = ExitMeta {
        name: label,
        file,
        line: meta.call_line,
        kind: callee.kind_hint,
    };

    match invoke() {
        CallOutcome::Value(value) => {
            let snap = value.to_snapshot();
            let event = scope.exit(
                &span,
                exit_meta,
                apptrace_core::ExitDetail {
                    result: Some(snap),
                    error: None,
                    threw: false,
                    unawaited: false,
                },
            );
            apptrace_core::publish(event);
            DispatchOutcome::Ready(Ok(value))
        }
        CallOutcome::Threw(err) => {
            let event = scope.exit(
                &span,
                exit_meta,
                apptrace_core::ExitDetail {
                    result: None,
                    error: Some(err.clone()),
                    threw: true,
                    unawaited: false,
                },
            );
            apptrace_core::publish(event);
            DispatchOutcome::Ready(Err(err))
        }
        CallOutcome::QueryBuilder(query) => {
            // Never attach a continuation to a query builder — that would
            // force it to execute (spec §4.4, §4.9). Emit the exit
            // immediately with the builder's own summary and register a
            // finalizer for whenever the ORM's own `exec` resolves it.
            let summary = query.summary();
            let event = scope.exit(
                &span,
                exit_meta.clone(),
                apptrace_core::ExitDetail {
                    result: Some(summary),
                    error: None,
                    threw: false,
                    unawaited: false,
                },
            );
            apptrace_core::publish(event);

            let fork = scope.fork_for_unawaited();
            let span2 = span.clone();
            query.enqueue_finalizer(Box::new(move |resolved| match resolved {
                Ok(value) => {
                    let snap = value.to_snapshot();
                    apptrace_core::publish(fork.exit(
                        &span2,
                        exit_meta,
                        apptrace_core::ExitDetail {
                            result: Some(snap),
                            error: None,
                            threw: false,
                            unawaited: false,
                        },
                    ));
                }
                Err(err) => {
                    apptrace_core::publish(fork.exit(
                        &span2,
                        exit_meta,
                        apptrace_core::ExitDetail {
                            result: None,
                            error: Some(err),
                            threw: true,
                            unawaited: false,
                        },
                    ));
                }
            }));
            DispatchOutcome::ReadyBuilder(query)
        }
        CallOutcome::Thenable(fut) => {
            scope.mark_top_suspended();
            let fork = scope.fork_for_unawaited();
            let span2 = span.clone();
            let exit_meta2 = exit_meta.clone();

            if meta.unawaited {
                // Close the span in the caller's timeline right away; the
                // callee keeps running under the forked scope and its
                // eventual settlement is reconciled by the assembler as a
                // second exit under the same span id (spec §4.4, §5).
                let event = scope.exit(
                    &span,
                    exit_meta,
                    apptrace_core::ExitDetail {
                        result: None,
                        error: None,
                        threw: false,
                        unawaited: true,
                    },
                );
                apptrace_core::publish(event);

                let spawned = tokio::task::spawn_local(async move {
                    let resolved = fut.await;
                    let event = match resolved {
                        Ok(value) => fork.exit(
                            &span2,
                            exit_meta2,
                            apptrace_core::ExitDetail {
                                result: Some(value.to_snapshot()),
                                error: None,
                                threw: false,
                                unawaited: true,
                            },
                        ),
                        Err(err) => fork.exit(
                            &span2,
                            exit_meta2,
                            apptrace_core::ExitDetail {
                                result: None,
                                error: Some(err),
                                threw: true,
                                unawaited: true,
                            },
                        ),
                    };
                    apptrace_core::publish(event);
                });
                drop(spawned);
                DispatchOutcome::Fired
            } else {
                let wrapped: LocalBoxFuture<'static, Result<T, Snapshot>> = Box::pin(async move {
                    let resolved = fut.await;
                    match resolved {
                        Ok(value) => {
                            let event = fork.exit(
                                &span2,
                                exit_meta2,
                                apptrace_core::ExitDetail {
                                    result: Some(value.to_snapshot()),
                                    error: None,
                                    threw: false,
                                    unawaited: false,
                                },
                            );
                            apptrace_core::publish(event);
                            Ok(value)
                        }
                        Err(err) => {
                            let event = fork.exit(
                                &span2,
                                exit_meta2,
                                apptrace_core::ExitDetail {
                                    result: None,
                                    error: Some(err.clone()),
                                    threw: true,
                                    unawaited: false,
                                },
                            );
                            apptrace_core::publish(event);
                            Err(err)
                        }
                    }
                });
                DispatchOutcome::Pending(wrapped)
            }
        }
    }
}

fn run_untraced<T, F>(invoke: F) -> DispatchOutcome<T>
where
    T: ToSnapshot + 'static,
    F: FnOnce() -> CallOutcome<T>,
{
    match invoke() {
        CallOutcome::Value(v) => DispatchOutcome::Ready(Ok(v)),
        CallOutcome::Threw(e) => DispatchOutcome::Ready(Err(e)),
        CallOutcome::Thenable(fut) => DispatchOutcome::Pending(fut),
        CallOutcome::QueryBuilder(q) => DispatchOutcome::ReadyBuilder(q),
    }
}
