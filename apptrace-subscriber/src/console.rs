//! The console logger subscriber (spec §4.6): indents by depth, coalesces
//! exact-repeat lines, and mutes dependency frames nested under a dependency
//! frame that's already being shown.
//!
//! Grounded on the split `tracing-subscriber::fmt` draws between formatting
//! and writing — here simplified to a single `Write` sink, since this
//! subscriber has one job rather than `fmt`'s pluggable `FormatEvent`/
//! `FormatFields`/`MakeWriter` stack.

use crate::filter::inferred_library;
use apptrace_core::{FunctionKind, Phase, TraceEvent};
use std::cell::RefCell;
use std::io::Write;

/// One rendered line's identity for repeat-coalescing: everything that would
/// make two consecutive lines look the same to a human reading the log.
#[derive(Clone, PartialEq, Eq)]
struct LineKey {
    depth: usize,
    phase: Phase,
    name: String,
    file: Option<String>,
}

impl LineKey {
    fn from_event(event: &TraceEvent) -> Self {
        LineKey {
            depth: event.depth,
            phase: event.phase,
            name: event.name.clone(),
            file: event.file.clone(),
        }
    }
}

struct Repeat {
    key: LineKey,
    count: u32,
}

/// Whether the sequence of dependency frames currently on the stack should
/// mute a just-seen frame: once an app frame calls into a dependency, only
/// that top-most dependency frame is printed; anything the dependency calls
/// internally is muted until the top frame exits (spec §4.6).
struct DependencyGuard {
    /// Depth at which the top-most dependency frame was entered, if any
    /// dependency frame is currently open.
    muting_since_depth: Option<usize>,
}

struct ConsoleLoggerState<W> {
    writer: W,
    last: Option<Repeat>,
    guard: DependencyGuard,
}

/// A console logger that can be handed to [`apptrace_core::subscribe`].
///
/// `W` is typically `std::io::Stdout`, but tests use an in-memory buffer.
pub struct ConsoleLogger<W> {
    state: RefCell<ConsoleLoggerState<W>>,
}

impl<W: Write> ConsoleLogger<W> {
    pub fn new(writer: W) -> Self {
        ConsoleLogger {
            state: RefCell::new(ConsoleLoggerState {
                writer,
                last: None,
                guard: DependencyGuard {
                    muting_since_depth: None,
                },
            }),
        }
    }

    fn is_dependency(event: &TraceEvent) -> bool {
        event
            .file
            .as_deref()
            .and_then(inferred_library)
            .is_some()
    }

    fn flush_repeat(state: &mut ConsoleLoggerState<W>) {
        if let Some(repeat) = state.last.take() {
            if repeat.count > 1 {
                let _ = writeln!(
                    state.writer,
                    "{}  \u{d7}{}",
                    "  ".repeat(repeat.key.depth.saturating_sub(1)),
                    repeat.count
                );
            }
        }
    }

    fn render(state: &mut ConsoleLoggerState<W>, event: &TraceEvent, key: &LineKey) {
        let indent = "  ".repeat(key.depth.saturating_sub(1));
        let marker = match key.phase {
            Phase::Enter => ">",
            Phase::Exit => "<",
        };
        let kind = match event.kind {
            FunctionKind::Getter => " (get)",
            FunctionKind::Setter => " (set)",
            FunctionKind::Constructor => " (new)",
            _ => "",
        };
        let suffix = if key.phase == Phase::Exit && event.threw {
            " threw"
        } else if key.phase == Phase::Exit && event.unawaited {
            " (unawaited)"
        } else {
            ""
        };
        let _ = writeln!(state.writer, "{indent}{marker} {}{kind}{suffix}", key.name);
    }

    /// The subscriber callback to pass to `apptrace_core::subscribe`.
    pub fn on_event(&self, event: &TraceEvent) {
        let mut state = self.state.borrow_mut();

        // Dependency-frame muting: once a dependency frame is open, any
        // deeper frame (app or dependency) is suppressed until that
        // top-most frame's exit is seen.
        if let Some(muted_depth) = state.guard.muting_since_depth {
            if event.depth > muted_depth {
                return;
            }
            if event.phase == Phase::Exit && event.depth == muted_depth {
                state.guard.muting_since_depth = None;
            } else if event.depth <= muted_depth && event.phase == Phase::Enter {
                state.guard.muting_since_depth = None;
            }
        }

        if event.phase == Phase::Enter && Self::is_dependency(event) && state.guard.muting_since_depth.is_none() {
            state.guard.muting_since_depth = Some(event.depth);
        }

        let key = LineKey::from_event(event);
        let repeated = state
            .last
            .as_ref()
            .map(|r| r.key == key)
            .unwrap_or(false);

        if repeated {
            if let Some(repeat) = state.last.as_mut() {
                repeat.count += 1;
            }
            return;
        }

        Self::flush_repeat(&mut state);
        Self::render(&mut state, event, &key);
        state.last = Some(Repeat { key, count: 1 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apptrace_core::{Phase, SpanId};

    fn event(name: &str, file: Option<&str>, depth: usize, phase: Phase) -> TraceEvent {
        TraceEvent {
            phase,
            t: 0,
            name: name.into(),
            file: file.map(str::to_string),
            line: None,
            kind: FunctionKind::Function,
            scope_id: "s".into(),
            depth,
            span_id: SpanId::from_u64(depth as u64),
            parent_span_id: None,
            args: None,
            result: None,
            error: None,
            threw: false,
            unawaited: false,
        }
    }

    #[test]
    fn coalesces_exact_repeat_lines() {
        let buf: Vec<u8> = Vec::new();
        let logger = ConsoleLogger::new(buf);
        for _ in 0..3 {
            logger.on_event(&event("f", Some("/app/a.js"), 1, Phase::Enter));
        }
        logger.on_event(&event("g", Some("/app/a.js"), 1, Phase::Enter));
        let out = String::from_utf8(logger.state.borrow().writer.clone()).unwrap();
        assert!(out.contains("> f"));
        assert!(out.contains("\u{d7}3"));
        assert!(out.contains("> g"));
    }

    #[test]
    fn mutes_frames_nested_under_a_dependency_frame() {
        let buf: Vec<u8> = Vec::new();
        let logger = ConsoleLogger::new(buf);
        logger.on_event(&event("appFn", Some("/app/a.js"), 1, Phase::Enter));
        logger.on_event(&event(
            "libTop",
            Some("/app/node_modules/lodash/index.js"),
            2,
            Phase::Enter,
        ));
        logger.on_event(&event(
            "libInner",
            Some("/app/node_modules/lodash/inner.js"),
            3,
            Phase::Enter,
        ));
        logger.on_event(&event(
            "libInner",
            Some("/app/node_modules/lodash/inner.js"),
            3,
            Phase::Exit,
        ));
        logger.on_event(&event(
            "libTop",
            Some("/app/node_modules/lodash/index.js"),
            2,
            Phase::Exit,
        ));
        logger.on_event(&event("appFn", Some("/app/a.js"), 1, Phase::Exit));

        let out = String::from_utf8(logger.state.borrow().writer.clone()).unwrap();
        assert!(out.contains("libTop"));
        assert!(!out.contains("libInner"));
        assert!(out.contains("appFn"));
    }
}
