use crate::id::SpanId;
use serde::Serialize;
use std::collections::BTreeMap;

/// Which half of a span a [`TraceEvent`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Enter,
    Exit,
}

/// The syntactic shape of the function a span was opened for.
///
/// This is reported on every event per spec §3; the assembler and console
/// logger both branch on it (getters/setters are muted unless
/// `wrapGettersSetters` is configured, constructors are labeled distinctly).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FunctionKind {
    Function,
    Arrow,
    Method,
    StaticMethod,
    Constructor,
    Getter,
    Setter,
}

/// A sanitized, depth/size-capped representation of a value observed at a
/// call boundary (an argument, a return value, or a thrown error).
///
/// This is deliberately not "the" value — by the time one of these is built
/// the sanitizer (`apptrace-collector::sanitize`) has already applied the
/// depth/key/item/string caps from spec §4.7.1 and replaced circular
/// references and promises with sentinels. `apptrace-core` only needs to
/// know the shape well enough to serialize it for egress.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Snapshot {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(Vec<Snapshot>),
    Object(BTreeMap<String, Snapshot>),
    /// A `Date`, `RegExp`, `Buffer`, `Error`, `BigInt`, `Symbol`, `Map`, `Set`,
    /// or function value reduced to a canonical string form (spec §4.7.1).
    Canonical { type_tag: &'static str, repr: String },
    /// A promise encountered while sanitizing — its settlement is never
    /// forced, so all we can record is that it was pending at snapshot time.
    PendingPromise,
    /// A circular reference was hit while walking the value graph.
    Circular,
    /// A database query builder, summarized without triggering `exec`.
    QuerySummary {
        model: Option<String>,
        operation: Option<String>,
        filter: Option<Box<Snapshot>>,
    },
    /// Sanitization itself failed for this value (spec §7).
    Unserializable(String),
}

/// An immutable enter/exit record, as defined by spec §3.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub phase: Phase,
    /// Monotonic emit timestamp, milliseconds, already shifted by the
    /// middleware's clock-skew offset (spec §4.7).
    pub t: u64,
    pub name: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub kind: FunctionKind,
    pub scope_id: String,
    pub depth: usize,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub args: Option<Vec<Snapshot>>,
    pub result: Option<Snapshot>,
    pub error: Option<Snapshot>,
    pub threw: bool,
    pub unawaited: bool,
}

impl TraceEvent {
    pub fn is_enter(&self) -> bool {
        matches!(self.phase, Phase::Enter)
    }

    pub fn is_exit(&self) -> bool {
        matches!(self.phase, Phase::Exit)
    }
}
