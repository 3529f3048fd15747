//! Declarative filter rules (spec §4.6): drop events matching file patterns,
//! function-kind patterns, compound rules over {name, file, library, kind,
//! phase}, or an arbitrary predicate, before they ever reach a logger or the
//! per-request collector.

use apptrace_core::{FunctionKind, Phase, TraceEvent};
use regex::Regex;
use std::rc::Rc;

/// A file-path pattern, matched against the event's `file` field after it
/// has been normalized to forward slashes (spec §4.6 "file patterns").
#[derive(Clone)]
pub enum FilePattern {
    Substring(String),
    Suffix(String),
    Regex(Rc<Regex>),
}

impl FilePattern {
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(FilePattern::Regex(Rc::new(Regex::new(pattern)?)))
    }

    pub fn substring(s: impl Into<String>) -> Self {
        FilePattern::Substring(s.into())
    }

    pub fn suffix(s: impl Into<String>) -> Self {
        FilePattern::Suffix(s.into())
    }

    fn matches(&self, file: &str) -> bool {
        let normalized = file.replace('\\', "/");
        match self {
            FilePattern::Substring(s) => normalized.contains(s.as_str()),
            FilePattern::Suffix(s) => normalized.ends_with(s.as_str()),
            FilePattern::Regex(re) => re.is_match(&normalized),
        }
    }
}

/// The first path segment following a `node_modules/` component, used as
/// the "inferred library" compound-rule field (spec §4.6).
pub fn inferred_library(file: &str) -> Option<String> {
    let normalized = file.replace('\\', "/");
    let idx = normalized.find("node_modules/")?;
    let rest = &normalized[idx + "node_modules/".len()..];
    let mut seg = rest.split('/').next()?.to_string();
    // Scoped packages (`@scope/name`) count the scope and name together.
    if seg.starts_with('@') {
        let mut parts = rest.splitn(3, '/');
        let scope = parts.next()?;
        let name = parts.next()?;
        seg = format!("{scope}/{name}");
    }
    Some(seg)
}

/// A single field a compound rule can match against.
#[derive(Clone)]
pub enum RuleField {
    Name(String),
    File(FilePattern),
    Library(String),
    Kind(FunctionKind),
    Phase(Phase),
}

impl RuleField {
    fn matches(&self, event: &TraceEvent) -> bool {
        match self {
            RuleField::Name(n) => event.name == *n,
            RuleField::File(p) => event.file.as_deref().map(|f| p.matches(f)).unwrap_or(false),
            RuleField::Library(lib) => event
                .file
                .as_deref()
                .and_then(inferred_library)
                .map(|l| l == *lib)
                .unwrap_or(false),
            RuleField::Kind(k) => event.kind == *k,
            RuleField::Phase(p) => event.phase == *p,
        }
    }
}

/// A compound rule: an event is dropped when it satisfies every field in
/// the rule (an AND across fields; OR across rules in a [`FilterSet`]).
#[derive(Clone, Default)]
pub struct CompoundRule {
    fields: Vec<RuleField>,
}

impl CompoundRule {
    pub fn new() -> Self {
        CompoundRule::default()
    }

    pub fn with(mut self, field: RuleField) -> Self {
        self.fields.push(field);
        self
    }

    /// Convenience constructor for the common single-field case: drop every
    /// event whose function name exactly matches `name` (spec §6
    /// `disableFunctionTraces`).
    pub fn by_name(name: impl Into<String>) -> Self {
        CompoundRule::new().with(RuleField::Name(name.into()))
    }

    fn matches(&self, event: &TraceEvent) -> bool {
        !self.fields.is_empty() && self.fields.iter().all(|f| f.matches(event))
    }
}

type Predicate = Rc<dyn Fn(&TraceEvent) -> bool>;

/// The declarative filter layer itself: a set of dropped-file patterns,
/// dropped function kinds, compound rules, and user predicates. An event
/// is dropped if any one of these says to drop it.
#[derive(Clone, Default)]
pub struct FilterSet {
    file_patterns: Vec<FilePattern>,
    kinds: Vec<FunctionKind>,
    compound_rules: Vec<CompoundRule>,
    predicates: Vec<Predicate>,
}

impl FilterSet {
    pub fn new() -> Self {
        FilterSet::default()
    }

    pub fn drop_file_pattern(mut self, pattern: FilePattern) -> Self {
        self.file_patterns.push(pattern);
        self
    }

    pub fn drop_kind(mut self, kind: FunctionKind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn drop_compound(mut self, rule: CompoundRule) -> Self {
        self.compound_rules.push(rule);
        self
    }

    pub fn drop_predicate(mut self, predicate: impl Fn(&TraceEvent) -> bool + 'static) -> Self {
        self.predicates.push(Rc::new(predicate));
        self
    }

    /// `disableFunctionTraces`/`disableFunctionTypes`/`disableTraceFiles`
    /// (spec §6) land here as ordinary file-pattern and kind rules; they are
    /// not a distinct mechanism from a user-authored [`FilterSet`].
    pub fn should_drop(&self, event: &TraceEvent) -> bool {
        if self.kinds.contains(&event.kind) {
            return true;
        }
        if let Some(file) = event.file.as_deref() {
            if self.file_patterns.iter().any(|p| p.matches(file)) {
                return true;
            }
        }
        if self.compound_rules.iter().any(|r| r.matches(event)) {
            return true;
        }
        self.predicates.iter().any(|p| p(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apptrace_core::SpanId;

    fn event(name: &str, file: Option<&str>, kind: FunctionKind, phase: Phase) -> TraceEvent {
        TraceEvent {
            phase,
            t: 0,
            name: name.into(),
            file: file.map(|s| s.to_string()),
            line: None,
            kind,
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
    fn drops_by_file_suffix() {
        let filter = FilterSet::new().drop_file_pattern(FilePattern::Suffix(".test.js".into()));
        let e = event("f", Some("/app/math.test.js"), FunctionKind::Function, Phase::Enter);
        assert!(filter.should_drop(&e));
        let e2 = event("f", Some("/app/math.js"), FunctionKind::Function, Phase::Enter);
        assert!(!filter.should_drop(&e2));
    }

    #[test]
    fn drops_by_kind() {
        let filter = FilterSet::new().drop_kind(FunctionKind::Getter);
        let e = event("get x", None, FunctionKind::Getter, Phase::Enter);
        assert!(filter.should_drop(&e));
    }

    #[test]
    fn compound_rule_requires_all_fields() {
        let rule = CompoundRule::new()
            .with(RuleField::Kind(FunctionKind::Method))
            .with(RuleField::Phase(Phase::Exit));
        let filter = FilterSet::new().drop_compound(rule);
        let matching = event("m", None, FunctionKind::Method, Phase::Exit);
        assert!(filter.should_drop(&matching));
        let partial = event("m", None, FunctionKind::Method, Phase::Enter);
        assert!(!filter.should_drop(&partial));
    }

    #[test]
    fn inferred_library_reads_first_segment_after_node_modules() {
        assert_eq!(
            inferred_library("/repo/node_modules/lodash/index.js"),
            Some("lodash".to_string())
        );
        assert_eq!(
            inferred_library("/repo/node_modules/@scope/pkg/index.js"),
            Some("@scope/pkg".to_string())
        );
        assert_eq!(inferred_library("/repo/src/app.js"), None);
    }

    #[test]
    fn predicate_rule_can_drop_arbitrary_events() {
        let filter = FilterSet::new().drop_predicate(|e| e.name.starts_with('_'));
        let e = event("_private", None, FunctionKind::Function, Phase::Enter);
        assert!(filter.should_drop(&e));
    }
}
