//! The transformer itself (spec §4.1, C1): turns a module's source into a
//! semantically equivalent rewrite with every function body wrapped to emit
//! its own enter/exit, and every call expression routed through the
//! dispatcher hook.
//!
//! `SourceTransform` is a trait rather than a single free function so a
//! production embedder can swap in a real grammar (e.g. swc) without
//! touching anything downstream that consumes rewritten source — the same
//! reason `tracing-subscriber` keeps `FormatEvent`/`FormatFields` as traits
//! rather than baking one formatter in.

use crate::error::TransformError;
use crate::parser::{self, FunctionSite};
use apptrace_core::FunctionKind;
use regex::RegexSet;
use std::cell::Cell;
use std::fmt::Write as _;

/// The leading marker `apptrace-transform` writes onto output it produced
/// and checks for on input, so re-running the interceptor on already
/// rewritten source is a no-op (spec §8, "re-wrapping an already-wrapped
/// function is a no-op" — implemented here at file granularity, since a
/// source file is always rewritten as a unit).
pub const WRAPPED_SENTINEL: &str = "/* apptrace:wrapped */";

/// Runtime hook names the rewritten source calls into. These are provided
/// by the host's JS-side runtime shim (out of scope, spec §6); the
/// transformer only needs to agree on names.
#[derive(Debug, Clone)]
pub struct HookNames {
    pub enter_fn: String,
    pub exit_fn: String,
    pub dispatch_fn: String,
}

impl Default for HookNames {
    fn default() -> Self {
        HookNames {
            enter_fn: "__apptraceEnter".to_string(),
            exit_fn: "__apptraceExit".to_string(),
            dispatch_fn: "__apptraceDispatch".to_string(),
        }
    }
}

/// Configuration knobs from spec §6 that affect the transform itself
/// (`include`/`exclude` path filtering belongs to the module interceptor,
/// not here — by the time source reaches this crate, the interceptor has
/// already decided it's in scope).
#[derive(Debug, Clone)]
pub struct TransformConfig {
    pub wrap_getters_setters: bool,
    pub skip_anonymous: bool,
    /// Allowlist mode: when present, only functions whose resolved display
    /// name matches one of these patterns are wrapped.
    pub allow_fns: Option<RegexSet>,
    pub hooks: HookNames,
}

impl Default for TransformConfig {
    fn default() -> Self {
        TransformConfig {
            wrap_getters_setters: false,
            skip_anonymous: false,
            allow_fns: None,
            hooks: HookNames::default(),
        }
    }
}

/// Per-call metadata the interceptor (C2) derives before invoking the
/// transformer: the tagged metadata filename (may differ from the compiled
/// file when a source map points elsewhere) and a nullable original-position
/// mapper (spec §4.1 "Input").
pub struct TransformMeta<'a> {
    pub file: &'a str,
    pub position_map: Option<&'a dyn Fn(u32) -> u32>,
}

impl<'a> TransformMeta<'a> {
    pub fn new(file: &'a str) -> Self {
        TransformMeta {
            file,
            position_map: None,
        }
    }

    fn original_line(&self, compiled_line: u32) -> u32 {
        match self.position_map {
            Some(f) => f(compiled_line),
            None => compiled_line,
        }
    }
}

pub trait SourceTransform {
    fn transform(&self, src: &str, meta: &TransformMeta<'_>) -> Result<String, TransformError>;
}

pub struct DefaultTransformer {
    pub config: TransformConfig,
}

impl DefaultTransformer {
    pub fn new(config: TransformConfig) -> Self {
        DefaultTransformer { config }
    }
}

struct Edit {
    start: usize,
    end: usize,
    text: String,
}

fn kind_str(kind: FunctionKind) -> &'static str {
    match kind {
        FunctionKind::Function => "function",
        FunctionKind::Arrow => "arrow",
        FunctionKind::Method => "method",
        FunctionKind::StaticMethod => "static-method",
        FunctionKind::Constructor => "constructor",
        FunctionKind::Getter => "getter",
        FunctionKind::Setter => "setter",
    }
}

fn js_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

fn display_name(f: &FunctionSite) -> String {
    f.declared_name.clone().unwrap_or_else(|| "(anonymous)".to_string())
}

fn resolved_kind(f: &FunctionSite) -> FunctionKind {
    if f.kind == FunctionKind::Method && f.declared_name.as_deref() == Some("constructor") {
        FunctionKind::Constructor
    } else {
        f.kind
    }
}

fn should_wrap(f: &FunctionSite, cfg: &TransformConfig) -> bool {
    if f.is_getter_setter && !cfg.wrap_getters_setters {
        return false;
    }
    if cfg.skip_anonymous && f.declared_name.is_none() {
        return false;
    }
    if let Some(set) = &cfg.allow_fns {
        let name = display_name(f);
        if !set.is_match(&name) {
            return false;
        }
    }
    true
}

impl SourceTransform for DefaultTransformer {
    fn transform(&self, src: &str, meta: &TransformMeta<'_>) -> Result<String, TransformError> {
        if src.trim_start().starts_with(WRAPPED_SENTINEL) {
            return Ok(src.to_string());
        }

        let parsed = parser::parse(src)?;
        let counter = Cell::new(0u64);
        let next_id = || {
            let v = counter.get();
            counter.set(v + 1);
            v
        };

        let mut edits: Vec<Edit> = Vec::new();
        let mut wrapped_flags = vec![false; parsed.functions.len()];

        for (fi, f) in parsed.functions.iter().enumerate() {
            if !should_wrap(f, &self.config) {
                continue;
            }
            wrapped_flags[fi] = true;
            let id = next_id();
            let name = display_name(f);
            let kind = resolved_kind(f);
            let line = meta.original_line(f.line);
            let args_expr = if f.is_arrow {
                let items: Vec<String> = f
                    .params
                    .iter()
                    .map(|p| p.name.clone().unwrap_or_else(|| "undefined".to_string()))
                    .collect();
                format!("[{}]", items.join(", "))
            } else {
                "(typeof arguments !== \"undefined\" ? Array.prototype.slice.call(arguments) : [])".to_string()
            };

            let meta_obj = format!(
                "{{name: {}, file: {}, line: {}, kind: {}}}",
                js_string(&name),
                js_string(meta.file),
                line,
                js_string(kind_str(kind))
            );

            let span_var = format!("__apptrace_span_{id}");
            let err_var = format!("__apptrace_err_{id}");

            let mut preamble = String::new();
            let _ = write!(
                preamble,
                "\nconst __apptrace_args_{id} = {args_expr};\nlet result = undefined, error = null, threw = false;\nvar {span_var} = {enter}({meta_obj}, __apptrace_args_{id});\ntry {{",
                enter = self.config.hooks.enter_fn,
            );

            let epilogue = format!(
                "\n}} catch ({err_var}) {{\n  threw = true;\n  error = {err_var};\n  throw {err_var};\n}} finally {{\n  {exit}({span_var}, {meta_obj}, {{result: result, error: error, threw: threw}});\n}}\n",
                exit = self.config.hooks.exit_fn,
            );

            if f.is_expression_body {
                let expr_text = &src[f.body_open..f.body_close];
                let block = format!(
                    "{{{preamble}\n  return (result = ({expr_text}));{epilogue}}}",
                );
                edits.push(Edit {
                    start: f.body_open,
                    end: f.body_close,
                    text: block,
                });
            } else {
                edits.push(Edit {
                    start: f.body_open,
                    end: f.body_open,
                    text: preamble,
                });
                edits.push(Edit {
                    start: f.body_close,
                    end: f.body_close,
                    text: epilogue,
                });
            }
        }

        for (owner_idx, ret) in &parsed.returns {
            if !wrapped_flags.get(*owner_idx).copied().unwrap_or(false) {
                continue;
            }
            if let Some((expr_start, expr_end)) = ret.expr {
                edits.push(Edit {
                    start: expr_start,
                    end: expr_start,
                    text: "(result = (".to_string(),
                });
                edits.push(Edit {
                    start: expr_end,
                    end: expr_end,
                    text: "))".to_string(),
                });
            }
        }

        for call in &parsed.calls {
            if call.label == self.config.hooks.dispatch_fn
                || call.label == self.config.hooks.enter_fn
                || call.label == self.config.hooks.exit_fn
            {
                continue;
            }
            let id = next_id();
            let unawaited = !call.awaited;
            let args_text = &src[parsed.tokens[call.paren_open].end..parsed.tokens[call.paren_close].start];

            let full_start = parsed.tokens[call.callee_start].start;
            let full_end = parsed.tokens[call.paren_close].end;

            let line = meta.original_line(call.line);
            let text = if let Some(obj) = &call.object_text {
                format!(
                    "(__apptrace_t{id}_obj = {obj}, __apptrace_t{id}_fn = __apptrace_t{id}_obj.{label}, {dispatch}(__apptrace_t{id}_fn, __apptrace_t{id}_obj, [{args}], {file}, {line}, {label_lit}, {unawaited}))",
                    label = call.label,
                    dispatch = self.config.hooks.dispatch_fn,
                    args = args_text,
                    file = js_string(meta.file),
                    label_lit = js_string(&call.label),
                )
            } else {
                format!(
                    "(__apptrace_t{id}_fn = {callee}, {dispatch}(__apptrace_t{id}_fn, null, [{args}], {file}, {line}, {label_lit}, {unawaited}))",
                    callee = call.callee_text,
                    dispatch = self.config.hooks.dispatch_fn,
                    args = args_text,
                    file = js_string(meta.file),
                    label_lit = js_string(&call.label),
                )
            };

            edits.push(Edit {
                start: full_start,
                end: full_end,
                text,
            });
        }

        edits.sort_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)));

        let mut out = String::with_capacity(src.len() + src.len() / 2);
        out.push_str(WRAPPED_SENTINEL);
        out.push('\n');
        let mut cursor = 0usize;
        for edit in &edits {
            if edit.start < cursor {
                continue; // overlapping edit from a malformed/ambiguous parse; drop rather than corrupt output
            }
            out.push_str(&src[cursor..edit.start]);
            out.push_str(&edit.text);
            cursor = edit.end;
        }
        out.push_str(&src[cursor..]);

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform(src: &str) -> String {
        let t = DefaultTransformer::new(TransformConfig::default());
        t.transform(src, &TransformMeta::new("/app/math.js")).unwrap()
    }

    #[test]
    fn wraps_function_declaration_body() {
        let out = transform("function add(a, b) {\n  return a + b;\n}");
        assert!(out.starts_with(WRAPPED_SENTINEL));
        assert!(out.contains("__apptraceEnter("));
        assert!(out.contains("__apptraceExit("));
        assert!(out.contains("result = (a + b)"));
    }

    #[test]
    fn rewrites_plain_and_member_call_sites() {
        let out = transform("foo(1, 2); obj.bar(3);");
        assert!(out.contains("__apptraceDispatch("));
        assert!(out.contains("__apptrace_t"));
        assert!(out.contains("obj.bar") || out.contains("_obj = obj"));
    }

    #[test]
    fn promotes_arrow_expression_body_to_block() {
        let out = transform("const double = x => x * 2;");
        assert!(out.contains("return (result = (x * 2))"));
    }

    #[test]
    fn idempotent_on_already_wrapped_source() {
        let once = transform("function f() { return 1; }");
        let twice = {
            let t = DefaultTransformer::new(TransformConfig::default());
            t.transform(&once, &TransformMeta::new("/app/f.js")).unwrap()
        };
        assert_eq!(once, twice);
    }

    #[test]
    fn getters_are_skipped_unless_enabled() {
        let out = transform("const o = { get value() { return 1; } };");
        assert!(!out.contains("__apptraceEnter("));

        let mut cfg = TransformConfig::default();
        cfg.wrap_getters_setters = true;
        let t = DefaultTransformer::new(cfg);
        let out2 = t
            .transform("const o = { get value() { return 1; } };", &TransformMeta::new("/app/o.js"))
            .unwrap();
        assert!(out2.contains("__apptraceEnter("));
    }

    #[test]
    fn skip_anonymous_config_suppresses_unnamed_functions() {
        let mut cfg = TransformConfig::default();
        cfg.skip_anonymous = true;
        let t = DefaultTransformer::new(cfg);
        let out = t
            .transform("setTimeout(function () { doThing(); }, 10);", &TransformMeta::new("/app/a.js"))
            .unwrap();
        assert!(!out.contains("__apptraceEnter("));
    }
}
