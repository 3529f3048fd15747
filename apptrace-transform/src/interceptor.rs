//! C2, the module interceptor: decides which loaded code units get
//! source-rewritten, swallows transform failures, and drives the origin
//! tagger and the dependency method-swap path for everything else.
//!
//! This crate doesn't embed a JS engine, so there's no live compile-and-load
//! hook to attach to. [`ModuleLoader`] stands in for that hook — a host (a
//! Node native-addon shim, an embedded-engine binding) implements it once per
//! runtime and drives [`Interceptor::on_load`] from its own require/import
//! path. A reference in-memory implementation is provided for tests.

use crate::origin::{ExportValue, OriginTagger};
use crate::rewrite::{DefaultTransformer, SourceTransform, TransformConfig, TransformMeta};
use apptrace_core::FunctionKind;
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use std::collections::HashSet;

static NODE_MODULES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(^|/)node_modules/").unwrap());

/// The conventional "is application code" classifier: anything outside
/// `node_modules`. Hosts with a different dependency layout (a monorepo with
/// vendored packages elsewhere) pass their own closure to [`Interceptor::new`]
/// instead.
pub fn default_is_app_classifier() -> Box<dyn Fn(&str) -> bool> {
    Box::new(|path: &str| !NODE_MODULES_RE.is_match(path))
}

/// Compiled once from the operator's `include`/`exclude` path pattern lists
/// (spec §6), grounded the way `tracing-subscriber`'s env-filter compiles a
/// directive set into one matcher rather than testing patterns one at a
/// time.
pub struct ScopeMatcher {
    include: RegexSet,
    exclude: RegexSet,
}

impl ScopeMatcher {
    pub fn new<I, E>(include: I, exclude: E) -> Result<Self, regex::Error>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Ok(ScopeMatcher {
            include: RegexSet::new(include)?,
            exclude: RegexSet::new(exclude)?,
        })
    }

    /// True iff `path` falls inside an include pattern and outside every
    /// exclude pattern (spec §4.2 step 1).
    pub fn in_scope(&self, path: &str) -> bool {
        self.include.is_match(path) && !self.exclude.is_match(path)
    }
}

/// The host-facing hook a real engine binding drives per compiled unit and,
/// separately, per ESM specifier resolution (spec §4.2 step 4).
pub trait ModuleLoader {
    /// Reads the raw (untransformed) source for `path`.
    fn read_source(&self, path: &str) -> std::io::Result<String>;
}

/// An in-memory `ModuleLoader` for tests and for hosts that already hold
/// every module's source in memory (e.g. a bundler plugin).
#[derive(Default)]
pub struct InMemoryLoader {
    files: std::collections::HashMap<String, String>,
}

impl InMemoryLoader {
    pub fn new() -> Self {
        InMemoryLoader::default()
    }

    pub fn add(&mut self, path: impl Into<String>, source: impl Into<String>) {
        self.files.insert(path.into(), source.into());
    }
}

impl ModuleLoader for InMemoryLoader {
    fn read_source(&self, path: &str) -> std::io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no source for {path}"))
        })
    }
}

/// Names the dependency wrapping path never swaps in, regardless of the
/// include set (spec §4.2 "Dependency wrapping path").
const THENABLE_SURFACE: &[&str] = &["then", "catch", "finally"];
const QUERY_EXEC_NAMES: &[&str] = &["exec", "execute", "run", "fetch"];

pub struct LoadResult {
    pub source: String,
    /// True iff the transformer actually rewrote this unit's source (as
    /// opposed to falling back to the original on a transform error, or the
    /// unit being out of scope).
    pub body_traced: bool,
}

pub struct Interceptor {
    scope: ScopeMatcher,
    transformer: DefaultTransformer,
    is_app: Box<dyn Fn(&str) -> bool>,
    /// Paths that have already been through `on_load`, so the retrofit pass
    /// (spec §4.2 step 5) only reprocesses modules loaded before this
    /// interceptor existed.
    seen: HashSet<String>,
}

impl Interceptor {
    pub fn new(scope: ScopeMatcher, config: TransformConfig, is_app: Box<dyn Fn(&str) -> bool>) -> Self {
        Interceptor {
            scope,
            transformer: DefaultTransformer::new(config),
            is_app,
            seen: HashSet::new(),
        }
    }

    /// Spec §4.2 steps 1–3: transform in-scope units (swallowing errors),
    /// record the path as seen, and hand back the export shape for the
    /// origin tagger to walk.
    pub fn on_load(&mut self, path: &str, source: &str) -> LoadResult {
        self.seen.insert(path.to_string());

        if !self.scope.in_scope(path) {
            return LoadResult {
                source: source.to_string(),
                body_traced: false,
            };
        }

        let meta = TransformMeta::new(path);
        match self.transformer.transform(source, &meta) {
            Ok(rewritten) => LoadResult {
                source: rewritten,
                body_traced: true,
            },
            Err(err) => {
                if std::env::var("TRACE_QUIET").as_deref() != Ok("1") {
                    eprintln!("apptrace: transform failed for {path}, loading untransformed: {err}");
                }
                LoadResult {
                    source: source.to_string(),
                    body_traced: false,
                }
            }
        }
    }

    /// Tags every function in `exports` with this unit's origin (spec §4.2
    /// step 3, §4.3).
    pub fn tag_exports(&self, path: &str, exports: &ExportValue, body_traced: bool) {
        let tagger = OriginTagger::new(path, (self.is_app)(path));
        tagger.tag(exports);
        if body_traced {
            mark_body_traced(exports);
        }
    }

    /// Spec §4.2 step 5: modules loaded before this interceptor existed. For
    /// each one inside the configured include set, re-run the transform as
    /// if freshly loaded; for the rest, apply the dependency wrapping path
    /// instead of source rewriting.
    pub fn retrofit(&mut self, loader: &dyn ModuleLoader, already_loaded: &[String]) -> Vec<(String, LoadResult)> {
        already_loaded
            .iter()
            .filter(|path| !self.seen.contains(path.as_str()))
            .filter_map(|path| {
                let source = loader.read_source(path).ok()?;
                Some((path.clone(), self.on_load(path, &source)))
            })
            .collect()
    }

    /// The method-swap path (spec §4.2 "Dependency wrapping path") for a
    /// unit the transformer never touched: every exported function is
    /// eligible for dispatch-path wrapping except accessors, the thenable
    /// surface, query-exec methods, and anything already marked wrapped.
    /// Ineligible functions are marked `skip_wrap` so the dispatcher invokes
    /// them untraced.
    pub fn wrap_dependency_exports(&self, path: &str, exports: &ExportValue) {
        self.tag_exports(path, exports, false);
        mark_skip_wrap_exclusions(exports, &mut HashSet::new());
    }
}

fn mark_body_traced(value: &ExportValue) {
    match value {
        ExportValue::Function { cell, .. } => {
            let mut origin = cell.get();
            origin.body_traced = true;
            cell.set(origin);
        }
        ExportValue::Object(entries) => {
            for (_, v) in entries {
                mark_body_traced(v);
            }
        }
        ExportValue::Class {
            methods,
            static_methods,
        } => {
            for (_, v) in methods.iter().chain(static_methods.iter()) {
                mark_body_traced(v);
            }
        }
        ExportValue::Other => {}
    }
}

fn mark_skip_wrap_exclusions(value: &ExportValue, visited: &mut HashSet<*const ()>) {
    match value {
        ExportValue::Object(entries) => {
            for (name, v) in entries {
                apply_exclusion(name, v);
                mark_skip_wrap_exclusions(v, visited);
            }
        }
        ExportValue::Class {
            methods,
            static_methods,
        } => {
            for (name, v) in methods.iter().chain(static_methods.iter()) {
                apply_exclusion(name, v);
                mark_skip_wrap_exclusions(v, visited);
            }
        }
        _ => {}
    }
}

fn apply_exclusion(name: &str, value: &ExportValue) {
    let ExportValue::Function { cell, kind, .. } = value else {
        return;
    };
    if cell.is_skip_wrap() {
        return; // already marked wrapped/excluded
    }
    let is_accessor = matches!(kind, FunctionKind::Getter | FunctionKind::Setter);
    let excluded = is_accessor || THENABLE_SURFACE.contains(&name) || QUERY_EXEC_NAMES.contains(&name);
    if excluded {
        cell.mark_skip_wrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apptrace_core::OriginCell;

    fn matcher() -> ScopeMatcher {
        ScopeMatcher::new(vec!["^/app/"], vec!["\\.test\\.js$"]).unwrap()
    }

    #[test]
    fn in_scope_respects_include_and_exclude() {
        let m = matcher();
        assert!(m.in_scope("/app/src/widgets.js"));
        assert!(!m.in_scope("/node_modules/left-pad/index.js"));
        assert!(!m.in_scope("/app/src/widgets.test.js"));
    }

    #[test]
    fn on_load_transforms_in_scope_source_and_tags_out_of_scope_passthrough() {
        let mut interceptor = Interceptor::new(
            matcher(),
            TransformConfig::default(),
            Box::new(|path: &str| path.starts_with("/app/")),
        );
        let result = interceptor.on_load("/app/src/math.js", "function add(a, b) { return a + b; }");
        assert!(result.body_traced);
        assert!(result.source.contains("__apptraceEnter("));

        let passthrough = interceptor.on_load("/node_modules/lib/index.js", "function f() {}");
        assert!(!passthrough.body_traced);
        assert_eq!(passthrough.source, "function f() {}");
    }

    #[test]
    fn on_load_swallows_transform_errors_and_falls_back_to_untransformed() {
        let mut interceptor = Interceptor::new(
            matcher(),
            TransformConfig::default(),
            Box::new(|_: &str| true),
        );
        let broken = "function f() { return `unterminated";
        let result = interceptor.on_load("/app/broken.js", broken);
        assert!(!result.body_traced);
        assert_eq!(result.source, broken);
    }

    #[test]
    fn dependency_wrapping_path_skips_thenable_and_exec_surface() {
        let interceptor = Interceptor::new(matcher(), TransformConfig::default(), Box::new(|_: &str| false));
        let then_cell = OriginCell::new();
        let find_cell = OriginCell::new();
        let exec_cell = OriginCell::new();
        let exports = ExportValue::Object(vec![
            (
                "then".to_string(),
                ExportValue::Function {
                    cell: then_cell.clone(),
                    body_traced: false,
                    kind: FunctionKind::Function,
                },
            ),
            (
                "find".to_string(),
                ExportValue::Function {
                    cell: find_cell.clone(),
                    body_traced: false,
                    kind: FunctionKind::Function,
                },
            ),
            (
                "exec".to_string(),
                ExportValue::Function {
                    cell: exec_cell.clone(),
                    body_traced: false,
                    kind: FunctionKind::Function,
                },
            ),
        ]);

        interceptor.wrap_dependency_exports("/node_modules/orm/index.js", &exports);

        assert!(then_cell.is_skip_wrap());
        assert!(exec_cell.is_skip_wrap());
        assert!(!find_cell.is_skip_wrap());
        assert!(!find_cell.get().is_app);
    }

    #[test]
    fn dependency_wrapping_path_skips_getters_and_setters() {
        let interceptor = Interceptor::new(matcher(), TransformConfig::default(), Box::new(|_: &str| false));
        let getter_cell = OriginCell::new();
        let setter_cell = OriginCell::new();
        let method_cell = OriginCell::new();
        let exports = ExportValue::Object(vec![
            (
                "name".to_string(),
                ExportValue::Function {
                    cell: getter_cell.clone(),
                    body_traced: false,
                    kind: FunctionKind::Getter,
                },
            ),
            (
                "name".to_string(),
                ExportValue::Function {
                    cell: setter_cell.clone(),
                    body_traced: false,
                    kind: FunctionKind::Setter,
                },
            ),
            (
                "save".to_string(),
                ExportValue::Function {
                    cell: method_cell.clone(),
                    body_traced: false,
                    kind: FunctionKind::Method,
                },
            ),
        ]);

        interceptor.wrap_dependency_exports("/node_modules/orm/index.js", &exports);

        assert!(getter_cell.is_skip_wrap());
        assert!(setter_cell.is_skip_wrap());
        assert!(!method_cell.is_skip_wrap());
    }

    #[test]
    fn default_is_app_classifier_excludes_node_modules() {
        let classify = default_is_app_classifier();
        assert!(classify("/app/src/widgets.js"));
        assert!(!classify("/repo/node_modules/left-pad/index.js"));
    }

    #[test]
    fn retrofit_only_reprocesses_modules_not_already_seen() {
        let mut interceptor = Interceptor::new(matcher(), TransformConfig::default(), Box::new(|_: &str| true));
        interceptor.on_load("/app/already.js", "function a() {}");

        let mut loader = InMemoryLoader::new();
        loader.add("/app/already.js", "function a() {}");
        loader.add("/app/stale.js", "function b() { return 1; }");

        let results = interceptor.retrofit(
            &loader,
            &["/app/already.js".to_string(), "/app/stale.js".to_string()],
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "/app/stale.js");
    }
}
