//! C3, the origin tagger: walks a module's exported shape and attaches an
//! [`OriginCell`] mark to every function found, recording which file defined
//! it, whether it's app code, and whether the transformer already traced its
//! body.
//!
//! A real host walks the live `module.exports` object graph; since this
//! crate only sees a module's static shape (recovered by `parser::parse`,
//! not a live object graph), [`ExportValue`] models that shape as a tree the
//! interceptor (`interceptor.rs`) builds once per loaded module, mirroring
//! what export analysis would discover: top-level function declarations,
//! `module.exports = {...}` object literals, and class bodies with their
//! methods.

use apptrace_core::{FunctionKind, FunctionOrigin, OriginCell};
use std::sync::Arc;

/// Cap on how deep the tagger will recurse into nested export objects,
/// mirroring the generic "avoid pathological exports" caution spec §9
/// raises for hosts that walk a live object graph.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub enum ExportValue {
    Function {
        cell: Arc<OriginCell>,
        /// True once the transformer actually rewrote this function's body
        /// (as opposed to one the interceptor decided to skip).
        body_traced: bool,
        /// Recovered by the parser (spec §4.2 "Dependency wrapping path":
        /// "accessors (never replace getters/setters)") — needed so the
        /// dependency method-swap path can exclude getters/setters without
        /// re-deriving them from the function's shape.
        kind: FunctionKind,
    },
    Object(Vec<(String, ExportValue)>),
    Class {
        methods: Vec<(String, ExportValue)>,
        static_methods: Vec<(String, ExportValue)>,
    },
    /// A value the tagger doesn't need to mark: primitives, arrays of
    /// non-functions, etc.
    Other,
}

pub struct OriginTagger {
    defining_file: String,
    is_app: bool,
}

impl OriginTagger {
    pub fn new(defining_file: impl Into<String>, is_app: bool) -> Self {
        OriginTagger {
            defining_file: defining_file.into(),
            is_app,
        }
    }

    /// Tags every function reachable from `root`, skipping anything past
    /// [`MAX_DEPTH`] or already visited (guarding against a module that
    /// aliases the same function under two export names).
    pub fn tag(&self, root: &ExportValue) {
        let mut visited: Vec<*const OriginCell> = Vec::new();
        self.walk(root, 0, &mut visited);
    }

    fn walk(&self, value: &ExportValue, depth: usize, visited: &mut Vec<*const OriginCell>) {
        if depth >= MAX_DEPTH {
            return;
        }
        match value {
            ExportValue::Function { cell, body_traced, .. } => {
                let ptr = Arc::as_ptr(cell);
                if visited.contains(&ptr) {
                    return;
                }
                visited.push(ptr);
                cell.set(FunctionOrigin {
                    defining_file: Some(self.defining_file.clone()),
                    is_app: self.is_app,
                    skip_wrap: false,
                    body_traced: *body_traced,
                });
            }
            ExportValue::Object(entries) => {
                for (_, v) in entries {
                    self.walk(v, depth + 1, visited);
                }
            }
            ExportValue::Class {
                methods,
                static_methods,
            } => {
                for (_, v) in methods.iter().chain(static_methods.iter()) {
                    self.walk(v, depth + 1, visited);
                }
            }
            ExportValue::Other => {}
        }
    }

    /// Marks a single function as exempt from call-site wrapping (native
    /// binding, already-instrumented dependency method, etc.) without
    /// touching its file/app classification.
    pub fn mark_skip_wrap(cell: &Arc<OriginCell>) {
        cell.mark_skip_wrap();
    }
}

/// Builds the static export shape for a parsed module: one [`ExportValue`]
/// per top-level function/method the parser found, keyed by its resolved
/// name. Functions the parser couldn't name (`(anonymous)`) are omitted —
/// there's no export key to hang a mark on.
pub fn export_shape_from_parsed(functions: &[crate::parser::FunctionSite]) -> ExportValue {
    let entries: Vec<(String, ExportValue)> = functions
        .iter()
        .filter_map(|f| {
            let name = f.declared_name.clone()?;
            Some((
                name,
                ExportValue::Function {
                    cell: OriginCell::new(),
                    body_traced: false,
                    kind: f.kind,
                },
            ))
        })
        .collect();
    ExportValue::Object(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_function_with_defining_file_and_app_classification() {
        let cell = OriginCell::new();
        let value = ExportValue::Function {
            cell: cell.clone(),
            body_traced: true,
            kind: FunctionKind::Function,
        };
        let tagger = OriginTagger::new("/app/src/widgets.js", true);
        tagger.tag(&value);

        let origin = cell.get();
        assert_eq!(origin.defining_file.as_deref(), Some("/app/src/widgets.js"));
        assert!(origin.is_app);
        assert!(origin.body_traced);
    }

    #[test]
    fn tags_nested_object_and_class_exports() {
        let leaf = OriginCell::new();
        let method = OriginCell::new();
        let value = ExportValue::Object(vec![
            (
                "helper".to_string(),
                ExportValue::Function {
                    cell: leaf.clone(),
                    body_traced: false,
                    kind: FunctionKind::Function,
                },
            ),
            (
                "Widget".to_string(),
                ExportValue::Class {
                    methods: vec![(
                        "render".to_string(),
                        ExportValue::Function {
                            cell: method.clone(),
                            body_traced: true,
                            kind: FunctionKind::Method,
                        },
                    )],
                    static_methods: vec![],
                },
            ),
        ]);
        let tagger = OriginTagger::new("/node_modules/widgets/index.js", false);
        tagger.tag(&value);

        assert!(!leaf.get().is_app);
        assert!(!method.get().is_app);
        assert_eq!(
            method.get().defining_file.as_deref(),
            Some("/node_modules/widgets/index.js")
        );
    }

    #[test]
    fn aliased_function_is_only_visited_once() {
        let cell = OriginCell::new();
        let aliased = ExportValue::Object(vec![
            (
                "a".to_string(),
                ExportValue::Function {
                    cell: cell.clone(),
                    body_traced: false,
                    kind: FunctionKind::Function,
                },
            ),
            (
                "b".to_string(),
                ExportValue::Function {
                    cell: cell.clone(),
                    body_traced: false,
                    kind: FunctionKind::Function,
                },
            ),
        ]);
        let tagger = OriginTagger::new("/app/a.js", true);
        tagger.tag(&aliased); // shouldn't panic or double-mark oddly
        assert!(cell.get().is_app);
    }
}
