//! Spec §4.7.1: bounds every value embedded in an event before it is held
//! anywhere past the current flush, and reduces host-specific shapes (dates,
//! buffers, ORM documents, query builders, promises...) to the canonical
//! forms `apptrace_core::Snapshot` already models.
//!
//! The host hands values across the boundary as [`RawValue`] rather than
//! this crate walking live JS objects itself. Because `RawValue` is an owned
//! Rust tree, a true reference cycle can't arise by construction the way it
//! can in a live JS object graph — the host is expected to detect
//! self-reference on its side and encode it as `RawValue::CircularRef`
//! before crossing the boundary; this sanitizer still defends against
//! runaway nesting with a depth cap regardless.

use apptrace_core::Snapshot;
use std::collections::BTreeMap;

/// Spec §9: "choose limits conservatively (≤3 levels deep, ≤20 keys, ≤20
/// items, ≤2 KB per string is a good starting point)".
#[derive(Debug, Clone, Copy)]
pub struct Caps {
    pub max_depth: usize,
    pub max_keys: usize,
    pub max_items: usize,
    pub max_string_len: usize,
}

impl Default for Caps {
    fn default() -> Self {
        Caps {
            max_depth: 3,
            max_keys: 20,
            max_items: 20,
            max_string_len: 2048,
        }
    }
}

/// The shape of a value as handed across the host boundary, prior to
/// sanitization. Mirrors the canonical forms spec §4.7.1 lists explicitly.
#[derive(Debug, Clone)]
pub enum RawValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(Vec<RawValue>),
    Object(Vec<(String, RawValue)>),
    Date(String),
    Regex(String),
    Buffer(Vec<u8>),
    Error { name: String, message: String },
    BigInt(String),
    Symbol(Option<String>),
    Map(Vec<(RawValue, RawValue)>),
    Set(Vec<RawValue>),
    Function(Option<String>),
    /// A promise: its settlement is never forced by the sanitizer.
    Promise,
    /// An ORM document: the host has already called `toObject`/`toJSON` and
    /// handed back the resulting plain structure.
    OrmDocument(Box<RawValue>),
    QueryBuilder {
        model: Option<String>,
        operation: Option<String>,
        filter: Option<Box<RawValue>>,
    },
    /// The host detected a self-reference in the live object graph.
    CircularRef,
}

fn truncate_string(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &s[..cut])
    }
}

fn canonical(tag: &'static str, repr: String) -> Snapshot {
    Snapshot::Canonical { type_tag: tag, repr }
}

/// Sanitizes a single value to a bounded [`Snapshot`], per spec §4.7.1.
pub fn sanitize(value: &RawValue, caps: &Caps) -> Snapshot {
    sanitize_at(value, caps, 0)
}

fn sanitize_at(value: &RawValue, caps: &Caps, depth: usize) -> Snapshot {
    match value {
        RawValue::Undefined => Snapshot::Undefined,
        RawValue::Null => Snapshot::Null,
        RawValue::Bool(b) => Snapshot::Bool(*b),
        RawValue::Number(n) => Snapshot::Number(*n),
        RawValue::Str(s) => Snapshot::Str(truncate_string(s, caps.max_string_len)),
        RawValue::CircularRef => Snapshot::Circular,
        RawValue::Promise => Snapshot::PendingPromise,
        RawValue::Date(iso) => canonical("date", iso.clone()),
        RawValue::Regex(src) => canonical("regexp", src.clone()),
        RawValue::Buffer(bytes) => canonical("buffer", format!("<Buffer {} bytes>", bytes.len())),
        RawValue::Error { name, message } => canonical("error", format!("{name}: {message}")),
        RawValue::BigInt(repr) => canonical("bigint", repr.clone()),
        RawValue::Symbol(desc) => canonical(
            "symbol",
            desc.clone().map(|d| format!("Symbol({d})")).unwrap_or_else(|| "Symbol()".to_string()),
        ),
        RawValue::Function(name) => canonical(
            "function",
            format!("[Function: {}]", name.as_deref().unwrap_or("anonymous")),
        ),
        RawValue::QueryBuilder {
            model,
            operation,
            filter,
        } => Snapshot::QuerySummary {
            model: model.clone(),
            operation: operation.clone(),
            filter: filter
                .as_ref()
                .map(|f| Box::new(sanitize_at(f, caps, depth + 1))),
        },
        RawValue::OrmDocument(inner) => sanitize_at(inner, caps, depth),
        RawValue::Array(items) => {
            if depth >= caps.max_depth {
                return Snapshot::Unserializable("max depth exceeded".to_string());
            }
            let capped: Vec<Snapshot> = items
                .iter()
                .take(caps.max_items)
                .map(|v| sanitize_at(v, caps, depth + 1))
                .collect();
            Snapshot::Array(capped)
        }
        RawValue::Set(items) => canonical("set", format!("Set({})", items.len())),
        RawValue::Object(entries) => {
            if depth >= caps.max_depth {
                return Snapshot::Unserializable("max depth exceeded".to_string());
            }
            let mut map = BTreeMap::new();
            for (k, v) in entries.iter().take(caps.max_keys) {
                map.insert(k.clone(), sanitize_at(v, caps, depth + 1));
            }
            Snapshot::Object(map)
        }
        RawValue::Map(entries) => canonical("map", format!("Map({})", entries.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_strings() {
        let caps = Caps {
            max_string_len: 4,
            ..Caps::default()
        };
        let out = sanitize(&RawValue::Str("abcdef".to_string()), &caps);
        assert_eq!(out, Snapshot::Str("abcd…".to_string()));
    }

    #[test]
    fn caps_object_keys_and_array_items() {
        let caps = Caps {
            max_keys: 1,
            max_items: 1,
            ..Caps::default()
        };
        let obj = RawValue::Object(vec![
            ("a".to_string(), RawValue::Number(1.0)),
            ("b".to_string(), RawValue::Number(2.0)),
        ]);
        let Snapshot::Object(map) = sanitize(&obj, &caps) else {
            panic!("expected object snapshot");
        };
        assert_eq!(map.len(), 1);

        let arr = RawValue::Array(vec![RawValue::Number(1.0), RawValue::Number(2.0)]);
        let Snapshot::Array(items) = sanitize(&arr, &caps) else {
            panic!("expected array snapshot");
        };
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn depth_cap_produces_unserializable_placeholder() {
        let caps = Caps {
            max_depth: 1,
            ..Caps::default()
        };
        let nested = RawValue::Object(vec![(
            "a".to_string(),
            RawValue::Object(vec![("b".to_string(), RawValue::Number(1.0))]),
        )]);
        let Snapshot::Object(map) = sanitize(&nested, &caps) else {
            panic!("expected object snapshot");
        };
        assert!(matches!(map.get("a"), Some(Snapshot::Unserializable(_))));
    }

    #[test]
    fn circular_ref_becomes_sentinel() {
        assert_eq!(sanitize(&RawValue::CircularRef, &Caps::default()), Snapshot::Circular);
    }

    #[test]
    fn promise_becomes_pending_placeholder() {
        assert_eq!(sanitize(&RawValue::Promise, &Caps::default()), Snapshot::PendingPromise);
    }

    #[test]
    fn query_builder_summarizes_without_forcing_resolution() {
        let qb = RawValue::QueryBuilder {
            model: Some("User".to_string()),
            operation: Some("find".to_string()),
            filter: Some(Box::new(RawValue::Object(vec![(
                "active".to_string(),
                RawValue::Bool(true),
            )]))),
        };
        let snap = sanitize(&qb, &Caps::default());
        match snap {
            Snapshot::QuerySummary { model, operation, filter } => {
                assert_eq!(model.as_deref(), Some("User"));
                assert_eq!(operation.as_deref(), Some("find"));
                assert!(filter.is_some());
            }
            other => panic!("expected query summary, got {other:?}"),
        }
    }

    #[test]
    fn orm_document_unwraps_to_its_plain_shape() {
        let doc = RawValue::OrmDocument(Box::new(RawValue::Object(vec![(
            "id".to_string(),
            RawValue::Number(1.0),
        )])));
        let Snapshot::Object(map) = sanitize(&doc, &Caps::default()) else {
            panic!("expected object snapshot");
        };
        assert!(map.contains_key("id"));
    }
}
