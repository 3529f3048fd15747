use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The marks C3 (the origin tagger) attaches to every function value it
/// walks: defining file, app-vs-dependency classification, and whether the
/// transformer already rewrote this function's body.
///
/// Spec §9 notes that if the host language can't attach hidden metadata to
/// functions, implementations should fall back to a side table keyed by
/// identity with weak keys, to avoid leaking. Rust has no weak reference to
/// an arbitrary function value, but it also has no GC to leak from: an owned
/// [`OriginCell`] held alongside the function (see
/// `apptrace-transform::origin::ExportValue::Function`) is the direct
/// analogue with the leak concern removed by construction.
#[derive(Debug, Default)]
pub struct OriginCell {
    defining_file: std::sync::Mutex<Option<String>>,
    is_app: AtomicBool,
    skip_wrap: AtomicBool,
    body_traced: AtomicBool,
}

impl OriginCell {
    pub fn new() -> Arc<Self> {
        Arc::new(OriginCell::default())
    }

    pub fn set(&self, origin: FunctionOrigin) {
        *self.defining_file.lock().unwrap() = origin.defining_file;
        self.is_app.store(origin.is_app, Ordering::Relaxed);
        self.skip_wrap.store(origin.skip_wrap, Ordering::Relaxed);
        self.body_traced.store(origin.body_traced, Ordering::Relaxed);
    }

    pub fn get(&self) -> FunctionOrigin {
        FunctionOrigin {
            defining_file: self.defining_file.lock().unwrap().clone(),
            is_app: self.is_app.load(Ordering::Relaxed),
            skip_wrap: self.skip_wrap.load(Ordering::Relaxed),
            body_traced: self.body_traced.load(Ordering::Relaxed),
        }
    }

    pub fn mark_skip_wrap(&self) {
        self.skip_wrap.store(true, Ordering::Relaxed);
    }

    pub fn is_skip_wrap(&self) -> bool {
        self.skip_wrap.load(Ordering::Relaxed)
    }

    pub fn is_body_traced(&self) -> bool {
        self.body_traced.load(Ordering::Relaxed)
    }

    pub fn is_app(&self) -> bool {
        self.is_app.load(Ordering::Relaxed)
    }

    pub fn defining_file(&self) -> Option<String> {
        self.defining_file.lock().unwrap().clone()
    }
}

/// A snapshot of the marks in an [`OriginCell`], as a plain value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionOrigin {
    pub defining_file: Option<String>,
    pub is_app: bool,
    pub skip_wrap: bool,
    pub body_traced: bool,
}
