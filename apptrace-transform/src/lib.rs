//! C1 (transformer), C2 (module interceptor), and C3 (origin tagger):
//! rewrites loaded application source so every function body and call site
//! routes through the apptrace dispatcher, and tags the resulting export
//! values with origin metadata the dispatcher reads at call time.

pub mod error;
pub mod interceptor;
pub mod lexer;
pub mod origin;
pub mod parser;
pub mod rewrite;

pub use error::TransformError;
pub use interceptor::{
    default_is_app_classifier, InMemoryLoader, Interceptor, LoadResult, ModuleLoader, ScopeMatcher,
};
pub use origin::{ExportValue, OriginTagger};
pub use parser::{CallSite, FunctionSite, ParsedModule, ReturnStmt};
pub use rewrite::{DefaultTransformer, HookNames, SourceTransform, TransformConfig, TransformMeta, WRAPPED_SENTINEL};
