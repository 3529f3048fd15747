use thiserror::Error;

/// Errors raised while rewriting a single module's source.
///
/// Per spec §7, the caller (the module interceptor, §4.2) always swallows
/// these: a transform error falls back to loading the untransformed source
/// rather than failing the load.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("unterminated string literal starting at byte {0}")]
    UnterminatedString(usize),

    #[error("unterminated template literal starting at byte {0}")]
    UnterminatedTemplate(usize),

    #[error("unterminated block comment starting at byte {0}")]
    UnterminatedComment(usize),

    #[error("unbalanced braces: {open} open brace(s) never closed")]
    UnbalancedBraces { open: usize },

    #[error("malformed source map: {0}")]
    SourceMap(String),
}
