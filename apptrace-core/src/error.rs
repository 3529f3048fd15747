use thiserror::Error;

/// Errors raised by the scope engine itself.
///
/// These are programmer-error conditions (a mismatched enter/exit pair, a
/// fork requested with no active scope) rather than anything a caller should
/// expect to hit in normal operation — per the tracing specification's error
/// handling design, the dispatcher and middleware never let these escape to
/// user-visible behavior; they are swallowed and logged at the call site.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("exit called with no span on the stack")]
    EmptyStack,

    #[error("exit span id {expected} did not match top-of-stack span id {found}")]
    SpanMismatch { expected: u64, found: u64 },

    #[error("no scope is active on this thread")]
    NoActiveScope,
}
