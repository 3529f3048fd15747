use thiserror::Error;

/// Spec §7: every failure mode here is swallowed by the caller (the
/// middleware never fails a request over a collection problem); this enum
/// exists so the swallowing happens at one well-defined boundary instead of
/// being silent everywhere.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("invalid include/exclude pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
