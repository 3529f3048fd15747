//! §6 configuration: the bulk of the `TRACE_*` environment knobs deserialize
//! through `envy::prefixed`, straight off its own documented usage; the
//! include/exclude pattern lists and other structured knobs that don't map
//! cleanly onto scalar env vars are set through [`ConfigBuilder`] instead.

use crate::error::CollectorError;
use apptrace_core::FunctionKind;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Trace,
    V8,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Trace
    }
}

/// Mirrors the `TRACE_*` environment variables from spec §6. Deserialized by
/// `envy::prefixed("TRACE_")`, so field names here are the lowercase,
/// underscored form of the suffix after `TRACE_`.
#[derive(Debug, Deserialize, Default)]
struct EnvConfig {
    mode: Option<String>,
    #[serde(default)]
    quiet: bool,
    #[serde(default)]
    debug_unawaited: bool,
    linger_after_finish_ms: Option<u64>,
    idle_flush_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub instrument: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub parser_plugins: Vec<String>,
    pub mode: Mode,
    pub sampling_ms: Option<u64>,
    pub wrap_getters_setters: bool,
    pub skip_anonymous: bool,
    pub allow_fns: Option<Vec<String>>,
    pub disable_function_traces: Vec<String>,
    pub disable_function_types: Vec<FunctionKind>,
    pub disable_trace_files: Vec<String>,
    pub log_function_calls: bool,
    pub trace_interceptors: bool,
    pub quiet: bool,
    pub debug_unawaited: bool,
    pub linger_after_finish_ms: u64,
    pub idle_flush_ms: u64,
    pub api_base: String,
    pub app_id: String,
    pub app_secret: String,
    pub tenant_id: String,
    pub app_name: Option<String>,
}

pub struct ConfigBuilder {
    instrument: bool,
    include: Vec<String>,
    exclude: Vec<String>,
    parser_plugins: Vec<String>,
    mode: Mode,
    sampling_ms: Option<u64>,
    wrap_getters_setters: bool,
    skip_anonymous: bool,
    allow_fns: Option<Vec<String>>,
    disable_function_traces: Vec<String>,
    disable_function_types: Vec<FunctionKind>,
    disable_trace_files: Vec<String>,
    log_function_calls: bool,
    trace_interceptors: bool,
    api_base: String,
    app_id: String,
    app_secret: String,
    tenant_id: String,
    app_name: Option<String>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        ConfigBuilder {
            instrument: true,
            include: Vec::new(),
            exclude: vec![r"(^|/)node_modules/".to_string()],
            parser_plugins: Vec::new(),
            mode: Mode::default(),
            sampling_ms: None,
            wrap_getters_setters: false,
            skip_anonymous: false,
            allow_fns: None,
            disable_function_traces: Vec::new(),
            disable_function_types: Vec::new(),
            disable_trace_files: Vec::new(),
            log_function_calls: false,
            trace_interceptors: false,
            api_base: String::new(),
            app_id: String::new(),
            app_secret: String::new(),
            tenant_id: String::new(),
            app_name: None,
        }
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder::default()
    }

    pub fn instrument(mut self, value: bool) -> Self {
        self.instrument = value;
        self
    }

    pub fn include(mut self, patterns: impl IntoIterator<Item = String>) -> Self {
        self.include = patterns.into_iter().collect();
        self
    }

    pub fn exclude(mut self, patterns: impl IntoIterator<Item = String>) -> Self {
        self.exclude = patterns.into_iter().collect();
        self
    }

    pub fn parser_plugins(mut self, plugins: impl IntoIterator<Item = String>) -> Self {
        self.parser_plugins = plugins.into_iter().collect();
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn sampling_ms(mut self, ms: u64) -> Self {
        self.sampling_ms = Some(ms);
        self
    }

    pub fn wrap_getters_setters(mut self, value: bool) -> Self {
        self.wrap_getters_setters = value;
        self
    }

    pub fn skip_anonymous(mut self, value: bool) -> Self {
        self.skip_anonymous = value;
        self
    }

    pub fn allow_fns(mut self, patterns: impl IntoIterator<Item = String>) -> Self {
        self.allow_fns = Some(patterns.into_iter().collect());
        self
    }

    pub fn disable_function_traces(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.disable_function_traces = names.into_iter().collect();
        self
    }

    pub fn disable_function_types(mut self, kinds: impl IntoIterator<Item = FunctionKind>) -> Self {
        self.disable_function_types = kinds.into_iter().collect();
        self
    }

    pub fn disable_trace_files(mut self, patterns: impl IntoIterator<Item = String>) -> Self {
        self.disable_trace_files = patterns.into_iter().collect();
        self
    }

    pub fn log_function_calls(mut self, value: bool) -> Self {
        self.log_function_calls = value;
        self
    }

    pub fn trace_interceptors(mut self, value: bool) -> Self {
        self.trace_interceptors = value;
        self
    }

    pub fn api_base(mut self, value: impl Into<String>) -> Self {
        self.api_base = value.into();
        self
    }

    pub fn app_id(mut self, value: impl Into<String>) -> Self {
        self.app_id = value.into();
        self
    }

    pub fn app_secret(mut self, value: impl Into<String>) -> Self {
        self.app_secret = value.into();
        self
    }

    pub fn tenant_id(mut self, value: impl Into<String>) -> Self {
        self.tenant_id = value.into();
        self
    }

    pub fn app_name(mut self, value: impl Into<String>) -> Self {
        self.app_name = Some(value.into());
        self
    }

    /// Reads the `TRACE_*` env vars and combines them with whatever was set
    /// on the builder so far.
    pub fn build(self) -> Result<Config, CollectorError> {
        let env: EnvConfig = envy::prefixed("TRACE_")
            .from_env()
            .map_err(|e| CollectorError::Config(e.to_string()))?;

        let mode = match env.mode.as_deref() {
            Some("v8") => Mode::V8,
            Some("trace") | None => self.mode,
            Some(other) => return Err(CollectorError::Config(format!("unknown TRACE_MODE: {other}"))),
        };

        Ok(Config {
            instrument: self.instrument,
            include: self.include,
            exclude: self.exclude,
            parser_plugins: self.parser_plugins,
            mode,
            sampling_ms: self.sampling_ms,
            wrap_getters_setters: self.wrap_getters_setters,
            skip_anonymous: self.skip_anonymous,
            allow_fns: self.allow_fns,
            disable_function_traces: self.disable_function_traces,
            disable_function_types: self.disable_function_types,
            disable_trace_files: self.disable_trace_files,
            log_function_calls: self.log_function_calls,
            trace_interceptors: self.trace_interceptors,
            quiet: env.quiet,
            debug_unawaited: env.debug_unawaited,
            linger_after_finish_ms: env.linger_after_finish_ms.unwrap_or(1_000),
            idle_flush_ms: env.idle_flush_ms.unwrap_or(2_000),
            api_base: self.api_base,
            app_id: self.app_id,
            app_secret: self.app_secret,
            tenant_id: self.tenant_id,
            app_name: self.app_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_exclude_node_modules() {
        let builder = ConfigBuilder::new();
        assert!(builder.exclude.iter().any(|p| p.contains("node_modules")));
    }

    #[test]
    fn builder_sets_egress_identity_fields() {
        let cfg = ConfigBuilder::new()
            .api_base("https://ingest.example.com")
            .app_id("app-1")
            .app_secret("secret")
            .tenant_id("tenant-1")
            .build()
            .unwrap();
        assert_eq!(cfg.api_base, "https://ingest.example.com");
        assert_eq!(cfg.app_id, "app-1");
        assert_eq!(cfg.linger_after_finish_ms, 1_000);
        assert_eq!(cfg.idle_flush_ms, 2_000);
    }
}
