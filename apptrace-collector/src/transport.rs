//! Egress (spec §6): ships one request-snapshot payload plus one or more
//! trace-batch payloads per flush to `{apiBase}/v1/sessions/{sessionId}/backend`.
//!
//! Grounded on `reqwest::Client` the way the pack's `prisma-prisma-engines`
//! and `clockworklabs-SpacetimeDB` examples use it for outbound HTTP — the
//! teacher itself has no outbound HTTP client to borrow from for this
//! specific concern (`SPEC_FULL.md` §3).

use crate::assembler::Batch;
use crate::config::Config;
use crate::middleware::RequestSnapshot;
use apptrace_core::Snapshot;
use serde::Serialize;
use std::sync::Arc;

/// One element of the `entries` array in the egress body (spec §6
/// "Egress format"). Only one of `request`/`trace`+`traceBatch` is ever
/// populated per entry — the request snapshot ships as its own entry, and
/// each trace batch ships as a separate entry carrying the serialized event
/// array as a JSON string.
#[derive(Debug, Serialize)]
struct Entry {
    #[serde(rename = "actionId")]
    action_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    request: Option<RequestEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace: Option<String>,
    #[serde(rename = "traceBatch", skip_serializing_if = "Option::is_none")]
    trace_batch: Option<TraceBatchMeta>,
    t: u64,
}

#[derive(Debug, Serialize)]
struct RequestEntry {
    rid: String,
    method: String,
    url: String,
    path: String,
    status: u16,
    #[serde(rename = "durMs")]
    dur_ms: u64,
    headers: std::collections::BTreeMap<String, String>,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Snapshot>,
    params: std::collections::BTreeMap<String, String>,
    query: std::collections::BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "respBody")]
    resp_body: Option<Snapshot>,
    #[serde(rename = "entryPoint", skip_serializing_if = "Option::is_none")]
    entry_point: Option<String>,
}

#[derive(Debug, Serialize)]
struct TraceBatchMeta {
    rid: String,
    index: usize,
    total: usize,
}

#[derive(Debug, Serialize)]
struct Envelope {
    entries: Vec<Entry>,
}

/// Everything [`RequestTrace::flush`](crate::middleware::RequestTrace)
/// needs to know to build and send one flush's worth of payloads.
pub struct FlushPayload {
    pub snapshot: RequestSnapshot,
    pub status: u16,
    pub dur_ms: u64,
    pub headers: std::collections::BTreeMap<String, String>,
    pub query: std::collections::BTreeMap<String, String>,
    pub entry_point: Option<String>,
    pub body: Option<Snapshot>,
    pub resp_body: Option<Snapshot>,
    pub batches: Vec<Batch>,
    pub t: u64,
}

/// The outbound HTTP client (spec §6 "Headers (outbound)" and "Egress
/// format"). Transport errors are swallowed per spec §7: no retry, no
/// buffer-to-disk, and a failed POST never reaches the caller.
pub struct Transport {
    client: reqwest::Client,
    config: Arc<Config>,
}

impl Transport {
    pub fn new(config: Arc<Config>) -> Self {
        Transport {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn url(&self, session_id: &str) -> String {
        format!(
            "{}/v1/sessions/{}/backend",
            self.config.api_base.trim_end_matches('/'),
            session_id
        )
    }

    fn build_entries(payload: &FlushPayload) -> Vec<Entry> {
        let mut entries = Vec::with_capacity(1 + payload.batches.len());
        entries.push(Entry {
            action_id: payload.snapshot.action_id.clone(),
            request: Some(RequestEntry {
                rid: payload.snapshot.rid.clone(),
                method: payload.snapshot.method.clone(),
                url: payload.snapshot.url.clone(),
                path: payload.snapshot.path.clone(),
                status: payload.status,
                dur_ms: payload.dur_ms,
                headers: payload.headers.clone(),
                key: payload.snapshot.action_id.clone(),
                body: payload.body.clone(),
                params: payload.snapshot.params.clone(),
                query: payload.query.clone(),
                resp_body: payload.resp_body.clone(),
                entry_point: payload.entry_point.clone(),
            }),
            trace: None,
            trace_batch: None,
            t: payload.t,
        });

        for batch in &payload.batches {
            let trace_json = serde_json::to_string(&batch.events).unwrap_or_else(|_| "[]".to_string());
            entries.push(Entry {
                action_id: payload.snapshot.action_id.clone(),
                request: None,
                trace: Some(trace_json),
                trace_batch: Some(TraceBatchMeta {
                    rid: payload.snapshot.rid.clone(),
                    index: batch.chunk_index,
                    total: batch.total_chunks,
                }),
                t: payload.t,
            });
        }
        entries
    }

    /// Spec §4.7 "Flush": sends the request snapshot and every trace batch
    /// in one POST. Any failure (network, non-2xx, serialization) is
    /// swallowed per spec §7 — the caller never learns of it.
    pub async fn send(&self, session_id: &str, payload: FlushPayload) {
        if self.config.api_base.is_empty() {
            return;
        }
        let entries = Self::build_entries(&payload);
        let mut request = self
            .client
            .post(self.url(session_id))
            .header("Content-Type", "application/json")
            .header("X-App-Id", self.config.app_id.clone())
            .header("X-App-Secret", self.config.app_secret.clone())
            .header("X-Tenant-Id", self.config.tenant_id.clone());
        if let Some(name) = &self.config.app_name {
            request = request.header("X-App-Name", name.clone());
        }
        let result = request.json(&Envelope { entries }).send().await;
        if let Err(err) = result {
            if !self.config.quiet {
                eprintln!("apptrace: flush POST failed, dropping batch: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::Batch;
    use apptrace_core::{FunctionKind, Phase, SpanId, TraceEvent};

    fn sample_snapshot() -> RequestSnapshot {
        RequestSnapshot {
            rid: "req-1".to_string(),
            method: "GET".to_string(),
            url: "/widgets".to_string(),
            path: "/widgets".to_string(),
            action_id: "action-1".to_string(),
            params: Default::default(),
        }
    }

    fn sample_event() -> TraceEvent {
        TraceEvent {
            phase: Phase::Enter,
            t: 0,
            name: "f".into(),
            file: None,
            line: None,
            kind: FunctionKind::Function,
            scope_id: "s".into(),
            depth: 1,
            span_id: SpanId::from_u64(1),
            parent_span_id: None,
            args: None,
            result: None,
            error: None,
            threw: false,
            unawaited: false,
        }
    }

    #[test]
    fn builds_one_request_entry_and_one_entry_per_batch() {
        let payload = FlushPayload {
            snapshot: sample_snapshot(),
            status: 200,
            dur_ms: 12,
            headers: Default::default(),
            query: Default::default(),
            entry_point: Some("handleWidgets".to_string()),
            body: None,
            resp_body: None,
            batches: vec![
                Batch {
                    scope_id: "s".to_string(),
                    chunk_index: 0,
                    total_chunks: 2,
                    events: vec![sample_event()],
                },
                Batch {
                    scope_id: "s".to_string(),
                    chunk_index: 1,
                    total_chunks: 2,
                    events: vec![sample_event()],
                },
            ],
            t: 1000,
        };

        let entries = Transport::build_entries(&payload);
        assert_eq!(entries.len(), 3);
        assert!(entries[0].request.is_some());
        assert!(entries[0].trace.is_none());
        assert!(entries[1].trace.is_some());
        assert_eq!(entries[1].trace_batch.as_ref().unwrap().index, 0);
        assert_eq!(entries[2].trace_batch.as_ref().unwrap().index, 1);
        assert!(entries.iter().all(|e| e.action_id == "action-1"));
    }
}
