//! C7: the per-request `tower::Layer`/`Service` pair. Grounded on the
//! teacher's own `tracing-tower-http` (`_tower_http_ref.rs`, kept in this
//! crate as reference while this module was built), updated from its
//! `futures` 0.1 / `tower` 0.1 stack to `tower` 0.4 `Service`/`Layer` + `http`
//! 0.2 + `hyper`/`bytes`, matching what the teacher's own example
//! dev-dependencies already pull in for their tower demos.
//!
//! [`apptrace_core::Scope`] is deliberately `Rc`/`RefCell`-based — spec §5
//! models a single-threaded cooperative runtime, mirroring the host JS
//! engine this SDK actually instruments. [`TraceService::call`] therefore
//! returns a `!Send` future and must be driven from a `tokio::task::LocalSet`
//! on a current-thread runtime, the same way [`crate::dispatch`]'s
//! `tokio::task::spawn_local` calls require one.

use crate::assembler::assemble;
use crate::config::Config;
use crate::sanitize::{sanitize, Caps, RawValue};
use crate::transport::{FlushPayload, Transport};
use apptrace_core::{subscribe, unsubscribe, Scope, Snapshot, SubscriberId, TraceEvent};
use apptrace_subscriber::{CompoundRule, FilterSet};
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Request, Response};
use http_body::Body as HttpBody;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tower::{Layer, Service};

pub const SESSION_HEADER: &str = "x-bug-session-id";
pub const ACTION_HEADER: &str = "x-bug-action-id";
pub const REQUEST_START_HEADER: &str = "x-bug-request-start";

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn sanitized_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or("<binary>").to_string(),
            )
        })
        .collect()
}

fn parse_query(url: &str) -> BTreeMap<String, String> {
    let query = match url.split_once('?') {
        Some((_, q)) => q,
        None => return BTreeMap::new(),
    };
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Per-request state captured between request start and flush. Lives inside
/// an `Arc<Mutex<_>>` so the response-body tap and the bus subscriber
/// callback can both reach it; the `Scope` itself is `Rc`-based and is kept
/// alongside rather than inside the mutex, since it is only ever touched
/// from this request's own task.
struct Collected {
    events: Vec<TraceEvent>,
    entry_point: Option<String>,
    response_body: Option<Bytes>,
    response_content_type: Option<String>,
    last_event_at: u64,
}

#[derive(Clone)]
pub struct RequestSnapshot {
    pub rid: String,
    pub method: String,
    pub url: String,
    pub path: String,
    pub action_id: String,
    pub params: BTreeMap<String, String>,
}

/// Route parameters the host's own router has already resolved (spec §6
/// egress `request.params`). This middleware has no router of its own —
/// generic `tower` `Service`s don't carry path-pattern matches — so it only
/// reads what a router layer placed ahead of it in `Request::extensions`,
/// mirroring how `tower-http`'s `MatchedPath` is threaded through. Absent a
/// router layer that inserts this, `params` ships empty.
#[derive(Debug, Clone, Default)]
pub struct RouteParams(pub BTreeMap<String, String>);

fn sanitize_body_bytes(bytes: &Bytes, content_type: Option<&str>) -> Snapshot {
    let caps = Caps::default();
    let parse_as_json = content_type.map(|ct| ct.contains("application/json")).unwrap_or(false);
    if parse_as_json {
        match serde_json::from_slice::<serde_json::Value>(bytes) {
            Ok(value) => sanitize(&json_to_raw(&value), &caps),
            Err(_) => sanitize(&RawValue::Str(String::from_utf8_lossy(bytes).to_string()), &caps),
        }
    } else {
        sanitize(&RawValue::Str(String::from_utf8_lossy(bytes).to_string()), &caps)
    }
}

fn filter_set(cfg: &Config) -> FilterSet {
    let mut set = FilterSet::default();
    for name in &cfg.disable_function_traces {
        set = set.drop_compound(CompoundRule::by_name(name.clone()));
    }
    for kind in &cfg.disable_function_types {
        set = set.drop_kind(*kind);
    }
    for pattern in &cfg.disable_trace_files {
        set = set.drop_file_pattern(apptrace_subscriber::FilePattern::substring(pattern.clone()));
    }
    set
}

/// Opens a [`Scope`], subscribes to the event bus filtered per the
/// operator's declarative rules, and tracks the request/response snapshot.
/// The returned handle is driven to completion by [`RequestTrace::finish`],
/// called once the response body has fully been observed.
pub struct RequestTrace {
    scope: Scope,
    state: Arc<Mutex<Collected>>,
    subscriber_id: SubscriberId,
    config: Arc<Config>,
    snapshot: RequestSnapshot,
    request_headers: BTreeMap<String, String>,
    request_body: Option<Snapshot>,
    query: BTreeMap<String, String>,
    start_ms: u64,
    clock_skew_ms: i64,
}

impl RequestTrace {
    /// Spec §4.7 "On request start": returns `None` (collecting nothing)
    /// unless both the session and action headers are present (scenario 5
    /// in spec §8). `request_body` is already sanitized by the caller, which
    /// has to buffer the body before `start` can run (this constructor is
    /// synchronous; buffering a generic `http_body::Body` isn't).
    pub fn start(
        config: Arc<Config>,
        headers: &HeaderMap,
        snapshot: RequestSnapshot,
        request_body: Option<Snapshot>,
    ) -> Option<Self> {
        header_str(headers, SESSION_HEADER)?;
        header_str(headers, ACTION_HEADER)?;

        let local_now = now_ms();
        let (scope_id, clock_skew_ms) = match header_str(headers, REQUEST_START_HEADER).and_then(|s| s.parse::<i64>().ok()) {
            Some(client_start) => (client_start.to_string(), client_start - local_now as i64),
            None => (local_now.to_string(), 0),
        };

        let scope = Scope::new(scope_id.clone());
        let state = Arc::new(Mutex::new(Collected {
            events: Vec::new(),
            entry_point: None,
            response_body: None,
            response_content_type: None,
            last_event_at: local_now,
        }));

        let filter = filter_set(&config);
        let state_for_bus = state.clone();
        let subscriber_id = subscribe(move |event: &TraceEvent| {
            if event.scope_id != scope_id {
                return;
            }
            if filter.should_drop(event) {
                return;
            }
            let mut guard = state_for_bus.lock().unwrap();
            if guard.entry_point.is_none() && event.is_enter() && event.file.is_some() {
                guard.entry_point = Some(event.name.clone());
            }
            guard.last_event_at = now_ms();
            guard.events.push(event.clone());
        });

        let request_headers = sanitized_headers(headers);
        let query = parse_query(&snapshot.url);

        Some(RequestTrace {
            scope,
            state,
            subscriber_id,
            config,
            snapshot,
            request_headers,
            request_body,
            query,
            start_ms: local_now,
            clock_skew_ms,
        })
    }

    pub fn scope_id(&self) -> String {
        self.scope.scope_id()
    }

    /// The scope this request's dispatched calls should run under; handed
    /// to [`apptrace_core::Scope::instrument`] so it stays current across
    /// every `.await` in the wrapped service call, not just its synchronous
    /// prefix.
    pub fn scope(&self) -> Scope {
        self.scope.clone()
    }

    pub fn clock_skew_ms(&self) -> i64 {
        self.clock_skew_ms
    }

    pub fn record_response_body(&self, body: Bytes, content_type: Option<String>) {
        let mut guard = self.state.lock().unwrap();
        guard.response_body = Some(body);
        guard.response_content_type = content_type;
    }

    /// Spec §4.7 "On response finish": arms the idle/hard-deadline timers
    /// and flushes once either fires.
    pub async fn finish(self, transport: Arc<Transport>, status: u16) {
        let idle = Duration::from_millis(self.config.idle_flush_ms);
        let hard_deadline = Duration::from_millis(self.config.linger_after_finish_ms.max(self.config.idle_flush_ms));
        let deadline = tokio::time::Instant::now() + hard_deadline;

        loop {
            let last = self.state.lock().unwrap().last_event_at;
            let since_last = now_ms().saturating_sub(last);
            if since_last >= idle.as_millis() as u64 || tokio::time::Instant::now() >= deadline {
                break;
            }
            let remaining_idle = idle.saturating_sub(Duration::from_millis(since_last));
            let remaining_hard = deadline.saturating_duration_since(tokio::time::Instant::now());
            tokio::time::sleep(remaining_idle.min(remaining_hard)).await;
        }

        unsubscribe(self.subscriber_id);
        self.flush(transport, status).await;
    }

    async fn flush(self, transport: Arc<Transport>, status: u16) {
        let scope_id = self.scope.scope_id();
        let (events, entry_point, response_body, response_content_type) = {
            let mut guard = self.state.lock().unwrap();
            (
                std::mem::take(&mut guard.events),
                guard.entry_point.take(),
                guard.response_body.take(),
                guard.response_content_type.take(),
            )
        };

        let resp_body_snapshot =
            response_body.map(|bytes| sanitize_body_bytes(&bytes, response_content_type.as_deref()));

        let batches = assemble(&scope_id, events, 200);
        let t = (now_ms() as i64 + self.clock_skew_ms).max(0) as u64;
        let dur_ms = now_ms().saturating_sub(self.start_ms);

        transport
            .send(
                &scope_id,
                FlushPayload {
                    snapshot: self.snapshot,
                    status,
                    dur_ms,
                    headers: self.request_headers,
                    query: self.query,
                    entry_point,
                    body: self.request_body,
                    resp_body: resp_body_snapshot,
                    batches,
                    t,
                },
            )
            .await;
    }
}

fn json_to_raw(value: &serde_json::Value) -> RawValue {
    match value {
        serde_json::Value::Null => RawValue::Null,
        serde_json::Value::Bool(b) => RawValue::Bool(*b),
        serde_json::Value::Number(n) => RawValue::Number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => RawValue::Str(s.clone()),
        serde_json::Value::Array(items) => RawValue::Array(items.iter().map(json_to_raw).collect()),
        serde_json::Value::Object(map) => {
            RawValue::Object(map.iter().map(|(k, v)| (k.clone(), json_to_raw(v))).collect())
        }
    }
}

/// Drains a generic request body to `Bytes` before handing the request to
/// the inner service, the same buffer-then-forward shape [`TappedBody`] uses
/// on the response side, just run to completion up front rather than tapped
/// chunk-by-chunk as the handler streams it out.
async fn buffer_body<B>(mut body: B) -> Result<Bytes, B::Error>
where
    B: HttpBody<Data = Bytes> + Unpin,
{
    let mut buf = BytesMut::new();
    std::future::poll_fn(|cx| loop {
        match Pin::new(&mut body).poll_data(cx) {
            Poll::Ready(Some(Ok(chunk))) => buf.extend_from_slice(&chunk),
            Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(err)),
            Poll::Ready(None) => return Poll::Ready(Ok(())),
            Poll::Pending => return Poll::Pending,
        }
    })
    .await?;
    Ok(buf.freeze())
}

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_rid() -> String {
    format!("req-{}", REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// `tower::Layer` that installs [`TraceService`] in front of the app's
/// handler service.
#[derive(Clone)]
pub struct TraceLayer {
    config: Arc<Config>,
    transport: Arc<Transport>,
}

impl TraceLayer {
    pub fn new(config: Arc<Config>, transport: Arc<Transport>) -> Self {
        TraceLayer { config, transport }
    }
}

impl<S> Layer<S> for TraceLayer {
    type Service = TraceService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TraceService {
            inner,
            config: self.config.clone(),
            transport: self.transport.clone(),
        }
    }
}

#[derive(Clone)]
pub struct TraceService<S> {
    inner: S,
    config: Arc<Config>,
    transport: Arc<Transport>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for TraceService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + 'static,
    S::Future: 'static,
    S::Error: 'static,
    ReqBody: HttpBody<Data = Bytes> + From<Bytes> + Unpin + 'static,
    ReqBody::Error: 'static,
    ResBody: HttpBody<Data = Bytes> + 'static,
    ResBody::Error: 'static,
{
    type Response = Response<TappedBody<ResBody>>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let headers = req.headers().clone();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let url = req.uri().to_string();
        let action_id = header_str(&headers, ACTION_HEADER).unwrap_or_default().to_string();
        let params = req.extensions().get::<RouteParams>().cloned().unwrap_or_default().0;
        let request_content_type = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let snapshot = RequestSnapshot {
            rid: next_rid(),
            method,
            url,
            path,
            action_id,
            params,
        };

        let config = self.config.clone();
        let transport = self.transport.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body_bytes = buffer_body(body).await.unwrap_or_default();
            let request_body_snapshot = if body_bytes.is_empty() {
                None
            } else {
                Some(sanitize_body_bytes(&body_bytes, request_content_type.as_deref()))
            };
            let req = Request::from_parts(parts, ReqBody::from(body_bytes));

            let trace = RequestTrace::start(config, &headers, snapshot, request_body_snapshot);

            let resp = match &trace {
                // Spec §4.7 step 3: everything the handler calls — and
                // everything it calls in turn, across every `.await` —
                // runs with this request's scope current, so dispatched
                // calls land their spans under the right scope id.
                Some(t) => t.scope().instrument(inner.call(req)).await?,
                None => inner.call(req).await?,
            };
            let (parts, body) = resp.into_parts();
            let content_type = parts
                .headers
                .get(http::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let status = parts.status.as_u16();

            let tapped = TappedBody::new(body, trace, content_type, status, transport);
            Ok(Response::from_parts(parts, tapped))
        })
    }
}

/// Wraps a response body, accumulating every chunk so the full body can be
/// sanitized and attached to the flush payload once streaming completes
/// (spec §4.7 step 3: "the final body is captured regardless of shape").
pub struct TappedBody<B> {
    inner: B,
    buffer: BytesMut,
    trace: Option<RequestTrace>,
    content_type: Option<String>,
    status: u16,
    transport: Arc<Transport>,
    finished: bool,
}

impl<B> TappedBody<B> {
    fn new(
        inner: B,
        trace: Option<RequestTrace>,
        content_type: Option<String>,
        status: u16,
        transport: Arc<Transport>,
    ) -> Self {
        TappedBody {
            inner,
            buffer: BytesMut::new(),
            trace,
            content_type,
            status,
            transport,
            finished: false,
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(trace) = self.trace.take() {
            trace.record_response_body(self.buffer.clone().freeze(), self.content_type.clone());
            let transport = self.transport.clone();
            let status = self.status;
            tokio::task::spawn_local(async move {
                trace.finish(transport, status).await;
            });
        }
    }
}

impl<B> HttpBody for TappedBody<B>
where
    B: HttpBody<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_data(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_data(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.buffer.extend_from_slice(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn poll_trailers(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        Pin::new(&mut self.inner).poll_trailers(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_with(session: Option<&str>, action: Option<&str>, start: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(s) = session {
            h.insert(SESSION_HEADER, HeaderValue::from_str(s).unwrap());
        }
        if let Some(a) = action {
            h.insert(ACTION_HEADER, HeaderValue::from_str(a).unwrap());
        }
        if let Some(s) = start {
            h.insert(REQUEST_START_HEADER, HeaderValue::from_str(s).unwrap());
        }
        h
    }

    fn snapshot() -> RequestSnapshot {
        RequestSnapshot {
            rid: "r1".to_string(),
            method: "GET".to_string(),
            url: "/widgets?active=true".to_string(),
            path: "/widgets".to_string(),
            action_id: "a1".to_string(),
            params: BTreeMap::new(),
        }
    }

    #[test]
    fn missing_session_header_skips_collection() {
        let cfg = Arc::new(crate::config::ConfigBuilder::new().build().unwrap());
        let headers = headers_with(None, Some("a1"), None);
        assert!(RequestTrace::start(cfg, &headers, snapshot(), None).is_none());
    }

    #[test]
    fn missing_action_header_skips_collection() {
        let cfg = Arc::new(crate::config::ConfigBuilder::new().build().unwrap());
        let headers = headers_with(Some("s1"), None, None);
        assert!(RequestTrace::start(cfg, &headers, snapshot(), None).is_none());
    }

    #[test]
    fn present_headers_open_a_scope_and_derive_scope_id_from_request_start() {
        let cfg = Arc::new(crate::config::ConfigBuilder::new().build().unwrap());
        let headers = headers_with(Some("s1"), Some("a1"), Some("1000"));
        let trace = RequestTrace::start(cfg, &headers, snapshot(), None).unwrap();
        assert_eq!(trace.scope_id(), "1000");
        unsubscribe(trace.subscriber_id);
    }

    #[test]
    fn query_string_is_parsed_from_the_request_url() {
        let cfg = Arc::new(crate::config::ConfigBuilder::new().build().unwrap());
        let headers = headers_with(Some("s1"), Some("a1"), None);
        let trace = RequestTrace::start(cfg, &headers, snapshot(), None).unwrap();
        assert_eq!(trace.query.get("active").map(String::as_str), Some("true"));
        unsubscribe(trace.subscriber_id);
    }

    #[test]
    fn request_body_snapshot_is_stored_verbatim() {
        let cfg = Arc::new(crate::config::ConfigBuilder::new().build().unwrap());
        let headers = headers_with(Some("s1"), Some("a1"), None);
        let body_snapshot = sanitize_body_bytes(&Bytes::from_static(b"{\"active\":true}"), Some("application/json"));
        let trace = RequestTrace::start(cfg, &headers, snapshot(), Some(body_snapshot)).unwrap();
        assert!(trace.request_body.is_some());
        unsubscribe(trace.subscriber_id);
    }
}
