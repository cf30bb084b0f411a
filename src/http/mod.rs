//! Outbound HTTP with audit logging and 429 handling
//!
//! Every call is recorded as an output request on the caller's
//! [`DetailLog`] and closed with a response (or error) event plus a
//! [`SummaryLog`] block. Calls never fail with `Err`: transport problems
//! come back as a degraded [`HttpResponse`].

pub mod transport;

pub use transport::{BasicAuth, HttpTransport, PreparedRequest, RawResponse, ReqwestTransport};

use crate::error::{Result, TxLogError};
use crate::id::generate_internal_tid;
use crate::log::{DetailLog, SummaryLog};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Length of invocation ids minted for calls without one
pub const INVOKE_LEN: i64 = 20;

/// Description used for every failed call's summary block
pub const CONNECTION_ERROR_DESC: &str = "connection error";

/// Summary code for a retried call whose result was replaced by a placeholder
const DEGRADED_STATUS: &str = "500";

/// Upper bound accepted for a `retry-after` delay
const MAX_RETRY_AFTER_SECS: f64 = 300.0;

/// Parse a `retry-after` value given as integer or decimal seconds.
///
/// Values outside `(0, 300]` and HTTP dates are treated as absent.
pub fn parse_retry_after(header_value: Option<&str>) -> Option<Duration> {
    let value = header_value?.trim();
    let seconds = value.parse::<f64>().ok()?;
    if seconds > 0.0 && seconds <= MAX_RETRY_AFTER_SECS {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}

/// One outbound call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestAttributes {
    /// Target service, logged as the event node
    pub service: String,
    /// Command name, logged as the event command
    pub command: String,
    /// Invocation id; generated when empty
    pub invoke: String,
    /// URL with optional `{key}` or `:key` placeholders
    pub url: String,
    /// HTTP method, `GET` when empty
    pub method: String,
    pub headers: BTreeMap<String, String>,
    /// Placeholder values for `url`
    pub params: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
    /// Status codes treated as success; 2xx when unset
    pub status_success: Option<Vec<u16>>,
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing)]
    pub auth: Option<BasicAuth>,
}

impl RequestAttributes {
    pub fn new(
        service: impl Into<String>,
        command: impl Into<String>,
        method: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            command: command.into(),
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_invoke(mut self, invoke: impl Into<String>) -> Self {
        self.invoke = invoke.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_status_success(mut self, codes: Vec<u16>) -> Self {
        self.status_success = Some(codes);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(BasicAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    fn method(&self) -> String {
        if self.method.is_empty() {
            "GET".to_string()
        } else {
            self.method.to_ascii_uppercase()
        }
    }

    /// URL with `{key}` placeholders resolved first, then `:key`
    pub fn resolved_url(&self) -> String {
        let mut url = self.url.clone();
        for (key, value) in &self.params {
            let braced = format!("{{{}}}", key);
            if url.contains(&braced) {
                url = url.replace(&braced, value);
            } else {
                url = url.replace(&format!(":{}", key), value);
            }
        }
        url
    }

    fn is_success(&self, status: u16) -> bool {
        match &self.status_success {
            Some(codes) => codes.contains(&status),
            None => (200..300).contains(&status),
        }
    }

    fn prepare(&self) -> PreparedRequest {
        PreparedRequest {
            method: self.method(),
            url: self.resolved_url(),
            query: self.query.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            timeout: self.timeout_ms.map(Duration::from_millis),
            auth: self.auth.clone(),
        }
    }
}

/// Result of an outbound call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HttpResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub header: BTreeMap<String, String>,
    pub status: u16,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub status_text: String,
}

impl HttpResponse {
    /// Placeholder `{Status: 500}` returned on fallback paths
    pub fn degraded(status_text: impl Into<String>) -> Self {
        Self {
            status: 500,
            status_text: status_text.into(),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl From<RawResponse> for HttpResponse {
    fn from(raw: RawResponse) -> Self {
        Self {
            body: raw.body,
            header: raw.headers,
            status: raw.status,
            status_text: raw.status_text,
        }
    }
}

/// Per-call state threaded through one request
struct CallContext<'a> {
    attrs: &'a RequestAttributes,
    invoke: String,
    process_log: Value,
}

/// Outbound HTTP client that logs every call
pub struct HttpService {
    transport: Arc<dyn HttpTransport>,
    degraded: AtomicU64,
}

impl std::fmt::Debug for HttpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpService")
            .field("degraded", &self.degraded_count())
            .finish()
    }
}

impl HttpService {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            degraded: AtomicU64::new(0),
        }
    }

    /// Client using [`ReqwestTransport`]
    pub fn with_reqwest() -> Result<Self> {
        Ok(Self::new(Arc::new(ReqwestTransport::new()?)))
    }

    /// Calls whose result was replaced by the `{Status: 500}` placeholder
    /// after a 429 retry without loggers
    pub fn degraded_count(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Send one request.
    ///
    /// A 429 with a usable `retry-after` is retried once after the delay.
    /// Without a detail log the retried result is discarded and a
    /// `{Status: 500}` placeholder is returned; a summary log still gets a
    /// `500` error block for the call.
    pub async fn request_http(
        &self,
        attrs: &RequestAttributes,
        mut detail: Option<&mut DetailLog>,
        mut summary: Option<&mut SummaryLog>,
    ) -> HttpResponse {
        let call = self.begin(attrs, detail.as_deref_mut());
        let prepared = attrs.prepare();

        let first = self.transport.execute(&prepared).await;
        let retry_after = match &first {
            Ok(resp) if resp.status == 429 => parse_retry_after(resp.header("retry-after")),
            _ => None,
        };

        let Some(delay) = retry_after else {
            return Self::finish(&call, first, detail, summary);
        };

        match detail.as_deref_mut() {
            Some(log) => {
                log.add_output_request_retry(
                    &attrs.service,
                    &attrs.command,
                    &call.invoke,
                    &call.process_log.to_string(),
                    call.process_log.clone(),
                    1,
                    1,
                );
                tokio::time::sleep(delay).await;
                let retried = self.transport.execute(&prepared).await;
                Self::finish(&call, retried, Some(log), summary.as_deref_mut())
            }
            None => {
                tokio::time::sleep(delay).await;
                let retried = self.transport.execute(&prepared).await;
                self.degraded.fetch_add(1, Ordering::Relaxed);
                if let Some(log) = summary.as_deref_mut() {
                    log.add_error_block(&attrs.service, &attrs.command, DEGRADED_STATUS, CONNECTION_ERROR_DESC);
                }
                tracing::warn!(
                    service = %attrs.service,
                    command = %attrs.command,
                    invoke = %call.invoke,
                    retry_status = retried.as_ref().map(|r| r.status).ok(),
                    "Retried 429 without detail log, returning placeholder response"
                );
                HttpResponse::degraded("")
            }
        }
    }

    /// Send requests one after another; results keep input order
    pub async fn request_http_batch(
        &self,
        attrs: &[RequestAttributes],
        mut detail: Option<&mut DetailLog>,
        mut summary: Option<&mut SummaryLog>,
    ) -> Vec<HttpResponse> {
        let mut responses = Vec::with_capacity(attrs.len());
        for attr in attrs {
            let response = self
                .request_http(attr, detail.as_deref_mut(), summary.as_deref_mut())
                .await;
            responses.push(response);
        }
        responses
    }

    fn begin<'a>(&self, attrs: &'a RequestAttributes, detail: Option<&mut DetailLog>) -> CallContext<'a> {
        let invoke = if attrs.invoke.is_empty() {
            generate_internal_tid(&attrs.service, "-", INVOKE_LEN)
        } else {
            attrs.invoke.clone()
        };
        let method = attrs.method();
        let process_log = json!({
            "Header": attrs.headers,
            "Url": attrs.resolved_url(),
            "QueryString": attrs.query,
            "Body": attrs.body,
            "Method": method,
        });

        if let Some(log) = detail {
            log.add_output_request(
                &attrs.service,
                &attrs.command,
                &invoke,
                &process_log.to_string(),
                process_log.clone(),
                Some("http"),
                Some(&method),
            );
        }

        CallContext {
            attrs,
            invoke,
            process_log,
        }
    }

    fn finish(
        call: &CallContext<'_>,
        result: Result<RawResponse>,
        detail: Option<&mut DetailLog>,
        summary: Option<&mut SummaryLog>,
    ) -> HttpResponse {
        let attrs = call.attrs;
        match result {
            Ok(raw) => {
                let status = raw.status;
                let response = HttpResponse::from(raw);
                let raw_body = response
                    .body
                    .as_ref()
                    .map(|b| b.to_string())
                    .unwrap_or_default();

                if attrs.is_success(status) {
                    if let Some(log) = detail {
                        let data = serde_json::to_value(&response).unwrap_or(Value::Null);
                        log.add_input_response(&attrs.service, &attrs.command, &call.invoke, &raw_body, data, None);
                    }
                    if let Some(log) = summary {
                        log.add_success_block(&attrs.service, &attrs.command, &status.to_string(), &response.status_text);
                    }
                } else {
                    if let Some(log) = detail {
                        log.add_input_response_error(&attrs.service, &attrs.command, &call.invoke, Some(&raw_body));
                    }
                    if let Some(log) = summary {
                        log.add_error_block(&attrs.service, &attrs.command, &status.to_string(), CONNECTION_ERROR_DESC);
                    }
                }
                response
            }
            Err(err) => {
                let message = err.to_string();
                let code = match err {
                    TxLogError::ConnectionTimeout(_) => "ret=4",
                    _ => "ret=1",
                };
                tracing::warn!(
                    service = %attrs.service,
                    command = %attrs.command,
                    invoke = %call.invoke,
                    error = %message,
                    "Outbound HTTP call failed"
                );
                if let Some(log) = detail {
                    log.add_input_response_error(&attrs.service, &attrs.command, &call.invoke, Some(&message));
                }
                if let Some(log) = summary {
                    log.add_error_block(&attrs.service, &attrs.command, code, CONNECTION_ERROR_DESC);
                }
                HttpResponse::degraded(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use crate::log::AuditLogger;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted results and records every request it sees
    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<RawResponse>>>,
        seen: Mutex<Vec<PreparedRequest>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<RawResponse>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn execute(&self, request: &PreparedRequest) -> Result<RawResponse> {
            self.seen.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(RawResponse::new(200)))
        }
    }

    fn ok(body: Value) -> Result<RawResponse> {
        Ok(RawResponse {
            status: 200,
            status_text: "OK".into(),
            headers: BTreeMap::new(),
            body: Some(body),
        })
    }

    fn logs() -> (DetailLog, SummaryLog) {
        let (logger, _) = AuditLogger::memory(LogConfig::default());
        let logs = logger.common_log("profile", None, None);
        (logs.detail_log, logs.summary_log)
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(Some("5")), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(Some(" 1.5 ")), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_after(Some("300")), Some(Duration::from_secs(300)));
        assert_eq!(parse_retry_after(Some("0")), None);
        assert_eq!(parse_retry_after(Some("301")), None);
        assert_eq!(parse_retry_after(Some("Wed, 21 Oct 2015 07:28:00 GMT")), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn test_url_placeholders() {
        let attrs = RequestAttributes::new("svc", "get", "GET", "http://h/users/{id}/orders/:order")
            .with_param("id", "42")
            .with_param("order", "o-9");
        assert_eq!(attrs.resolved_url(), "http://h/users/42/orders/o-9");
    }

    #[tokio::test]
    async fn test_success_logs_request_and_response() {
        let transport = ScriptedTransport::new(vec![ok(json!({"name": "neo"}))]);
        let service = HttpService::new(transport.clone());
        let (mut detail, mut summary) = logs();

        let attrs = RequestAttributes::new("profile", "get_user", "get", "http://profile/users/{id}")
            .with_param("id", "7")
            .with_query("expand", "true")
            .with_invoke("inv-1");
        let response = service
            .request_http(&attrs, Some(&mut detail), Some(&mut summary))
            .await;

        assert_eq!(response.status, 200);
        assert_eq!(response.body, Some(json!({"name": "neo"})));

        let seen = transport.seen.lock().unwrap()[0].clone();
        assert_eq!(seen.url, "http://profile/users/7");
        assert_eq!(seen.method, "GET");
        assert_eq!(seen.query["expand"], "true");

        let out = &detail.outputs()[0];
        assert_eq!(out.event, "profile.get_user");
        assert_eq!(out.protocol.as_deref(), Some("http.get"));
        let data = out.data.as_ref().unwrap();
        assert_eq!(data["Url"], "http://profile/users/7");
        assert_eq!(data["QueryString"]["expand"], "true");
        assert_eq!(data["Method"], "GET");

        let input = &detail.inputs()[0];
        assert_eq!(input.kind, "res");
        assert_eq!(input.invoke, "inv-1");
        assert!(input.res_time.is_some());

        let block = &summary.blocks()[0];
        assert_eq!(block.node, "profile");
        assert_eq!(block.result[0].result, "200");
        assert_eq!(block.result[0].desc, "OK");
    }

    #[tokio::test]
    async fn test_missing_invoke_is_generated() {
        let transport = ScriptedTransport::new(vec![ok(json!({}))]);
        let service = HttpService::new(transport);
        let (mut detail, _) = logs();

        let attrs = RequestAttributes::new("profile", "get", "GET", "http://profile");
        service.request_http(&attrs, Some(&mut detail), None).await;

        let invoke = &detail.outputs()[0].invoke;
        assert_eq!(invoke.len(), 20);
        assert!(invoke.starts_with("profi-"));
        assert_eq!(&detail.inputs()[0].invoke, invoke);
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_with_logger_retries_once() {
        let transport = ScriptedTransport::new(vec![
            Ok(RawResponse::new(429).with_header("retry-after", "2")),
            ok(json!({"ok": true})),
        ]);
        let service = HttpService::new(transport.clone());
        let (mut detail, mut summary) = logs();

        let attrs = RequestAttributes::new("svc", "cmd", "POST", "http://svc").with_invoke("inv-1");
        let response = service
            .request_http(&attrs, Some(&mut detail), Some(&mut summary))
            .await;

        assert_eq!(transport.calls(), 2);
        assert_eq!(response.status, 200);
        assert_eq!(detail.outputs()[1].kind, "req_retry_1/1");
        assert_eq!(detail.inputs()[0].kind, "res");
        assert_eq!(summary.blocks()[0].result[0].result, "200");
        assert_eq!(service.degraded_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_without_logger_returns_placeholder() {
        let transport = ScriptedTransport::new(vec![
            Ok(RawResponse::new(429).with_header("retry-after", "1")),
            ok(json!({"ok": true})),
        ]);
        let service = HttpService::new(transport.clone());

        let attrs = RequestAttributes::new("svc", "cmd", "GET", "http://svc");
        let response = service.request_http(&attrs, None, None).await;

        assert_eq!(transport.calls(), 2);
        assert_eq!(serde_json::to_value(&response).unwrap(), json!({"Status": 500}));
        assert_eq!(service.degraded_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_with_summary_only_records_degraded_block() {
        let transport = ScriptedTransport::new(vec![
            Ok(RawResponse::new(429).with_header("retry-after", "1")),
            ok(json!({"ok": true})),
        ]);
        let service = HttpService::new(transport.clone());
        let (_, mut summary) = logs();

        let attrs = RequestAttributes::new("svc", "cmd", "GET", "http://svc");
        let response = service.request_http(&attrs, None, Some(&mut summary)).await;

        assert_eq!(transport.calls(), 2);
        assert_eq!(response.status, 500);
        assert_eq!(service.degraded_count(), 1);
        let block = &summary.blocks()[0];
        assert_eq!(block.node, "svc");
        assert_eq!(block.result[0].result, "500");
        assert_eq!(block.result[0].desc, "connection error");
    }

    #[tokio::test]
    async fn test_429_without_retry_after_is_plain_failure() {
        let transport = ScriptedTransport::new(vec![Ok(RawResponse::new(429))]);
        let service = HttpService::new(transport.clone());
        let (mut detail, mut summary) = logs();

        let attrs = RequestAttributes::new("svc", "cmd", "GET", "http://svc");
        let response = service
            .request_http(&attrs, Some(&mut detail), Some(&mut summary))
            .await;

        assert_eq!(transport.calls(), 1);
        assert_eq!(response.status, 429);
        assert_eq!(detail.inputs()[0].kind, "res_error");
        assert_eq!(summary.blocks()[0].result[0].result, "429");
        assert_eq!(summary.blocks()[0].result[0].desc, "connection error");
    }

    #[tokio::test]
    async fn test_transport_errors_are_classified() {
        let transport = ScriptedTransport::new(vec![
            Err(TxLogError::Connection("ECONNREFUSED".into())),
            Err(TxLogError::ConnectionTimeout("deadline".into())),
        ]);
        let service = HttpService::new(transport);
        let (mut detail, mut summary) = logs();

        let attrs = RequestAttributes::new("svc", "cmd", "GET", "http://svc");
        let first = service
            .request_http(&attrs, Some(&mut detail), Some(&mut summary))
            .await;
        let second = service
            .request_http(&attrs, Some(&mut detail), Some(&mut summary))
            .await;

        assert_eq!(first.status, 500);
        assert!(first.status_text.contains("ECONNREFUSED"));
        assert_eq!(second.status, 500);

        let results = &summary.blocks()[0].result;
        assert_eq!(results[0].result, "ret=1");
        assert_eq!(results[0].desc, "connection error");
        assert_eq!(results[1].result, "ret=4");
        assert_eq!(detail.inputs()[0].kind, "res_error");
        assert!(detail.inputs()[0].data.is_none());
    }

    #[tokio::test]
    async fn test_custom_success_codes() {
        let transport = ScriptedTransport::new(vec![ok(json!({}))]);
        let service = HttpService::new(transport);
        let (mut detail, mut summary) = logs();

        let attrs = RequestAttributes::new("svc", "create", "POST", "http://svc")
            .with_status_success(vec![201]);
        service
            .request_http(&attrs, Some(&mut detail), Some(&mut summary))
            .await;

        assert_eq!(detail.inputs()[0].kind, "res_error");
        assert_eq!(summary.blocks()[0].result[0].desc, "connection error");
    }

    #[tokio::test]
    async fn test_batch_is_sequential_and_ordered() {
        let transport = ScriptedTransport::new(vec![ok(json!({"n": 1})), ok(json!({"n": 2}))]);
        let service = HttpService::new(transport.clone());
        let (mut detail, mut summary) = logs();

        let attrs = vec![
            RequestAttributes::new("a", "one", "GET", "http://a"),
            RequestAttributes::new("b", "two", "GET", "http://b"),
        ];
        let responses = service
            .request_http_batch(&attrs, Some(&mut detail), Some(&mut summary))
            .await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].body, Some(json!({"n": 1})));
        assert_eq!(responses[1].body, Some(json!({"n": 2})));

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].url, "http://a");
        assert_eq!(seen[1].url, "http://b");

        assert_ne!(detail.outputs()[0].invoke, detail.outputs()[1].invoke);
        assert_eq!(detail.inputs()[1].invoke, detail.outputs()[1].invoke);
        assert_eq!(summary.blocks().len(), 2);
    }
}
