//! Per-transaction event recorder
//!
//! A `DetailLog` collects every inbound and outbound call of one scenario
//! with masked payloads, pairs requests with responses by invocation id,
//! and emits a single record when the transaction ends.

use super::{timestamp, Shared};
use crate::error::{Result, TxLogError};
use crate::log::sink::LogKind;
use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Event type of a request entry
pub const TYPE_REQUEST: &str = "req";
/// Event type of a successful response entry
pub const TYPE_RESPONSE: &str = "res";
/// Event type of a failed response entry
pub const TYPE_RESPONSE_ERROR: &str = "res_error";

/// One recorded input or output event
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct InputOutput {
    pub invoke: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub res_time: Option<String>,
}

/// Detail audit log for one transaction scenario.
///
/// Lifecycle is `Open -> Ended`, and `Ended -> Open` only through
/// [`DetailLog::new_scenario`]. Calling [`DetailLog::end`] on an ended
/// log is a usage error.
pub struct DetailLog {
    shared: Arc<Shared>,
    session: String,
    init_invoke: String,
    scenario: String,
    identity: String,
    opened_at: Option<Instant>,
    input_time: Option<DateTime<Local>>,
    output_time: Option<DateTime<Local>>,
    pending: HashMap<String, Instant>,
    input: Vec<InputOutput>,
    output: Vec<InputOutput>,
}

impl std::fmt::Debug for DetailLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetailLog")
            .field("session", &self.session)
            .field("init_invoke", &self.init_invoke)
            .field("scenario", &self.scenario)
            .field("ended", &self.is_end())
            .field("input", &self.input.len())
            .field("output", &self.output.len())
            .finish()
    }
}

impl DetailLog {
    pub(crate) fn open(
        shared: Arc<Shared>,
        session: String,
        init_invoke: String,
        scenario: String,
        identity: String,
    ) -> Self {
        Self {
            shared,
            session,
            init_invoke,
            scenario,
            identity,
            opened_at: Some(Instant::now()),
            input_time: None,
            output_time: None,
            pending: HashMap::new(),
            input: Vec::new(),
            output: Vec::new(),
        }
    }

    /// Reopen for a new scenario, keeping session and identity
    pub fn new_scenario(&mut self, scenario: impl Into<String>) -> &mut Self {
        self.clear();
        self.scenario = scenario.into();
        self.opened_at = Some(Instant::now());
        self
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn init_invoke(&self) -> &str {
        &self.init_invoke
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Input events recorded since the log was opened
    pub fn inputs(&self) -> &[InputOutput] {
        &self.input
    }

    /// Output events recorded since the log was opened
    pub fn outputs(&self) -> &[InputOutput] {
        &self.output
    }

    /// Number of outbound calls still waiting for a response
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// True once [`end`](Self::end) has run and before the log is reopened
    pub fn is_end(&self) -> bool {
        self.opened_at.is_none()
    }

    /// Record an inbound request.
    ///
    /// `req` is a request-shaped object (`deviceInfo`, `session`, `userId`,
    /// `hostname`, `ip`, `params`, `query`, `body`, `protocol`, `method`).
    /// It is normalized to `{headers, params, query, body}`; when none of
    /// those are present the raw object is logged instead. An empty
    /// `invoke` falls back to the log's init invoke.
    pub fn add_input_request(
        &mut self,
        node: &str,
        cmd: &str,
        invoke: &str,
        req: &Value,
    ) -> &mut Self {
        let invoke = if invoke.is_empty() {
            self.init_invoke.clone()
        } else {
            invoke.to_string()
        };

        let data = normalize_request(req).unwrap_or_else(|| req.clone());
        let protocol = build_protocol(
            req.get("protocol").and_then(Value::as_str),
            req.get("method").and_then(Value::as_str),
        );

        self.add_input(node, cmd, invoke, TYPE_REQUEST, None, Some(data), None, protocol);
        self
    }

    /// Record a response to an earlier outbound call.
    ///
    /// An explicit `res_time_ms` wins over the measured time; either way the
    /// pending timer for `invoke` is consumed.
    pub fn add_input_response(
        &mut self,
        node: &str,
        cmd: &str,
        invoke: &str,
        raw_data: &str,
        data: Value,
        res_time_ms: Option<u64>,
    ) -> &mut Self {
        self.add_input(
            node,
            cmd,
            invoke.to_string(),
            TYPE_RESPONSE,
            Some(raw_data),
            Some(data),
            res_time_ms,
            None,
        );
        self
    }

    /// Record a failed response; no data payload is kept
    pub fn add_input_response_error(
        &mut self,
        node: &str,
        cmd: &str,
        invoke: &str,
        raw_data: Option<&str>,
    ) -> &mut Self {
        self.add_input(
            node,
            cmd,
            invoke.to_string(),
            TYPE_RESPONSE_ERROR,
            raw_data,
            None,
            None,
            None,
        );
        self
    }

    /// Record an outbound request and start its response timer
    #[allow(clippy::too_many_arguments)]
    pub fn add_output_request(
        &mut self,
        node: &str,
        cmd: &str,
        invoke: &str,
        raw_data: &str,
        data: Value,
        protocol: Option<&str>,
        method: Option<&str>,
    ) -> &mut Self {
        let protocol = build_protocol(protocol, method);
        self.add_output(node, cmd, invoke, TYPE_REQUEST.to_string(), raw_data, data, protocol);
        self
    }

    /// Record an outbound response (this service answering its caller)
    pub fn add_output_response(
        &mut self,
        node: &str,
        cmd: &str,
        invoke: &str,
        raw_data: &str,
        data: Value,
    ) -> &mut Self {
        self.add_output(node, cmd, invoke, TYPE_RESPONSE.to_string(), raw_data, data, None);
        self
    }

    /// Record a retried outbound request as `req_retry_<attempt>/<max>`.
    ///
    /// The response timer for `invoke` restarts from now.
    #[allow(clippy::too_many_arguments)]
    pub fn add_output_request_retry(
        &mut self,
        node: &str,
        cmd: &str,
        invoke: &str,
        raw_data: &str,
        data: Value,
        attempt: u32,
        max_attempts: u32,
    ) -> &mut Self {
        let kind = format!("req_retry_{}/{}", attempt, max_attempts);
        self.add_output(node, cmd, invoke, kind, raw_data, data, None);
        self
    }

    /// Close the log and write its record to the configured sinks.
    ///
    /// Returns [`TxLogError::DetailEnded`] if the log is already closed.
    /// On success the instance is cleared and reports `is_end() == true`.
    pub fn end(&mut self) -> Result<()> {
        let opened_at = self.opened_at.ok_or(TxLogError::DetailEnded)?;

        let processing_time = format!("{} ms", opened_at.elapsed().as_millis());
        let input_timestamp = self.input_time.map(timestamp);
        let output_timestamp = self.output_time.map(timestamp);
        let output = if self.output_time.is_some() {
            std::mem::take(&mut self.output)
        } else {
            Vec::new()
        };

        let record = json!({
            "systemTimestamp": input_timestamp,
            "logType": "Detail",
            "logLevel": "INFO",
            "namespace": self.shared.config.namespace,
            "containerId": self.shared.host,
            "applicationName": self.shared.config.project_name,
            "detail": {
                "LogType": "Detail",
                "Host": self.shared.host,
                "AppName": self.shared.config.project_name,
                "Instance": std::process::id(),
                "Session": self.session,
                "InitInvoke": self.init_invoke,
                "Scenario": self.scenario,
                "Identity": self.identity,
                "InputTimeStamp": input_timestamp,
                "Input": self.input,
                "OutputTimeStamp": output_timestamp,
                "Output": output,
                "ProcessingTime": processing_time,
            }
        });

        let line = serde_json::to_string(&record)?;
        self.shared.write(LogKind::Detail, &line);

        tracing::debug!(
            session = %self.session,
            scenario = %self.scenario,
            processing_time = %processing_time,
            "Detail log ended"
        );

        self.clear();
        Ok(())
    }

    fn clear(&mut self) {
        self.input.clear();
        self.output.clear();
        self.pending.clear();
        self.input_time = None;
        self.output_time = None;
        self.opened_at = None;
    }

    fn accepts_events(&self, node: &str, cmd: &str) -> bool {
        if self.is_end() {
            self.shared.record_dropped_event();
            tracing::warn!(
                session = %self.session,
                event = %format!("{}.{}", node, cmd),
                "Event recorded on an ended detail log was dropped"
            );
            return false;
        }
        true
    }

    fn mask_raw(&self, raw_data: Option<&str>) -> Option<String> {
        if !self.shared.config.detail.raw_data {
            return None;
        }
        raw_data
            .filter(|raw| !raw.is_empty())
            .map(|raw| self.shared.masking.apply_raw(raw))
    }

    fn mask_data(&self, data: Option<Value>) -> Option<Value> {
        data.filter(|d| !d.is_null())
            .map(|d| self.shared.masking.apply(&d))
    }

    #[allow(clippy::too_many_arguments)]
    fn add_input(
        &mut self,
        node: &str,
        cmd: &str,
        invoke: String,
        kind: &str,
        raw_data: Option<&str>,
        data: Option<Value>,
        res_time_ms: Option<u64>,
        protocol: Option<String>,
    ) {
        if !self.accepts_events(node, cmd) {
            return;
        }

        let now = Instant::now();
        self.input_time = Some(Local::now());

        let res_time = match res_time_ms {
            Some(ms) => {
                self.pending.remove(&invoke);
                Some(format!("{} ms", ms))
            }
            None if kind.starts_with(TYPE_RESPONSE) => self
                .pending
                .remove(&invoke)
                .map(|started| format!("{} ms", now.duration_since(started).as_millis())),
            None => None,
        };

        let entry = InputOutput {
            event: format!("{}.{}", node, cmd),
            protocol,
            kind: kind.to_string(),
            raw_data: self.mask_raw(raw_data),
            data: self.mask_data(data),
            res_time,
            invoke,
        };
        self.input.push(entry);
    }

    fn add_output(
        &mut self,
        node: &str,
        cmd: &str,
        invoke: &str,
        kind: String,
        raw_data: &str,
        data: Value,
        protocol: Option<String>,
    ) {
        if !self.accepts_events(node, cmd) {
            return;
        }

        self.output_time = Some(Local::now());
        if !invoke.is_empty() && kind != TYPE_RESPONSE {
            self.pending.insert(invoke.to_string(), Instant::now());
        }

        let entry = InputOutput {
            invoke: invoke.to_string(),
            event: format!("{}.{}", node, cmd),
            protocol,
            kind,
            raw_data: self.mask_raw(Some(raw_data)),
            data: self.mask_data(Some(data)),
            res_time: None,
        };
        self.output.push(entry);
    }
}

/// `{headers, params, query, body}` view of a request-shaped object, or
/// `None` when it carries none of those parts
fn normalize_request(req: &Value) -> Option<Value> {
    let field = |key: &str| req.get(key).filter(|v| !v.is_null()).cloned();

    let mut headers = match req.get("headers") {
        Some(Value::Object(raw)) => raw.clone(),
        _ => Map::new(),
    };
    // Identity fields override raw headers of the same name
    for (from, to) in [
        ("deviceInfo", "device"),
        ("session", "session"),
        ("userId", "userId"),
        ("hostname", "host"),
        ("ip", "ip"),
    ] {
        if let Some(value) = field(from) {
            headers.insert(to.to_string(), value);
        }
    }

    let params = field("params");
    let query = field("query");
    let body = field("body");

    if headers.is_empty() && params.is_none() && query.is_none() && body.is_none() {
        return None;
    }

    let mut data = Map::new();
    data.insert("headers".to_string(), Value::Object(headers));
    for (key, value) in [("params", params), ("query", query), ("body", body)] {
        if let Some(value) = value {
            data.insert(key.to_string(), value);
        }
    }
    Some(Value::Object(data))
}

/// `"<protocol>.<method>"` lower-cased, or just the protocol
fn build_protocol(protocol: Option<&str>, method: Option<&str>) -> Option<String> {
    let protocol = protocol.filter(|p| !p.is_empty())?.to_lowercase();
    match method.filter(|m| !m.is_empty()) {
        Some(method) => Some(format!("{}.{}", protocol, method.to_lowercase())),
        None => Some(protocol),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use crate::log::{AuditLogger, MemorySink};

    fn logger() -> (AuditLogger, Arc<MemorySink>) {
        AuditLogger::memory(LogConfig::default().with_project_name("test-app"))
    }

    #[test]
    fn test_end_twice_is_usage_error() {
        let (logger, _) = logger();
        let mut log = logger.detail_log("s-1", None, "login", "");
        assert!(!log.is_end());

        log.end().unwrap();
        assert!(log.is_end());

        let err = log.end().unwrap_err();
        assert!(matches!(err, TxLogError::DetailEnded));
        assert_eq!(err.to_string(), "detailLog call \"end()\", twice");
    }

    #[test]
    fn test_new_scenario_reopens() {
        let (logger, sink) = logger();
        let mut log = logger.detail_log("s-1", Some("inv-1"), "login", "user-1");
        log.end().unwrap();

        log.new_scenario("refresh");
        assert!(!log.is_end());
        assert_eq!(log.scenario(), "refresh");
        assert_eq!(log.session(), "s-1");
        assert_eq!(log.identity(), "user-1");
        log.end().unwrap();

        let records = sink.records(LogKind::Detail);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["detail"]["Scenario"], "refresh");
    }

    #[test]
    fn test_request_normalization() {
        let (logger, _) = logger();
        let mut log = logger.detail_log("s-1", Some("init-1"), "login", "");
        let req = json!({
            "session": "s-1",
            "userId": "u-7",
            "hostname": "api.local",
            "ip": "10.0.0.1",
            "body": {"username": "neo", "password": "matrix"},
            "protocol": "HTTP",
            "method": "POST",
        });
        log.add_input_request("client", "login", "", &req);

        let entry = &log.inputs()[0];
        assert_eq!(entry.invoke, "init-1");
        assert_eq!(entry.event, "client.login");
        assert_eq!(entry.kind, "req");
        assert_eq!(entry.protocol.as_deref(), Some("http.post"));

        let data = entry.data.as_ref().unwrap();
        assert_eq!(data["headers"]["host"], "api.local");
        assert_eq!(data["headers"]["userId"], "u-7");
        assert_eq!(data["body"]["username"], "neo");
        assert_eq!(data["body"]["password"], "******");
        assert!(data.get("params").is_none());
    }

    #[test]
    fn test_request_without_known_parts_is_logged_raw() {
        let (logger, _) = logger();
        let mut log = logger.detail_log("s-1", None, "consume", "");
        let req = json!({"topic": "orders", "offset": 4});
        log.add_input_request("kafka_consumer", "orders", "inv-1", &req);

        assert_eq!(log.inputs()[0].data.as_ref(), Some(&req));
        assert!(log.inputs()[0].protocol.is_none());
    }

    #[test]
    fn test_response_pairs_with_pending_timer() {
        let (logger, _) = logger();
        let mut log = logger.detail_log("s-1", None, "profile", "");

        log.add_output_request("profile", "get", "inv-1", "", json!({"id": 1}), Some("http"), Some("GET"));
        assert_eq!(log.pending_calls(), 1);

        log.add_input_response("profile", "get", "inv-1", "", json!({"ok": true}), None);
        assert_eq!(log.pending_calls(), 0);

        let res_time = log.inputs()[0].res_time.clone().unwrap();
        let ms: u64 = res_time.trim_end_matches(" ms").parse().unwrap();
        assert!(ms < 1000, "unexpected response time {}", res_time);
    }

    #[test]
    fn test_explicit_response_time_wins() {
        let (logger, _) = logger();
        let mut log = logger.detail_log("s-1", None, "profile", "");

        log.add_output_request("profile", "get", "inv-1", "", json!({}), None, None);
        log.add_input_response("profile", "get", "inv-1", "", json!({}), Some(42));

        assert_eq!(log.inputs()[0].res_time.as_deref(), Some("42 ms"));
        assert_eq!(log.pending_calls(), 0);
    }

    #[test]
    fn test_unmatched_response_has_no_time() {
        let (logger, _) = logger();
        let mut log = logger.detail_log("s-1", None, "profile", "");
        log.add_input_response("profile", "get", "unknown", "", json!({}), None);
        assert!(log.inputs()[0].res_time.is_none());
    }

    #[test]
    fn test_retry_restarts_timer_and_tags_type() {
        let (logger, _) = logger();
        let mut log = logger.detail_log("s-1", None, "profile", "");

        log.add_output_request("svc", "cmd", "inv-1", "", json!({}), None, None);
        log.add_output_request_retry("svc", "cmd", "inv-1", "", json!({}), 1, 3);

        assert_eq!(log.outputs()[1].kind, "req_retry_1/3");
        assert!(log.outputs()[1].protocol.is_none());
        assert_eq!(log.pending_calls(), 1);
    }

    #[test]
    fn test_error_response_has_no_data() {
        let (logger, _) = logger();
        let mut log = logger.detail_log("s-1", None, "profile", "");
        log.add_output_request("svc", "cmd", "inv-1", "", json!({}), None, None);
        log.add_input_response_error("svc", "cmd", "inv-1", Some("refused"));

        let entry = &log.inputs()[0];
        assert_eq!(entry.kind, "res_error");
        assert!(entry.data.is_none());
        assert_eq!(entry.raw_data.as_deref(), Some("refused"));
        assert!(entry.res_time.is_some());
    }

    #[test]
    fn test_raw_data_masked_and_switchable() {
        let (logger, _) = logger();
        let mut log = logger.detail_log("s-1", None, "login", "");
        log.add_output_request("svc", "cmd", "inv-1", r#"{"token":"abc"}"#, json!({}), None, None);
        assert_eq!(log.outputs()[0].raw_data.as_deref(), Some(r#"{"token":"******"}"#));

        let mut config = LogConfig::default();
        config.detail.raw_data = false;
        let (logger, _) = AuditLogger::memory(config);
        let mut log = logger.detail_log("s-1", None, "login", "");
        log.add_output_request("svc", "cmd", "inv-1", "secret-raw", json!({}), None, None);
        assert!(log.outputs()[0].raw_data.is_none());
    }

    #[test]
    fn test_end_without_output_omits_output_section() {
        let (logger, sink) = logger();
        let mut log = logger.detail_log("s-1", Some("inv-0"), "login", "");
        log.add_input_request("client", "login", "", &json!({"body": {"a": 1}}));
        log.end().unwrap();

        let record = &sink.records(LogKind::Detail)[0];
        assert_eq!(record["logType"], "Detail");
        assert_eq!(record["logLevel"], "INFO");
        assert_eq!(record["applicationName"], "test-app");

        let detail = &record["detail"];
        assert_eq!(detail["Session"], "s-1");
        assert_eq!(detail["InitInvoke"], "inv-0");
        assert_eq!(detail["Input"].as_array().unwrap().len(), 1);
        assert!(detail["Output"].as_array().unwrap().is_empty());
        assert!(detail["OutputTimeStamp"].is_null());
        assert!(detail["InputTimeStamp"].is_string());
        assert!(detail["ProcessingTime"].as_str().unwrap().ends_with(" ms"));
        assert_eq!(record["systemTimestamp"], detail["InputTimeStamp"]);
    }

    #[test]
    fn test_end_clears_state() {
        let (logger, _) = logger();
        let mut log = logger.detail_log("s-1", None, "login", "");
        log.add_output_request("svc", "cmd", "inv-1", "", json!({}), None, None);
        log.end().unwrap();

        assert!(log.inputs().is_empty());
        assert!(log.outputs().is_empty());
        assert_eq!(log.pending_calls(), 0);
    }

    #[test]
    fn test_events_on_ended_log_are_dropped() {
        let (logger, _) = logger();
        let mut log = logger.detail_log("s-1", None, "login", "");
        log.end().unwrap();

        log.add_input_response("svc", "cmd", "inv-1", "", json!({}), None);
        assert!(log.inputs().is_empty());
        assert_eq!(logger.dropped_events(), 1);
    }

    #[test]
    fn test_build_protocol() {
        assert_eq!(build_protocol(Some("HTTP"), Some("GET")).as_deref(), Some("http.get"));
        assert_eq!(build_protocol(Some("Kafka"), None).as_deref(), Some("kafka"));
        assert_eq!(build_protocol(None, Some("GET")), None);
    }
}
