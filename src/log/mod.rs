//! Audit logging
//!
//! [`AuditLogger`] owns the configuration and sinks shared by every
//! transaction and hands out correlated [`DetailLog`] / [`SummaryLog`]
//! pairs. Each pair is exclusively owned by one in-flight transaction.

pub mod detail;
pub mod sink;
pub mod summary;

pub use detail::{DetailLog, InputOutput};
pub use sink::{ConsoleSink, LogKind, LogSink, MemorySink, RotatingFileSink};
pub use summary::{BlockResult, SummaryBlock, SummaryLog};

use crate::config::{LogConfig, SinkConfig};
use crate::error::Result;
use crate::id::{generate_internal_tid, generate_xtid};
use crate::masking::FieldMasking;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Length of the init invoke minted by [`AuditLogger::common_log`]
pub const INIT_INVOKE_LEN: i64 = 20;

/// State shared by all logs created from one [`AuditLogger`]
pub(crate) struct Shared {
    pub(crate) config: LogConfig,
    pub(crate) host: String,
    pub(crate) masking: FieldMasking,
    detail_sinks: Vec<Arc<dyn LogSink>>,
    summary_sinks: Vec<Arc<dyn LogSink>>,
    dropped_events: AtomicU64,
}

impl Shared {
    pub(crate) fn write(&self, kind: LogKind, line: &str) {
        let sinks = match kind {
            LogKind::Detail => &self.detail_sinks,
            LogKind::Summary => &self.summary_sinks,
        };
        for sink in sinks {
            sink.write(kind, line);
        }
    }

    pub(crate) fn record_dropped_event(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }
}

/// ISO-8601 local timestamp with offset, e.g. `2024-05-01T09:30:00+07:00`
pub(crate) fn timestamp(at: DateTime<Local>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

/// Factory for correlated audit logs
#[derive(Clone)]
pub struct AuditLogger {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("project", &self.shared.config.project_name)
            .field("host", &self.shared.host)
            .field("detail_sinks", &self.shared.detail_sinks.len())
            .field("summary_sinks", &self.shared.summary_sinks.len())
            .finish()
    }
}

impl AuditLogger {
    /// Build console and file sinks as selected by `config`
    pub fn new(config: LogConfig) -> Result<Self> {
        let host = local_hostname();
        let detail = build_sinks(&config.detail, &host, &config.project_name)?;
        let summary = build_sinks(&config.summary, &host, &config.project_name)?;

        tracing::info!(
            project = %config.project_name,
            host = %host,
            detail_sinks = detail.len(),
            summary_sinks = summary.len(),
            "Audit logger initialized"
        );

        Ok(Self::assemble(config, host, detail, summary))
    }

    /// Load [`LogConfig::from_env`] and build its sinks
    pub fn from_env() -> Result<Self> {
        Self::new(LogConfig::from_env()?)
    }

    /// Use caller-supplied sinks instead of the ones in `config`
    pub fn with_sinks(
        config: LogConfig,
        detail: Vec<Arc<dyn LogSink>>,
        summary: Vec<Arc<dyn LogSink>>,
    ) -> Self {
        Self::assemble(config, local_hostname(), detail, summary)
    }

    /// Logger writing both kinds into one in-memory sink
    pub fn memory(config: LogConfig) -> (Self, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let logger = Self::with_sinks(config, vec![sink.clone()], vec![sink.clone()]);
        (logger, sink)
    }

    fn assemble(
        config: LogConfig,
        host: String,
        detail_sinks: Vec<Arc<dyn LogSink>>,
        summary_sinks: Vec<Arc<dyn LogSink>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                host,
                masking: FieldMasking::default(),
                detail_sinks,
                summary_sinks,
                dropped_events: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &LogConfig {
        &self.shared.config
    }

    pub fn host(&self) -> &str {
        &self.shared.host
    }

    /// Events or blocks discarded because their log had already ended
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped_events.load(Ordering::Relaxed)
    }

    /// Open a detail log. Without `init_invoke` the log uses
    /// `<project>_<yyyyMMddHHmmss>`.
    pub fn detail_log(
        &self,
        session: &str,
        init_invoke: Option<&str>,
        scenario: &str,
        identity: &str,
    ) -> DetailLog {
        DetailLog::open(
            self.shared.clone(),
            session.to_string(),
            self.init_invoke_or_default(init_invoke),
            scenario.to_string(),
            identity.to_string(),
        )
    }

    /// Open a summary log
    pub fn summary_log(&self, session: &str, init_invoke: Option<&str>, scenario: &str) -> SummaryLog {
        SummaryLog::open(
            self.shared.clone(),
            session.to_string(),
            self.init_invoke_or_default(init_invoke),
            scenario.to_string(),
        )
    }

    /// Open a correlated detail/summary pair for one transaction.
    ///
    /// A missing `session` is generated from the scenario name; the init
    /// invoke is always freshly minted.
    pub fn common_log(
        &self,
        scenario: &str,
        identity: Option<&str>,
        session: Option<&str>,
    ) -> CommonLog {
        let session = match session.filter(|s| !s.is_empty()) {
            Some(session) => session.to_string(),
            None => generate_xtid(scenario),
        };
        let init_invoke = generate_internal_tid(scenario, "-", INIT_INVOKE_LEN);

        CommonLog {
            detail_log: self.detail_log(&session, Some(&init_invoke), scenario, identity.unwrap_or("")),
            summary_log: self.summary_log(&session, Some(&init_invoke), scenario),
            session,
            init_invoke,
        }
    }

    /// Open logs for an inbound HTTP request and record it as the first
    /// input event. The request's session is reused when present.
    pub fn begin_http(&self, node: &str, scenario: &str, req: &InboundRequest) -> CommonLog {
        let mut logs = self.common_log(scenario, req.user_id.as_deref(), req.session.as_deref());
        let invoke = logs.init_invoke.clone();
        logs.detail_log
            .add_input_request(node, scenario, &invoke, &req.to_value());
        logs
    }

    fn init_invoke_or_default(&self, init_invoke: Option<&str>) -> String {
        match init_invoke.filter(|i| !i.is_empty()) {
            Some(invoke) => invoke.to_string(),
            None => format!(
                "{}_{}",
                self.shared.config.project_name,
                Local::now().format("%Y%m%d%H%M%S")
            ),
        }
    }
}

/// Correlated loggers handed to business handlers
#[derive(Debug)]
pub struct CommonLog {
    pub detail_log: DetailLog,
    pub summary_log: SummaryLog,
    pub session: String,
    pub init_invoke: String,
}

/// Request-shaped view of an inbound HTTP call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundRequest {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl InboundRequest {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn build_sinks(config: &SinkConfig, host: &str, project: &str) -> Result<Vec<Arc<dyn LogSink>>> {
    let mut sinks: Vec<Arc<dyn LogSink>> = Vec::new();
    if config.console {
        sinks.push(Arc::new(ConsoleSink));
    }
    if config.file {
        sinks.push(Arc::new(RotatingFileSink::new(config, host, project)?));
    }
    Ok(sinks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_common_log_generates_correlated_pair() {
        let (logger, _) = AuditLogger::memory(LogConfig::default());
        let logs = logger.common_log("register", Some("user-1"), None);

        assert_eq!(logs.session.len(), 22);
        assert!(logs.session.starts_with("regis-"));
        assert_eq!(logs.init_invoke.len(), 20);
        assert_eq!(logs.detail_log.session(), logs.session);
        assert_eq!(logs.summary_log.session(), logs.session);
        assert_eq!(logs.detail_log.init_invoke(), logs.init_invoke);
        assert_eq!(logs.detail_log.identity(), "user-1");
        assert!(!logs.detail_log.is_end());
        assert!(!logs.summary_log.is_end());
    }

    #[test]
    fn test_common_log_keeps_given_session() {
        let (logger, _) = AuditLogger::memory(LogConfig::default());
        let logs = logger.common_log("register", None, Some("parent-session"));
        assert_eq!(logs.session, "parent-session");
        assert_eq!(logs.detail_log.identity(), "");
    }

    #[test]
    fn test_default_init_invoke_uses_project_name() {
        let (logger, _) = AuditLogger::memory(LogConfig::default().with_project_name("auth"));
        let log = logger.detail_log("s-1", None, "login", "");
        assert!(log.init_invoke().starts_with("auth_"));
        assert_eq!(log.init_invoke().len(), "auth_".len() + 14);
    }

    #[test]
    fn test_begin_http_records_request() {
        let (logger, sink) = AuditLogger::memory(LogConfig::default());
        let req = InboundRequest {
            session: Some("http-session".into()),
            user_id: Some("u-1".into()),
            body: Some(json!({"email": "neo.anderson@matrix.io"})),
            protocol: Some("HTTP".into()),
            method: Some("POST".into()),
            ..Default::default()
        };

        let mut logs = logger.begin_http("client", "register", &req);
        assert_eq!(logs.session, "http-session");

        let entry = &logs.detail_log.inputs()[0];
        assert_eq!(entry.invoke, logs.init_invoke);
        assert_eq!(entry.protocol.as_deref(), Some("http.post"));
        assert_eq!(entry.data.as_ref().unwrap()["body"]["email"], "neo*********@matrix.io");

        logs.detail_log.end().unwrap();
        logs.summary_log.end("200", "success").unwrap();
        assert_eq!(sink.records(LogKind::Detail).len(), 1);
        assert_eq!(sink.records(LogKind::Summary).len(), 1);
    }

    #[test]
    fn test_begin_http_keeps_masked_headers() {
        let (logger, _) = AuditLogger::memory(LogConfig::default());
        let mut headers = HashMap::new();
        headers.insert("token".to_string(), "bearer-abc".to_string());
        headers.insert("x-request-id".to_string(), "req-7".to_string());
        let req = InboundRequest {
            headers,
            session: Some("http-session".into()),
            ..Default::default()
        };

        let logs = logger.begin_http("client", "profile", &req);

        let data = logs.detail_log.inputs()[0].data.as_ref().unwrap();
        assert_eq!(data["headers"]["token"], "******");
        assert_eq!(data["headers"]["x-request-id"], "req-7");
        assert_eq!(data["headers"]["session"], "http-session");
    }

    #[test]
    fn test_file_sinks_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LogConfig::default();
        config.detail.console = false;
        config.detail.file = true;
        config.detail.path = dir.path().join("detail");
        config.summary.console = false;

        let logger = AuditLogger::new(config).unwrap();
        let mut log = logger.detail_log("s-1", None, "login", "");
        log.end().unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path().join("detail")).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_timestamp_format() {
        let ts = timestamp(Local::now());
        assert_eq!(ts.len(), "2024-05-01T09:30:00+07:00".len());
        assert_eq!(&ts[10..11], "T");
    }
}
