//! Per-transaction outcome aggregator

use super::{timestamp, Shared};
use crate::error::{Result, TxLogError};
use crate::log::sink::LogKind;
use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;

/// One distinct `(code, desc)` outcome in a block
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct BlockResult {
    pub result: String,
    pub desc: String,
    pub count: u32,
}

/// Outcomes of all calls made to one downstream `node.cmd`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SummaryBlock {
    pub node: String,
    pub cmd: String,
    pub result: Vec<BlockResult>,
}

/// Summary audit log for one transaction.
///
/// Blocks are bucketed per `node + cmd`; repeating the same `(code, desc)`
/// increments its count instead of adding an entry.
pub struct SummaryLog {
    shared: Arc<Shared>,
    session: String,
    init_invoke: String,
    scenario: String,
    opened: Option<(Instant, DateTime<Local>)>,
    blocks: Vec<SummaryBlock>,
    fields: Map<String, Value>,
}

impl std::fmt::Debug for SummaryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryLog")
            .field("session", &self.session)
            .field("scenario", &self.scenario)
            .field("ended", &self.is_end())
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl SummaryLog {
    pub(crate) fn open(
        shared: Arc<Shared>,
        session: String,
        init_invoke: String,
        scenario: String,
    ) -> Self {
        Self {
            shared,
            session,
            init_invoke,
            scenario,
            opened: Some((Instant::now(), Local::now())),
            blocks: Vec::new(),
            fields: Map::new(),
        }
    }

    /// Reopen for a new scenario, dropping blocks and fields
    pub fn new_scenario(&mut self, scenario: impl Into<String>) -> &mut Self {
        self.scenario = scenario.into();
        self.blocks.clear();
        self.fields.clear();
        self.opened = Some((Instant::now(), Local::now()));
        self
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn blocks(&self) -> &[SummaryBlock] {
        &self.blocks
    }

    /// Free-form diagnostic field value, if set
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn is_end(&self) -> bool {
        self.opened.is_none()
    }

    pub fn add_success_block(&mut self, node: &str, cmd: &str, code: &str, desc: &str) -> &mut Self {
        self.add_block(node, cmd, code, desc);
        self
    }

    pub fn add_error_block(&mut self, node: &str, cmd: &str, code: &str, desc: &str) -> &mut Self {
        self.add_block(node, cmd, code, desc);
        self
    }

    /// Attach a diagnostic field such as `errorCause`
    pub fn add_field(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Finalize with the transaction's response code and description
    pub fn end(&mut self, code: &str, desc: &str) -> Result<()> {
        self.finish(code, desc, None)
    }

    /// Finalize an asynchronous transaction, also recording its state
    pub fn end_async(
        &mut self,
        code: &str,
        desc: &str,
        transaction_state: &str,
        transaction_desc: &str,
    ) -> Result<()> {
        self.finish(code, desc, Some((transaction_state, transaction_desc)))
    }

    fn add_block(&mut self, node: &str, cmd: &str, code: &str, desc: &str) {
        if self.is_end() {
            self.shared.record_dropped_event();
            tracing::warn!(
                session = %self.session,
                node = node,
                cmd = cmd,
                "Block added to an ended summary log was dropped"
            );
            return;
        }

        let position = self
            .blocks
            .iter()
            .position(|b| b.node == node && b.cmd == cmd);
        let idx = match position {
            Some(idx) => idx,
            None => {
                self.blocks.push(SummaryBlock {
                    node: node.to_string(),
                    cmd: cmd.to_string(),
                    result: Vec::new(),
                });
                self.blocks.len() - 1
            }
        };
        let block = &mut self.blocks[idx];

        match block
            .result
            .iter_mut()
            .find(|r| r.result == code && r.desc == desc)
        {
            Some(existing) => existing.count += 1,
            None => block.result.push(BlockResult {
                result: code.to_string(),
                desc: desc.to_string(),
                count: 1,
            }),
        }
    }

    fn finish(&mut self, code: &str, desc: &str, transaction: Option<(&str, &str)>) -> Result<()> {
        let (started, input_time) = self.opened.ok_or(TxLogError::SummaryEnded)?;
        let end_time = Local::now();

        let mut summary = json!({
            "LogType": "Summary",
            "InputTimeStamp": timestamp(input_time),
            "Host": self.shared.host,
            "AppName": self.shared.config.project_name,
            "Instance": std::process::id(),
            "Session": self.session,
            "InitInvoke": self.init_invoke,
            "Scenario": self.scenario,
            "ResponseResult": code,
            "ResponseDesc": desc,
            "Sequences": self.blocks,
            "EndProcessTimeStamp": timestamp(end_time),
            "ProcessTime": format!("{} ms", started.elapsed().as_millis()),
        });
        if let Some(record) = summary.as_object_mut() {
            if !self.fields.is_empty() {
                record.insert("CustomDesc".to_string(), Value::Object(self.fields.clone()));
            }
            if let Some((state, tx_desc)) = transaction {
                record.insert("TransactionResult".to_string(), json!(state));
                record.insert("TransactionDesc".to_string(), json!(tx_desc));
            }
        }

        let record = json!({
            "systemTimestamp": timestamp(end_time),
            "logType": "Summary",
            "logLevel": "INFO",
            "namespace": self.shared.config.namespace,
            "containerId": self.shared.host,
            "applicationName": self.shared.config.project_name,
            "summary": summary,
        });

        let line = serde_json::to_string(&record)?;
        self.shared.write(LogKind::Summary, &line);

        tracing::debug!(
            session = %self.session,
            scenario = %self.scenario,
            result = code,
            "Summary log ended"
        );

        self.opened = None;
        self.blocks.clear();
        self.fields.clear();
        Ok(())
    }
}
