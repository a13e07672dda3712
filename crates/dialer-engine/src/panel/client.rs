//! HTTP client for the dialer-management panel.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::PanelSettings;
use crate::error::PanelError;

#[derive(Debug, Clone, Deserialize)]
pub struct PanelNumber {
    pub number_id: i64,
    pub phone_number: String,
    #[serde(default)]
    pub scenario: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PanelAgent {
    pub agent_id: i64,
    pub extension: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PanelOutboundLine {
    pub trunk: String,
    /// The line's own phone number, used to resolve which line an inbound
    /// call arrived on (§4.2). Falls back to `trunk` when the panel omits
    /// it, since most deployments key trunks by phone number directly.
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default)]
pub struct NextBatchResponse {
    pub call_allowed: bool,
    pub retry_after_seconds: u64,
    pub numbers: Vec<PanelNumber>,
    pub active_agents: Vec<PanelAgent>,
    pub inbound_agents: Vec<PanelAgent>,
    pub outbound_agents: Vec<PanelAgent>,
    pub active_scenarios: Vec<String>,
    pub outbound_lines: Vec<PanelOutboundLine>,
    pub batch_id: Option<String>,
    pub timezone: Option<String>,
    pub server_time: Option<DateTime<Utc>>,
    pub schedule_version: Option<String>,
    pub reason: Option<String>,
}

impl NextBatchResponse {
    fn empty() -> NextBatchResponse {
        NextBatchResponse {
            call_allowed: false,
            retry_after_seconds: 30,
            ..Default::default()
        }
    }
}

/// Wire shape of `POST /api/dialer/report-result` (§4.4, §6): the panel
/// wants a flat object, not `result` plus a side blob of metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ReportPayload {
    pub number_id: Option<i64>,
    pub phone_number: Option<String>,
    pub status: String,
    pub reason: String,
    pub attempted_at: String,
    pub batch_id: Option<String>,
    /// Set to `false` only on the report that trips the failure-streak
    /// pause (§4.5), telling the panel not to schedule this contact again
    /// until an operator clears the block. Omitted (not serialized)
    /// otherwise, matching the original client's `if call_allowed is not
    /// None: payload["call_allowed"] = call_allowed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_allowed: Option<bool>,
    pub agent_id: Option<i64>,
    pub agent_phone: Option<String>,
    pub user_message: Option<String>,
    pub scenario: String,
    pub outbound_line: Option<String>,
}

pub struct PanelClient {
    http: Client,
    base_url: String,
    api_token: String,
    company: String,
    pending_reports: Mutex<Vec<ReportPayload>>,
    /// Most recently fetched agent rosters, consulted by the Flow Engine's
    /// `transfer_to_operator` step (§4.3.1) between panel polls.
    agent_rosters: Mutex<(Vec<PanelAgent>, Vec<PanelAgent>)>,
}

impl PanelClient {
    pub fn new(settings: &PanelSettings, http_max_connections: usize) -> Result<PanelClient, PanelError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .pool_max_idle_per_host(http_max_connections.max(1))
            .build()?;
        Ok(PanelClient {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_token: settings.api_token.clone(),
            company: settings.company.clone(),
            pending_reports: Mutex::new(Vec::new()),
            agent_rosters: Mutex::new((Vec::new(), Vec::new())),
        })
    }

    /// Returns the roster for `agent_type` as of the last `get_next_batch`
    /// fetch. Empty until the first successful batch poll.
    pub async fn cached_agents(&self, inbound: bool) -> Vec<PanelAgent> {
        let rosters = self.agent_rosters.lock().await;
        if inbound { rosters.0.clone() } else { rosters.1.clone() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Requests the next batch of numbers to dial. Any transport or parse
    /// failure degrades to an "empty, retry later" response rather than
    /// propagating — the dialer loop treats this the same as "no work"
    /// and tries again after `retry_after_seconds`.
    pub async fn get_next_batch(&self, size: u32) -> NextBatchResponse {
        let mut query = vec![("size".to_string(), size.to_string())];
        if !self.company.is_empty() {
            query.push(("company".to_string(), self.company.clone()));
        }

        let result = self
            .http
            .get(self.url("/api/dialer/next-batch"))
            .bearer_auth(&self.api_token)
            .query(&query)
            .send()
            .await;

        let response = match result {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(status = %resp.status(), "panel next-batch returned error status");
                return NextBatchResponse::empty();
            }
            Err(e) => {
                warn!(error = %e, "panel next-batch request failed");
                return NextBatchResponse::empty();
            }
        };

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "panel next-batch returned unparseable body");
                return NextBatchResponse::empty();
            }
        };

        let parsed = Self::parse_next_batch(&body);
        *self.agent_rosters.lock().await = (parsed.inbound_agents.clone(), parsed.outbound_agents.clone());
        parsed
    }

    fn parse_next_batch(body: &Value) -> NextBatchResponse {
        let numbers: Vec<PanelNumber> = body
            .get("numbers")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let active_scenarios = Self::parse_active_scenarios(body);
        let outbound_lines = Self::parse_outbound_lines(body);

        // Legacy panels send one flat `active_agents` list; newer ones
        // split inbound/outbound. Fall back to the flat list for both
        // when the split fields are absent.
        let inbound_agents: Vec<PanelAgent> = body
            .get("inbound_agents")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .or_else(|| {
                body.get("active_agents")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
            })
            .unwrap_or_default();
        let outbound_agents: Vec<PanelAgent> = body
            .get("outbound_agents")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .or_else(|| {
                body.get("active_agents")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
            })
            .unwrap_or_default();
        let active_agents: Vec<PanelAgent> = body
            .get("active_agents")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        NextBatchResponse {
            call_allowed: body
                .get("call_allowed")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            retry_after_seconds: body
                .get("retry_after_seconds")
                .and_then(Value::as_u64)
                .unwrap_or(30),
            numbers,
            active_agents,
            inbound_agents,
            outbound_agents,
            active_scenarios,
            outbound_lines,
            batch_id: body
                .get("batch_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            timezone: body
                .get("timezone")
                .and_then(Value::as_str)
                .map(str::to_string),
            server_time: body
                .get("server_time")
                .and_then(Value::as_str)
                .and_then(Self::parse_dt),
            schedule_version: body
                .get("schedule_version")
                .and_then(Value::as_str)
                .map(str::to_string),
            reason: body
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    fn parse_dt(raw: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }

    fn parse_active_scenarios(body: &Value) -> Vec<String> {
        match body.get("active_scenarios") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn parse_outbound_lines(body: &Value) -> Vec<PanelOutboundLine> {
        body.get("outbound_lines")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Reports a single call's terminal classification. On transport
    /// failure the report is queued for a later `flush_pending`.
    #[allow(clippy::too_many_arguments)]
    pub async fn report_result(
        &self,
        number_id: Option<i64>,
        phone_number: Option<String>,
        status: impl Into<String>,
        reason: impl Into<String>,
        attempted_at: impl Into<String>,
        batch_id: Option<String>,
        call_allowed: Option<bool>,
        agent_id: Option<i64>,
        agent_phone: Option<String>,
        user_message: Option<String>,
        scenario: impl Into<String>,
        outbound_line: Option<String>,
    ) {
        let payload = ReportPayload {
            number_id,
            phone_number,
            status: status.into(),
            reason: reason.into(),
            attempted_at: attempted_at.into(),
            batch_id,
            call_allowed,
            agent_id,
            agent_phone,
            user_message,
            scenario: scenario.into(),
            outbound_line,
        };
        if let Err(e) = self.post_report(&payload).await {
            warn!(error = %e, "panel report-result failed, queuing for retry");
            self.pending_reports.lock().await.push(payload);
        }
    }

    async fn post_report(&self, payload: &ReportPayload) -> Result<(), PanelError> {
        let resp = self
            .http
            .post(self.url("/api/dialer/report-result"))
            .bearer_auth(&self.api_token)
            .json(payload)
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            Err(PanelError::Rest { status, body })
        }
    }

    pub async fn register_scenarios(&self, names: &[String]) -> Result<(), PanelError> {
        let resp = self
            .http
            .post(self.url("/api/dialer/register-scenarios"))
            .bearer_auth(&self.api_token)
            .json(&json!({ "scenarios": names }))
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            Err(PanelError::Rest { status, body })
        }
    }

    /// Drains the retry queue in order, dropping entries that carry
    /// neither a `number_id` nor a `phone_number` (nothing to key the
    /// report against), and stopping at the first failure so later
    /// entries stay queued in order.
    pub async fn flush_pending(&self) {
        let mut queue = self.pending_reports.lock().await;
        while let Some(payload) = queue.first() {
            if payload.number_id.is_none() && payload.phone_number.is_none() {
                debug!("dropping unreportable queued result, missing both identifiers");
                queue.remove(0);
                continue;
            }
            match self.post_report(payload).await {
                Ok(()) => {
                    queue.remove(0);
                }
                Err(e) => {
                    warn!(error = %e, remaining = queue.len(), "flush_pending stopped on failure");
                    break;
                }
            }
        }
    }
}
