//! Result classification, hangup-cause mapping, and panel reporting.
//! Ported from the original's `_set_result` / `_report_result` /
//! `_map_result_to_panel` helpers, plus the three-way STT transcript log
//! split this system's dialer dashboard depends on.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use crate::panel::PanelClient;
use crate::session::manager::SessionManager;
use crate::session::SessionId;

/// Maps an ARI hangup cause code (and, for the causes the code alone
/// doesn't resolve, the cause text and whatever result was already set)
/// to a terminal call result. Table is §4.4's literal cause-code mapping:
/// busy/congestion/unavailable codes map deterministically; anything else
/// falls back to a textual "Request Terminated" check, then to whatever
/// result already stood, then to `missed`.
pub fn result_for_hangup_cause(cause: u16, cause_txt: Option<&str>, prior: Option<&str>) -> String {
    match cause {
        16 | 31 | 32 => "hangup".to_string(),
        17 => "busy".to_string(),
        18 | 19 | 20 | 0 | 1 | 3 | 22 | 27 | 38 => "power_off".to_string(),
        21 | 34 | 41 | 42 => "banned".to_string(),
        _ => {
            if cause_txt.is_some_and(|t| t.contains("Request Terminated")) {
                "missed".to_string()
            } else {
                prior.map(str::to_string).unwrap_or_else(|| "missed".to_string())
            }
        }
    }
}

/// True for the busy/congestion/unavailable causes the session manager
/// must pre-notify a call failure for before firing the hangup callback
/// (§4.2's `ChannelHangupRequest` handling).
pub fn is_failure_cause(cause: u16) -> bool {
    matches!(cause, 17 | 18 | 19 | 20 | 21 | 34 | 41 | 42)
}

/// Maps an internal result string to the panel's status vocabulary. A
/// `failed:<reason>` result (any reason) maps to the single `FAILED`
/// panel status — the reason is preserved in metadata, not in the enum.
pub fn map_result_to_panel_status(result: &str) -> &'static str {
    if result.starts_with("failed:") {
        return "FAILED";
    }
    match result {
        "connected_to_operator" => "CONNECTED",
        "inbound_call" => "INBOUND_CALL",
        "not_interested" => "NOT_INTERESTED",
        "missed" | "user_didnt_answer" => "MISSED",
        "hangup" => "HANGUP",
        "disconnected" => "DISCONNECTED",
        "unknown" => "UNKNOWN",
        "busy" => "BUSY",
        "power_off" => "POWER_OFF",
        "banned" => "BANNED",
        _ => "UNKNOWN",
    }
}

/// Maps an internal result (plus whether the session was inbound, since
/// `disconnected` reports differently for inbound-direct sessions) to the
/// panel's human-readable reason string, per §4.4's mapping table.
pub fn reason_for_result(result: &str, inbound: bool) -> String {
    if let Some(reason) = result.strip_prefix("failed:") {
        if reason.starts_with("stt_failure") {
            return "User did not respond".to_string();
        }
        return reason.to_string();
    }
    match result {
        "connected_to_operator" => "User said yes".to_string(),
        "inbound_call" => "Inbound call connected to agent".to_string(),
        "not_interested" => "User declined".to_string(),
        "missed" | "user_didnt_answer" => "No answer/busy/unreachable".to_string(),
        "hangup" => "Caller hung up".to_string(),
        "disconnected" if inbound => "Inbound call connected to agent".to_string(),
        "disconnected" => "Caller disconnected".to_string(),
        "unknown" => "Unknown intent".to_string(),
        "busy" => "Line busy".to_string(),
        "power_off" => "Unavailable / powered off".to_string(),
        "banned" => "Rejected by operator".to_string(),
        other => other.to_string(),
    }
}

/// `disconnected` reports as `INBOUND_CALL` rather than `DISCONNECTED` for
/// inbound-direct sessions (§4.4's panel mapping table, "disconnected
/// (inbound-direct)" row).
pub fn map_result_to_panel_status_for(result: &str, inbound: bool) -> &'static str {
    if inbound && result == "disconnected" {
        return "INBOUND_CALL";
    }
    map_result_to_panel_status(result)
}

/// Reports a session's result to the panel, guarded by two idempotence
/// checks: `result_reported` (never double-report the same session) and
/// `panel_last_status` (never re-POST when the mapped status hasn't
/// actually changed, e.g. a `missed` -> `missed` re-set under retry).
pub async fn report_result(
    sessions: &SessionManager,
    panel: &PanelClient,
    session_id: SessionId,
    call_allowed: Option<bool>,
) {
    let (result, number_id, phone_number, batch_id, already_reported, inbound, scenario_name, outbound_line, agent_id, agent_phone, user_message, attempted_at) = {
        let Some(session) = sessions.get(session_id) else {
            return;
        };
        let Some(result) = session.result.clone() else {
            return;
        };
        (
            result,
            session
                .metadata
                .get("number_id")
                .and_then(|v| v.parse::<i64>().ok()),
            session.metadata.get("phone_number").cloned(),
            session.metadata.get("batch_id").cloned(),
            session.result_already_reported(),
            session.inbound,
            session.scenario_name.clone(),
            session.outbound_line.clone(),
            session.agent_id,
            session.agent_phone.clone(),
            session.responses.last().cloned(),
            session
                .metadata
                .get("attempted_at")
                .cloned()
                .unwrap_or_else(|| session.created_at.to_rfc3339()),
        )
    };

    let panel_status = map_result_to_panel_status_for(&result, inbound);
    let reason = reason_for_result(&result, inbound);
    let last_status = sessions
        .get(session_id)
        .and_then(|s| s.panel_last_status.clone());

    if already_reported && last_status.as_deref() == Some(panel_status) {
        return;
    }

    let user_message = match panel_status {
        "CONNECTED" | "INBOUND_CALL" | "NOT_INTERESTED" | "DISCONNECTED" => user_message,
        _ => None,
    };

    panel
        .report_result(
            number_id,
            phone_number,
            panel_status,
            reason,
            attempted_at,
            batch_id,
            call_allowed,
            agent_id,
            agent_phone,
            user_message,
            scenario_name,
            outbound_line,
        )
        .await;

    if let Some(mut session) = sessions.get_mut(session_id) {
        session.mark_result_reported();
        session.panel_last_status = Some(panel_status.to_string());
    }
    info!(%session_id, result = %result, panel_status, "reported result to panel");
}

/// Three rotating daily transcript logs, split by classification bucket,
/// read by downstream QA tooling. Positive = an intent the scenario
/// treats as a successful lead; negative = an explicit decline; unknown =
/// anything the classifier couldn't place confidently.
pub struct TranscriptLogger {
    positive: tracing_appender::non_blocking::NonBlocking,
    negative: tracing_appender::non_blocking::NonBlocking,
    unknown: tracing_appender::non_blocking::NonBlocking,
    _guards: [WorkerGuard; 3],
}

impl TranscriptLogger {
    pub fn init(log_dir: impl AsRef<Path>) -> TranscriptLogger {
        let log_dir = log_dir.as_ref();
        let (positive, g1) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "transcripts-positive.log"));
        let (negative, g2) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "transcripts-negative.log"));
        let (unknown, g3) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "transcripts-unknown.log"));
        TranscriptLogger {
            positive,
            negative,
            unknown,
            _guards: [g1, g2, g3],
        }
    }

    pub fn log(&self, session_id: SessionId, intent: &str, transcript: &str) {
        use std::io::Write;
        let line = format!("{session_id}\t{intent}\t{transcript}\n");
        let mut writer = match intent {
            "yes" | "number_question" => &self.positive,
            "no" => &self.negative,
            _ => &self.unknown,
        }
        .clone();
        if let Err(e) = writer.write_all(line.as_bytes()) {
            warn!(error = %e, "failed to write transcript log line");
        }
    }
}

pub fn transcript_logger_or_noop(log_dir: Option<impl AsRef<Path>>) -> Option<Arc<TranscriptLogger>> {
    log_dir.map(|dir| Arc::new(TranscriptLogger::init(dir)))
}
