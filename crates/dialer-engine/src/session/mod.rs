//! Call session state: legs, bridge, per-call metadata, result. Ported
//! from `sessions/session.py`.

pub mod manager;

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LegDirection {
    Inbound,
    Outbound,
    Operator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LegState {
    Created,
    Ringing,
    Answered,
    Hungup,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initiating,
    Ringing,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CallLeg {
    pub channel_id: String,
    pub direction: LegDirection,
    pub endpoint: String,
    pub state: LegState,
    pub variables: HashMap<String, String>,
}

impl CallLeg {
    pub fn new(channel_id: impl Into<String>, direction: LegDirection, endpoint: impl Into<String>) -> Self {
        CallLeg {
            channel_id: channel_id.into(),
            direction,
            endpoint: endpoint.into(),
            state: LegState::Created,
            variables: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeInfo {
    pub bridge_id: String,
    pub bridge_type: String,
    pub channels: Vec<String>,
}

impl BridgeInfo {
    pub fn new(bridge_id: impl Into<String>) -> Self {
        BridgeInfo {
            bridge_id: bridge_id.into(),
            bridge_type: "mixing".to_string(),
            channels: Vec::new(),
        }
    }
}

/// One call's full state: up to one leg per direction, an optional bridge
/// once two or more legs need mixing, free-form metadata, and the
/// classification result the flow engine eventually assigns.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub bridge: Option<BridgeInfo>,
    pub inbound_leg: Option<CallLeg>,
    pub outbound_leg: Option<CallLeg>,
    pub operator_leg: Option<CallLeg>,
    pub status: SessionStatus,
    pub metadata: HashMap<String, String>,
    pub playbacks: HashMap<String, String>,
    pub responses: Vec<String>,
    pub result: Option<String>,
    pub processed_recordings: std::collections::HashSet<String>,
    /// Current step id the flow engine is sitting at; `None` before entry.
    pub current_step: Option<String>,
    /// Step to resume at once the in-flight playback/recording/transfer
    /// this session is waiting on reports back.
    pub pending_next: Option<String>,
    /// Per-counter retry tallies addressed by `check_retry_limit` steps.
    pub counters: HashMap<String, u32>,
    /// Last intent the LLM classified this session's most recent response as.
    pub last_intent: Option<String>,
    /// Scenario driving this session.
    pub scenario_name: String,
    pub inbound: bool,
    /// Set once cleanup has run so repeated `StasisEnd`/hangup events are no-ops.
    pub cleanup_done: bool,
    /// Panel status last reported, to suppress redundant reports.
    pub panel_last_status: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Trunk line this session originated on (outbound) or was resolved to
    /// (inbound); reported to the panel as `outbound_line`.
    pub outbound_line: Option<String>,
    /// Agent selected by `transfer_to_operator`, once one has answered.
    pub agent_id: Option<i64>,
    pub agent_phone: Option<String>,
    /// Set once the operator-transfer sub-protocol has originated a leg,
    /// refusing a second concurrent attempt (§4.3.1 step 1).
    pub operator_call_started: bool,
    /// Set once the operator leg answers; stops the `onhold` loop.
    pub operator_connected: bool,
    /// Active `onhold` playback id, if the loop is currently playing.
    pub onhold_playback_id: Option<String>,
    /// Trunk line reserved for the operator leg's origination, released
    /// once the session ends (§4.3.1 step 3).
    pub operator_line: Option<String>,
    /// Key this session holds in the flow engine's `agent_busy` set, if
    /// any, released once the session ends.
    pub operator_busy_key: Option<String>,
    /// Set when a flow step (`disconnect`/`hangup`) itself tore the call
    /// down, rather than the far end hanging up — used to distinguish
    /// `failed:hangup` from plain `hangup` at result-classification time.
    pub engine_hangup: bool,
    /// Line this inbound session is queued on, waiting for capacity to free
    /// up (§4.2). `None` once the session is either reserved a slot or
    /// never needed to queue.
    pub queued_line: Option<String>,
}

impl Session {
    pub fn new(session_id: SessionId, scenario_name: impl Into<String>, inbound: bool) -> Self {
        Session {
            session_id,
            bridge: None,
            inbound_leg: None,
            outbound_leg: None,
            operator_leg: None,
            status: SessionStatus::Initiating,
            metadata: HashMap::new(),
            playbacks: HashMap::new(),
            responses: Vec::new(),
            result: None,
            processed_recordings: std::collections::HashSet::new(),
            current_step: None,
            pending_next: None,
            counters: HashMap::new(),
            last_intent: None,
            scenario_name: scenario_name.into(),
            inbound,
            cleanup_done: false,
            panel_last_status: None,
            created_at: chrono::Utc::now(),
            outbound_line: None,
            agent_id: None,
            agent_phone: None,
            operator_call_started: false,
            operator_connected: false,
            onhold_playback_id: None,
            operator_line: None,
            operator_busy_key: None,
            engine_hangup: false,
            queued_line: None,
        }
    }

    /// Attaches `channel_id` to the leg matching `direction`, creating it
    /// with the given endpoint if absent.
    pub fn add_channel(&mut self, channel_id: &str, direction: LegDirection, endpoint: &str) {
        let leg = CallLeg::new(channel_id.to_string(), direction, endpoint.to_string());
        match direction {
            LegDirection::Inbound => self.inbound_leg = Some(leg),
            LegDirection::Outbound => self.outbound_leg = Some(leg),
            LegDirection::Operator => self.operator_leg = Some(leg),
        }
    }

    pub fn leg_for_channel(&mut self, channel_id: &str) -> Option<&mut CallLeg> {
        for leg in [
            self.inbound_leg.as_mut(),
            self.outbound_leg.as_mut(),
            self.operator_leg.as_mut(),
        ] {
            if let Some(leg) = leg {
                if leg.channel_id == channel_id {
                    return Some(leg);
                }
            }
        }
        None
    }

    pub fn all_channel_ids(&self) -> Vec<String> {
        [&self.inbound_leg, &self.outbound_leg, &self.operator_leg]
            .into_iter()
            .flatten()
            .map(|leg| leg.channel_id.clone())
            .collect()
    }

    /// Mirrors `_set_result(session, value, force, report)`: only
    /// overwrites an existing non-placeholder result when `force` is set.
    pub fn set_result(&mut self, value: impl Into<String>, force: bool) -> bool {
        let placeholder = matches!(
            self.result.as_deref(),
            None | Some("user_didnt_answer") | Some("missed")
        );
        if force || placeholder {
            self.result = Some(value.into());
            true
        } else {
            false
        }
    }

    pub fn result_already_reported(&self) -> bool {
        self.metadata.get("result_reported").map(String::as_str) == Some("true")
    }

    pub fn mark_result_reported(&mut self) {
        self.metadata
            .insert("result_reported".to_string(), "true".to_string());
    }
}
