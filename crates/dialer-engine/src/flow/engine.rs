//! Step interpreter: walks a scenario's `FlowStep` graph for one session,
//! driven by PBX events delivered through the `ScenarioHandler` trait.
//! Synchronous steps (classify_intent, route_by_intent,
//! check_retry_limit, set_result, wait) run to completion inside a single
//! `run_from` call; steps that wait on PBX feedback (play_prompt, record,
//! transfer_to_operator) park the session at `pending_next` and return,
//! to be resumed by the matching event callback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use tracing::{info, warn};

use crate::error::TelephonyError;
use crate::panel::{PanelAgent, PanelClient};
use crate::providers::{LlmClient, SttClient};
use crate::scenario::registry::ScenarioRegistry;
use crate::scenario::{AgentType, FlowStep, StepType};
use crate::session::manager::SessionManager;
use crate::session::{LegDirection, LegState, SessionId};
use crate::wiring::{DialerNotifier, LineReservation, ScenarioHandler};

use super::audio::is_empty_audio;
use super::result::{is_failure_cause, report_result, result_for_hangup_cause, TranscriptLogger};

pub struct FlowEngine {
    sessions: Arc<SessionManager>,
    ari: Arc<crate::telephony::AriClient>,
    scenarios: Arc<ScenarioRegistry>,
    panel: Arc<PanelClient>,
    llm: Arc<LlmClient>,
    stt: Arc<SttClient>,
    dialer: arc_swap::ArcSwapOption<dyn DialerNotifier>,
    lines: arc_swap::ArcSwapOption<dyn LineReservation>,
    transcripts: Option<Arc<TranscriptLogger>>,
    operator: crate::config::OperatorSettings,
    /// Agent phones/extensions currently occupied by an in-flight or
    /// active operator transfer, process-wide (§5, "shared-resource
    /// policy"). Keyed by the endpoint string dialed, not the agent id,
    /// so both panel-roster and static-mobile-number agents share it.
    agent_busy: DashSet<String>,
    rr_inbound: AtomicUsize,
    rr_outbound: AtomicUsize,
}

impl FlowEngine {
    pub fn new(
        sessions: Arc<SessionManager>,
        ari: Arc<crate::telephony::AriClient>,
        scenarios: Arc<ScenarioRegistry>,
        panel: Arc<PanelClient>,
        llm: Arc<LlmClient>,
        stt: Arc<SttClient>,
        transcripts: Option<Arc<TranscriptLogger>>,
        operator: crate::config::OperatorSettings,
    ) -> FlowEngine {
        FlowEngine {
            sessions,
            ari,
            scenarios,
            panel,
            llm,
            stt,
            dialer: arc_swap::ArcSwapOption::empty(),
            lines: arc_swap::ArcSwapOption::empty(),
            transcripts,
            operator,
            agent_busy: DashSet::new(),
            rr_inbound: AtomicUsize::new(0),
            rr_outbound: AtomicUsize::new(0),
        }
    }

    pub fn set_dialer_notifier(&self, dialer: Arc<dyn DialerNotifier>) {
        self.dialer.store(Some(dialer));
    }

    /// Set once during bootstrap so `transfer_to_operator` can borrow
    /// outbound trunk capacity through the Dialer's line roster (§4.3.1
    /// step 3) without owning it.
    pub fn set_line_reservation(&self, lines: Arc<dyn LineReservation>) {
        self.lines.store(Some(lines));
    }

    fn active_channel(&self, session_id: SessionId) -> Option<(String, bool)> {
        let session = self.sessions.get(session_id)?;
        let bridged = session.bridge.is_some();
        let leg = if session.inbound {
            session.inbound_leg.as_ref()
        } else {
            session.outbound_leg.as_ref()
        }?;
        Some((leg.channel_id.clone(), bridged))
    }

    fn step_for(&self, session_id: SessionId, step_id: &str) -> Option<FlowStep> {
        let session = self.sessions.get(session_id)?;
        let scenario = self.scenarios.get(&session.scenario_name)?;
        scenario.get_step(step_id, session.inbound).cloned()
    }

    fn entry_step_id(&self, session_id: SessionId) -> Option<String> {
        let session = self.sessions.get(session_id)?;
        let scenario = self.scenarios.get(&session.scenario_name)?;
        scenario.get_entry_step(session.inbound).map(|s| s.step.clone())
    }

    /// Drives synchronous steps forward until one needs to wait for a PBX
    /// event, then parks there.
    pub async fn run_from(&self, session_id: SessionId, mut step_id: String) {
        loop {
            let Some(step) = self.step_for(session_id, &step_id) else {
                warn!(%session_id, step_id, "flow step not found, ending session");
                self.finish(session_id, None).await;
                return;
            };
            if let Some(mut session) = self.sessions.get_mut(session_id) {
                session.current_step = Some(step_id.clone());
            }

            match step.step_type {
                StepType::Entry => {
                    let Some(next) = step.next.clone() else {
                        self.finish(session_id, None).await;
                        return;
                    };
                    step_id = next;
                }
                StepType::PlayPrompt => {
                    self.play_prompt(session_id, &step).await;
                    return;
                }
                StepType::Record => {
                    self.start_record(session_id, &step).await;
                    return;
                }
                StepType::ClassifyIntent => {
                    if self.classify_intent(session_id).await {
                        // Quota exhaustion already forced the result and
                        // tore the session down (§4.5/§7 quota protocol).
                        return;
                    }
                    let Some(next) = step.next.clone() else {
                        self.finish(session_id, None).await;
                        return;
                    };
                    step_id = next;
                }
                StepType::RouteByIntent => {
                    let intent = self
                        .sessions
                        .get(session_id)
                        .and_then(|s| s.last_intent.clone())
                        .unwrap_or_else(|| "unknown".to_string());
                    let routes = step.routes.clone().unwrap_or_default();
                    let Some(next) = routes.get(&intent).or_else(|| routes.get("unknown")).cloned()
                    else {
                        warn!(%session_id, step_id, intent, "no route for intent, ending session");
                        self.finish(session_id, None).await;
                        return;
                    };
                    step_id = next;
                }
                StepType::CheckRetryLimit => {
                    let counter_key = step.counter.clone().unwrap_or_else(|| step_id.clone());
                    let max_count = step.max_count.unwrap_or(1);
                    let count = {
                        let mut session = match self.sessions.get_mut(session_id) {
                            Some(s) => s,
                            None => return,
                        };
                        let entry = session.counters.entry(counter_key).or_insert(0);
                        *entry += 1;
                        *entry
                    };
                    let next = if count <= max_count {
                        step.within_limit.clone()
                    } else {
                        step.exceeded.clone()
                    };
                    let Some(next) = next else {
                        self.finish(session_id, None).await;
                        return;
                    };
                    step_id = next;
                }
                StepType::SetResult => {
                    if let Some(result) = step.result.clone() {
                        if let Some(mut session) = self.sessions.get_mut(session_id) {
                            session.set_result(result, false);
                        }
                    }
                    let Some(next) = step.next.clone() else {
                        self.finish(session_id, None).await;
                        return;
                    };
                    step_id = next;
                }
                StepType::TransferToOperator => {
                    let success = self.transfer_to_operator(session_id, &step).await;
                    let next = if success {
                        step.on_success.clone().or_else(|| step.next.clone())
                    } else {
                        step.next.clone()
                    };
                    let Some(next) = next else {
                        self.finish(session_id, None).await;
                        return;
                    };
                    step_id = next;
                }
                StepType::Disconnect | StepType::Hangup => {
                    if let Some(mut session) = self.sessions.get_mut(session_id) {
                        if let Some(result) = step.result.clone() {
                            session.set_result(result, false);
                        }
                        session.engine_hangup = true;
                    }
                    self.finish(session_id, None).await;
                    return;
                }
                StepType::Wait => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let Some(next) = step.next.clone() else {
                        self.finish(session_id, None).await;
                        return;
                    };
                    step_id = next;
                }
            }
        }
    }

    fn resolve_prompt_uri(&self, session_id: SessionId, prompt_key: &str) -> String {
        let session = self.sessions.get(session_id);
        let resolved = session
            .as_ref()
            .and_then(|s| self.scenarios.get(&s.scenario_name))
            .and_then(|sc| sc.prompts.get(prompt_key).cloned())
            .unwrap_or_else(|| prompt_key.to_string());
        format!("sound:{resolved}")
    }

    /// Starts a playback on whichever of the session's channel/bridge is
    /// currently live, and tags it in `session.playbacks` with the
    /// symbolic prompt key that was awaited (§3's `playbacks` invariant).
    /// `onhold` additionally gets tracked in `onhold_playback_id` so
    /// `on_playback_finished` can re-loop it.
    async fn start_playback(
        &self,
        session_id: SessionId,
        channel_id: &str,
        bridged: bool,
        prompt_key: &str,
    ) -> Result<String, TelephonyError> {
        let media_uri = self.resolve_prompt_uri(session_id, prompt_key);
        let playback_id = if bridged {
            let bridge_id = self
                .sessions
                .get(session_id)
                .and_then(|s| s.bridge.as_ref().map(|b| b.bridge_id.clone()));
            match bridge_id {
                Some(bridge_id) => self.ari.play_on_bridge(&bridge_id, &media_uri).await?,
                None => self.ari.play_on_channel(channel_id, &media_uri).await?,
            }
        } else {
            self.ari.play_on_channel(channel_id, &media_uri).await?
        };
        self.sessions.register_playback(playback_id.clone(), session_id);
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.playbacks.insert(playback_id.clone(), prompt_key.to_string());
            if prompt_key == "onhold" {
                session.onhold_playback_id = Some(playback_id.clone());
            }
        }
        Ok(playback_id)
    }

    async fn play_prompt(&self, session_id: SessionId, step: &FlowStep) {
        let Some((channel_id, bridged)) = self.active_channel(session_id) else {
            self.finish(session_id, None).await;
            return;
        };
        let prompt_key = step.prompt.clone().unwrap_or_default();
        match self.start_playback(session_id, &channel_id, bridged, &prompt_key).await {
            Ok(_) => {
                if let Some(mut session) = self.sessions.get_mut(session_id) {
                    session.pending_next = step.next.clone();
                }
            }
            Err(e) => {
                warn!(%session_id, error = %e, "failed to start playback");
                self.finish(session_id, Some("failed:playback_start".to_string())).await;
            }
        }
    }

    async fn start_record(&self, session_id: SessionId, step: &FlowStep) {
        let Some((channel_id, _bridged)) = self.active_channel(session_id) else {
            self.finish(session_id, None).await;
            return;
        };
        let (max_duration, max_silence) = {
            let session = self.sessions.get(session_id);
            session
                .as_ref()
                .and_then(|s| self.scenarios.get(&s.scenario_name))
                .map(|sc| (sc.stt.max_duration, sc.stt.max_silence))
                .unwrap_or((10, 2))
        };
        let recording_name = format!("rec-{session_id}-{}", step.step);

        match self
            .ari
            .record_channel(&channel_id, &recording_name, max_duration, max_silence)
            .await
        {
            Ok(()) => {
                self.sessions.register_recording(recording_name, session_id);
            }
            Err(e) => {
                warn!(%session_id, error = %e, "failed to start recording");
                let next = step.on_failure.clone().or_else(|| step.next.clone());
                match next {
                    Some(next) => Box::pin(self.run_from(session_id, next)).await,
                    None => self.finish(session_id, None).await,
                }
            }
        }
    }

    /// Returns `true` if an LLM quota failure forced the session to a
    /// terminal `failed:llm_quota` result and torn it down already (§4.5,
    /// §7's quota-exhaustion protocol) — the caller must stop walking the
    /// flow graph in that case rather than continuing to `next`.
    async fn classify_intent(&self, session_id: SessionId) -> bool {
        let (transcript, llm_config, scenario_name) = {
            let Some(session) = self.sessions.get(session_id) else {
                return false;
            };
            let Some(transcript) = session.responses.last().cloned() else {
                return false;
            };
            let Some(scenario) = self.scenarios.get(&session.scenario_name) else {
                return false;
            };
            (transcript, scenario.llm.clone(), session.scenario_name.clone())
        };
        let _ = scenario_name;

        let system_prompt = format!(
            "{}\nRespond with strict JSON: {{\"intent\": one of {:?}}}.",
            llm_config.prompt_template, llm_config.intent_categories
        );
        let messages = vec![
            ("system".to_string(), system_prompt),
            ("user".to_string(), transcript.clone()),
        ];

        let intent = match self.llm.chat(&messages, "gpt-4o-mini", 0.2, true).await {
            Ok(raw) => parse_intent(&raw, &llm_config.intent_categories, &llm_config.fallback_tokens, &transcript),
            Err(e) => {
                warn!(%session_id, error = %e, "LLM classification failed");
                if matches!(e, crate::error::ProviderError::QuotaExhausted(_)) {
                    self.handle_quota_exhaustion(session_id, "llm_quota").await;
                    return true;
                }
                "unknown".to_string()
            }
        };

        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.last_intent = Some(intent.clone());
        }
        if let Some(transcripts) = &self.transcripts {
            transcripts.log(session_id, &intent, &transcript);
        }
        false
    }

    /// §7's quota-exhaustion protocol: force `failed:<reason>`, mark the
    /// hangup as engine-initiated, pause the dialer (which also fires the
    /// SMS alert), then tear the session down and report it.
    async fn handle_quota_exhaustion(&self, session_id: SessionId, reason: &str) {
        if let Some(dialer) = self.dialer.load_full() {
            dialer.force_pause_for_quota(reason).await;
        }
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.set_result(format!("failed:{reason}"), true);
            session.engine_hangup = true;
        }
        if let Some((channel_id, _)) = self.active_channel(session_id) {
            if let Err(e) = self.ari.hangup_channel(&channel_id, None).await {
                if !e.is_not_found() {
                    warn!(%session_id, error = %e, "failed to hang up after quota exhaustion");
                }
            }
        }
        self.finish(session_id, None).await;
    }

    /// Reserves a trunk to dial an agent phone/extension over, preferring
    /// the dialer's shared line pool (so operator transfers count against
    /// the same capacity accounting as outbound origination) and falling
    /// back to the statically configured `operator.trunk` when the pool
    /// isn't wired or is saturated. The `bool` says whether the trunk came
    /// from the pool and therefore needs releasing later.
    /// §4.3.1 step 3: pauses queue originations (`request_operator_priority`)
    /// and polls `LineReservation::reserve_outbound_line` up to
    /// `operator.timeout` seconds before giving up and falling back to the
    /// static `operator.trunk`.
    async fn reserve_operator_trunk(&self) -> Option<(String, bool)> {
        if let Some(lines) = self.lines.load_full() {
            let dialer = self.dialer.load_full();
            if let Some(dialer) = &dialer {
                dialer.request_operator_priority().await;
            }
            let deadline = tokio::time::Instant::now() + Duration::from_secs(self.operator.timeout_secs.max(1));
            let mut reserved = None;
            loop {
                if let Some(trunk) = lines.reserve_outbound_line().await {
                    reserved = Some(trunk);
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            if let Some(dialer) = &dialer {
                dialer.release_operator_priority().await;
            }
            if let Some(trunk) = reserved {
                return Some((trunk, true));
            }
        }
        if !self.operator.trunk.is_empty() {
            return Some((self.operator.trunk.clone(), false));
        }
        None
    }

    async fn release_operator_line(&self, trunk: &str) {
        if let Some(lines) = self.lines.load_full() {
            lines.release_outbound_line(trunk).await;
        }
    }

    async fn stop_onhold(&self, session_id: SessionId) {
        let playback_id = self
            .sessions
            .get_mut(session_id)
            .and_then(|mut s| s.onhold_playback_id.take());
        if let Some(playback_id) = playback_id {
            if let Err(e) = self.ari.stop_playback(&playback_id).await {
                warn!(%session_id, error = %e, "failed to stop onhold playback");
            }
        }
    }

    /// Originates toward the next free candidate for this transfer: first
    /// the panel agent roster (round-robin, skipping whoever `agent_busy`
    /// already holds), then the statically configured mobile numbers
    /// (each needing its own reserved trunk line), then the single static
    /// operator endpoint as a last resort (§4.3.1 steps 2-6).
    ///
    /// Returns the originated channel id, the agent id/phone to report
    /// against the call, and the trunk line reserved for it (if any), all
    /// tagged with the `agent_busy` key this session now holds.
    async fn pick_and_originate(
        &self,
        session_id: SessionId,
        inbound: bool,
    ) -> Option<(String, Option<i64>, Option<String>, Option<String>, String)> {
        let roster = if self.operator.use_panel_agents {
            self.panel.cached_agents(inbound).await
        } else {
            Vec::new()
        };

        let rr = if inbound { &self.rr_inbound } else { &self.rr_outbound };
        let start = rr.fetch_add(1, Ordering::Relaxed);
        let n = roster.len();
        for i in 0..n {
            let agent: &PanelAgent = &roster[(start + i) % n];
            let busy_key = agent.extension.clone();
            if self.agent_busy.contains(&busy_key) || !self.agent_busy.insert(busy_key.clone()) {
                continue;
            }
            let Some((trunk, reserved)) = self.reserve_operator_trunk().await else {
                self.agent_busy.remove(&busy_key);
                continue;
            };
            let endpoint = format!("PJSIP/{}@{trunk}", agent.extension);
            match self
                .ari
                .originate_call(
                    &endpoint,
                    &self.operator.caller_id,
                    Duration::from_secs(self.operator.timeout_secs),
                    &std::collections::HashMap::new(),
                )
                .await
            {
                Ok(channel_id) => {
                    let line = reserved.then_some(trunk);
                    return Some((channel_id, Some(agent.agent_id), Some(agent.extension.clone()), line, busy_key));
                }
                Err(e) => {
                    warn!(%session_id, agent_id = agent.agent_id, error = %e, "failed to originate to agent, trying next");
                    self.agent_busy.remove(&busy_key);
                    if reserved {
                        self.release_operator_line(&trunk).await;
                    }
                }
            }
        }

        for number in &self.operator.mobile_numbers {
            if self.agent_busy.contains(number) || !self.agent_busy.insert(number.clone()) {
                continue;
            }
            let Some((trunk, reserved)) = self.reserve_operator_trunk().await else {
                self.agent_busy.remove(number);
                continue;
            };
            let endpoint = format!("PJSIP/{number}@{trunk}");
            match self
                .ari
                .originate_call(
                    &endpoint,
                    &self.operator.caller_id,
                    Duration::from_secs(self.operator.timeout_secs),
                    &std::collections::HashMap::new(),
                )
                .await
            {
                Ok(channel_id) => {
                    let line = reserved.then_some(trunk);
                    return Some((channel_id, None, Some(number.clone()), line, number.clone()));
                }
                Err(e) => {
                    warn!(%session_id, error = %e, "failed to originate to mobile operator, trying next");
                    self.agent_busy.remove(number);
                    if reserved {
                        self.release_operator_line(&trunk).await;
                    }
                }
            }
        }

        if !self.operator.endpoint.is_empty() && self.agent_busy.insert(self.operator.endpoint.clone()) {
            match self
                .ari
                .originate_call(
                    &self.operator.endpoint,
                    &self.operator.caller_id,
                    Duration::from_secs(self.operator.timeout_secs),
                    &std::collections::HashMap::new(),
                )
                .await
            {
                Ok(channel_id) => {
                    return Some((channel_id, None, None, None, self.operator.endpoint.clone()));
                }
                Err(e) => {
                    warn!(%session_id, error = %e, "failed to originate to static operator endpoint");
                    self.agent_busy.remove(&self.operator.endpoint);
                }
            }
        }

        None
    }

    /// Originates an operator leg for `session_id` and parks it in the
    /// session's `operator_leg`, returning once it is dialing. The onhold
    /// loop (started here) keeps playing until `on_call_answered` fires
    /// for the operator leg or the transfer is abandoned. Returns whether
    /// a candidate was actually dialed — not whether anyone answered,
    /// since that only becomes known asynchronously.
    async fn transfer_to_operator(&self, session_id: SessionId, step: &FlowStep) -> bool {
        let already_started = match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                let started = session.operator_call_started;
                session.operator_call_started = true;
                started
            }
            None => return false,
        };
        if already_started {
            warn!(%session_id, "operator transfer already attempted for this session, refusing to double-dial");
            return false;
        }

        let inbound = step
            .agent_type
            .map(|t| t == AgentType::Inbound)
            .unwrap_or_else(|| self.sessions.get(session_id).map(|s| s.inbound).unwrap_or(false));

        if let Some((channel_id, bridged)) = self.active_channel(session_id) {
            if let Err(e) = self.start_playback(session_id, &channel_id, bridged, "onhold").await {
                warn!(%session_id, error = %e, "failed to start onhold playback");
            }
        }

        let Some((channel_id, agent_id, agent_phone, trunk, busy_key)) =
            self.pick_and_originate(session_id, inbound).await
        else {
            warn!(%session_id, "exhausted operator candidates, transfer failed");
            self.stop_onhold(session_id).await;
            if let Some(mut session) = self.sessions.get_mut(session_id) {
                let result = if session.inbound { "disconnected" } else { "failed:operator_failed" };
                session.set_result(result, false);
            }
            return false;
        };

        self.assign_operator_leg(session_id, channel_id, agent_id, agent_phone, trunk, busy_key);
        true
    }

    fn assign_operator_leg(
        &self,
        session_id: SessionId,
        channel_id: String,
        agent_id: Option<i64>,
        agent_phone: Option<String>,
        trunk: Option<String>,
        busy_key: String,
    ) {
        self.sessions.register_channel(channel_id.clone(), session_id);
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.add_channel(&channel_id, LegDirection::Operator, &channel_id);
            session.agent_id = agent_id;
            session.agent_phone = agent_phone;
            session.operator_line = trunk;
            session.operator_busy_key = Some(busy_key);
        }
    }

    /// §4.3.1 step 6's async counterpart: the operator leg we just
    /// originated came back `Busy`/`Failed` rather than answering. Frees
    /// the trunk line that candidate held (but leaves it marked busy in
    /// `agent_busy`, so the next pick doesn't re-dial it) and tries the
    /// next candidate in the cascade; on exhaustion, tears the transfer
    /// down the same way the synchronous exhaustion path does.
    async fn retry_operator(&self, session_id: SessionId) {
        let (old_channel, line, inbound) = match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                let old_channel = session.operator_leg.take().map(|l| l.channel_id);
                let line = session.operator_line.take();
                (old_channel, line, session.inbound)
            }
            None => return,
        };
        if let Some(channel_id) = &old_channel {
            self.sessions.unregister_channel(channel_id);
        }
        if let Some(trunk) = line {
            self.release_operator_line(&trunk).await;
        }

        match self.pick_and_originate(session_id, inbound).await {
            Some((channel_id, agent_id, agent_phone, trunk, busy_key)) => {
                self.assign_operator_leg(session_id, channel_id, agent_id, agent_phone, trunk, busy_key);
            }
            None => {
                warn!(%session_id, "exhausted operator candidates after failed leg, abandoning transfer");
                self.stop_onhold(session_id).await;
                if let Some(mut session) = self.sessions.get_mut(session_id) {
                    let result = if session.inbound { "disconnected" } else { "failed:operator_failed" };
                    session.set_result(result, false);
                    session.engine_hangup = true;
                }
                self.finish(session_id, None).await;
            }
        }
    }

    async fn finish(&self, session_id: SessionId, fallback_result: Option<String>) {
        if let (Some(result), Some(mut session)) = (fallback_result, self.sessions.get_mut(session_id)) {
            session.set_result(result, false);
        }
        self.release_operator_resources(session_id).await;
        self.sessions.maybe_cleanup(session_id).await;

        // §4.5's failure-streak accounting must run before this session's
        // own report goes out, so a report that newly crosses the pause
        // threshold can carry `call_allowed=false` for its own contact
        // ("the triggering contact") rather than only affecting the next one.
        let mut call_allowed_override = None;
        if let Some(dialer) = self.dialer.load_full() {
            let (result, number_id) = self
                .sessions
                .get(session_id)
                .map(|s| {
                    (
                        s.result.clone(),
                        s.metadata.get("number_id").and_then(|v| v.parse::<i64>().ok()),
                    )
                })
                .unwrap_or((None, None));
            if let Some(result) = &result {
                if dialer.on_session_result(result, number_id).await {
                    call_allowed_override = Some(false);
                }
            }
            report_result(&self.sessions, &self.panel, session_id, call_allowed_override).await;
            dialer.on_outbound_session_ended(session_id, result).await;
        } else {
            report_result(&self.sessions, &self.panel, session_id, None).await;
        }
    }

    /// Frees whatever this session's operator transfer holds: the
    /// `agent_busy` slot and, if one was taken from the shared pool, the
    /// reserved trunk line.
    async fn release_operator_resources(&self, session_id: SessionId) {
        let (busy_key, line) = match self.sessions.get_mut(session_id) {
            Some(mut session) => (session.operator_busy_key.take(), session.operator_line.take()),
            None => return,
        };
        if let Some(busy_key) = busy_key {
            self.agent_busy.remove(&busy_key);
        }
        if let Some(trunk) = line {
            self.release_operator_line(&trunk).await;
        }
    }
}

fn parse_intent(
    raw: &str,
    categories: &[String],
    fallback_tokens: &std::collections::HashMap<String, Vec<String>>,
    transcript: &str,
) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
        if let Some(intent) = value["intent"].as_str() {
            if categories.iter().any(|c| c == intent) {
                return intent.to_string();
            }
        }
    }
    let lowered = transcript.to_lowercase();
    for category in categories {
        if let Some(tokens) = fallback_tokens.get(category) {
            if tokens.iter().any(|t| lowered.contains(&t.to_lowercase())) {
                return category.clone();
            }
        }
    }
    "unknown".to_string()
}

#[async_trait]
impl ScenarioHandler for FlowEngine {
    async fn on_session_started(&self, session_id: SessionId, channel_id: String) -> Result<(), TelephonyError> {
        let is_operator_leg = self
            .sessions
            .get(session_id)
            .and_then(|s| s.operator_leg.as_ref().map(|l| l.channel_id == channel_id))
            .unwrap_or(false);
        if is_operator_leg {
            // The operator leg entering Stasis just means it's dialing; it
            // answers asynchronously and gets bridged by `on_call_answered`,
            // not by re-running the scenario's entry step.
            self.ari.answer_channel(&channel_id).await?;
            return Ok(());
        }

        if let Some(entry) = self.entry_step_id(session_id) {
            self.ari.answer_channel(&channel_id).await?;
            self.run_from(session_id, entry).await;
        }
        Ok(())
    }

    async fn on_recording_finished(
        &self,
        session_id: SessionId,
        recording_name: String,
    ) -> Result<(), TelephonyError> {
        let Some(step_id) = self.sessions.get(session_id).and_then(|s| s.current_step.clone())
        else {
            return Ok(());
        };
        let Some(step) = self.step_for(session_id, &step_id) else {
            return Ok(());
        };

        let audio = self.ari.fetch_stored_recording(&recording_name).await?;
        if is_empty_audio(&audio) {
            info!(%session_id, recording_name, "empty recording");
            let next = step.on_empty.clone().or_else(|| step.next.clone());
            match next {
                Some(next) => Box::pin(self.run_from(session_id, next)).await,
                None => self.finish(session_id, None).await,
            }
            return Ok(());
        }

        let hotwords = self
            .sessions
            .get(session_id)
            .and_then(|s| self.scenarios.get(&s.scenario_name))
            .map(|sc| sc.stt.hotwords.clone())
            .unwrap_or_default();

        match self.stt.transcribe(audio, &hotwords).await {
            Ok(result) if !result.text.trim().is_empty() => {
                if let Some(mut session) = self.sessions.get_mut(session_id) {
                    session.responses.push(result.text);
                }
                let next = step.next.clone();
                match next {
                    Some(next) => Box::pin(self.run_from(session_id, next)).await,
                    None => self.finish(session_id, None).await,
                }
            }
            Ok(_) => {
                let next = step.on_empty.clone().or_else(|| step.next.clone());
                match next {
                    Some(next) => Box::pin(self.run_from(session_id, next)).await,
                    None => self.finish(session_id, None).await,
                }
            }
            Err(e) => {
                warn!(%session_id, error = %e, "STT transcription failed");
                if matches!(e, crate::error::ProviderError::QuotaExhausted(_)) {
                    self.handle_quota_exhaustion(session_id, "vira_quota").await;
                    return Ok(());
                }
                let next = step.on_failure.clone().or_else(|| step.next.clone());
                match next {
                    Some(next) => Box::pin(self.run_from(session_id, next)).await,
                    None => self.finish(session_id, None).await,
                }
            }
        }
        Ok(())
    }

    async fn on_recording_failed(&self, session_id: SessionId, recording_name: String) {
        warn!(%session_id, recording_name, "recording failed");
        let step = self
            .sessions
            .get(session_id)
            .and_then(|s| s.current_step.clone())
            .and_then(|step_id| self.step_for(session_id, &step_id));
        let next = step.and_then(|s| s.on_failure.or(s.next));
        match next {
            Some(next) => self.run_from(session_id, next).await,
            None => self.finish(session_id, None).await,
        }
    }

    async fn on_playback_finished(&self, session_id: SessionId, playback_id: String) {
        let is_onhold = self
            .sessions
            .get(session_id)
            .map(|s| s.onhold_playback_id.as_deref() == Some(playback_id.as_str()))
            .unwrap_or(false);
        if is_onhold {
            let still_waiting = self
                .sessions
                .get(session_id)
                .map(|s| !s.operator_connected && !s.cleanup_done)
                .unwrap_or(false);
            if still_waiting {
                if let Some((channel_id, bridged)) = self.active_channel(session_id) {
                    if let Err(e) = self.start_playback(session_id, &channel_id, bridged, "onhold").await {
                        warn!(%session_id, error = %e, "failed to re-loop onhold playback");
                    }
                }
            } else if let Some(mut session) = self.sessions.get_mut(session_id) {
                session.onhold_playback_id = None;
            }
            return;
        }

        let next = self
            .sessions
            .get(session_id)
            .and_then(|s| s.pending_next.clone());
        match next {
            Some(next) => self.run_from(session_id, next).await,
            None => self.finish(session_id, None).await,
        }
    }

    async fn on_channel_hungup(&self, session_id: SessionId, cause: Option<u16>, cause_txt: Option<String>) {
        let operator_connected = self
            .sessions
            .get(session_id)
            .map(|s| s.operator_connected)
            .unwrap_or(false);

        if !operator_connected {
            let prior = self.sessions.get(session_id).and_then(|s| s.result.clone());
            let cause_driven = cause.filter(|c| is_failure_cause(*c)).map(|c| {
                result_for_hangup_cause(c, cause_txt.as_deref(), prior.as_deref())
            });

            let result = match cause_driven {
                Some(result) => result,
                None => {
                    let (last_intent, operator_answered, engine_hangup) = self
                        .sessions
                        .get(session_id)
                        .map(|s| {
                            let operator_answered = s
                                .operator_leg
                                .as_ref()
                                .map(|l| l.state == LegState::Answered)
                                .unwrap_or(false);
                            (s.last_intent.clone(), operator_answered, s.engine_hangup)
                        })
                        .unwrap_or((None, false, false));
                    match last_intent.as_deref() {
                        Some("yes") if !operator_answered => "disconnected".to_string(),
                        Some("no") => "not_interested".to_string(),
                        _ if engine_hangup => "failed:hangup".to_string(),
                        _ => "hangup".to_string(),
                    }
                }
            };
            if let Some(mut session) = self.sessions.get_mut(session_id) {
                session.set_result(result, false);
            }
        }
        self.finish(session_id, None).await;
    }

    async fn on_call_answered(&self, session_id: SessionId, direction: LegDirection) {
        if direction != LegDirection::Operator {
            return;
        }
        self.stop_onhold(session_id).await;
        if let Err(e) = self.sessions.ensure_bridge(session_id).await {
            warn!(%session_id, error = %e, "failed to bridge operator leg after answer");
            return;
        }
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            let result = if session.inbound { "inbound_call" } else { "connected_to_operator" };
            session.set_result(result, true);
            session.operator_connected = true;
        }
    }

    async fn on_call_failed(&self, session_id: SessionId, direction: LegDirection) {
        if direction == LegDirection::Operator {
            info!(%session_id, "operator leg failed, retrying next candidate");
            self.retry_operator(session_id).await;
        }
    }
}
