//! Session table and PBX event router. Ported from
//! `sessions/session_manager.py::SessionManager`, with the registry
//! indexing style (channel/playback/recording → session id) taken from
//! `session-core`'s `InternalSessionRegistry`.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::scenario::registry::ScenarioRegistry;
use crate::telephony::{AriClient, AriEvent};
use crate::wiring::{DialerNotifier, ScenarioHandler};

use super::{LegDirection, LegState, Session, SessionId, SessionStatus};

/// Result of a `ChannelStateChange` affecting a tracked leg — which
/// callback the scenario handler needs, and which leg caused it.
enum LegTransition {
    Answered(SessionId, LegDirection),
    Failed(SessionId, LegDirection),
}

/// Same cause set as `flow::result::is_failure_cause` (busy, congestion,
/// unavailable — §4.2's `ChannelHangupRequest` pre-notify rule), kept as
/// its own copy here so the session manager doesn't reach into `flow`.
fn is_busy_or_congestion_cause(cause: u16) -> bool {
    matches!(cause, 17 | 18 | 19 | 20 | 21 | 34 | 41 | 42)
}

pub struct SessionManager {
    sessions: DashMap<SessionId, Session>,
    channel_to_session: DashMap<String, SessionId>,
    playback_to_session: DashMap<String, SessionId>,
    recording_to_session: DashMap<String, SessionId>,
    ari: Arc<AriClient>,
    scenarios: Arc<ScenarioRegistry>,
    handler: arc_swap::ArcSwapOption<dyn ScenarioHandler>,
    dialer: arc_swap::ArcSwapOption<dyn DialerNotifier>,
    /// Inbound callers waiting for a line to free up, FIFO per line (§4.2).
    inbound_waiters: DashMap<String, VecDeque<(String, SessionId)>>,
}

impl SessionManager {
    pub fn new(ari: Arc<AriClient>, scenarios: Arc<ScenarioRegistry>) -> SessionManager {
        SessionManager {
            sessions: DashMap::new(),
            channel_to_session: DashMap::new(),
            playback_to_session: DashMap::new(),
            recording_to_session: DashMap::new(),
            ari,
            scenarios,
            handler: arc_swap::ArcSwapOption::empty(),
            dialer: arc_swap::ArcSwapOption::empty(),
            inbound_waiters: DashMap::new(),
        }
    }

    /// Set once during bootstrap, after the Flow Engine is constructed.
    pub fn set_scenario_handler(&self, handler: Arc<dyn ScenarioHandler>) {
        self.handler.store(Some(handler));
    }

    /// Set once during bootstrap, after the Dialer is constructed — gives
    /// inbound-call routing access to the trunk-line roster it shares with
    /// outbound origination (§4.2, §4.5).
    pub fn set_dialer_notifier(&self, dialer: Arc<dyn DialerNotifier>) {
        self.dialer.store(Some(dialer));
    }

    fn handler(&self) -> Option<Arc<dyn ScenarioHandler>> {
        self.handler.load_full()
    }

    fn dialer(&self) -> Option<Arc<dyn DialerNotifier>> {
        self.dialer.load_full()
    }

    pub fn create_session(&self, scenario_name: impl Into<String>, inbound: bool) -> SessionId {
        let id = Uuid::new_v4();
        let session = Session::new(id, scenario_name, inbound);
        self.sessions.insert(id, session);
        id
    }

    pub fn get(&self, id: SessionId) -> Option<dashmap::mapref::one::Ref<'_, SessionId, Session>> {
        self.sessions.get(&id)
    }

    pub fn get_mut(
        &self,
        id: SessionId,
    ) -> Option<dashmap::mapref::one::RefMut<'_, SessionId, Session>> {
        self.sessions.get_mut(&id)
    }

    pub fn register_channel(&self, channel_id: impl Into<String>, session_id: SessionId) {
        self.channel_to_session.insert(channel_id.into(), session_id);
    }

    /// Drops a single channel's index entry without touching the session
    /// itself — used when a leg (e.g. a failed operator-transfer attempt)
    /// is discarded in favor of dialing a fresh candidate.
    pub fn unregister_channel(&self, channel_id: &str) {
        self.channel_to_session.remove(channel_id);
    }

    pub fn register_playback(&self, playback_id: impl Into<String>, session_id: SessionId) {
        self.playback_to_session.insert(playback_id.into(), session_id);
    }

    pub fn register_recording(&self, recording_name: impl Into<String>, session_id: SessionId) {
        self.recording_to_session
            .insert(recording_name.into(), session_id);
    }

    fn session_for_channel(&self, channel_id: &str) -> Option<SessionId> {
        self.channel_to_session.get(channel_id).map(|r| *r)
    }

    /// Entry point for events coming off `AriEventStream`. Mirrors the
    /// original's big per-event-type `if/elif` ladder in `_on_event`.
    pub async fn handle_event(&self, event: AriEvent) {
        match event {
            AriEvent::StasisStart {
                channel_id,
                args,
                caller_number,
                dialed_extension,
                connected_number,
                ..
            } => {
                self.handle_stasis_start(channel_id, args, caller_number, dialed_extension, connected_number)
                    .await;
            }
            AriEvent::ChannelStateChange { channel_id, state } => {
                match self.handle_state_change(channel_id, state) {
                    Some(LegTransition::Answered(session_id, direction)) => {
                        if let Some(handler) = self.handler() {
                            handler.on_call_answered(session_id, direction).await;
                        }
                    }
                    Some(LegTransition::Failed(session_id, direction)) => {
                        if let Some(handler) = self.handler() {
                            handler.on_call_failed(session_id, direction).await;
                        }
                    }
                    None => {}
                }
            }
            AriEvent::ChannelHangupRequest { channel_id, cause, cause_txt } => {
                self.handle_hangup(channel_id, cause, cause_txt).await;
            }
            AriEvent::ChannelDestroyed { channel_id, cause, cause_txt } => {
                self.handle_hangup(channel_id, cause, cause_txt).await;
            }
            AriEvent::StasisEnd { channel_id } => {
                self.handle_stasis_end(channel_id).await;
            }
            AriEvent::PlaybackFinished { playback_id } => {
                self.handle_playback_finished(playback_id).await;
            }
            AriEvent::RecordingFinished { recording_name } => {
                self.handle_recording_finished(recording_name).await;
            }
            AriEvent::RecordingFailed { recording_name, .. } => {
                self.handle_recording_failed(recording_name).await;
            }
            AriEvent::PlaybackStarted { .. } | AriEvent::Other { .. } => {
                debug!(?event, "unhandled ARI event");
            }
        }
    }

    /// Routes a `StasisStart` by the Stasis app-args convention (§4.1, §6):
    /// `outbound,<session_id>` and `operator,<session_id>,<endpoint>` legs
    /// were already pre-registered synchronously right after origination,
    /// so those just fall through to the known-channel path below. Anything
    /// else — no args, or args we don't recognize — is a genuine inbound
    /// arrival and gets routed to trunk-line resolution instead of being
    /// hung up as an orphan.
    async fn handle_stasis_start(
        &self,
        channel_id: String,
        args: Vec<String>,
        caller_number: Option<String>,
        dialed_extension: Option<String>,
        connected_number: Option<String>,
    ) {
        if self.session_for_channel(&channel_id).is_none()
            && !matches!(args.first().map(String::as_str), Some("outbound") | Some("operator"))
        {
            self.handle_inbound_arrival(channel_id, caller_number, dialed_extension, connected_number)
                .await;
            return;
        }

        let Some(session_id) = self.session_for_channel(&channel_id) else {
            // An orphan leg (e.g. an operator channel whose session already
            // finished before it entered Stasis) must not be left ringing.
            warn!(channel_id, "StasisStart for unknown channel, hanging up orphan leg");
            if let Err(e) = self.ari.hangup_channel(&channel_id, None).await {
                if !e.is_not_found() {
                    warn!(channel_id, error = %e, "failed to hang up orphan channel");
                }
            }
            return;
        };
        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            if let Some(leg) = session.leg_for_channel(&channel_id) {
                leg.state = LegState::Ringing;
            }
            session.status = SessionStatus::Ringing;
        }
        if let Some(handler) = self.handler() {
            if let Err(e) = handler.on_session_started(session_id, channel_id).await {
                warn!(%session_id, error = %e, "scenario handler failed on session start");
            }
        }
    }

    /// A channel entered Stasis that this session manager never originated
    /// — a genuine inbound call. Resolves it to a trunk line, then either
    /// accepts it immediately or queues it behind other waiters on that
    /// line (§4.2, §4.5).
    async fn handle_inbound_arrival(
        &self,
        channel_id: String,
        caller_number: Option<String>,
        dialed_extension: Option<String>,
        connected_number: Option<String>,
    ) {
        let Some(dialer) = self.dialer() else {
            warn!(channel_id, "inbound call with no dialer wired, hanging up");
            self.hangup_orphan(&channel_id).await;
            return;
        };
        // `connected.number` is the far end's view of what it dialed;
        // prefer it over the dialplan extension when both are present.
        let dialed = connected_number
            .as_deref()
            .filter(|n| !n.is_empty())
            .or(dialed_extension.as_deref())
            .unwrap_or_default();
        let Some(line) = dialer.resolve_inbound_line(dialed).await else {
            warn!(channel_id, dialed, "inbound call dialed an unresolvable number, hanging up");
            self.hangup_orphan(&channel_id).await;
            return;
        };

        let Some(scenario) = self.scenarios.next_inbound_scenario() else {
            warn!(channel_id, line, "no enabled inbound scenario, hanging up");
            self.hangup_orphan(&channel_id).await;
            return;
        };
        let scenario_name = scenario.name.clone();

        let session_id = self.create_session(scenario_name, true);
        self.register_channel(channel_id.clone(), session_id);
        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            session.add_channel(&channel_id, LegDirection::Inbound, "inbound");
            session.outbound_line = Some(line.clone());
            if let Some(caller_number) = caller_number {
                session.metadata.insert("caller_number".to_string(), caller_number);
            }
            session.metadata.insert("dialed_number".to_string(), dialed.to_string());
            session.status = SessionStatus::Ringing;
        }

        if dialer.try_reserve_inbound(&line).await {
            self.accept_inbound_session(session_id, channel_id).await;
        } else {
            info!(%session_id, line, "inbound line saturated, queuing caller");
            if let Some(mut session) = self.sessions.get_mut(&session_id) {
                session.queued_line = Some(line.clone());
            }
            dialer.increment_waiting_inbound(&line).await;
            self.inbound_waiters
                .entry(line)
                .or_default()
                .push_back((channel_id, session_id));
        }
    }

    /// Answers a reserved inbound channel and hands the session to the flow
    /// engine, same as any other session start.
    async fn accept_inbound_session(&self, session_id: SessionId, channel_id: String) {
        if let Err(e) = self.ari.answer_channel(&channel_id).await {
            warn!(%session_id, channel_id, error = %e, "failed to answer inbound channel");
        }
        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            session.status = SessionStatus::Active;
            if let Some(leg) = session.leg_for_channel(&channel_id) {
                leg.state = LegState::Answered;
            }
        }
        if let Some(handler) = self.handler() {
            if let Err(e) = handler.on_session_started(session_id, channel_id).await {
                warn!(%session_id, error = %e, "scenario handler failed on inbound session start");
            }
        }
    }

    async fn hangup_orphan(&self, channel_id: &str) {
        if let Err(e) = self.ari.hangup_channel(channel_id, None).await {
            if !e.is_not_found() {
                warn!(channel_id, error = %e, "failed to hang up unroutable inbound channel");
            }
        }
    }

    /// Pops the next waiter on `line`, if any, and tries to promote it once
    /// capacity frees (called from cleanup when an active call on that line
    /// ends). Puts the waiter back at the front if the reservation races
    /// with another release and fails.
    async fn try_promote_waiting(&self, line: &str) {
        let Some(dialer) = self.dialer() else { return };
        let next = {
            let mut waiters = self.inbound_waiters.entry(line.to_string()).or_default();
            waiters.pop_front()
        };
        let Some((channel_id, session_id)) = next else {
            return;
        };
        if self.sessions.get(&session_id).map(|s| s.cleanup_done).unwrap_or(true) {
            // Caller hung up while queued; drop it and try the next one.
            dialer.decrement_waiting_inbound(line).await;
            Box::pin(self.try_promote_waiting(line)).await;
            return;
        }
        if dialer.try_reserve_inbound(line).await {
            dialer.decrement_waiting_inbound(line).await;
            if let Some(mut session) = self.sessions.get_mut(&session_id) {
                session.queued_line = None;
            }
            self.accept_inbound_session(session_id, channel_id).await;
        } else {
            self.inbound_waiters
                .entry(line.to_string())
                .or_default()
                .push_front((channel_id, session_id));
        }
    }

    /// Removes a session from its line's waiter queue — used when a queued
    /// caller hangs up before being promoted.
    fn remove_from_waiter_queue(&self, line: &str, session_id: SessionId) {
        if let Some(mut waiters) = self.inbound_waiters.get_mut(line) {
            waiters.retain(|(_, sid)| *sid != session_id);
        }
    }

    fn handle_state_change(&self, channel_id: String, state: String) -> Option<LegTransition> {
        let session_id = self.session_for_channel(&channel_id)?;
        let mut transition = None;
        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            if let Some(leg) = session.leg_for_channel(&channel_id) {
                if state == "Up" && leg.state != LegState::Answered {
                    leg.state = LegState::Answered;
                    transition = Some(LegTransition::Answered(session_id, leg.direction));
                } else if state == "Ringing" {
                    leg.state = LegState::Ringing;
                } else if (state == "Busy" || state == "Failed") && leg.state != LegState::Failed {
                    leg.state = LegState::Failed;
                    transition = Some(LegTransition::Failed(session_id, leg.direction));
                }
            }
            if state == "Up"
                && matches!(
                    session.outbound_leg.as_ref().map(|l| l.state),
                    Some(LegState::Answered)
                )
            {
                session.status = SessionStatus::Active;
            }
        }
        transition
    }

    async fn handle_hangup(&self, channel_id: String, cause: Option<u16>, cause_txt: Option<String>) {
        let Some(session_id) = self.session_for_channel(&channel_id) else {
            return;
        };
        let mut failed_leg_direction = None;
        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            if let Some(leg) = session.leg_for_channel(&channel_id) {
                leg.state = LegState::Hungup;
                if cause.is_some_and(is_busy_or_congestion_cause) {
                    failed_leg_direction = Some(leg.direction);
                }
            }
            if let Some(cause) = cause {
                session
                    .metadata
                    .insert("hangup_cause".to_string(), cause.to_string());
            }
            if let Some(cause_txt) = &cause_txt {
                session
                    .metadata
                    .insert("hangup_cause_txt".to_string(), cause_txt.clone());
            }
        }
        if let Some(handler) = self.handler() {
            // §4.2: a busy/congestion/unavailable hangup cause pre-notifies
            // `on_call_failed` before the hangup callback itself fires.
            if let Some(direction) = failed_leg_direction {
                handler.on_call_failed(session_id, direction).await;
            }
            handler.on_channel_hungup(session_id, cause, cause_txt).await;
        }
    }

    async fn handle_stasis_end(&self, channel_id: String) {
        let Some(session_id) = self.session_for_channel(&channel_id) else {
            return;
        };
        self.maybe_cleanup(session_id).await;
    }

    async fn handle_playback_finished(&self, playback_id: String) {
        let Some(session_id) = self.playback_to_session.remove(&playback_id).map(|(_, v)| v) else {
            return;
        };
        if let Some(handler) = self.handler() {
            handler.on_playback_finished(session_id, playback_id).await;
        }
    }

    async fn handle_recording_finished(&self, recording_name: String) {
        let Some(session_id) = self
            .recording_to_session
            .get(&recording_name)
            .map(|r| *r)
        else {
            return;
        };
        let already = self
            .sessions
            .get(&session_id)
            .map(|s| s.processed_recordings.contains(&recording_name))
            .unwrap_or(true);
        if already {
            debug!(recording_name, "recording already processed, ignoring duplicate event");
            return;
        }
        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            session.processed_recordings.insert(recording_name.clone());
        }
        if let Some(handler) = self.handler() {
            if let Err(e) = handler
                .on_recording_finished(session_id, recording_name)
                .await
            {
                warn!(%session_id, error = %e, "scenario handler failed on recording finished");
            }
        }
    }

    async fn handle_recording_failed(&self, recording_name: String) {
        let Some(session_id) = self
            .recording_to_session
            .get(&recording_name)
            .map(|r| *r)
        else {
            return;
        };
        if let Some(handler) = self.handler() {
            handler.on_recording_failed(session_id, recording_name).await;
        }
    }

    /// Drops every leg it can still reach, tears down the bridge if one
    /// exists, and removes the session's index entries. Idempotent via
    /// `cleanup_done` — `StasisEnd` firing for every leg of a multi-leg
    /// session must not double-run teardown.
    pub async fn maybe_cleanup(&self, session_id: SessionId) {
        let (channel_ids, bridge_id, inbound, outbound_line, queued_line) = {
            let Some(mut session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            if session.cleanup_done {
                return;
            }
            session.cleanup_done = true;
            session.status = SessionStatus::Completed;
            (
                session.all_channel_ids(),
                session.bridge.as_ref().map(|b| b.bridge_id.clone()),
                session.inbound,
                session.outbound_line.clone(),
                session.queued_line.clone(),
            )
        };

        for channel_id in &channel_ids {
            self.channel_to_session.remove(channel_id);
            if let Err(e) = self.ari.hangup_channel(channel_id, None).await {
                if !e.is_not_found() {
                    warn!(channel_id, error = %e, "hangup during cleanup failed");
                }
            }
        }

        if let Some(bridge_id) = bridge_id {
            if let Err(e) = self.ari.delete_bridge(&bridge_id).await {
                if !e.is_not_found() {
                    warn!(bridge_id, error = %e, "bridge delete during cleanup failed");
                }
            }
        }

        if inbound {
            if let Some(line) = outbound_line {
                if let Some(dialer) = self.dialer() {
                    if let Some(queued_line) = queued_line {
                        // Caller hung up before a slot ever freed for it.
                        dialer.decrement_waiting_inbound(&queued_line).await;
                        self.remove_from_waiter_queue(&queued_line, session_id);
                    } else {
                        dialer.release_inbound(&line).await;
                    }
                    self.try_promote_waiting(&line).await;
                }
            }
        }

        info!(%session_id, "session cleaned up");
    }

    /// Creates a mixing bridge and adds both the inbound and outbound legs
    /// to it, replacing direct channel audio once the operator (or the
    /// outbound party) needs to hear the other leg.
    pub async fn ensure_bridge(&self, session_id: SessionId) -> Result<String, crate::error::TelephonyError> {
        let existing = self
            .sessions
            .get(&session_id)
            .and_then(|s| s.bridge.as_ref().map(|b| b.bridge_id.clone()));
        if let Some(bridge_id) = existing {
            return Ok(bridge_id);
        }
        let bridge_id = self.ari.create_bridge("mixing").await?;
        let channel_ids = self
            .sessions
            .get(&session_id)
            .map(|s| s.all_channel_ids())
            .unwrap_or_default();
        for channel_id in &channel_ids {
            self.ari.add_channel_to_bridge(&bridge_id, channel_id).await?;
        }
        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            let mut bridge = super::BridgeInfo::new(bridge_id.clone());
            bridge.channels = channel_ids;
            session.bridge = Some(bridge);
        }
        Ok(bridge_id)
    }

    /// Sessions still in `Initiating`/`Ringing` after `max_age` — the
    /// dialer's missed-call watcher uses this to classify calls the far
    /// end never picked up, since ARI may not always deliver a clean
    /// hangup cause for an unanswered origination.
    pub fn stale_unanswered_sessions(&self, max_age: chrono::Duration) -> Vec<SessionId> {
        let now = chrono::Utc::now();
        self.sessions
            .iter()
            .filter(|entry| {
                matches!(
                    entry.value().status,
                    SessionStatus::Initiating | SessionStatus::Ringing
                ) && now - entry.value().created_at > max_age
            })
            .map(|entry| *entry.key())
            .collect()
    }

    /// Normalizes a dialed/caller number to the bare digit string the
    /// panel and dialer key contacts by (strips a leading `+` / `00`, and
    /// Iran's `98` country code down to the local `0…` form the original
    /// panel integration expects).
    pub fn normalize_number(raw: &str) -> String {
        let mut digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if let Some(stripped) = digits.strip_prefix("0098") {
            digits = format!("0{stripped}");
        } else if let Some(stripped) = digits.strip_prefix("98") {
            if digits.len() > 10 {
                digits = format!("0{stripped}");
            }
        }
        digits
    }
}
