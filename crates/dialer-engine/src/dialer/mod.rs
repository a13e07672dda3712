//! Outbound call scheduler. Ported from `dialer.py::Dialer`: pull a batch
//! of numbers from the panel, respect the call window and the
//! per-minute/per-day/per-second caps, originate onto whichever trunk
//! line has capacity, and hand the resulting session to the Flow Engine.

pub mod line;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Timelike;
use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::config::DialerSettings;
use crate::panel::{PanelClient, PanelNumber};
use crate::providers::SmsClient;
use crate::scenario::registry::ScenarioRegistry;
use crate::session::manager::SessionManager;
use crate::session::{LegDirection, SessionId};
use crate::wiring::{DialerNotifier, LineReservation};

use line::{reconcile_from_panel, TrunkLine};

pub struct Dialer {
    sessions: Arc<SessionManager>,
    ari: Arc<crate::telephony::AriClient>,
    panel: Arc<PanelClient>,
    scenarios: Arc<ScenarioRegistry>,
    sms: Arc<SmsClient>,
    settings: DialerSettings,
    lines: Mutex<Vec<TrunkLine>>,
    queue: AsyncMutex<VecDeque<PanelNumber>>,
    active_batch_id: Mutex<Option<String>>,
    consecutive_failures: AtomicU32,
    /// Global count of accepted inbound sessions, independent of which line
    /// they landed on. Only enforced as a ceiling when
    /// `max_concurrent_inbound_calls` is positive (Open Question: a 0 means
    /// "no additional global cap, just the per-line budget").
    active_inbound_total: AtomicU32,
    sms_fail_threshold: u32,
    /// §4.5 "Failure-streak alerting": consecutive `failed:*` panel results
    /// against known contacts, and the pause it trips once it reaches
    /// `sms_fail_threshold`. Distinct from `consecutive_failures`, which
    /// tracks origination-transport failures for the trunk-health alert.
    failure_streak: AtomicU32,
    paused_by_failures: std::sync::atomic::AtomicBool,
    /// Set by the panel's `call_allowed=false` response; cleared on the
    /// next `call_allowed=true` batch (§4.5 step 2). Backed by the same
    /// flag as the failure-streak pause, since both are "don't originate
    /// queue work right now" signals the main loop treats identically.
    panel_retry_after: Mutex<Option<std::time::Instant>>,
    /// §4.3.1 step 3: count of in-flight operator transfers currently
    /// polling for a free trunk. Non-zero means the scheduling loop yields
    /// queue originations so the transfer can win the next free line.
    operator_priority_requests: AtomicU32,
}

impl Dialer {
    pub fn new(
        sessions: Arc<SessionManager>,
        ari: Arc<crate::telephony::AriClient>,
        panel: Arc<PanelClient>,
        scenarios: Arc<ScenarioRegistry>,
        sms: Arc<SmsClient>,
        settings: DialerSettings,
        sms_fail_threshold: u32,
    ) -> Dialer {
        let initial_lines = if settings.outbound_numbers.is_empty() {
            if settings.outbound_trunk.is_empty() {
                Vec::new()
            } else {
                vec![TrunkLine::with_number(
                    settings.outbound_trunk.clone(),
                    settings.default_caller_id.clone(),
                    settings.default_caller_id.clone(),
                )]
            }
        } else {
            settings
                .outbound_numbers
                .iter()
                .map(|number| {
                    TrunkLine::with_number(
                        settings.outbound_trunk.clone(),
                        number.clone(),
                        settings.default_caller_id.clone(),
                    )
                })
                .collect()
        };
        Dialer {
            sessions,
            ari,
            panel,
            scenarios,
            sms,
            settings,
            lines: Mutex::new(initial_lines),
            queue: AsyncMutex::new(VecDeque::new()),
            active_batch_id: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            active_inbound_total: AtomicU32::new(0),
            sms_fail_threshold,
            failure_streak: AtomicU32::new(0),
            paused_by_failures: std::sync::atomic::AtomicBool::new(false),
            panel_retry_after: Mutex::new(None),
            operator_priority_requests: AtomicU32::new(0),
        }
    }

    async fn alert_failure_streak(&self, reason: &str) {
        self.paused_by_failures.store(true, Ordering::Relaxed);
        warn!(reason, "dialer pausing outbound origination on failure streak");
        if let Err(e) = self
            .sms
            .send_message(
                &format!("Dialer: outbound calling paused ({reason}), consecutive failure threshold reached."),
                None,
            )
            .await
        {
            warn!(error = %e, "failed to send failure-streak SMS alert");
        }
    }

    fn within_call_window(&self) -> bool {
        let now = chrono::Local::now();
        let minutes_now = now.hour() * 60 + now.minute();
        let (sh, sm) = self.settings.call_window_start;
        let (eh, em) = self.settings.call_window_end;
        let start = sh * 60 + sm;
        let end = eh * 60 + em;
        if start <= end {
            minutes_now >= start && minutes_now <= end
        } else {
            // window wraps midnight
            minutes_now >= start || minutes_now <= end
        }
    }

    async fn refill_queue_if_empty(&self) {
        let mut queue = self.queue.lock().await;
        if !queue.is_empty() {
            return;
        }
        if let Some(until) = *self.panel_retry_after.lock() {
            if std::time::Instant::now() < until {
                return;
            }
        }

        // §4.4 delivery guarantee: every batch poll is a chance to flush
        // whatever the last report-result POST failed to deliver.
        self.panel.flush_pending().await;

        let batch = self.panel.get_next_batch(self.settings.batch_size).await;

        if !batch.call_allowed {
            let retry_after = if batch.retry_after_seconds > 0 {
                batch.retry_after_seconds
            } else {
                self.settings.default_retry_secs
            };
            *self.panel_retry_after.lock() =
                Some(std::time::Instant::now() + Duration::from_secs(retry_after));
            self.paused_by_failures.store(true, Ordering::Relaxed);
            debug!(retry_after, reason = ?batch.reason, "panel disallowed further calls, backing off");
            return;
        }
        *self.panel_retry_after.lock() = None;
        self.paused_by_failures.store(false, Ordering::Relaxed);
        self.failure_streak.store(0, Ordering::Relaxed);

        if !batch.active_scenarios.is_empty() {
            self.scenarios.set_enabled(batch.active_scenarios);
        }
        {
            let mut lines = self.lines.lock();
            reconcile_from_panel(&mut lines, &batch.outbound_lines, &self.settings.default_caller_id);
        }
        *self.active_batch_id.lock() = batch.batch_id.clone();
        if batch.numbers.is_empty() {
            for number in &self.settings.static_contacts {
                queue.push_back(PanelNumber {
                    number_id: 0,
                    phone_number: number.clone(),
                    scenario: None,
                    retry_count: 0,
                });
            }
        } else {
            queue.extend(batch.numbers);
        }
    }

    /// Reserves whichever line has outbound capacity, bumping its
    /// `active_outbound`/rolling/daily counters. Lines are keyed by
    /// `phone_number`, since several lines can share one SIP trunk name.
    fn reserve_line(&self) -> Option<TrunkLine> {
        let mut lines = self.lines.lock();
        let settings = &self.settings;
        let max_concurrent = settings.max_concurrent_outbound_calls;
        let line = lines
            .iter_mut()
            .filter(|l| {
                l.has_outbound_capacity(max_concurrent, settings.max_calls_per_minute, settings.max_calls_per_day)
            })
            .min_by_key(|l| (l.total_active(), l.rolling_count(), l.daily_count))?;
        line.active_outbound += 1;
        line.record_outbound_attempt();
        Some(line.clone())
    }

    /// Main scheduling loop; runs until `stop` fires. Per-minute/per-day
    /// caps now live on each `TrunkLine`'s own rolling window, so the loop
    /// only needs to pace origination attempts.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut per_second = tokio::time::interval(Duration::from_secs_f64(
            1.0 / self.settings.max_originations_per_second.max(0.01),
        ));
        let mut daily_reset_check = tokio::time::interval(Duration::from_secs(60));

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return;
                    }
                }
                _ = daily_reset_check.tick() => {
                    let today = chrono::Utc::now().date_naive();
                    let mut lines = self.lines.lock();
                    for line in lines.iter_mut() {
                        line.reset_daily_if_rolled(today);
                    }
                }
                _ = per_second.tick() => {
                    self.try_originate_next().await;
                }
            }
        }
    }

    async fn try_originate_next(&self) {
        if !self.within_call_window() {
            return;
        }
        if self.paused_by_failures.load(Ordering::Relaxed) {
            return;
        }
        if self.operator_priority_requests.load(Ordering::Relaxed) > 0 {
            return;
        }

        self.refill_queue_if_empty().await;

        let Some(line) = self.reserve_line() else {
            return;
        };

        let contact = {
            let mut queue = self.queue.lock().await;
            queue.pop_front()
        };
        let Some(contact) = contact else {
            self.release_line(&line.phone_number);
            return;
        };

        let Some(scenario) = self
            .scenarios
            .get(
                contact
                    .scenario
                    .as_deref()
                    .unwrap_or_default(),
            )
            .or_else(|| self.scenarios.next_scenario())
        else {
            warn!("no enabled scenario available, dropping contact");
            self.release_line(&line.phone_number);
            return;
        };

        let batch_id = self.active_batch_id.lock().clone();
        let metadata = crate::config::attempt_metadata(
            if contact.number_id == 0 { None } else { Some(contact.number_id) },
            batch_id.as_deref(),
            chrono::Utc::now(),
        );

        let session_id = self.sessions.create_session(scenario.name.clone(), false);
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.metadata = metadata.clone();
            session
                .metadata
                .insert("phone_number".to_string(), contact.phone_number.clone());
            if contact.number_id != 0 {
                session
                    .metadata
                    .insert("number_id".to_string(), contact.number_id.to_string());
            }
        }

        match self
            .ari
            .originate_call(
                &format!("PJSIP/{}@{}", contact.phone_number, line.trunk),
                &line.caller_id,
                Duration::from_secs(self.settings.origination_timeout_secs),
                &metadata,
            )
            .await
        {
            Ok(channel_id) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.sessions.register_channel(channel_id.clone(), session_id);
                if let Some(mut session) = self.sessions.get_mut(session_id) {
                    session.add_channel(&channel_id, LegDirection::Outbound, &line.trunk);
                    session.outbound_line = Some(line.phone_number.clone());
                }
                info!(%session_id, phone_number = %contact.phone_number, trunk = %line.trunk, line = %line.phone_number, "originated outbound call");
            }
            Err(e) => {
                warn!(error = %e, trunk = %line.trunk, "origination failed");
                self.release_line(&line.phone_number);
                self.sessions.maybe_cleanup(session_id).await;
                self.on_origination_failure().await;
            }
        }
    }

    /// Releases one outbound slot on the line identified by `phone_number`
    /// (the unique per-line key; several lines can share a `trunk` name).
    fn release_line(&self, phone_number: &str) {
        let mut lines = self.lines.lock();
        if let Some(line) = lines.iter_mut().find(|l| l.phone_number == phone_number) {
            line.active_outbound = line.active_outbound.saturating_sub(1);
        }
    }

    async fn on_origination_failure(&self) {
        let streak = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if streak == self.sms_fail_threshold {
            if let Err(e) = self
                .sms
                .send_message("Dialer: consecutive origination failures, check trunk health.", None)
                .await
            {
                warn!(error = %e, "failed to send origination-failure SMS alert");
            }
        }
    }

    /// Periodically scans for sessions stuck past the origination timeout
    /// without a clean hangup event and reports them `missed`.
    pub async fn watch_missed_calls(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let max_age = chrono::Duration::seconds(self.settings.origination_timeout_secs as i64 + 5);
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    for session_id in self.sessions.stale_unanswered_sessions(max_age) {
                        debug!(%session_id, "marking stale unanswered session as missed");
                        if let Some(mut session) = self.sessions.get_mut(session_id) {
                            session.set_result("missed", false);
                        }
                        self.sessions.maybe_cleanup(session_id).await;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl LineReservation for Dialer {
    /// Grabs whichever line currently has outbound capacity and hands back
    /// its SIP trunk name for dialing. Operator transfers share the same
    /// pool as outbound origination rather than a separate budget.
    async fn reserve_outbound_line(&self) -> Option<String> {
        self.reserve_line().map(|l| l.trunk)
    }

    /// Releases one outbound slot on the first line matching `trunk` that
    /// still shows it in use. Several `TrunkLine`s can share a trunk name,
    /// but operator-transfer reserve/release pairs are always matched
    /// 1:1 in call order, so the first in-use match is the right one.
    async fn release_outbound_line(&self, trunk: &str) {
        let mut lines = self.lines.lock();
        if let Some(line) = lines
            .iter_mut()
            .find(|l| l.trunk == trunk && l.active_outbound > 0)
        {
            line.active_outbound -= 1;
        }
    }
}

#[async_trait]
impl DialerNotifier for Dialer {
    async fn on_outbound_session_ended(&self, session_id: SessionId, result: Option<String>) {
        let line = self.sessions.get(session_id).and_then(|s| s.outbound_line.clone());
        if let Some(line) = line {
            self.release_line(&line);
        }
        debug!(%session_id, ?result, "outbound session ended");
    }

    async fn resolve_inbound_line(&self, dialed_number: &str) -> Option<String> {
        let lines = self.lines.lock();
        lines
            .iter()
            .find(|l| l.enabled && l.matches_number(dialed_number))
            .map(|l| l.phone_number.clone())
    }

    async fn try_reserve_inbound(&self, line: &str) -> bool {
        if self.settings.max_concurrent_inbound_calls > 0
            && self.active_inbound_total.load(Ordering::Relaxed) >= self.settings.max_concurrent_inbound_calls
        {
            return false;
        }
        let mut lines = self.lines.lock();
        let Some(line) = lines.iter_mut().find(|l| l.phone_number == line) else {
            return false;
        };
        if !line.enabled || line.total_active() >= self.settings.max_concurrent_calls {
            return false;
        }
        line.active_inbound += 1;
        self.active_inbound_total.fetch_add(1, Ordering::Relaxed);
        true
    }

    async fn release_inbound(&self, line: &str) {
        let mut lines = self.lines.lock();
        if let Some(line) = lines.iter_mut().find(|l| l.phone_number == line) {
            if line.active_inbound > 0 {
                line.active_inbound -= 1;
                self.active_inbound_total.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    async fn increment_waiting_inbound(&self, line: &str) {
        let mut lines = self.lines.lock();
        if let Some(line) = lines.iter_mut().find(|l| l.phone_number == line) {
            line.waiting_inbound += 1;
        }
    }

    async fn decrement_waiting_inbound(&self, line: &str) {
        let mut lines = self.lines.lock();
        if let Some(line) = lines.iter_mut().find(|l| l.phone_number == line) {
            line.waiting_inbound = line.waiting_inbound.saturating_sub(1);
        }
    }

    async fn on_session_result(&self, result: &str, number_id: Option<i64>) -> bool {
        if result.starts_with("failed:") && number_id.is_some() {
            let streak = self.failure_streak.fetch_add(1, Ordering::Relaxed) + 1;
            if streak >= self.sms_fail_threshold {
                let newly_paused = !self.paused_by_failures.swap(true, Ordering::Relaxed);
                if newly_paused {
                    self.alert_failure_streak("consecutive_failures").await;
                }
                return newly_paused;
            }
        } else {
            self.failure_streak.store(0, Ordering::Relaxed);
        }
        false
    }

    async fn request_operator_priority(&self) {
        self.operator_priority_requests.fetch_add(1, Ordering::Relaxed);
    }

    async fn release_operator_priority(&self) {
        self.operator_priority_requests.fetch_sub(1, Ordering::Relaxed);
    }

    async fn force_pause_for_quota(&self, reason: &str) {
        self.failure_streak.store(self.sms_fail_threshold, Ordering::Relaxed);
        if !self.paused_by_failures.swap(true, Ordering::Relaxed) {
            self.alert_failure_streak(reason).await;
        }
    }
}
