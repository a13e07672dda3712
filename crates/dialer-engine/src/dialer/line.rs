//! Outbound trunk roster. The static `OUTBOUND_NUMBERS`/`DEFAULT_CALLER_ID`
//! env vars seed one line per configured number; the panel can replace the
//! whole roster with `outbound_lines` on any `get_next_batch` response
//! (§2a). Each line also doubles as an inbound capacity unit (§3's
//! trunk-line stats): inbound arrivals are resolved to a line by dialed
//! number and share its `max_concurrent_calls` budget with outbound.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TrunkLine {
    pub trunk: String,
    /// The line's own phone number, matched against an inbound call's
    /// dialed/connected number to resolve which line it arrived on.
    pub phone_number: String,
    pub caller_id: String,
    pub enabled: bool,
    pub active_outbound: u32,
    pub active_inbound: u32,
    /// Inbound callers currently queued waiting for this line to free up.
    pub waiting_inbound: u32,
    rolling_attempts: VecDeque<Instant>,
    pub daily_count: u32,
    daily_marker: chrono::NaiveDate,
}

impl TrunkLine {
    pub fn with_number(
        trunk: impl Into<String>,
        phone_number: impl Into<String>,
        caller_id: impl Into<String>,
    ) -> TrunkLine {
        TrunkLine {
            trunk: trunk.into(),
            phone_number: phone_number.into(),
            caller_id: caller_id.into(),
            enabled: true,
            active_outbound: 0,
            active_inbound: 0,
            waiting_inbound: 0,
            rolling_attempts: VecDeque::new(),
            daily_count: 0,
            daily_marker: chrono::Utc::now().date_naive(),
        }
    }

    pub fn total_active(&self) -> u32 {
        self.active_outbound + self.active_inbound
    }

    fn prune_rolling(&mut self) {
        let cutoff = Instant::now().checked_sub(Duration::from_secs(60));
        while let Some(&front) = self.rolling_attempts.front() {
            if Some(front) < cutoff {
                self.rolling_attempts.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn rolling_count(&mut self) -> u32 {
        self.prune_rolling();
        self.rolling_attempts.len() as u32
    }

    pub fn reset_daily_if_rolled(&mut self, today: chrono::NaiveDate) {
        if self.daily_marker != today {
            self.daily_marker = today;
            self.daily_count = 0;
        }
    }

    /// Whether this line has room for one more outbound origination, per
    /// §4.5's line-selection rule: skip lines with callers waiting, at
    /// capacity, or past the per-minute/per-day caps.
    pub fn has_outbound_capacity(
        &mut self,
        max_concurrent: u32,
        max_per_minute: u32,
        max_per_day: u32,
    ) -> bool {
        self.enabled
            && self.waiting_inbound == 0
            && self.total_active() < max_concurrent
            && self.rolling_count() < max_per_minute
            && self.daily_count < max_per_day
    }

    /// Records one outbound origination attempt against this line's
    /// rolling-minute and daily counters.
    pub fn record_outbound_attempt(&mut self) {
        self.rolling_attempts.push_back(Instant::now());
        self.daily_count += 1;
    }

    /// Matches a dialed/connected number against this line's configured
    /// number using §4.2's three-tier rule: exact, leading-zero-stripped,
    /// then suffix.
    pub fn matches_number(&self, dialed: &str) -> bool {
        if self.phone_number.is_empty() || dialed.is_empty() {
            return false;
        }
        if self.phone_number == dialed {
            return true;
        }
        let stripped_self = self.phone_number.trim_start_matches('0');
        let stripped_dialed = dialed.trim_start_matches('0');
        if !stripped_self.is_empty() && stripped_self == stripped_dialed {
            return true;
        }
        dialed.ends_with(self.phone_number.as_str()) || self.phone_number.ends_with(dialed)
    }
}

/// Replaces `lines` in place with the panel's roster, preserving
/// in-flight counters for trunks that survive the swap (an in-flight call
/// shouldn't be forgotten because the panel re-sent the roster).
pub fn reconcile_from_panel(
    lines: &mut Vec<TrunkLine>,
    panel_lines: &[crate::panel::PanelOutboundLine],
    default_caller_id: &str,
) {
    if panel_lines.is_empty() {
        return;
    }
    let previous = std::mem::take(lines);
    for panel_line in panel_lines {
        let carried = previous.iter().find(|l| l.trunk == panel_line.trunk).cloned();
        let mut line = TrunkLine::with_number(
            panel_line.trunk.clone(),
            panel_line.phone_number.clone().unwrap_or_else(|| panel_line.trunk.clone()),
            panel_line
                .caller_id
                .clone()
                .unwrap_or_else(|| default_caller_id.to_string()),
        );
        line.enabled = panel_line.enabled;
        if let Some(carried) = carried {
            line.active_outbound = carried.active_outbound;
            line.active_inbound = carried.active_inbound;
            line.waiting_inbound = carried.waiting_inbound;
            line.daily_count = carried.daily_count;
        }
        lines.push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_number_handles_leading_zero_and_suffix() {
        let line = TrunkLine::with_number("trunk", "09121234567", "1000");
        assert!(line.matches_number("09121234567"));
        assert!(line.matches_number("9121234567"));
        assert!(line.matches_number("1234567"));
        assert!(!line.matches_number("0999999999"));
    }

    #[test]
    fn has_outbound_capacity_respects_waiting_inbound() {
        let mut line = TrunkLine::with_number("trunk", "0912", "1000");
        line.waiting_inbound = 1;
        assert!(!line.has_outbound_capacity(5, 100, 1000));
        line.waiting_inbound = 0;
        assert!(line.has_outbound_capacity(5, 100, 1000));
    }
}
