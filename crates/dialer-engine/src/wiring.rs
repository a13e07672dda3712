//! Explicit interface structs wiring the Session Manager, Dialer, and Flow
//! Engine together.
//!
//! The teacher (`call-engine/src/orchestrator/core.rs`) wires its
//! components with `Arc::downgrade` back-references fixed up after
//! construction via `unsafe` pointer surgery, because its engine and
//! router are mutually recursive. That circularity doesn't exist here:
//! the Dialer only ever needs to ask the Session Manager "is a line free"
//! and "start this call", and the Session Manager only ever needs to tell
//! the Dialer "a line freed up" and ask the Flow Engine "handle this
//! event". Three small traits express exactly that, constructed once
//! during process bootstrap — no weak references, no unsafe.

use async_trait::async_trait;

use crate::error::TelephonyError;
use crate::session::{LegDirection, SessionId};

/// What the Session Manager exposes to the Dialer so it can claim and
/// release outbound trunk capacity without owning the trunk roster itself.
#[async_trait]
pub trait LineReservation: Send + Sync {
    /// Attempts to reserve a line for an outbound origination. Returns the
    /// trunk name reserved, or `None` if every line is saturated.
    async fn reserve_outbound_line(&self) -> Option<String>;

    /// Releases a previously reserved line (call completed or failed before
    /// answer).
    async fn release_outbound_line(&self, trunk: &str);
}

/// What the Session Manager calls on the Dialer when session-level events
/// it is tracking change the Dialer's scheduling state.
#[async_trait]
pub trait DialerNotifier: Send + Sync {
    /// An outbound session reached a terminal state; the dialer should
    /// record the attempt and consider the line free again.
    async fn on_outbound_session_ended(&self, session_id: SessionId, result: Option<String>);

    /// Resolves a dialed/connected number to the configured trunk line it
    /// belongs to (§4.2: exact, leading-zero-stripped, then suffix match).
    /// Pure lookup — reserves nothing.
    async fn resolve_inbound_line(&self, dialed_number: &str) -> Option<String>;

    /// Attempts to claim one inbound slot on `line`. Returns `false` if the
    /// line's combined active count is already at `max_concurrent_calls`
    /// (§4.5 inbound capacity sharing) — the caller must queue.
    async fn try_reserve_inbound(&self, line: &str) -> bool;

    /// Releases an inbound slot previously claimed with `try_reserve_inbound`.
    async fn release_inbound(&self, line: &str);

    /// Marks one more inbound caller as queued on `line` — used so the
    /// outbound scheduler can skip lines with callers waiting (§4.5 line
    /// selection).
    async fn increment_waiting_inbound(&self, line: &str);

    /// Reverses `increment_waiting_inbound`, either because a waiter was
    /// promoted or because the queued caller hung up before promotion.
    async fn decrement_waiting_inbound(&self, line: &str);

    /// Called just before a session's final result is reported to the panel
    /// (§4.5 "Failure-streak alerting"): a `failed:*` result against a known
    /// contact bumps the streak toward the SMS/pause threshold; any other
    /// result resets it. Returns `true` exactly when this call is the one
    /// that newly crossed the threshold — the caller attaches
    /// `call_allowed=false` to this session's own report in that case,
    /// since the spec singles out "the triggering contact" for that flag.
    async fn on_session_result(&self, result: &str, number_id: Option<i64>) -> bool;

    /// Signals that an operator transfer is polling for a free trunk line
    /// (§4.3.1 step 3); the outbound scheduling loop yields queue
    /// originations while at least one transfer holds this. Calls nest —
    /// each `request` must be matched by exactly one `release`.
    async fn request_operator_priority(&self);
    async fn release_operator_priority(&self);

    /// STT/LLM quota exhaustion forces the dialer's failure streak straight
    /// to its alert threshold (§4.5, §7): pause outbound dialing and fire
    /// the SMS alert immediately rather than waiting for further failures.
    async fn force_pause_for_quota(&self, reason: &str);
}

/// What the Session Manager calls into on every routed PBX event so the
/// Flow Engine can advance the relevant session's step graph.
#[async_trait]
pub trait ScenarioHandler: Send + Sync {
    async fn on_session_started(&self, session_id: SessionId, channel_id: String) -> Result<(), TelephonyError>;
    async fn on_recording_finished(
        &self,
        session_id: SessionId,
        recording_name: String,
    ) -> Result<(), TelephonyError>;
    async fn on_recording_failed(&self, session_id: SessionId, recording_name: String);
    async fn on_playback_finished(&self, session_id: SessionId, playback_id: String);
    async fn on_channel_hungup(&self, session_id: SessionId, cause: Option<u16>, cause_txt: Option<String>);
    /// A leg transitioned to `Up` for the first time. Mainly meaningful
    /// for the operator leg (§4.3.1 step 7: stop `onhold`, connect).
    async fn on_call_answered(&self, session_id: SessionId, direction: LegDirection);

    /// A leg transitioned to `Busy`/`Failed` (§4.2's `ChannelStateChange`
    /// row). For the operator leg this is the async counterpart of an
    /// origination error — the agent's endpoint rejected the call rather
    /// than the originate RPC itself failing — and drives the same
    /// retry-next-candidate cascade as §4.3.1 step 6.
    async fn on_call_failed(&self, session_id: SessionId, direction: LegDirection);
}
