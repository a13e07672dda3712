//! Outbound/inbound PBX dialer engine.
//!
//! Three cooperating pieces, wired together once at process start (see
//! [`wiring`]):
//!
//! - [`session`] tracks call state and routes PBX events.
//! - [`flow`] interprets each session's YAML-declared scenario.
//! - [`dialer`] paces outbound origination against panel-assigned work.
//!
//! [`telephony`], [`panel`], and [`providers`] are the outward-facing
//! clients those three talk through; [`config`] and [`error`] are the
//! ambient plumbing every other module depends on.

pub mod config;
pub mod dialer;
pub mod error;
pub mod flow;
pub mod panel;
pub mod providers;
pub mod scenario;
pub mod session;
pub mod telephony;
pub mod wiring;

pub use config::Settings;
pub use dialer::Dialer;
pub use flow::FlowEngine;
pub use scenario::registry::ScenarioRegistry;
pub use session::manager::SessionManager;
pub use session::SessionId;
