use pbx_dialer_engine::session::manager::SessionManager;
use pbx_dialer_engine::session::{LegDirection, Session};

#[test]
fn set_result_does_not_overwrite_a_real_result_without_force() {
    let mut session = Session::new(uuid::Uuid::new_v4(), "demo", false);
    assert!(session.set_result("not_interested", false));
    assert!(!session.set_result("hangup", false));
    assert_eq!(session.result.as_deref(), Some("not_interested"));
}

#[test]
fn set_result_overwrites_placeholder_results_without_force() {
    let mut session = Session::new(uuid::Uuid::new_v4(), "demo", false);
    assert!(session.set_result("user_didnt_answer", false));
    assert!(session.set_result("connected_to_operator", false));
    assert_eq!(session.result.as_deref(), Some("connected_to_operator"));
}

#[test]
fn set_result_with_force_always_overwrites() {
    let mut session = Session::new(uuid::Uuid::new_v4(), "demo", false);
    session.set_result("not_interested", false);
    assert!(session.set_result("hangup", true));
    assert_eq!(session.result.as_deref(), Some("hangup"));
}

#[test]
fn result_reported_guard_is_idempotent() {
    let mut session = Session::new(uuid::Uuid::new_v4(), "demo", false);
    assert!(!session.result_already_reported());
    session.mark_result_reported();
    assert!(session.result_already_reported());
}

#[test]
fn add_channel_assigns_one_leg_per_direction() {
    let mut session = Session::new(uuid::Uuid::new_v4(), "demo", false);
    session.add_channel("chan-1", LegDirection::Outbound, "TO-CUCM-Gaptel");
    session.add_channel("chan-2", LegDirection::Operator, "200");
    assert!(session.outbound_leg.is_some());
    assert!(session.operator_leg.is_some());
    assert!(session.inbound_leg.is_none());
    assert_eq!(session.all_channel_ids().len(), 2);
}

#[test]
fn normalize_number_strips_country_code_and_prefixes() {
    assert_eq!(SessionManager::normalize_number("+989123456789"), "09123456789");
    assert_eq!(SessionManager::normalize_number("00989123456789"), "09123456789");
    assert_eq!(SessionManager::normalize_number("09123456789"), "09123456789");
}
