use pbx_dialer_engine::flow::result::{
    map_result_to_panel_status, map_result_to_panel_status_for, reason_for_result,
    result_for_hangup_cause,
};

#[test]
fn busy_cause_maps_to_busy_result() {
    assert_eq!(result_for_hangup_cause(17, None, None), "busy");
}

#[test]
fn power_off_causes_map_to_power_off() {
    assert_eq!(result_for_hangup_cause(18, None, None), "power_off");
    assert_eq!(result_for_hangup_cause(19, None, None), "power_off");
    assert_eq!(result_for_hangup_cause(20, None, None), "power_off");
    assert_eq!(result_for_hangup_cause(38, None, None), "power_off");
}

#[test]
fn banned_causes_map_to_banned() {
    assert_eq!(result_for_hangup_cause(21, None, None), "banned");
    assert_eq!(result_for_hangup_cause(34, None, None), "banned");
    assert_eq!(result_for_hangup_cause(41, None, None), "banned");
    assert_eq!(result_for_hangup_cause(42, None, None), "banned");
}

#[test]
fn normal_clearing_causes_map_to_hangup() {
    assert_eq!(result_for_hangup_cause(16, None, None), "hangup");
    assert_eq!(result_for_hangup_cause(31, None, None), "hangup");
    assert_eq!(result_for_hangup_cause(32, None, None), "hangup");
}

#[test]
fn unmapped_cause_with_request_terminated_text_is_missed() {
    assert_eq!(
        result_for_hangup_cause(99, Some("Request Terminated"), None),
        "missed"
    );
}

#[test]
fn unmapped_cause_preserves_prior_result_else_missed() {
    assert_eq!(result_for_hangup_cause(99, None, Some("not_interested")), "not_interested");
    assert_eq!(result_for_hangup_cause(99, None, None), "missed");
}

#[test]
fn failed_results_always_map_to_failed_panel_status() {
    assert_eq!(map_result_to_panel_status("failed:timeout"), "FAILED");
    assert_eq!(map_result_to_panel_status("failed:provider_quota"), "FAILED");
}

#[test]
fn known_results_map_to_their_panel_status() {
    assert_eq!(map_result_to_panel_status("connected_to_operator"), "CONNECTED");
    assert_eq!(map_result_to_panel_status("busy"), "BUSY");
    assert_eq!(map_result_to_panel_status("banned"), "BANNED");
}

#[test]
fn unrecognized_result_maps_to_unknown() {
    assert_eq!(map_result_to_panel_status("something_new"), "UNKNOWN");
}

#[test]
fn disconnected_maps_differently_for_inbound_direct_sessions() {
    assert_eq!(map_result_to_panel_status_for("disconnected", false), "DISCONNECTED");
    assert_eq!(map_result_to_panel_status_for("disconnected", true), "INBOUND_CALL");
}

#[test]
fn reason_strings_match_the_panel_mapping_table() {
    assert_eq!(reason_for_result("connected_to_operator", false), "User said yes");
    assert_eq!(reason_for_result("not_interested", false), "User declined");
    assert_eq!(reason_for_result("disconnected", true), "Inbound call connected to agent");
    assert_eq!(reason_for_result("disconnected", false), "Caller disconnected");
    assert_eq!(reason_for_result("failed:stt_failure", false), "User did not respond");
    assert_eq!(reason_for_result("failed:llm_quota", false), "llm_quota");
}
