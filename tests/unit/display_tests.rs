//! Unit tests for remote-display URL construction.

use authbridge::orchestrator::display::display_url;

const BASE: &str = "https://auth.example.com/";

#[test]
fn missing_template_uses_session_display_route() {
    assert_eq!(
        display_url(None, BASE, "s1", "10.0.0.5"),
        "https://auth.example.com/api/auth/session/s1/display"
    );
}

#[test]
fn blank_template_is_treated_as_missing() {
    assert_eq!(
        display_url(Some("  "), BASE, "s1", "10.0.0.5"),
        "https://auth.example.com/api/auth/session/s1/display"
    );
}

#[test]
fn brace_placeholders_are_filled() {
    assert_eq!(
        display_url(
            Some("https://vnc.example.com/{{SESSION_ID}}/?host={{VM_IP}}"),
            BASE,
            "s1",
            "10.0.0.5"
        ),
        "https://vnc.example.com/s1/?host=10.0.0.5"
    );
}

#[test]
fn route_placeholders_are_filled_and_joined_to_base() {
    assert_eq!(
        display_url(Some("/vnc/:sessionId/:vmIp"), BASE, "s1", "10.0.0.5"),
        "https://auth.example.com/vnc/s1/10.0.0.5"
    );
    assert_eq!(
        display_url(Some("vnc/:sessionId"), BASE, "s1", "10.0.0.5"),
        "https://auth.example.com/vnc/s1"
    );
}
