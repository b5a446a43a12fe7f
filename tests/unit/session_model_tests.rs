//! Unit tests for the session lifecycle rules.

use authbridge::models::provider::Provider;
use authbridge::models::session::{Session, SessionStatus};

fn session_in(status: SessionStatus) -> Session {
    let mut session = Session::new("user-1".into(), Provider::Codex);
    session.status = status;
    session
}

#[test]
fn new_session_starts_in_started_with_no_vm() {
    let session = Session::new("user-1".into(), Provider::ClaudeCode);
    assert_eq!(session.status, SessionStatus::Started);
    assert!(session.ephemeral_vm_id.is_none());
    assert!(session.vm_ip.is_none());
    assert!(session.timeout_at.is_none());
    assert!(!session.id.is_empty());
}

#[test]
fn sessions_get_distinct_ids() {
    let a = Session::new("u".into(), Provider::Codex);
    let b = Session::new("u".into(), Provider::Codex);
    assert_ne!(a.id, b.id);
}

#[test]
fn forward_transitions_are_allowed() {
    let started = session_in(SessionStatus::Started);
    assert!(started.can_transition_to(SessionStatus::VmCreated));
    assert!(started.can_transition_to(SessionStatus::Failed));

    let created = session_in(SessionStatus::VmCreated);
    assert!(created.can_transition_to(SessionStatus::Ready));

    let ready = session_in(SessionStatus::Ready);
    assert!(ready.can_transition_to(SessionStatus::AwaitingUserAuth));

    let awaiting = session_in(SessionStatus::AwaitingUserAuth);
    assert!(awaiting.can_transition_to(SessionStatus::Completed));
    assert!(awaiting.can_transition_to(SessionStatus::Timeout));
    assert!(awaiting.can_transition_to(SessionStatus::Cancelled));
}

#[test]
fn phases_may_be_skipped() {
    let ready = session_in(SessionStatus::Ready);
    assert!(ready.can_transition_to(SessionStatus::Completed));
}

#[test]
fn backward_and_repeated_transitions_are_rejected() {
    let ready = session_in(SessionStatus::Ready);
    assert!(!ready.can_transition_to(SessionStatus::VmCreated));
    assert!(!ready.can_transition_to(SessionStatus::Ready));
    assert!(!ready.can_transition_to(SessionStatus::Started));
}

#[test]
fn terminal_states_never_change() {
    for terminal in [
        SessionStatus::Completed,
        SessionStatus::Failed,
        SessionStatus::Timeout,
        SessionStatus::Cancelled,
    ] {
        let session = session_in(terminal);
        assert!(terminal.is_terminal());
        assert!(!session.can_transition_to(SessionStatus::Failed));
        assert!(!session.can_transition_to(SessionStatus::Completed));
    }
}

#[test]
fn non_terminal_states_are_not_terminal() {
    for status in [
        SessionStatus::Started,
        SessionStatus::VmCreated,
        SessionStatus::Ready,
        SessionStatus::AwaitingUserAuth,
    ] {
        assert!(!status.is_terminal(), "{} is live", status.as_str());
    }
}

#[test]
fn status_serializes_to_wire_name() {
    let json = serde_json::to_string(&SessionStatus::AwaitingUserAuth).expect("serialize");
    assert_eq!(json, "\"awaiting_user_auth\"");
    assert_eq!(SessionStatus::VmCreated.as_str(), "vm_created");
}

#[test]
fn provider_names_parse_and_unknown_is_rejected() {
    for provider in Provider::ALL {
        let parsed: Provider = provider.as_str().parse().expect("known provider");
        assert_eq!(parsed, provider);
    }
    assert!("cursor".parse::<Provider>().is_err());
}

#[test]
fn credential_paths_are_fixed_per_provider() {
    assert_eq!(
        Provider::Codex.guest_credential_path().to_str(),
        Some("/root/.codex/auth.json")
    );
    assert_eq!(
        Provider::ClaudeCode.guest_credential_path().to_str(),
        Some("/root/.claude/.credentials.json")
    );
    assert_eq!(
        Provider::GeminiCli.guest_credential_path().to_str(),
        Some("/root/.gemini/oauth_creds.json")
    );
}
