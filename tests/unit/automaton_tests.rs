//! Unit tests for scripted prompt answering.

use authbridge::agent::automaton::{rules_for, PromptAutomaton, CURSOR_REPLY};
use authbridge::models::provider::Provider;

#[test]
fn claude_rules_fire_in_order_once_each() {
    let mut automaton = PromptAutomaton::for_provider(Provider::ClaudeCode);

    assert_eq!(automaton.feed(b"Choose the text style that looks best"), vec!["\r"]);
    assert_eq!(automaton.feed(b"? for shortcuts"), vec!["/login\r"]);
    assert_eq!(automaton.feed(b"Select login method:"), vec!["\r"]);
    assert!(!automaton.is_finished());
    assert_eq!(automaton.feed(b"Login successful. Press Enter"), vec!["\r"]);
    assert!(automaton.is_finished());
    assert_eq!(
        automaton.fired(),
        &["accept_theme", "issue_login", "accept_login_method", "acknowledge_success"]
    );

    assert!(automaton.feed(b"? for shortcuts").is_empty(), "rules never fire twice");
}

#[test]
fn later_rule_waits_for_earlier_ones() {
    let mut automaton = PromptAutomaton::for_provider(Provider::ClaudeCode);
    assert!(automaton.feed(b"Select login method:").is_empty());
    assert!(automaton.fired().is_empty());
}

#[test]
fn consecutive_prompts_in_one_chunk_fire_together() {
    let mut automaton = PromptAutomaton::for_provider(Provider::ClaudeCode);
    let replies = automaton.feed(b"choose the text style ... ? for shortcuts");
    assert_eq!(replies, vec!["\r", "/login\r"]);
}

#[test]
fn trigger_split_across_chunks_and_escapes_is_matched() {
    let mut automaton = PromptAutomaton::for_provider(Provider::GeminiCli);
    assert!(automaton.feed(b"\x1b[1mHow would you like ").is_empty());
    assert_eq!(automaton.feed(b"to \x1b[32mauthenticate\x1b[0m?"), vec!["\r"]);
    assert!(automaton.is_finished());
}

#[test]
fn codex_answers_every_cursor_query_and_nothing_else() {
    let mut automaton = PromptAutomaton::for_provider(Provider::Codex);
    assert!(rules_for(Provider::Codex).is_empty());
    assert_eq!(
        automaton.feed(b"\x1b[6nhello\x1b[6n"),
        vec![CURSOR_REPLY, CURSOR_REPLY]
    );
    assert_eq!(automaton.feed(b"\x1b[6n"), vec![CURSOR_REPLY]);
    assert!(automaton.feed(b"choose the text style").is_empty());
}

#[test]
fn interactive_providers_ignore_cursor_queries() {
    let mut automaton = PromptAutomaton::for_provider(Provider::ClaudeCode);
    assert!(automaton.feed(b"\x1b[6n").is_empty());
}
