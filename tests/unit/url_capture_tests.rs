//! Unit tests for OAuth URL discovery.

use std::time::Duration;

use authbridge::agent::url_capture::{poll_url_file, read_url_file, UrlMatcher};

#[test]
fn codex_url_is_found_in_output() {
    let matcher = UrlMatcher::new().expect("patterns compile");
    let out = "Starting local login server on http://localhost:1455.\n\
               If your browser did not open, navigate to this URL to authenticate:\n\n\
               https://auth.openai.com/oauth/authorize?response_type=code&client_id=app_x&state=abc\n";
    assert_eq!(
        matcher.find(out).as_deref(),
        Some("https://auth.openai.com/oauth/authorize?response_type=code&client_id=app_x&state=abc")
    );
}

#[test]
fn google_url_is_found_through_escapes() {
    let matcher = UrlMatcher::new().expect("patterns compile");
    let out = "\x1b[36mhttps://accounts.google.com/o/oauth2/v2/auth?client_id=1&scope=openid\x1b[0m\r\n";
    assert_eq!(
        matcher.find(out).as_deref(),
        Some("https://accounts.google.com/o/oauth2/v2/auth?client_id=1&scope=openid")
    );
}

#[test]
fn claude_url_matches_case_insensitively() {
    let matcher = UrlMatcher::new().expect("patterns compile");
    let out = "Browser didn't open? Use https://Claude.ai/oauth/authorize?code=true&state=s \n";
    assert_eq!(
        matcher.find(out).as_deref(),
        Some("https://Claude.ai/oauth/authorize?code=true&state=s")
    );
}

#[test]
fn url_at_end_of_buffer_waits_for_terminator() {
    let matcher = UrlMatcher::new().expect("patterns compile");
    let partial = "visit https://auth.openai.com/oauth/authorize?client_id=app_x&sta";
    assert!(matcher.find(partial).is_none());
    let complete = format!("{partial}te=abc\n");
    assert!(matcher.find(&complete).is_some());
}

#[test]
fn unrelated_urls_are_ignored() {
    let matcher = UrlMatcher::new().expect("patterns compile");
    assert!(matcher.find("see https://example.com/docs for help\n").is_none());
}

#[tokio::test]
async fn url_file_yields_first_non_empty_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("oauth-url-s1.txt");
    assert!(read_url_file(&path).await.is_none());

    std::fs::write(&path, "\n  https://accounts.google.com/o/oauth2/auth?x=1  \nsecond\n")
        .expect("write url file");
    assert_eq!(
        read_url_file(&path).await.as_deref(),
        Some("https://accounts.google.com/o/oauth2/auth?x=1")
    );
}

#[tokio::test]
async fn polling_picks_up_late_file_and_gives_up_after_budget() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("oauth-url-s2.txt");

    let missing = poll_url_file(&path, Duration::from_millis(60), Duration::from_millis(20)).await;
    assert!(missing.is_none());

    let writer_path = path.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::fs::write(&writer_path, "https://claude.ai/oauth/authorize?x=1\n")
            .await
            .expect("write url file");
    });
    let found = poll_url_file(&path, Duration::from_secs(2), Duration::from_millis(20)).await;
    assert_eq!(found.as_deref(), Some("https://claude.ai/oauth/authorize?x=1"));
}
