//! Subscription-tier fan-out and payload metadata extraction.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::models::credential::CredentialSlot;
use crate::models::provider::Provider;

/// Slots a freshly retrieved credential is stored under.
///
/// Claude Code payloads advertise their tier in
/// `claudeAiOauth.subscriptionType`: `max` covers both the Max and Pro
/// slots, `pro` only the Pro slot. Anything else, and every other
/// provider, lands in the provider's base slot.
#[must_use]
pub fn storage_slots(provider: Provider, credentials: &Value) -> Vec<CredentialSlot> {
    if provider != Provider::ClaudeCode {
        return vec![CredentialSlot::Base(provider)];
    }

    match subscription_tier(credentials) {
        Some("max") => vec![CredentialSlot::ClaudeCodeMax, CredentialSlot::ClaudeCodePro],
        Some("pro") => vec![CredentialSlot::ClaudeCodePro],
        _ => vec![CredentialSlot::Base(provider)],
    }
}

fn subscription_tier(credentials: &Value) -> Option<&str> {
    credentials
        .pointer("/claudeAiOauth/subscriptionType")
        .and_then(Value::as_str)
}

/// Expiry advertised by a credential payload.
///
/// Accepts a top-level RFC 3339 `expires_at`, or Claude's
/// `claudeAiOauth.expiresAt` in epoch milliseconds.
#[must_use]
pub fn credential_expiry(credentials: &Value) -> Option<DateTime<Utc>> {
    if let Some(raw) = credentials.get("expires_at").and_then(Value::as_str) {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    credentials
        .pointer("/claudeAiOauth/expiresAt")
        .and_then(Value::as_i64)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

/// Whether a retrieved payload carries any content at all.
#[must_use]
pub fn is_empty_payload(credentials: &Value) -> bool {
    match credentials {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
