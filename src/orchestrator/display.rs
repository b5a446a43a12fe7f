//! Remote-display URL construction.
//!
//! Templates may contain `{{SESSION_ID}}` / `{{VM_IP}}` or the route-style
//! `:sessionId` / `:vmIp` placeholders. A template without a scheme is
//! joined onto the public base URL.

/// Build the externally reachable remote-display URL for a session.
#[must_use]
pub fn display_url(
    template: Option<&str>,
    public_base_url: &str,
    session_id: &str,
    vm_ip: &str,
) -> String {
    let base = public_base_url.trim_end_matches('/');
    let Some(template) = template.map(str::trim).filter(|t| !t.is_empty()) else {
        return format!("{base}/api/auth/session/{session_id}/display");
    };

    let filled = template
        .replace("{{SESSION_ID}}", session_id)
        .replace("{{VM_IP}}", vm_ip)
        .replace(":sessionId", session_id)
        .replace(":vmIp", vm_ip);

    if filled.starts_with("http://") || filled.starts_with("https://") {
        filled
    } else if filled.starts_with('/') {
        format!("{base}{filled}")
    } else {
        format!("{base}/{filled}")
    }
}
