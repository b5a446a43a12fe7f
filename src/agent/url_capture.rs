//! OAuth URL discovery.
//!
//! Two independent paths: scanning CLI output for a known authorization
//! URL, and polling the side-channel file the `BROWSER` interception
//! script writes to.

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;

use crate::{AppError, Result};

/// Authorization URL patterns, one per provider.
const PATTERNS: [&str; 3] = [
    r"https://auth\.openai\.com/oauth/authorize\?[^\s]+",
    r"(?i)https://[^\s]*claude[^\s]*auth[^\s]+",
    r"https://accounts\.google\.com/o/oauth2[^\s]+",
];

/// Compiled authorization URL patterns.
#[derive(Debug, Clone)]
pub struct UrlMatcher {
    patterns: Vec<Regex>,
}

impl UrlMatcher {
    /// Compile the known patterns.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a pattern fails to compile.
    pub fn new() -> Result<Self> {
        let patterns = PATTERNS
            .iter()
            .map(|p| Regex::new(p).map_err(|err| AppError::Config(format!("bad url pattern {p}: {err}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// First authorization URL found in `text`, with ANSI escapes removed.
    ///
    /// A match that runs to the very end of `text` may still be arriving
    /// and is ignored until a terminating whitespace character is seen.
    #[must_use]
    pub fn find(&self, text: &str) -> Option<String> {
        let clean = strip_ansi_escapes::strip(text.as_bytes());
        let clean = String::from_utf8_lossy(&clean);
        self.patterns
            .iter()
            .find_map(|re| re.find(&clean).filter(|m| m.end() < clean.len()))
            .map(|m| m.as_str().to_owned())
    }
}

/// First non-empty line of the side-channel file, if any.
pub async fn read_url_file(path: &Path) -> Option<String> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    raw.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_owned)
}

/// Poll the side-channel file until it yields a URL or `budget` elapses.
pub async fn poll_url_file(path: &Path, budget: Duration, interval: Duration) -> Option<String> {
    let deadline = Instant::now() + budget;
    loop {
        if let Some(url) = read_url_file(path).await {
            return Some(url);
        }
        if Instant::now() + interval > deadline {
            return None;
        }
        tokio::time::sleep(interval).await;
    }
}
