//! Scripted answers to interactive CLI prompts.
//!
//! Each provider has an ordered rule table. A rule becomes eligible only
//! after every rule before it has fired, and fires at most once. The
//! cursor-position responder is the exception: it answers every query.

use crate::models::provider::{Provider, TerminalMode};

/// Terminal query asking for the cursor position (DSR 6).
pub const CURSOR_QUERY: &str = "\x1b[6n";

/// Reply placing the cursor at the top-left cell.
pub const CURSOR_REPLY: &str = "\x1b[1;1R";

/// Bytes of stripped output kept while waiting for the next prompt.
const WINDOW_LIMIT: usize = 8 * 1024;

/// One scripted prompt answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptRule {
    /// Stable rule name, recorded once the rule fires.
    pub name: &'static str,
    /// Case-insensitive text that identifies the prompt.
    pub trigger: &'static str,
    /// Bytes written to the terminal in response.
    pub reply: &'static str,
}

const CLAUDE_RULES: &[PromptRule] = &[
    PromptRule {
        name: "accept_theme",
        trigger: "choose the text style",
        reply: "\r",
    },
    PromptRule {
        name: "issue_login",
        trigger: "for shortcuts",
        reply: "/login\r",
    },
    PromptRule {
        name: "accept_login_method",
        trigger: "select login method",
        reply: "\r",
    },
    PromptRule {
        name: "acknowledge_success",
        trigger: "login successful",
        reply: "\r",
    },
];

const GEMINI_RULES: &[PromptRule] = &[PromptRule {
    name: "accept_default_auth",
    trigger: "how would you like to authenticate",
    reply: "\r",
}];

/// Ordered prompt rules for a provider.
#[must_use]
pub fn rules_for(provider: Provider) -> &'static [PromptRule] {
    match provider {
        Provider::Codex => &[],
        Provider::ClaudeCode => CLAUDE_RULES,
        Provider::GeminiCli => GEMINI_RULES,
    }
}

/// Per-session automation state.
#[derive(Debug)]
pub struct PromptAutomaton {
    rules: &'static [PromptRule],
    next: usize,
    fired: Vec<&'static str>,
    window: String,
    answers_cursor: bool,
    raw_tail: String,
}

impl PromptAutomaton {
    /// Automaton for a provider's CLI.
    #[must_use]
    pub fn for_provider(provider: Provider) -> Self {
        Self {
            rules: rules_for(provider),
            next: 0,
            fired: Vec::new(),
            window: String::new(),
            answers_cursor: provider.terminal_mode() == TerminalMode::CursorResponder,
            raw_tail: String::new(),
        }
    }

    /// Names of rules that have fired, in firing order.
    #[must_use]
    pub fn fired(&self) -> &[&'static str] {
        &self.fired
    }

    /// Whether every ordered rule has fired.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.next >= self.rules.len()
    }

    /// Feed a chunk of raw terminal output; returns the replies to write, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<&'static str> {
        let mut replies = Vec::new();

        if self.answers_cursor {
            let raw = format!("{}{}", self.raw_tail, String::from_utf8_lossy(chunk));
            replies.extend(std::iter::repeat_n(CURSOR_REPLY, raw.matches(CURSOR_QUERY).count()));
            self.raw_tail = tail(&raw, CURSOR_QUERY.len() - 1);
        }

        if self.is_finished() {
            return replies;
        }

        let stripped = strip_ansi_escapes::strip(chunk);
        self.window
            .push_str(&String::from_utf8_lossy(&stripped).to_lowercase());
        if self.window.len() > WINDOW_LIMIT {
            self.window = tail(&self.window, WINDOW_LIMIT);
        }

        while let Some(rule) = self.rules.get(self.next) {
            let Some(pos) = self.window.find(rule.trigger) else {
                break;
            };
            replies.push(rule.reply);
            self.fired.push(rule.name);
            self.next += 1;
            self.window = self.window[pos + rule.trigger.len()..].to_owned();
        }
        replies
    }
}

/// Last `max` bytes of `s`, cut on a character boundary.
fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_owned()
}
