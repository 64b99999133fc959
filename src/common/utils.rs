use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

static TOKEN_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Replaces the value of any `"token": "..."` JSON field before a frame is
/// handed to a trace sink. Applied to both sent and received frame text.
pub fn redact_tokens(text: &str) -> String {
    let pattern = TOKEN_PATTERN
        .get_or_init(|| Regex::new(r#"("token": ?")([A-Za-z0-9._-]*)(")"#).expect("valid regex"));
    pattern.replace_all(text, "${1}hunter2${3}").into_owned()
}
