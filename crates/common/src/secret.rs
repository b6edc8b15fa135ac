//! Secret wrapper for credential strings
//!
//! Credentials are handed around the engine by value, but must never reach a
//! log line or a sanitized snapshot. `Secret` prints as `[REDACTED]` and wipes
//! its buffer on drop; `preview` gives the short prefix used in health output.

use std::fmt;
use zeroize::Zeroize;

/// Number of leading characters shown by [`preview`].
const PREVIEW_CHARS: usize = 20;

/// Sensitive value, redacted in Debug/Display.
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Borrow the raw value. Only the request builder should need this.
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Short, log-safe prefix of the secret.
    pub fn preview(&self) -> String {
        preview(&self.0)
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl From<String> for Secret<String> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// First 20 characters of `value` followed by `...`, or the whole value when
/// it is shorter than that.
pub fn preview(value: &str) -> String {
    match value.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &value[..idx]),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_and_display_are_redacted() {
        let secret = Secret::new(String::from("EwAoA+pvBAAUsecret"));
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(format!("{secret}"), "[REDACTED]");
    }

    #[test]
    fn expose_returns_raw_value() {
        let secret: Secret<String> = String::from("EwAoA+pvBAAU").into();
        assert_eq!(secret.expose(), "EwAoA+pvBAAU");
    }

    #[test]
    fn preview_truncates_long_values() {
        let secret = Secret::new("a".repeat(64));
        assert_eq!(secret.preview(), format!("{}...", "a".repeat(20)));
    }

    #[test]
    fn preview_keeps_short_values_whole() {
        assert_eq!(preview("short"), "short");
        assert_eq!(preview(&"b".repeat(20)), "b".repeat(20));
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let value = "é".repeat(30);
        let p = preview(&value);
        assert!(p.ends_with("..."));
        assert_eq!(p.trim_end_matches("...").chars().count(), 20);
    }
}
