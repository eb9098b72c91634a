//! Log-safe formatting wrappers.
//!
//! Rendezvous addresses, ping ids and key material pass through these
//! wrappers before reaching a `tracing` field.

use std::fmt;

/// Shows only the head and tail of a rendezvous address.
pub struct RedactedOnion<'a>(pub &'a str);

impl fmt::Display for RedactedOnion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s.len() > 16 && s.is_char_boundary(4) && s.is_char_boundary(s.len() - 10) {
            write!(f, "{}...{}", &s[..4], &s[s.len() - 10..])
        } else {
            write!(f, "[onion]")
        }
    }
}

impl fmt::Debug for RedactedOnion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Shows only the length of a byte buffer.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl fmt::Display for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl fmt::Debug for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Shows the first 8 hex characters of an identifier.
pub struct ShortId<'a>(pub &'a str);

impl fmt::Display for ShortId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.get(..8) {
            Some(head) => write!(f, "{}..", head),
            None => write!(f, "{}", self.0),
        }
    }
}

const SENSITIVE_PATTERNS: &[&str] = &["pin", "secret", "private", "key", "seed"];

/// Replace a free-form string with a marker if it looks like it carries a secret.
pub fn sanitize_for_log(s: &str) -> String {
    let lower = s.to_lowercase();
    if SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p)) {
        "[REDACTED]".to_string()
    } else {
        s.to_string()
    }
}
