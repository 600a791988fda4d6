//! Outbound message validation.
//!
//! Runs before anything reaches the optimistic queue; a rejected message is
//! never sent. The denylist is a client-side courtesy, not a sanitizer: the
//! presentation layer must still escape what it renders.

use crate::constants::MAX_BODY_LEN;
use crate::error::ValidationError;

/// Validate a message body with the default length ceiling.
pub fn validate(body: &str, attachment_present: bool) -> Result<(), ValidationError> {
    validate_with_limit(body, attachment_present, MAX_BODY_LEN)
}

/// Validate a message body.
///
/// Rejects input that is blank and has no attachment, input longer than
/// `max_len` characters, and input matching the injection denylist.
pub fn validate_with_limit(
    body: &str,
    attachment_present: bool,
    max_len: usize,
) -> Result<(), ValidationError> {
    if body.trim().is_empty() && !attachment_present {
        return Err(ValidationError::Empty);
    }

    let len = body.chars().count();
    if len > max_len {
        return Err(ValidationError::TooLong { len, max: max_len });
    }

    if let Some(pattern) = denylisted(body) {
        return Err(ValidationError::Forbidden { pattern });
    }

    Ok(())
}

fn denylisted(body: &str) -> Option<&'static str> {
    let lower = body.to_lowercase();

    if lower.contains("<script") {
        return Some("<script>");
    }

    // Browsers ignore whitespace and control characters inside a scheme.
    let compact: String = lower
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect();
    if compact.contains("javascript:") {
        return Some("javascript:");
    }

    if has_event_handler_attribute(&lower) {
        return Some("on* event handler");
    }

    None
}

/// Look for `on<name>=` attributes inside anything shaped like an HTML tag.
fn has_event_handler_attribute(lower: &str) -> bool {
    let bytes = lower.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'<' && bytes.get(i + 1).is_some_and(u8::is_ascii_alphabetic) {
            let end = lower[i..].find('>').map_or(bytes.len(), |e| i + e);
            if tag_has_handler(&bytes[i + 1..end]) {
                return true;
            }
            i = end;
        }
        i += 1;
    }
    false
}

fn tag_has_handler(tag: &[u8]) -> bool {
    for start in 1..tag.len() {
        let prev = tag[start - 1];
        let boundary = prev.is_ascii_whitespace() || matches!(prev, b'/' | b'"' | b'\'');
        if !boundary || !tag[start..].starts_with(b"on") {
            continue;
        }

        let mut j = start + 2;
        let name_start = j;
        while j < tag.len() && tag[j].is_ascii_alphabetic() {
            j += 1;
        }
        if j == name_start {
            continue;
        }
        while j < tag.len() && tag[j].is_ascii_whitespace() {
            j += 1;
        }
        if tag.get(j) == Some(&b'=') {
            return true;
        }
    }
    false
}
