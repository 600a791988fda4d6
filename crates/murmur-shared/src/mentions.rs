//! `@name` mention scanning.
//!
//! A mention is `@` followed by one or more word characters (letters,
//! digits, `_`). Scanning never mutates the input and can be restarted at
//! any offset.

use std::ops::Range;

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Mention tokens in order of appearance, without the leading `@`.
pub fn extract_mentions(text: &str) -> Vec<String> {
    mention_ranges(text)
        .into_iter()
        .map(|range| text[range.start + 1..range.end].to_string())
        .collect()
}

/// Byte ranges of every mention, `@` included, for highlighting.
pub fn mention_ranges(text: &str) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        if c != '@' {
            continue;
        }
        let mut end = start + 1;
        while let Some(&(idx, next)) = chars.peek() {
            if !is_word_char(next) {
                break;
            }
            end = idx + next.len_utf8();
            chars.next();
        }
        if end > start + 1 {
            ranges.push(start..end);
        }
    }

    ranges
}

/// The mention being typed at the caret, which drives the suggestion popup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMention {
    /// Byte offset of the `@`.
    pub start: usize,
    /// Text between the `@` and the caret.
    pub query: String,
}

/// Find the in-progress token: the text between the nearest `@` before the
/// caret and the caret itself, provided no whitespace intervenes.
///
/// `caret` is a byte offset; it is clamped to the text and moved back to
/// the nearest character boundary.
pub fn active_mention(text: &str, caret: usize) -> Option<ActiveMention> {
    let mut caret = caret.min(text.len());
    while !text.is_char_boundary(caret) {
        caret -= 1;
    }

    let before = &text[..caret];
    let at = before.rfind('@')?;
    let query = &before[at + 1..];
    if query.chars().any(char::is_whitespace) {
        return None;
    }

    Some(ActiveMention {
        start: at,
        query: query.to_string(),
    })
}

/// Replace the active token with `@name` and return the new text and caret.
///
/// The caret lands after the whitespace that follows the name. A space is
/// only inserted when the token is not already followed by whitespace.
pub fn complete_mention(text: &str, caret: usize, name: &str) -> Option<(String, usize)> {
    let active = active_mention(text, caret)?;
    let token_end = active.start + 1 + active.query.len();
    let rest = &text[token_end..];

    let mut completed = String::with_capacity(text.len() + name.len() + 2);
    completed.push_str(&text[..active.start]);
    completed.push('@');
    completed.push_str(name);
    let new_caret = match rest.chars().next() {
        Some(c) if c.is_whitespace() => completed.len() + c.len_utf8(),
        _ => {
            completed.push(' ');
            completed.len()
        }
    };
    completed.push_str(rest);

    Some((completed, new_caret))
}

/// Candidates whose name starts with `query`, case-insensitively, in input order.
pub fn filter_candidates<'a, S: AsRef<str>>(query: &str, candidates: &'a [S]) -> Vec<&'a str> {
    let query = query.to_lowercase();
    candidates
        .iter()
        .map(AsRef::as_ref)
        .filter(|name| name.to_lowercase().starts_with(&query))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_in_order() {
        assert_eq!(extract_mentions("hi @sam and @lee"), vec!["sam", "lee"]);
    }

    #[test]
    fn test_extract_stops_at_non_word() {
        assert_eq!(extract_mentions("@sam, @lee! @x_1."), vec!["sam", "lee", "x_1"]);
        assert!(extract_mentions("email me @ noon").is_empty());
        assert_eq!(extract_mentions("@@sam"), vec!["sam"]);
    }

    #[test]
    fn test_extract_unicode() {
        assert_eq!(extract_mentions("salut @zoé!"), vec!["zoé"]);
    }

    #[test]
    fn test_ranges_cover_at_sign() {
        let text = "yo @sam";
        let ranges = mention_ranges(text);
        assert_eq!(ranges, vec![3..7]);
        assert_eq!(&text[ranges[0].clone()], "@sam");
    }

    #[test]
    fn test_active_mention_at_caret() {
        let text = "hey @sa";
        assert_eq!(
            active_mention(text, text.len()),
            Some(ActiveMention {
                start: 4,
                query: "sa".into()
            })
        );
        assert_eq!(active_mention("hey @", 5).map(|m| m.query), Some(String::new()));
    }

    #[test]
    fn test_active_mention_broken_by_whitespace() {
        assert!(active_mention("hey @sam is here", 16).is_none());
        assert!(active_mention("no mention", 10).is_none());
    }

    #[test]
    fn test_active_mention_clamps_caret() {
        assert_eq!(active_mention("@zoé", 4).map(|m| m.query), Some("zo".into()));
        assert!(active_mention("@sam", 100).is_some());
    }

    #[test]
    fn test_complete_mention() {
        let (text, caret) = complete_mention("ping @le about it", 8, "lee").unwrap();
        assert_eq!(text, "ping @lee about it");
        assert_eq!(caret, 10);
    }

    #[test]
    fn test_complete_mention_at_end_adds_space() {
        let (text, caret) = complete_mention("hi @sa", 6, "sam").unwrap();
        assert_eq!(text, "hi @sam ");
        assert_eq!(caret, 8);

        let (text, caret) = complete_mention("hi @sa,ok", 6, "sam").unwrap();
        assert_eq!(text, "hi @sam ,ok");
        assert_eq!(caret, 8);
    }

    #[test]
    fn test_filter_candidates() {
        let names = vec!["Sam".to_string(), "sally".to_string(), "Lee".to_string()];
        assert_eq!(filter_candidates("sa", &names), vec!["Sam", "sally"]);
        assert_eq!(filter_candidates("", &names).len(), 3);
    }
}
