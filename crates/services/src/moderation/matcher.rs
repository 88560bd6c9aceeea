//! Rule pattern language: case-insensitive, `*` stands for any run of
//! characters, anything else is literal. A pattern matches when it occurs
//! anywhere in the content.

use threadline_db::models::{Message, ModerationRule};

/// A pattern needs at least one literal segment; `""` or `"**"` would match
/// every message.
pub fn is_valid_pattern(pattern: &str) -> bool {
    pattern.split('*').any(|segment| !segment.is_empty())
}

pub fn pattern_matches(pattern: &str, content: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let content = content.to_lowercase();

    let mut rest = content.as_str();
    let mut matched = false;
    for segment in pattern.split('*').filter(|s| !s.is_empty()) {
        let Some(at) = rest.find(segment) else {
            return false;
        };
        rest = &rest[at + segment.len()..];
        matched = true;
    }
    matched
}

/// Evaluation order: severity, then creation time, then id.
pub fn sort_rules(rules: &mut [ModerationRule]) {
    rules.sort_by_key(|r| (r.severity, r.created_at, r.id));
}

/// First active rule, in evaluation order, whose pattern matches the
/// message. The input does not need to be sorted.
pub fn check_message<'a>(
    message: &Message,
    rules: &'a [ModerationRule],
) -> Option<&'a ModerationRule> {
    if message.is_system() || message.is_deleted {
        return None;
    }
    rules
        .iter()
        .filter(|r| r.is_active && pattern_matches(&r.pattern, &message.content))
        .min_by_key(|r| (r.severity, r.created_at, r.id))
}
