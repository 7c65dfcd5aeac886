//! Subject syntax: dot-separated tokens, `*` matches exactly one token and
//! `>` matches one or more trailing tokens.

const SEPARATOR: char = '.';
const SINGLE: &str = "*";
const TAIL: &str = ">";

fn token_is_literal(token: &str) -> bool {
    !token.is_empty()
        && token != SINGLE
        && token != TAIL
        && !token.chars().any(char::is_whitespace)
}

/// A concrete subject that messages can be published to (no wildcards).
pub fn is_valid_subject(subject: &str) -> bool {
    !subject.is_empty() && subject.split(SEPARATOR).all(token_is_literal)
}

/// A subscription pattern; `>` is only allowed as the last token.
pub fn is_valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = pattern.split(SEPARATOR).collect();
    let last = tokens.len() - 1;
    tokens.iter().enumerate().all(|(i, token)| match *token {
        SINGLE => true,
        TAIL => i == last,
        other => token_is_literal(other),
    })
}

/// True if `subject` is delivered to a subscription on `pattern`.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut p = pattern.split(SEPARATOR);
    let mut s = subject.split(SEPARATOR);
    loop {
        match (p.next(), s.next()) {
            (Some(TAIL), Some(_)) => return true,
            (Some(SINGLE), Some(_)) => continue,
            (Some(pt), Some(st)) if pt == st => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_subjects() {
        assert!(is_valid_subject("orders"));
        assert!(is_valid_subject("user.created"));
        assert!(is_valid_subject("_INBOX.abc.1"));

        assert!(!is_valid_subject(""));
        assert!(!is_valid_subject("orders."));
        assert!(!is_valid_subject(".orders"));
        assert!(!is_valid_subject("a..b"));
        assert!(!is_valid_subject("orders.*"));
        assert!(!is_valid_subject("orders.>"));
        assert!(!is_valid_subject("has space"));
    }

    #[test]
    fn subscription_patterns() {
        assert!(is_valid_pattern("orders"));
        assert!(is_valid_pattern("orders.*"));
        assert!(is_valid_pattern("*.created"));
        assert!(is_valid_pattern(">"));
        assert!(is_valid_pattern("user.>"));

        assert!(!is_valid_pattern(""));
        assert!(!is_valid_pattern("user.>.created"));
        assert!(!is_valid_pattern("user..created"));
    }

    #[test]
    fn wildcard_matching() {
        assert!(matches("orders", "orders"));
        assert!(!matches("orders", "orders.new"));
        assert!(!matches("orders.new", "orders"));

        assert!(matches("user.*", "user.created"));
        assert!(!matches("user.*", "user.created.v2"));
        assert!(!matches("user.*", "user"));

        assert!(matches("user.>", "user.created"));
        assert!(matches("user.>", "user.created.v2"));
        assert!(!matches("user.>", "user"));

        assert!(matches("*.created", "user.created"));
        assert!(matches(">", "anything.at.all"));
    }
}
