//! Domain pattern matching.
//!
//! Patterns are either a literal domain (`example.com`) or a wildcard of the
//! form `*.example.com`, which matches the suffix itself and every name below it.

/// Prefix marking a wildcard domain pattern.
const WILDCARD_PREFIX: &str = "*.";

/// Check whether a pattern is in wildcard form (`*.suffix`).
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.len() > WILDCARD_PREFIX.len() && pattern.starts_with(WILDCARD_PREFIX)
}

/// Check whether `domain` matches `pattern`.
///
/// # Examples
/// ```
/// use egress_gate::wildcard::matches;
///
/// assert!(matches("*.example.com", "api.example.com"));
/// assert!(matches("*.example.com", "example.com"));
/// assert!(!matches("*.example.com", "fooexample.com"));
/// ```
pub fn matches(pattern: &str, domain: &str) -> bool {
    if pattern == domain {
        return true;
    }

    let Some(suffix) = pattern.strip_prefix(WILDCARD_PREFIX) else {
        return false;
    };

    if domain == suffix {
        return true;
    }

    // Must be a dot-delimited tail, not a bare string suffix
    match domain.strip_suffix(suffix) {
        Some(head) => head.ends_with('.'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(matches("example.com", "example.com"));
        assert!(!matches("example.com", "www.example.com"));
        assert!(!matches("www.example.com", "example.com"));
    }

    #[test]
    fn test_wildcard_subdomains() {
        assert!(matches("*.example.com", "www.example.com"));
        assert!(matches("*.example.com", "a.b.c.example.com"));
        assert!(matches("*.example.com", "example.com"));
    }

    #[test]
    fn test_wildcard_rejects_string_suffix() {
        assert!(!matches("*.example.com", "fooexample.com"));
        assert!(!matches("*.example.com", "example.org"));
        assert!(!matches("*.example.com", "com"));
    }

    #[test]
    fn test_wildcard_is_reflexive() {
        assert!(matches("*.example.com", "*.example.com"));
    }

    #[test]
    fn test_other_patterns_need_equality() {
        assert!(!matches("*example.com", "fooexample.com"));
        assert!(!matches("api.*.com", "api.example.com"));
        assert!(!matches("", "example.com"));
    }

    #[test]
    fn test_is_wildcard() {
        assert!(is_wildcard("*.example.com"));
        assert!(!is_wildcard("example.com"));
        assert!(!is_wildcard("*."));
        assert!(!is_wildcard("*example.com"));
    }
}
