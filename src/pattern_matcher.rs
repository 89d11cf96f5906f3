//! Access Pattern Matcher
//!
//! Decides whether a permission's secret-key pattern covers a concrete secret key.
//! The only metacharacter is `*`, which matches any run of characters (including none).
//! There is no escaping, so a literal `*` cannot be expressed.
//!
//! Matching is greedy and never backtracks: interior segments bind to their leftmost
//! occurrence after the previous match. Some patterns therefore reject keys a
//! backtracking glob would accept, and that behavior is relied on by stored permissions.

/// The single wildcard character.
pub const WILDCARD: char = '*';

/// Returns `true` when `key` is covered by `pattern`.
///
/// # Arguments
/// * `key` - Concrete secret key (e.g. `prod/db/password`)
/// * `pattern` - Permission pattern (e.g. `prod/*`)
///
/// # Example
/// ```
/// use secret_vault::pattern_matcher::matches;
///
/// assert!(matches("prod/db/password", "prod/*"));
/// assert!(matches("anything", "*"));
/// assert!(!matches("staging/db", "prod/*"));
/// ```
pub fn matches(key: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return key.is_empty();
    }
    if pattern == "*" {
        return true;
    }
    if !pattern.contains(WILDCARD) {
        return key == pattern;
    }

    let parts: Vec<&str> = pattern.split(WILDCARD).collect();
    let mut cursor = 0usize;

    let first = parts[0];
    if !first.is_empty() {
        if !key.starts_with(first) {
            return false;
        }
        cursor = first.len();
    }

    // split() on a pattern containing '*' always yields at least two parts
    let last = parts[parts.len() - 1];
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match key[cursor..].find(part) {
            Some(pos) => cursor += pos + part.len(),
            None => return false,
        }
    }

    if !last.is_empty() {
        if key.len() < last.len() || !key.ends_with(last) {
            return false;
        }
        // Suffix must not reuse bytes already consumed by earlier segments
        if cursor > key.len() - last.len() {
            return false;
        }
    }

    true
}

/// Returns `true` when any of `patterns` covers `key`.
pub fn authorizes<'a, I>(key: &str, patterns: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    patterns.into_iter().any(|pattern| matches(key, pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn check(pattern: &str, matching: &[&str], unmatching: &[&str]) {
        for key in matching {
            assert!(matches(key, pattern), "'{}' should match '{}'", key, pattern);
        }
        for key in unmatching {
            assert!(
                !matches(key, pattern),
                "'{}' should not match '{}'",
                key,
                pattern
            );
        }
    }

    #[test]
    fn test_surrounded_wildcards() {
        check(
            "*abc*",
            &["abc", "xxxabc", "abcyyy", "xxxxabcyyyy"],
            &["abzc", "xxabzxx", "aabbcc", ""],
        );
    }

    #[test]
    fn test_internal_wildcard() {
        check(
            "ab*cd",
            &["abZZZcd", "abcd"],
            &["xxabcd", "xxabxxcd", "xxabxxcdyy", "abxxcdyy"],
        );
    }

    #[test]
    fn test_path_like_pattern() {
        check(
            "*/anything/inside/*.txt",
            &[
                "essa///anything/inside/abc.txt",
                "essa/d/a/anything/inside/abc.txt",
                "/anything/inside/def.txt",
                "/anything/inside/CASE.txt",
                "/anything/inside/abc.txt",
                "/anything/inside/abc.txt.txt",
                "/anything/inside/abc.txt/abc.txt",
            ],
            &[
                "essa///not/inside/abc.txt",
                "essa/d/a/anything/inside/abc.zip",
                "/anything/inside/abc.txt/",
            ],
        );
    }

    #[test]
    fn test_empty_pattern_matches_only_empty_key() {
        assert!(matches("", ""));
        assert!(!matches("a", ""));
    }

    #[test]
    fn test_exact_match_without_wildcard() {
        assert!(matches("prod/db", "prod/db"));
        assert!(!matches("prod/db2", "prod/db"));
        assert!(!matches("prod/d", "prod/db"));
    }

    #[test]
    fn test_suffix_cannot_overlap_prefix() {
        // "aba" has prefix "ab" and suffix "ba", but they share a byte
        assert!(!matches("aba", "ab*ba"));
        assert!(matches("abba", "ab*ba"));
    }

    #[test]
    fn test_consecutive_wildcards() {
        assert!(matches("abc", "a**c"));
        assert!(matches("", "**"));
        assert!(!matches("ab", "a**c"));
    }

    #[test]
    fn test_authorizes_any_pattern() {
        let patterns = ["staging/*", "prod/db/*"];
        assert!(authorizes("prod/db/password", patterns.iter().copied()));
        assert!(!authorizes("prod/api/key", patterns.iter().copied()));
        assert!(!authorizes("prod/api/key", std::iter::empty()));
    }

    proptest! {
        #[test]
        fn prop_star_matches_everything(key in ".*") {
            prop_assert!(matches(&key, "*"));
        }

        #[test]
        fn prop_key_matches_itself(key in "[a-c*/]{0,16}") {
            prop_assert!(matches(&key, &key));
        }

        #[test]
        fn prop_literal_pattern_needs_exact_key(pattern in "[a-c/]{0,8}", key in "[a-c*/]{0,8}") {
            prop_assume!(pattern != key);
            prop_assert!(!matches(&key, &pattern));
        }

        #[test]
        fn prop_prefix_star_matches_extensions(prefix in "[a-z/]{0,8}", rest in "[a-z/]{0,8}") {
            let key = format!("{}{}", prefix, rest);
            let pattern = format!("{}*", prefix);
            prop_assert!(matches(&key, &pattern));
        }
    }
}
