//! Unicode-aware tokenization of metadata strings.

use std::collections::HashSet;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

/// Splits strings into normalized, deduplicated lowercase tokens.
///
/// Construction decides whether the SQL wildcards `*` and `?` survive
/// tokenization; when they do, they are rewritten to `%` and `_` so the
/// output can be handed straight to a `LIKE` predicate.
#[derive(Debug, Clone, Copy)]
pub struct Tokenizer {
    allow_wildcards: bool,
}

impl Tokenizer {
    pub fn new(allow_wildcards: bool) -> Self {
        Self { allow_wildcards }
    }

    /// Tokenize `text`, preserving first-occurrence order and suppressing
    /// duplicates within the same call.
    ///
    /// Normalization is NFD, strip combining marks, NFC, lowercase; fragments
    /// are runs of Unicode letters, numbers, private-use characters, `-`, and
    /// (in wildcard mode) `*`/`?`.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let stripped: String = text.nfd().filter(|c| !is_combining_mark(*c)).nfc().collect();

        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut current = String::new();

        let push = |current: &mut String, out: &mut Vec<String>, seen: &mut HashSet<String>| {
            if !current.is_empty() {
                if !seen.contains(current.as_str()) {
                    seen.insert(current.clone());
                    out.push(std::mem::take(current));
                } else {
                    current.clear();
                }
            }
        };

        for c in stripped.chars().flat_map(char::to_lowercase) {
            if self.keeps(c) {
                current.push(match c {
                    '*' => '%',
                    '?' => '_',
                    other => other,
                });
            } else {
                push(&mut current, &mut out, &mut seen);
            }
        }
        push(&mut current, &mut out, &mut seen);

        out
    }

    fn keeps(&self, c: char) -> bool {
        if c.is_alphabetic() || c.is_numeric() || c == '-' || is_private_use(c) {
            return true;
        }
        // Both the raw wildcards and their SQL forms survive, so feeding a
        // previous call's output back through is a no-op.
        self.allow_wildcards && matches!(c, '*' | '?' | '%' | '_')
    }
}

fn is_private_use(c: char) -> bool {
    matches!(c,
        '\u{E000}'..='\u{F8FF}'
        | '\u{F0000}'..='\u{FFFFD}'
        | '\u{100000}'..='\u{10FFFD}')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_lowercases() {
        let tok = Tokenizer::new(false);
        assert_eq!(
            tok.tokenize("Aaron had a little lamb"),
            vec!["aaron", "had", "a", "little", "lamb"]
        );
        assert_eq!(tok.tokenize("foo_bar.whee"), vec!["foo", "bar", "whee"]);
    }

    #[test]
    fn strips_diacritics() {
        let tok = Tokenizer::new(false);
        assert_eq!(tok.tokenize("Aarón"), vec!["aaron"]);
        // Combining form of the same string normalizes identically.
        assert_eq!(tok.tokenize("Aaro\u{0301}n"), vec!["aaron"]);
        assert_eq!(tok.tokenize("ÅÎÛ"), vec!["aiu"]);
    }

    #[test]
    fn preserves_hyphens_and_numbers() {
        let tok = Tokenizer::new(false);
        assert_eq!(tok.tokenize("x-ray 2021"), vec!["x-ray", "2021"]);
        assert_eq!(tok.tokenize("1.5e3"), vec!["1", "5e3"]);
    }

    #[test]
    fn deduplicates_preserving_order() {
        let tok = Tokenizer::new(false);
        assert_eq!(
            tok.tokenize("lamb, LAMB; Lamb and wolf"),
            vec!["lamb", "and", "wolf"]
        );
    }

    #[test]
    fn wildcards_dropped_without_opt_in() {
        let tok = Tokenizer::new(false);
        assert_eq!(tok.tokenize("lam*"), vec!["lam"]);
        assert_eq!(tok.tokenize("l?mb"), vec!["l", "mb"]);
    }

    #[test]
    fn wildcards_rewritten_when_enabled() {
        let tok = Tokenizer::new(true);
        assert_eq!(tok.tokenize("lam*"), vec!["lam%"]);
        assert_eq!(tok.tokenize("l?mb"), vec!["l_mb"]);
        assert_eq!(tok.tokenize("*"), vec!["%"]);
        // Already-converted wildcards pass through unchanged.
        assert_eq!(tok.tokenize("lam%"), vec!["lam%"]);
        assert_eq!(tok.tokenize("l_mb"), vec!["l_mb"]);
    }

    #[test]
    fn deterministic_and_idempotent() {
        let tok = Tokenizer::new(false);
        let input = "The Qüick brown-fox jumps 42 times over the qüick fox";
        let first = tok.tokenize(input);
        assert_eq!(first, tok.tokenize(input));
        let rejoined = first.join(" ");
        assert_eq!(tok.tokenize(&rejoined), first);
    }

    #[test]
    fn empty_and_symbol_only_inputs() {
        let tok = Tokenizer::new(false);
        assert!(tok.tokenize("").is_empty());
        assert!(tok.tokenize("!!! ... ///").is_empty());
    }
}
