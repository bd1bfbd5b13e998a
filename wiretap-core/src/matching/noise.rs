//! Dotted-path noise filtering.
//!
//! A noise config maps a dotted JSON path (e.g. `body.user.created_at`) to an optional
//! list of regexes. A path with no regex list suppresses the whole subtree at that path;
//! a path with regexes only suppresses differences the regex matches. `[i]` index
//! syntax is normalized to `.i.` before lookup, and a config path with no index
//! component matches any index at that position.

use std::collections::HashMap;

use regex::Regex;

/// `body.items[3].name` -> `body.items.3.name`.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '[' {
            out.push('.');
            for c in chars.by_ref() {
                if c == ']' {
                    break;
                }
                out.push(c);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// `body.items.3.name` -> `body.items..name` (every numeric segment erased), used to
/// test the indexless fallback: a noise-config path with no index at a given position
/// is compared against this form too.
fn indexless(normalized: &str) -> String {
    normalized
    .split('.')
    .map(|seg| if seg.chars().all(|c| c.is_ascii_digit()) && !seg.is_empty() { "" } else { seg })
    .collect::<Vec<_>>()
    .join(".")
}

#[derive(Debug, Clone, Default)]
pub struct NoiseConfig {
    /// `None` regex list means "suppress the whole subtree"; `Some(vec![])` means
    /// "suppress nothing, the path is merely declared" (kept distinct from absence of
    /// any entry, which means "not noisy at all").
    entries: HashMap<String, Option<Vec<Regex>>>,
}

impl NoiseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suppress_subtree(mut self, path: &str) -> Self {
        self.entries.insert(normalize_path(path), None);
        self
    }

    pub fn suppress_matching(mut self, path: &str, regexes: Vec<Regex>) -> Self {
        self.entries.insert(normalize_path(path), Some(regexes));
        self
    }

    /// Looks up `path` (raw, possibly containing `[i]`) and, if found either directly or
    /// via the indexless fallback, returns whether `value` should be treated as noise
    /// (i.e. ignored by the matcher at this path).
    pub fn is_noise(&self, path: &str, value: &str) -> bool {
        let normalized = normalize_path(path);
        let entry = self
        .entries
        .get(&normalized)
        .or_else(|| self.entries.get(&indexless(&normalized)));

        match entry {
            None => false,
            Some(None) => true,
            Some(Some(regexes)) => regexes.is_empty() || regexes.iter().any(|r| r.is_match(value)),
        }
    }
}
