//! Substitution rulesets for relocating installed trees.
//!
//! A [`Relocation`] maps a symbolic key (`prefix`, `cellar`, ...) to a
//! [`Matcher`] and a literal replacement. Path-aware matchers only match a
//! literal path at a path boundary:
//!
//! - not directly after an ASCII letter or digit, unless that letter ends one
//!   of the configured compiler-flag prefixes (`-I/opt/prefix` matches),
//! - not directly before a letter, digit, `-` or `_` (`/opt/prefix-extra`
//!   does not match `/opt/prefix`).
//!
//! Replacements are always literal text; `$1` in a replacement is inserted
//! as-is.
//!
//! # Examples
//!
//! ```
//! use pourover::relocation::Relocation;
//!
//! let mut relocation = Relocation::new();
//! relocation.add_replacement_pair("prefix", "/opt/prefix", "@@HOMEBREW_PREFIX@@", true);
//!
//! assert_eq!(
//!     relocation.replace_text("-I/opt/prefix/include a/opt/prefix /opt/prefix-extra"),
//!     "-I@@HOMEBREW_PREFIX@@/include a/opt/prefix /opt/prefix-extra"
//! );
//! ```

use crate::config::DEFAULT_FLAG_PREFIXES;
use regex::bytes::Regex;
use std::cmp::Reverse;
use std::ops::Range;
use std::sync::Arc;

/// Weight that sorts pattern rules ahead of every literal.
const PATTERN_WEIGHT: usize = usize::MAX;

/// What a rule looks for.
#[derive(Debug, Clone)]
pub struct Matcher {
    regex: Regex,
    literal: Option<String>,
    flag_prefixes: Option<Arc<[String]>>,
    group: usize,
}

impl Matcher {
    /// Match `text` anywhere.
    pub fn literal(text: &str) -> Self {
        Self {
            regex: escaped(text),
            literal: Some(text.to_string()),
            flag_prefixes: None,
            group: 0,
        }
    }

    /// Match `path` only at a path boundary.
    pub fn path(path: &str, flag_prefixes: &[String]) -> Self {
        Self {
            regex: escaped(path),
            literal: Some(path.to_string()),
            flag_prefixes: Some(flag_prefixes.into()),
            group: 0,
        }
    }

    /// Match a caller-supplied pattern and replace the whole match.
    pub fn pattern(regex: Regex) -> Self {
        Self::pattern_group(regex, 0)
    }

    /// Match `regex` but replace only the span of capture `group`.
    pub fn pattern_group(regex: Regex, group: usize) -> Self {
        Self {
            regex,
            literal: None,
            flag_prefixes: None,
            group,
        }
    }

    /// The literal this matcher was built from, if any.
    pub fn as_literal(&self) -> Option<&str> {
        self.literal.as_deref()
    }

    pub fn is_path(&self) -> bool {
        self.flag_prefixes.is_some()
    }

    fn weight(&self) -> usize {
        self.literal.as_ref().map_or(PATTERN_WEIGHT, String::len)
    }

    pub fn is_match(&self, haystack: &[u8]) -> bool {
        self.find(haystack).is_some()
    }

    /// Span of the first replaceable match.
    pub fn find(&self, haystack: &[u8]) -> Option<Range<usize>> {
        self.spans(haystack, Some(1)).into_iter().next()
    }

    /// Replace every match. `None` when nothing matched.
    pub fn replace_all(&self, haystack: &[u8], replacement: &[u8]) -> Option<Vec<u8>> {
        self.replace(haystack, replacement, None)
    }

    /// Replace the first match only. `None` when nothing matched.
    pub fn replace_first(&self, haystack: &[u8], replacement: &[u8]) -> Option<Vec<u8>> {
        self.replace(haystack, replacement, Some(1))
    }

    fn replace(&self, haystack: &[u8], replacement: &[u8], limit: Option<usize>) -> Option<Vec<u8>> {
        let spans = self.spans(haystack, limit);
        if spans.is_empty() {
            return None;
        }

        let mut out = Vec::with_capacity(haystack.len());
        let mut last = 0;
        for span in spans {
            out.extend_from_slice(&haystack[last..span.start]);
            out.extend_from_slice(replacement);
            last = span.end;
        }
        out.extend_from_slice(&haystack[last..]);
        Some(out)
    }

    /// Non-overlapping replaceable spans, left to right.
    fn spans(&self, haystack: &[u8], limit: Option<usize>) -> Vec<Range<usize>> {
        let mut spans = Vec::new();
        let mut pos = 0;

        while pos <= haystack.len() && limit.is_none_or(|n| spans.len() < n) {
            let Some(caps) = self.regex.captures_at(haystack, pos) else {
                break;
            };
            let Some(whole) = caps.get(0) else {
                break;
            };
            let next = if whole.is_empty() { whole.end() + 1 } else { whole.end() };

            if !self.at_boundary(haystack, whole.start(), whole.end()) {
                pos = whole.start() + 1;
                continue;
            }
            if let Some(target) = caps.get(self.group) {
                spans.push(target.range());
            }
            pos = next;
        }

        spans
    }

    fn at_boundary(&self, haystack: &[u8], start: usize, end: usize) -> bool {
        let Some(flags) = &self.flag_prefixes else {
            return true;
        };

        let before = &haystack[..start];
        let leading = match before.last() {
            None => true,
            Some(b) if !b.is_ascii_alphanumeric() => true,
            Some(_) => flags.iter().any(|flag| before.ends_with(flag.as_bytes())),
        };
        let trailing = haystack
            .get(end)
            .is_none_or(|b| !(b.is_ascii_alphanumeric() || *b == b'-' || *b == b'_'));

        leading && trailing
    }
}

fn escaped(text: &str) -> Regex {
    Regex::new(&regex::escape(text)).expect("escaped literal is a valid regex")
}

#[derive(Debug, Clone)]
struct Rule {
    key: String,
    matcher: Matcher,
    replacement: String,
}

/// Ordered set of substitution rules.
///
/// Rules apply patterns first, then literals longest first; equal weights
/// keep insertion order. A longer path nested under a shorter one (the
/// cellar under the prefix) is therefore always rewritten before the shorter
/// one can shadow it.
#[derive(Debug, Clone)]
pub struct Relocation {
    rules: Vec<Rule>,
    flag_prefixes: Vec<String>,
}

impl Default for Relocation {
    fn default() -> Self {
        Self::new()
    }
}

impl Relocation {
    pub fn new() -> Self {
        Self::with_flag_prefixes(DEFAULT_FLAG_PREFIXES.iter().map(|s| s.to_string()).collect())
    }

    /// Ruleset whose path-aware matchers accept these compiler-flag prefixes.
    pub fn with_flag_prefixes(flag_prefixes: Vec<String>) -> Self {
        Self {
            rules: Vec::new(),
            flag_prefixes,
        }
    }

    /// Register `old -> new` under `key`. With `path` set, `old` only matches
    /// at a path boundary. Re-adding a key replaces its rule in place; an
    /// empty `old` is ignored.
    pub fn add_replacement_pair(&mut self, key: &str, old: &str, new: &str, path: bool) {
        if old.is_empty() {
            tracing::debug!("Ignoring empty matcher for {}", key);
            return;
        }
        let matcher = if path {
            Matcher::path(old, &self.flag_prefixes)
        } else {
            Matcher::literal(old)
        };
        self.add_rule(key, matcher, new);
    }

    pub fn add_rule(&mut self, key: &str, matcher: Matcher, new: &str) {
        let rule = Rule {
            key: key.to_string(),
            matcher,
            replacement: new.to_string(),
        };
        match self.rules.iter_mut().find(|r| r.key == key) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    pub fn replacement_pair_for(&self, key: &str) -> Option<(&Matcher, &str)> {
        self.rules
            .iter()
            .find(|r| r.key == key)
            .map(|r| (&r.matcher, r.replacement.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.key.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn flag_prefixes(&self) -> &[String] {
        &self.flag_prefixes
    }

    fn ordered(&self) -> Vec<&Rule> {
        let mut rules: Vec<&Rule> = self.rules.iter().collect();
        rules.sort_by_key(|r| Reverse(r.matcher.weight()));
        rules
    }

    /// Apply every rule. `None` when nothing changed.
    pub fn replace_bytes(&self, data: &[u8]) -> Option<Vec<u8>> {
        let mut current: Option<Vec<u8>> = None;
        for rule in self.ordered() {
            let haystack = current.as_deref().unwrap_or(data);
            if let Some(next) = rule.matcher.replace_all(haystack, rule.replacement.as_bytes()) {
                current = Some(next);
            }
        }
        current
    }

    pub fn replace_text(&self, text: &str) -> String {
        match self.replace_bytes(text.as_bytes()) {
            Some(bytes) => match String::from_utf8(bytes) {
                Ok(s) => s,
                Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
            },
            None => text.to_string(),
        }
    }

    /// Whether any rule matches `data`.
    pub fn is_match(&self, data: &[u8]) -> bool {
        self.rules.iter().any(|r| r.matcher.is_match(data))
    }
}
