//! Keyword-to-target matching.
//!
//! A [`KeywordMatcher`] maps free text to a target identifier (a worker id, a
//! policy reason) using an [`aho_corasick`] automaton over all registered
//! keywords.  Matching is ASCII case-insensitive and anchored at word starts,
//! so `"delete"` matches "Delete" and "deleted" but not "undeleted", and
//! `"hr"` does not fire inside "three".  [`KeywordMatcherBuilder::match_anywhere`]
//! drops the anchor.
//!
//! Targets are ranked by the order their rules were added: when the text hits
//! keywords of several targets, the earliest-added target wins regardless of
//! where in the text its keyword occurs.
//!
//! # Example
//!
//! ```rust
//! # use conductor_kernel::keywords::KeywordMatcher;
//! let matcher = KeywordMatcher::builder()
//!     .rule("HR", ["salary", "employee"])
//!     .rule("FPA", ["budget", "report"])
//!     .build()
//!     .unwrap();
//!
//! let hit = matcher.find("Budget report with salary totals").unwrap();
//! assert_eq!(hit.target, "HR");
//! ```

use aho_corasick::{AhoCorasick, MatchKind};
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A successful keyword lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordMatch {
    /// Target identifier of the winning rule.
    pub target: String,
    /// The keyword that fired, as registered.
    pub keyword: String,
    /// Byte offset of the match in the searched text.
    pub offset: usize,
}

#[derive(Debug, Default)]
pub struct KeywordMatcherBuilder {
    rules: Vec<(String, Vec<String>)>,
    anywhere: bool,
}

impl KeywordMatcherBuilder {
    /// Add a rule.  Rules added earlier take priority.
    pub fn rule<I, S>(mut self, target: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keywords = keywords
            .into_iter()
            .map(Into::into)
            .filter(|k: &String| !k.trim().is_empty())
            .collect();
        self.rules.push((target.into(), keywords));
        self
    }

    /// Match keywords inside words too, so `"create"` fires on "Recreate".
    pub fn match_anywhere(mut self) -> Self {
        self.anywhere = true;
        self
    }

    pub fn build(self) -> Result<KeywordMatcher> {
        let mut patterns = Vec::new();
        for (rank, (target, keywords)) in self.rules.into_iter().enumerate() {
            for keyword in keywords {
                patterns.push(Pattern {
                    keyword: keyword.trim().to_string(),
                    target: target.clone(),
                    rank,
                });
            }
        }

        if patterns.is_empty() {
            return Ok(KeywordMatcher {
                patterns,
                automaton: None,
                anywhere: self.anywhere,
            });
        }

        let automaton = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::Standard)
            .build(patterns.iter().map(|p| p.keyword.as_str()))
            .map_err(|e| KernelError::MatcherBuildError {
                reason: e.to_string(),
            })?;

        tracing::trace!(count = patterns.len(), "keyword automaton built");

        Ok(KeywordMatcher {
            patterns,
            automaton: Some(automaton),
            anywhere: self.anywhere,
        })
    }
}

#[derive(Debug, Clone)]
struct Pattern {
    keyword: String,
    target: String,
    rank: usize,
}

// ---------------------------------------------------------------------------
// KeywordMatcher
// ---------------------------------------------------------------------------

/// Immutable, shareable keyword matcher.
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    patterns: Vec<Pattern>,
    automaton: Option<AhoCorasick>,
    anywhere: bool,
}

impl KeywordMatcher {
    pub fn builder() -> KeywordMatcherBuilder {
        KeywordMatcherBuilder::default()
    }

    /// A matcher that never matches.
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            automaton: None,
            anywhere: false,
        }
    }

    /// Single-target convenience constructor.
    pub fn for_target<I, S>(target: impl Into<String>, keywords: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::builder().rule(target, keywords).build()
    }

    /// Find the highest-priority target whose keyword occurs in `text`.
    pub fn find(&self, text: &str) -> Option<KeywordMatch> {
        let ac = self.automaton.as_ref()?;

        // (rank, offset, pattern index); lowest rank wins, then earliest offset.
        let mut best: Option<(usize, usize, usize)> = None;
        for mat in ac.find_overlapping_iter(text) {
            if !self.anywhere && !starts_word(text, mat.start()) {
                continue;
            }
            let idx = mat.pattern().as_usize();
            let candidate = (self.patterns[idx].rank, mat.start(), idx);
            if best.is_none_or(|current| candidate < current) {
                best = Some(candidate);
            }
        }

        let (_, offset, idx) = best?;
        let pattern = &self.patterns[idx];
        Some(KeywordMatch {
            target: pattern.target.clone(),
            keyword: pattern.keyword.clone(),
            offset,
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.find(text).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl Default for KeywordMatcher {
    fn default() -> Self {
        Self::empty()
    }
}

fn starts_word(text: &str, offset: usize) -> bool {
    text[..offset]
        .chars()
        .next_back()
        .is_none_or(|c| !c.is_alphanumeric())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
