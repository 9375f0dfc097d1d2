//! Content filtering for inbound messages and generated output.
//!
//! Classification is synchronous and does no I/O at call time; the blocked
//! term set is loaded at startup and can be reloaded while running. If the
//! term file cannot be loaded the filter is degraded and blocks everything
//! until a reload succeeds. Unfiltered egress is never permitted.

use aho_corasick::AhoCorasick;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use tracing::{info, warn};

/// Classification result for a text fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Blocked,
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("failed to read blocked terms file {path}: {source}")]
    Load {
        path: String,
        source: std::io::Error,
    },
}

struct TermSet {
    terms: HashSet<String>,
    /// Substring automaton over normalized terms, for strict mode.
    matcher: Option<AhoCorasick>,
}

enum State {
    Ready(TermSet),
    /// Term file could not be loaded; block everything.
    Degraded,
}

/// Blocked-term filter with normalization against evasion.
pub struct ContentFilter {
    enabled: bool,
    strict: bool,
    path: PathBuf,
    state: RwLock<State>,
}

impl ContentFilter {
    /// Build a filter from the blocked-terms file.
    ///
    /// A missing or unreadable file does not fail construction; it leaves the
    /// filter degraded, which blocks every input until `reload` succeeds.
    pub fn new(path: impl AsRef<Path>, enabled: bool, strict: bool) -> Self {
        let filter = Self {
            enabled,
            strict,
            path: path.as_ref().to_path_buf(),
            state: RwLock::new(State::Degraded),
        };
        if let Err(e) = filter.reload() {
            warn!(error = %e, "Blocked terms unavailable; filter degraded, blocking all content");
        }
        filter
    }

    /// Reload the blocked-term set from disk. Clears degraded mode on success.
    pub fn reload(&self) -> Result<usize, FilterError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| FilterError::Load {
            path: self.path.display().to_string(),
            source: e,
        })?;

        let mut terms = HashSet::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let normalized = normalize(line);
            if !normalized.is_empty() {
                terms.insert(normalized);
            }
        }

        let matcher = if terms.is_empty() {
            None
        } else {
            // Patterns are already normalized, so the automaton can stay
            // case-sensitive.
            Some(
                AhoCorasick::new(terms.iter())
                    .expect("blocked term set is small and valid for automaton construction"),
            )
        };

        let count = terms.len();
        let mut state = self.state.write().expect("filter lock poisoned");
        *state = State::Ready(TermSet { terms, matcher });
        info!(terms = count, path = %self.path.display(), "Blocked terms loaded");
        Ok(count)
    }

    /// Whether the filter is currently degraded (term file unavailable).
    pub fn is_degraded(&self) -> bool {
        matches!(
            *self.state.read().expect("filter lock poisoned"),
            State::Degraded
        )
    }

    /// Classify a text fragment.
    ///
    /// Degraded mode blocks unconditionally, even when the filter is
    /// disabled.
    pub fn classify(&self, text: &str) -> Verdict {
        let state = self.state.read().expect("filter lock poisoned");
        let set = match &*state {
            State::Ready(set) => set,
            State::Degraded => return Verdict::Blocked,
        };

        if !self.enabled || set.terms.is_empty() {
            return Verdict::Allowed;
        }

        let normalized = normalize(text);
        if normalized
            .split_whitespace()
            .any(|token| set.terms.contains(token))
        {
            return Verdict::Blocked;
        }

        if self.strict {
            if let Some(matcher) = &set.matcher {
                if matcher.is_match(&normalized) {
                    return Verdict::Blocked;
                }
            }
        }

        Verdict::Allowed
    }
}

/// Leetspeak substitutions applied during normalization.
const LEET_TABLE: [(char, char); 6] = [
    ('3', 'e'),
    ('1', 'i'),
    ('0', 'o'),
    ('4', 'a'),
    ('5', 's'),
    ('7', 't'),
];

/// Normalize a candidate for matching: case-fold, undo leetspeak, strip
/// non-alphanumerics (whitespace preserved), collapse whitespace.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;
    for ch in text.chars() {
        let ch = ch.to_ascii_lowercase();
        let ch = LEET_TABLE
            .iter()
            .find(|(from, _)| *from == ch)
            .map(|(_, to)| *to)
            .unwrap_or(ch);
        if ch.is_alphanumeric() {
            out.push(ch);
            last_was_space = false;
        } else if ch.is_whitespace() && !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn filter_with(terms: &str, enabled: bool, strict: bool) -> (ContentFilter, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{terms}").unwrap();
        let filter = ContentFilter::new(file.path(), enabled, strict);
        (filter, file)
    }

    #[test]
    fn clean_text_is_allowed() {
        let (filter, _f) = filter_with("badterm\n# comment\n\n", true, false);
        assert_eq!(filter.classify("hello everyone, how are you"), Verdict::Allowed);
    }

    #[test]
    fn exact_token_is_blocked() {
        let (filter, _f) = filter_with("badterm", true, false);
        assert_eq!(filter.classify("this is badterm right here"), Verdict::Blocked);
    }

    #[test]
    fn leetspeak_evasion_is_blocked() {
        let (filter, _f) = filter_with("badterm", true, false);
        assert_eq!(filter.classify("b4dt3rm"), Verdict::Blocked);
    }

    #[test]
    fn punctuation_stripping_catches_spacing_tricks() {
        let (filter, _f) = filter_with("badterm", true, false);
        assert_eq!(filter.classify("b.a.d.t.e.r.m"), Verdict::Blocked);
    }

    #[test]
    fn substring_only_matches_in_strict_mode() {
        let (loose, _f1) = filter_with("badterm", true, false);
        assert_eq!(loose.classify("xbadtermx"), Verdict::Allowed);

        let (strict, _f2) = filter_with("badterm", true, true);
        assert_eq!(strict.classify("xbadtermx"), Verdict::Blocked);
    }

    #[test]
    fn disabled_filter_allows_everything() {
        let (filter, _f) = filter_with("badterm", false, false);
        assert_eq!(filter.classify("badterm"), Verdict::Allowed);
    }

    #[test]
    fn missing_file_blocks_everything_even_when_disabled() {
        let filter = ContentFilter::new("/nonexistent/blocked.txt", false, false);
        assert!(filter.is_degraded());
        assert_eq!(filter.classify("hello"), Verdict::Blocked);
        assert_eq!(filter.classify(""), Verdict::Blocked);
    }

    #[test]
    fn reload_clears_degraded_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocked.txt");

        let filter = ContentFilter::new(&path, true, false);
        assert!(filter.is_degraded());
        assert_eq!(filter.classify("hello"), Verdict::Blocked);

        std::fs::write(&path, "badterm\n").unwrap();
        filter.reload().unwrap();
        assert!(!filter.is_degraded());
        assert_eq!(filter.classify("hello"), Verdict::Allowed);
        assert_eq!(filter.classify("badterm"), Verdict::Blocked);
    }

    #[test]
    fn classify_is_stable_under_normalization() {
        let (filter, _f) = filter_with("badterm", true, false);
        for input in ["b4dterm here", "clean words only", "B A D T E R M"] {
            assert_eq!(filter.classify(input), filter.classify(&normalize(input)));
        }
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize("  a   b\t\nc  "), "a b c");
        assert_eq!(normalize("He11o W0rld"), "heiio world");
    }

    #[test]
    fn normalize_applies_leet_table() {
        assert_eq!(normalize("73571NG"), "testing");
        assert_eq!(normalize("5alt"), "salt");
    }
}
