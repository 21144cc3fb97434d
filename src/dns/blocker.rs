//! Blocking decisions.
//!
//! The tunnel only needs a yes/no answer per query name, so the matching
//! engine sits behind [`RuleMatcher`]. [`Blocker`] is the built-in engine fed
//! from the inline patterns of the configuration; anything else (downloaded
//! hosts files, user exceptions, ...) plugs in through the same trait.

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;

/// Decides whether a query name is blocked.
///
/// Names are passed lower-cased and without the trailing root dot.
pub trait RuleMatcher: Send + Sync {
    fn is_blocked(&self, name: &str) -> bool;
}

impl<T: RuleMatcher + ?Sized> RuleMatcher for Arc<T> {
    fn is_blocked(&self, name: &str) -> bool {
        (**self).is_blocked(name)
    }
}

/// Rule matcher over exact names and `*.` suffix patterns.
///
/// Patterns are normalized once when the blocker is built, so lookups of
/// already lower-cased names never allocate.
#[derive(Debug, Clone, Default)]
pub struct Blocker {
    names: HashSet<String>,
    /// Kept with their leading dot: `*.ads.com` is stored as `.ads.com`.
    suffixes: Vec<String>,
}

impl Blocker {
    /// Build a blocker from `example.com` / `*.example.com` patterns.
    ///
    /// Case and a trailing root dot are ignored. A wildcard never matches
    /// its own base name.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut blocker = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref().to_ascii_lowercase();
            let pattern = pattern.trim_end_matches('.');
            match pattern.strip_prefix('*') {
                Some(suffix) => blocker.suffixes.push(suffix.to_owned()),
                None => {
                    blocker.names.insert(pattern.to_owned());
                }
            }
        }
        blocker
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct exact names plus wildcard patterns.
    #[inline]
    pub fn len(&self) -> usize {
        self.names.len() + self.suffixes.len()
    }
}

impl RuleMatcher for Blocker {
    #[inline]
    fn is_blocked(&self, name: &str) -> bool {
        let name = name.trim_end_matches('.');
        let name = if name.bytes().any(|b| b.is_ascii_uppercase()) {
            Cow::Owned(name.to_ascii_lowercase())
        } else {
            Cow::Borrowed(name)
        };

        self.names.contains(name.as_ref())
            || self
                .suffixes
                .iter()
                .any(|suffix| name.ends_with(suffix.as_str()))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Matcher blocking a fixed set of names and recording every lookup.
    #[derive(Default)]
    pub struct StaticMatcher {
        blocked: HashSet<String>,
        pub lookups: parking_lot::Mutex<Vec<String>>,
    }

    impl StaticMatcher {
        pub fn new<I: IntoIterator<Item = &'static str>>(blocked: I) -> Self {
            Self {
                blocked: blocked.into_iter().map(str::to_string).collect(),
                lookups: parking_lot::Mutex::default(),
            }
        }
    }

    impl RuleMatcher for StaticMatcher {
        fn is_blocked(&self, name: &str) -> bool {
            self.lookups.lock().push(name.to_string());
            self.blocked.contains(name)
        }
    }

    #[test]
    fn should_block_listed_names_only() {
        let blocker = Blocker::new(["ads.example.com", "telemetry.example.net"]);

        assert!(blocker.is_blocked("ads.example.com"));
        assert!(blocker.is_blocked("telemetry.example.net"));
        assert!(!blocker.is_blocked("example.com"));
        assert!(!blocker.is_blocked("www.ads.example.com"));
    }

    #[test]
    fn should_ignore_case_of_patterns_and_names() {
        let blocker = Blocker::new(["Tracker.Example.ORG"]);

        assert!(blocker.is_blocked("tracker.example.org"));
        assert!(blocker.is_blocked("TRACKER.EXAMPLE.ORG"));
    }

    #[test]
    fn should_match_any_depth_below_wildcard() {
        let blocker = Blocker::new(["*.doubleclick.net"]);

        assert!(blocker.is_blocked("ad.doubleclick.net"));
        assert!(blocker.is_blocked("stats.g.doubleclick.net"));
        assert!(!blocker.is_blocked("doubleclick.net"));
        assert!(!blocker.is_blocked("notdoubleclick.net"));
    }

    #[test]
    fn should_ignore_root_dot() {
        let blocker = Blocker::new(["ads.example.com."]);

        assert!(blocker.is_blocked("ads.example.com"));
        assert!(blocker.is_blocked("ads.example.com."));
    }

    #[test]
    fn should_count_duplicate_names_once() {
        let blocker = Blocker::new(["a.com", "A.com.", "*.b.com"]);

        assert_eq!(blocker.len(), 2);
        assert!(!Blocker::default().is_blocked("a.com"));
        assert!(Blocker::default().is_empty());
    }

    #[test]
    fn should_delegate_through_arc() {
        let matcher: Arc<dyn RuleMatcher> = Arc::new(Blocker::new(["a.com", "*.c.com"]));

        assert!(matcher.is_blocked("a.com"));
        assert!(matcher.is_blocked("x.c.com"));
        assert!(!matcher.is_blocked("b.com"));
    }
}
