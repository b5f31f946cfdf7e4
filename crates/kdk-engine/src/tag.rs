//! Per-user snapshot tag derivation and recognition.

use chrono::{DateTime, Utc};
use kdk_common::ImageRef;

/// Derives and recognizes snapshot image tags of the form
/// `<user>-kdk:<unix-seconds>`.
#[derive(Debug, Clone)]
pub struct TagMatcher {
    repository: String,
}

impl TagMatcher {
    pub fn new(user: &str) -> Self {
        Self {
            repository: format!("{user}-kdk"),
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Derive a fresh snapshot reference for the given instant.
    ///
    /// Tags have second granularity and are not checked against existing
    /// images; two commits within the same second land on the same tag and
    /// the runtime silently re-points it. Callers derive at most once per
    /// commit.
    pub fn derive(&self, at: DateTime<Utc>) -> ImageRef {
        ImageRef::new(&self.repository, at.timestamp().to_string())
    }

    /// True iff `repo_tag` is one of this user's snapshot references.
    pub fn matches(&self, repo_tag: &str) -> bool {
        let Some(rest) = repo_tag.strip_prefix(self.repository.as_str()) else {
            return false;
        };
        match rest.strip_prefix(':') {
            Some(tag) => !tag.is_empty() && tag.bytes().all(|b| b.is_ascii_digit()),
            None => false,
        }
    }

    /// A snapshot is stale when it is not backing the running container.
    pub fn is_stale(&self, repo_tag: &str, running_image: Option<&str>) -> bool {
        self.matches(repo_tag) && running_image != Some(repo_tag)
    }

    /// Parse the timestamp back out of a snapshot reference.
    pub fn timestamp(&self, repo_tag: &str) -> Option<i64> {
        if !self.matches(repo_tag) {
            return None;
        }
        repo_tag.rsplit_once(':')?.1.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_derive_round_trip() {
        let tags = TagMatcher::new("alice");
        let at = Utc.timestamp_opt(1000, 0).unwrap();
        let image = tags.derive(at);
        assert_eq!(image.to_string(), "alice-kdk:1000");
        assert!(tags.matches(&image.to_string()));
        assert_eq!(tags.timestamp(&image.to_string()), Some(1000));
    }

    #[test]
    fn test_rejects_foreign_and_malformed_tags() {
        let tags = TagMatcher::new("alice");
        assert!(!tags.matches("bob-kdk:1000"));
        assert!(!tags.matches("alice-kdk"));
        assert!(!tags.matches("alice-kdk:"));
        assert!(!tags.matches("alice-kdk:latest"));
        assert!(!tags.matches("alice-kdk:12a4"));
        assert!(!tags.matches("alice-kdk2:1000"));
        assert!(!tags.matches("xalice-kdk:1000"));
        assert!(!tags.matches("ubuntu:24.04"));
    }

    #[test]
    fn test_staleness_against_running_image() {
        let tags = TagMatcher::new("alice");
        assert!(tags.is_stale("alice-kdk:1000", Some("base:v1")));
        assert!(tags.is_stale("alice-kdk:1000", None));
        assert!(!tags.is_stale("alice-kdk:1000", Some("alice-kdk:1000")));
        // Non-snapshot images are never stale, whatever is running
        assert!(!tags.is_stale("ubuntu:24.04", Some("base:v1")));
    }

    #[test]
    fn test_timestamp_rejects_non_matching() {
        let tags = TagMatcher::new("alice");
        assert_eq!(tags.timestamp("bob-kdk:1000"), None);
        assert_eq!(tags.timestamp("alice-kdk:zzz"), None);
    }
}
