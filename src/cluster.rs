//! Fuzzy clustering of near-duplicate string values.
//!
//! Values are grouped by a normalized fingerprint (case-folded,
//! punctuation-stripped, token-sorted). Groups with two or more distinct
//! members become merge candidates; the canonical member is the one with the
//! highest occurrence count, ties broken lexicographically.
//!
//! The grouping itself is engine-agnostic: callers feed it `(value, count)`
//! pairs from whichever store owns the session, and apply accepted merges
//! through that store.

use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Maximum number of clusters returned by a suggestion scan.
pub const MAX_CLUSTERS: usize = 200;

fn non_token_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9\s]+").expect("static regex"))
}

/// Normalize a value into its cluster fingerprint.
///
/// Lowercase, replace every run of characters other than ASCII alphanumerics
/// and whitespace with a single space, split into tokens, sort them, and join
/// with single spaces. Empty or all-punctuation input yields the empty string,
/// which never acts as a cluster key.
pub fn fingerprint(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    if lowered.is_empty() {
        return String::new();
    }
    let spaced = non_token_chars().replace_all(&lowered, " ");
    let mut tokens: Vec<&str> = spaced.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// One distinct value inside a cluster, with its occurrence count.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ClusterMember {
    pub value: String,
    pub count: u64,
}

/// A group of distinct values sharing a fingerprint.
#[derive(Debug, Clone, Serialize)]
pub struct Cluster {
    /// The shared fingerprint.
    pub key: String,
    /// The proposed merge target: highest count, ties broken lexicographically.
    pub canonical: String,
    /// Members sorted by (count desc, value asc).
    pub members: Vec<ClusterMember>,
    /// Number of distinct members, always >= 2.
    pub size: usize,
}

/// Group distinct values by fingerprint and keep only groups of size >= 2.
///
/// `value_counts` is expected in descending-frequency order (the scan order);
/// the output is sorted by (size desc, canonical asc) and truncated to
/// [`MAX_CLUSTERS`].
pub fn build_clusters(value_counts: &[(String, u64)]) -> Vec<Cluster> {
    let mut groups: HashMap<String, Vec<ClusterMember>> = HashMap::new();

    for (value, count) in value_counts {
        let key = fingerprint(value);
        if key.is_empty() {
            continue;
        }
        groups.entry(key).or_default().push(ClusterMember {
            value: value.clone(),
            count: *count,
        });
    }

    let mut clusters: Vec<Cluster> = groups
        .into_iter()
        .filter(|(_, members)| members.len() >= 2)
        .map(|(key, mut members)| {
            members.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
            let canonical = members[0].value.clone();
            let size = members.len();
            Cluster {
                key,
                canonical,
                members,
                size,
            }
        })
        .collect();

    clusters.sort_by(|a, b| {
        b.size
            .cmp(&a.size)
            .then_with(|| a.canonical.cmp(&b.canonical))
    });
    clusters.truncate(MAX_CLUSTERS);
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fingerprint_strips_case_and_punctuation() {
        assert_eq!(fingerprint("Foo  Bar!"), "bar foo");
        assert_eq!(fingerprint("bar foo"), "bar foo");
        assert_eq!(fingerprint("  Apple "), "apple");
        assert_eq!(fingerprint("APPLE!"), "apple");
    }

    #[test]
    fn test_fingerprint_empty_inputs() {
        assert_eq!(fingerprint(""), "");
        assert_eq!(fingerprint("   "), "");
        assert_eq!(fingerprint("!?!,."), "");
    }

    #[test]
    fn test_apple_variants_form_one_cluster() {
        let counts = vec![
            ("Apple".to_string(), 5),
            ("apple ".to_string(), 3),
            ("APPLE!".to_string(), 2),
        ];
        let clusters = build_clusters(&counts);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].size, 3);
        assert_eq!(clusters[0].canonical, "Apple");
        assert_eq!(clusters[0].key, "apple");
    }

    #[test]
    fn test_canonical_tie_breaks_lexicographically() {
        let counts = vec![("beta".to_string(), 4), ("Beta".to_string(), 4)];
        let clusters = build_clusters(&counts);
        assert_eq!(clusters.len(), 1);
        // Equal counts: "Beta" < "beta" lexicographically.
        assert_eq!(clusters[0].canonical, "Beta");
    }

    #[test]
    fn test_all_unique_values_yield_no_clusters() {
        let counts = vec![
            ("red".to_string(), 3),
            ("green".to_string(), 2),
            ("blue".to_string(), 1),
        ];
        assert!(build_clusters(&counts).is_empty());
    }

    #[test]
    fn test_clusters_sorted_by_size_then_canonical() {
        let counts = vec![
            ("a b".to_string(), 1),
            ("A B".to_string(), 1),
            ("b a".to_string(), 1),
            ("x y".to_string(), 1),
            ("y x".to_string(), 1),
        ];
        let clusters = build_clusters(&counts);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].key, "a b");
        assert_eq!(clusters[0].size, 3);
        assert_eq!(clusters[1].key, "x y");
        assert_eq!(clusters[1].size, 2);
    }

    #[test]
    fn test_empty_fingerprint_never_clusters() {
        let counts = vec![("!!!".to_string(), 9), ("???".to_string(), 8)];
        assert!(build_clusters(&counts).is_empty());
    }

    proptest! {
        #[test]
        fn prop_fingerprint_is_idempotent(s in ".{0,64}") {
            let once = fingerprint(&s);
            prop_assert_eq!(fingerprint(&once), once.clone());
        }

        #[test]
        fn prop_fingerprint_is_token_order_insensitive(
            mut tokens in proptest::collection::vec("[a-z0-9]{1,8}", 1..6)
        ) {
            let forward = fingerprint(&tokens.join(" "));
            tokens.reverse();
            let reversed = fingerprint(&tokens.join(" "));
            prop_assert_eq!(forward, reversed);
        }

        #[test]
        fn prop_fingerprint_is_ascii_lowercase(s in ".{0,64}") {
            let fp = fingerprint(&s);
            prop_assert!(fp.chars().all(|c| c.is_ascii_lowercase()
                || c.is_ascii_digit()
                || c == ' '));
        }
    }
}
