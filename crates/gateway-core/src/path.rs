//! Lease path handling.
//!
//! A lease path has the canonical form `<repo-name>/<subpath>`; the subpath
//! keeps its leading `/` and may be just `/` for a lease on the repository
//! root. Two paths conflict iff one is a segment-aligned prefix of the
//! other.

/// Splits a lease path into `(repository, subpath)`.
///
/// The subpath keeps its leading `/` (`"repo/"` yields `("repo", "/")`).
/// Returns `None` when the path has no `/` separator or an empty repository
/// name.
#[must_use]
pub fn split_lease_path(lease_path: &str) -> Option<(&str, &str)> {
    let sep = lease_path.find('/')?;
    let (repo, subpath) = lease_path.split_at(sep);
    if repo.is_empty() {
        return None;
    }
    Some((repo, subpath))
}

/// Reports whether two paths conflict.
///
/// Trailing `/` is ignored; the paths are compared segment-wise, and they
/// conflict iff the shorter segment sequence is a prefix of the longer.
/// The relation is reflexive and symmetric: `r/a` conflicts with `r/a/b`
/// and with itself, but not with `r/ab`.
#[must_use]
pub fn conflicting(lhs: &str, rhs: &str) -> bool {
    let lhs: Vec<&str> = lhs.trim_end_matches('/').split('/').collect();
    let rhs: Vec<&str> = rhs.trim_end_matches('/').split('/').collect();

    let shared = lhs.len().min(rhs.len());
    lhs[..shared] == rhs[..shared]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_lease_path() {
        assert_eq!(
            split_lease_path("test2.repo.org/some/path"),
            Some(("test2.repo.org", "/some/path"))
        );
        assert_eq!(split_lease_path("repo/"), Some(("repo", "/")));
        assert_eq!(split_lease_path("repo"), None);
        assert_eq!(split_lease_path("/no/repo"), None);
        assert_eq!(split_lease_path(""), None);
    }

    #[test]
    fn test_conflict_on_prefix() {
        assert!(conflicting("r/a", "r/a/b"));
        assert!(conflicting("r/a/b", "r/a"));
        assert!(conflicting("r/a", "r/a"));
    }

    #[test]
    fn test_no_conflict_on_divergence() {
        assert!(!conflicting("r/a", "r/ab"));
        assert!(!conflicting("r/a/x", "r/a/y"));
        assert!(!conflicting("r1/a", "r2/a"));
    }

    #[test]
    fn test_trailing_slash_is_canonicalized() {
        assert!(conflicting("r/a/", "r/a"));
        assert!(conflicting("r/", "r/a/b"));
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    fn arb_segments() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec("[a-c]{1,2}", 1..5)
    }

    fn join(segments: &[String]) -> String {
        segments.join("/")
    }

    proptest! {
        #[test]
        fn conflict_reflexive(p in arb_segments()) {
            prop_assert!(conflicting(&join(&p), &join(&p)));
        }

        #[test]
        fn conflict_symmetric(a in arb_segments(), b in arb_segments()) {
            let (a, b) = (join(&a), join(&b));
            prop_assert_eq!(conflicting(&a, &b), conflicting(&b, &a));
        }

        #[test]
        fn conflict_iff_segment_prefix(a in arb_segments(), b in arb_segments()) {
            let shared = a.len().min(b.len());
            let expected = a[..shared] == b[..shared];
            prop_assert_eq!(conflicting(&join(&a), &join(&b)), expected);
        }

        #[test]
        fn extension_always_conflicts(a in arb_segments(), ext in "[a-c]{1,2}") {
            let base = join(&a);
            let extended = format!("{base}/{ext}");
            prop_assert!(conflicting(&base, &extended));
        }
    }
}
