//! Hierarchical scope evaluation
//!
//! Scopes are colon-separated (`category` or `category:resource[:...]`). A
//! token subject grants a required scope when it is the universal wildcard
//! `*`, the implicit super-scope `admin`, equal to the required scope, or a
//! whole-segment ancestor of it. Comparison is case-insensitive.

/// Outcome of comparing a subject against a required scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeMatch {
    /// Subject is `*` or `admin`
    WildcardAdmin,
    Equal,
    /// Subject's segments are a strict leading run of the required segments
    PrefixAncestor,
    NoMatch,
}

impl ScopeMatch {
    pub fn is_granted(self) -> bool {
        !matches!(self, ScopeMatch::NoMatch)
    }
}

pub const WILDCARD: &str = "*";
pub const ADMIN: &str = "admin";

pub fn evaluate(subject: &str, required_scope: &str) -> ScopeMatch {
    let subject = subject.to_lowercase();
    let required = required_scope.to_lowercase();

    if subject == WILDCARD || subject == ADMIN {
        return ScopeMatch::WildcardAdmin;
    }
    if subject == required {
        return ScopeMatch::Equal;
    }

    let subject_segments: Vec<&str> = subject.split(':').collect();
    let required_segments: Vec<&str> = required.split(':').collect();
    if subject_segments.len() < required_segments.len()
        && subject_segments
            .iter()
            .zip(&required_segments)
            .all(|(held, wanted)| held == wanted)
    {
        return ScopeMatch::PrefixAncestor;
    }

    ScopeMatch::NoMatch
}

/// Whether `subject` grants `required_scope`. Total over any two strings.
pub fn authorize(subject: &str, required_scope: &str) -> bool {
    evaluate(subject, required_scope).is_granted()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_and_admin_grant_everything() {
        for scope in ["api:metrics", "ai:alt", "dashboard", "admin:kv", "", "x:y:z"] {
            assert!(authorize("admin", scope));
            assert!(authorize("*", scope));
            assert!(authorize("ADMIN", scope));
        }
        assert_eq!(evaluate("*", "api"), ScopeMatch::WildcardAdmin);
    }

    #[test]
    fn test_exact_match() {
        assert_eq!(evaluate("ai:alt", "ai:alt"), ScopeMatch::Equal);
        assert_eq!(evaluate("AI:Alt", "ai:ALT"), ScopeMatch::Equal);
    }

    #[test]
    fn test_ancestor_grants_descendants() {
        assert_eq!(evaluate("api", "api:metrics"), ScopeMatch::PrefixAncestor);
        assert!(authorize("api", "api:metrics:usage"));
        assert!(authorize("api:metrics", "api:metrics:usage"));
        assert!(authorize("Api", "api:metrics"));
    }

    #[test]
    fn test_prefix_is_segment_based() {
        assert!(!authorize("apiz", "api:metrics"));
        assert!(!authorize("api", "apiary"));
        assert!(!authorize("api", "apix:metrics"));
        assert!(!authorize("api:met", "api:metrics"));
        assert!(!authorize("api:", "api:metrics"));
    }

    #[test]
    fn test_child_does_not_grant_parent() {
        assert_eq!(evaluate("api:metrics", "api"), ScopeMatch::NoMatch);
        assert!(!authorize("ai:alt", "ai"));
    }

    #[test]
    fn test_unrelated_scopes() {
        assert!(!authorize("dashboard", "api:metrics"));
        assert!(!authorize("", "api"));
        assert!(!authorize("api:metrics", "api:images"));
    }
}
