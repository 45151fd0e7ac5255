//! Version comparison and mirror filter evaluation.
//!
//! Upstream registries publish version strings that are not always strict
//! SemVer, so comparison here is deliberately lenient: `major.minor.patch`
//! is parsed after dropping any pre-release suffix, and non-numeric
//! components count as 0. As a consequence `1.0.0-alpha` compares equal to
//! `1.0.0`; pre-release ordering is outside scope.
//!
//! Filters are a small pipeline of variant matchers rather than regexes,
//! so the accepted grammar stays exactly the documented one.

use std::cmp::Ordering;

/// Parsed `(major, minor, patch)` triple of a lenient version string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Semver {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Semver {
    /// Parse a version string leniently.
    ///
    /// A leading `v` is tolerated, anything after the first `-` is dropped
    /// before parsing, and components that fail to parse as integers are 0.
    #[must_use]
    pub fn parse(version: &str) -> Self {
        let version = version.trim().trim_start_matches('v');
        let version = version.split('-').next().unwrap_or(version);
        let mut parts = version.split('.');
        let mut next = || -> u64 {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .unwrap_or(0)
        };
        Self {
            major: next(),
            minor: next(),
            patch: next(),
        }
    }
}

impl Ord for Semver {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for Semver {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare two version strings with the lenient parser.
#[must_use]
pub fn compare(a: &str, b: &str) -> Ordering {
    Semver::parse(a).cmp(&Semver::parse(b))
}

/// Whether a version string is stable: no pre-release or build suffix.
#[must_use]
pub fn is_stable(version: &str) -> bool {
    !version.contains('-') && !version.contains('+')
}

/// A parsed version filter, applied against an upstream version list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionFilter {
    /// Empty or absent filter: all versions.
    All,
    /// `latest:N`: the N greatest versions, descending.
    Latest(usize),
    /// `X.` or `X.x`: prefix match anchored before the second dot.
    Prefix(String),
    /// `>=V`, `>V`, `<=V`, `<V`.
    Compare(CompareOp, String),
    /// Comma-separated exact list.
    Exact(Vec<String>),
    /// Anything else: tried as a prefix first, then as an exact match.
    PrefixOrExact(String),
}

/// Comparison operator of a `Compare` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Ge,
    Gt,
    Le,
    Lt,
}

impl VersionFilter {
    /// Parse the filter grammar.
    #[must_use]
    pub fn parse(filter: Option<&str>) -> Self {
        let filter = match filter.map(str::trim) {
            None | Some("") => return Self::All,
            Some(f) => f,
        };

        if let Some(n) = filter.strip_prefix("latest:") {
            if let Ok(n) = n.parse::<usize>() {
                if n >= 1 {
                    return Self::Latest(n);
                }
            }
            // Malformed latest:N falls through to the catch-all.
            return Self::PrefixOrExact(filter.to_string());
        }

        if let Some(v) = filter.strip_prefix(">=") {
            return Self::Compare(CompareOp::Ge, v.trim().to_string());
        }
        if let Some(v) = filter.strip_prefix("<=") {
            return Self::Compare(CompareOp::Le, v.trim().to_string());
        }
        if let Some(v) = filter.strip_prefix('>') {
            return Self::Compare(CompareOp::Gt, v.trim().to_string());
        }
        if let Some(v) = filter.strip_prefix('<') {
            return Self::Compare(CompareOp::Lt, v.trim().to_string());
        }

        if filter.contains(',') {
            return Self::Exact(
                filter
                    .split(',')
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect(),
            );
        }

        if let Some(prefix) = explicit_prefix(filter) {
            return Self::Prefix(prefix);
        }

        Self::PrefixOrExact(filter.to_string())
    }

    /// Apply the filter to an upstream version list.
    ///
    /// The result is always a subset of `versions`. `Latest(n)` returns
    /// versions in descending order; every other variant preserves the
    /// upstream order.
    #[must_use]
    pub fn apply(&self, versions: &[String]) -> Vec<String> {
        match self {
            Self::All => versions.to_vec(),
            Self::Latest(n) => {
                let mut sorted = versions.to_vec();
                sorted.sort_by(|a, b| compare(b, a));
                sorted.truncate(*n);
                sorted
            }
            Self::Prefix(prefix) => versions
                .iter()
                .filter(|v| matches_prefix(v, prefix))
                .cloned()
                .collect(),
            Self::Compare(op, pivot) => versions
                .iter()
                .filter(|v| {
                    let ord = compare(v, pivot);
                    match op {
                        CompareOp::Ge => ord != Ordering::Less,
                        CompareOp::Gt => ord == Ordering::Greater,
                        CompareOp::Le => ord != Ordering::Greater,
                        CompareOp::Lt => ord == Ordering::Less,
                    }
                })
                .cloned()
                .collect(),
            Self::Exact(list) => versions
                .iter()
                .filter(|v| list.iter().any(|e| e == *v))
                .cloned()
                .collect(),
            Self::PrefixOrExact(pattern) => {
                let prefix: Vec<String> = versions
                    .iter()
                    .filter(|v| matches_prefix(v, pattern))
                    .cloned()
                    .collect();
                if !prefix.is_empty() {
                    return prefix;
                }
                versions.iter().filter(|v| *v == pattern).cloned().collect()
            }
        }
    }
}

/// Recognize the explicit prefix forms `X.` and `X.x`.
fn explicit_prefix(filter: &str) -> Option<String> {
    if let Some(stem) = filter.strip_suffix(".x") {
        if !stem.is_empty() && !stem.contains('.') {
            return Some(format!("{stem}."));
        }
    }
    if filter.ends_with('.') && filter.matches('.').count() == 1 {
        return Some(filter.to_string());
    }
    None
}

/// Prefix match anchored before the second dot: `1.` matches `1.2.3` but
/// not `11.0.0`.
fn matches_prefix(version: &str, pattern: &str) -> bool {
    let pattern = pattern.trim_end_matches('x');
    let pattern = if pattern.ends_with('.') {
        pattern.to_string()
    } else {
        format!("{pattern}.")
    };
    version.starts_with(&pattern)
}

/// A parsed platform filter: a JSON array of case-insensitive `"os/arch"`.
///
/// Absent, malformed, or empty all mean "all platforms".
#[derive(Debug, Clone, Default)]
pub struct PlatformFilter {
    entries: Vec<(String, String)>,
}

impl PlatformFilter {
    /// Parse a JSON-encoded platform filter.
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        let raw = match raw {
            None => return Self::default(),
            Some(r) if r.trim().is_empty() => return Self::default(),
            Some(r) => r,
        };
        let Ok(list) = serde_json::from_str::<Vec<String>>(raw) else {
            return Self::default();
        };
        let entries = list
            .iter()
            .filter_map(|entry| {
                let (os, arch) = entry.split_once('/')?;
                Some((os.to_lowercase(), arch.to_lowercase()))
            })
            .collect();
        Self { entries }
    }

    /// Whether the given platform passes the filter.
    #[must_use]
    pub fn matches(&self, os: &str, arch: &str) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        let os = os.to_lowercase();
        let arch = arch.to_lowercase();
        self.entries.iter().any(|(o, a)| *o == os && *a == arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn versions(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test_case("1.0.0", "1.0.0-alpha" ; "prerelease collapses")]
    #[test_case("v1.2.3", "1.2.3" ; "leading v ignored")]
    #[test_case("1.2", "1.2.0" ; "missing patch is zero")]
    #[test_case("1.weird.0", "1.0.0" ; "non numeric component is zero")]
    fn compare_equal(a: &str, b: &str) {
        assert_eq!(compare(a, b), Ordering::Equal);
    }

    #[test]
    fn compare_orders_numerically() {
        assert_eq!(compare("2.0.0", "10.0.0"), Ordering::Less);
        assert_eq!(compare("1.10.0", "1.9.9"), Ordering::Greater);
    }

    #[test]
    fn latest_n_returns_greatest_descending() {
        let input = versions(&["1.0.0", "2.0.0", "3.0.0", "4.0.0", "5.0.0"]);
        let filter = VersionFilter::parse(Some("latest:3"));
        assert_eq!(filter.apply(&input), versions(&["5.0.0", "4.0.0", "3.0.0"]));
    }

    #[test]
    fn semver_ge_filter() {
        let input = versions(&["1.0.0", "2.0.0", "3.0.0"]);
        let filter = VersionFilter::parse(Some(">=2.0.0"));
        assert_eq!(filter.apply(&input), versions(&["2.0.0", "3.0.0"]));
    }

    #[test_case("1.", &["1.0.0", "1.5.2", "11.0.0", "2.0.0"], &["1.0.0", "1.5.2"] ; "dot form")]
    #[test_case("1.x", &["1.0.0", "1.5.2", "11.0.0"], &["1.0.0", "1.5.2"] ; "x form")]
    fn prefix_is_anchored(filter: &str, input: &[&str], expected: &[&str]) {
        let filter = VersionFilter::parse(Some(filter));
        assert_eq!(filter.apply(&versions(input)), versions(expected));
    }

    #[test]
    fn comma_list_is_exact() {
        let input = versions(&["1.0.0", "1.2.0", "2.0.0"]);
        let filter = VersionFilter::parse(Some("1.0.0, 2.0.0"));
        assert_eq!(filter.apply(&input), versions(&["1.0.0", "2.0.0"]));
    }

    #[test]
    fn fallback_tries_prefix_then_exact() {
        let input = versions(&["1.4.0", "1.4.6", "2.0.0"]);
        // "1.4" is neither "X." nor "X.x" but matches as a prefix.
        let filter = VersionFilter::parse(Some("1.4"));
        assert_eq!(filter.apply(&input), versions(&["1.4.0", "1.4.6"]));
        // No prefix hit: falls back to exact.
        let filter = VersionFilter::parse(Some("2.0.0"));
        assert_eq!(filter.apply(&input), versions(&["2.0.0"]));
    }

    #[test]
    fn empty_filter_keeps_everything() {
        let input = versions(&["1.0.0", "2.0.0"]);
        assert_eq!(VersionFilter::parse(None).apply(&input), input);
        assert_eq!(VersionFilter::parse(Some("  ")).apply(&input), input);
    }

    #[test]
    fn result_is_always_a_subset() {
        let input = versions(&["0.9.0", "1.0.0", "1.1.0", "2.0.0-rc1"]);
        for f in ["latest:2", ">=1.0.0", "<1.1.0", "1.", "1.x", "1.0.0,9.9.9", "nonsense"] {
            let out = VersionFilter::parse(Some(f)).apply(&input);
            for v in &out {
                assert!(input.contains(v), "{f}: {v} not in input");
            }
        }
    }

    #[test]
    fn platform_filter_variants() {
        let all = PlatformFilter::parse(None);
        assert!(all.matches("linux", "amd64"));

        let malformed = PlatformFilter::parse(Some("not json"));
        assert!(malformed.matches("windows", "386"));

        let empty = PlatformFilter::parse(Some("[]"));
        assert!(empty.matches("darwin", "arm64"));

        let scoped = PlatformFilter::parse(Some(r#"["Linux/AMD64", "darwin/arm64"]"#));
        assert!(scoped.matches("linux", "amd64"));
        assert!(scoped.matches("DARWIN", "ARM64"));
        assert!(!scoped.matches("windows", "amd64"));
    }

    #[test]
    fn stable_versions_reject_pre_and_build() {
        assert!(is_stable("1.6.0"));
        assert!(!is_stable("1.6.0-beta1"));
        assert!(!is_stable("1.6.0+ent"));
    }
}
