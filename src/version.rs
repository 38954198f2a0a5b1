use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Constraint that every host version satisfies
pub const ANY_VERSION: &str = "*";

/// Kind of change between two versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Patch,
    Minor,
    Major,
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Patch => write!(f, "patch"),
            Self::Minor => write!(f, "minor"),
            Self::Major => write!(f, "major"),
        }
    }
}

/// Split a version string into its numeric components
///
/// A leading `v` and any pre-release/build suffix (`-rc1`, `+int8`) are
/// dropped. Components that are not numbers count as `0`, so `1.x.3` reads
/// as `1.0.3`.
#[must_use]
pub fn components(version: &str) -> Vec<u64> {
    let trimmed = version.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    // Drop pre-release and build metadata
    let core = trimmed
        .split(|c| c == '-' || c == '+')
        .next()
        .unwrap_or_default();

    if core.is_empty() {
        return Vec::new();
    }

    core.split('.')
        .map(|part| part.trim().parse::<u64>().unwrap_or(0))
        .collect()
}

/// Compare two version strings numerically, component by component
#[must_use]
pub fn compare(a: &str, b: &str) -> Ordering {
    let left = components(a);
    let right = components(b);
    let len = left.len().max(right.len());

    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    Ordering::Equal
}

/// Whether `app_version` satisfies any of the given constraints
///
/// Accepts `"*"` and `">=X.Y.Z"`. An empty list is never satisfied.
#[must_use]
pub fn satisfies<S: AsRef<str>>(app_version: &str, constraints: &[S]) -> bool {
    constraints.iter().any(|constraint| {
        let constraint = constraint.as_ref().trim();
        if constraint == ANY_VERSION {
            return true;
        }
        if let Some(minimum) = constraint.strip_prefix(">=") {
            return compare(app_version, minimum.trim()) != Ordering::Less;
        }
        tracing::debug!("Ignoring unrecognised compatibility constraint '{constraint}'");
        false
    })
}

/// Classify the change from `current` to `latest`
#[must_use]
pub fn classify_update(current: &str, latest: &str) -> UpdateType {
    let current = components(current);
    let latest = components(latest);
    let part = |v: &[u64], i: usize| v.get(i).copied().unwrap_or(0);

    if part(&current, 0) != part(&latest, 0) {
        UpdateType::Major
    } else if part(&current, 1) != part(&latest, 1) {
        UpdateType::Minor
    } else {
        UpdateType::Patch
    }
}

/// An update is breaking when the major component changes
#[must_use]
pub fn is_breaking(current: &str, latest: &str) -> bool {
    classify_update(current, latest) == UpdateType::Major
}

/// Whether the string has at least one component and every component is numeric
#[must_use]
pub fn is_well_formed(version: &str) -> bool {
    let trimmed = version.trim().trim_start_matches(['v', 'V']);
    let core = trimmed.split(['-', '+']).next().unwrap_or_default();
    !core.is_empty()
        && core
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_numeric_not_lexicographic() {
        assert_eq!(compare("1.2.0", "1.10.0"), Ordering::Less);
        assert_eq!(compare("1.10.0", "1.2.0"), Ordering::Greater);
    }

    #[test]
    fn test_compare_pads_missing_components() {
        assert_eq!(compare("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare("2", "1.9.9"), Ordering::Greater);
        assert_eq!(compare("", "0.0.0"), Ordering::Equal);
    }

    #[test]
    fn test_compare_ignores_prefix_and_suffix() {
        assert_eq!(compare("v1.4.0", "1.4.0"), Ordering::Equal);
        assert_eq!(compare("1.4.0-rc1", "1.4.0"), Ordering::Equal);
        assert_eq!(compare("1.4.0+int8", "1.4.1"), Ordering::Less);
    }

    #[test]
    fn test_non_numeric_components_coerce_to_zero() {
        assert_eq!(compare("1.x.3", "1.0.3"), Ordering::Equal);
        assert_eq!(compare("abc", "0.0.0"), Ordering::Equal);
        assert_eq!(compare("1.beta", "1.1"), Ordering::Less);
        assert!(!is_well_formed("1.x.3"));
        assert!(is_well_formed("1.0.3"));
        assert!(is_well_formed("v2.1"));
    }

    #[test]
    fn test_satisfies() {
        assert!(satisfies("2.0.0", &[">=1.5.0"]));
        assert!(!satisfies("1.0.0", &[">=1.5.0"]));
        assert!(satisfies("1.5.0", &[">=1.5.0"]));
        assert!(satisfies("0.1.0", &["*"]));
        assert!(satisfies("1.0.0", &[">=3.0.0", "*"]));
    }

    #[test]
    fn test_satisfies_empty_fails_closed() {
        let empty: [&str; 0] = [];
        assert!(!satisfies("0.9.0", &empty));
    }

    #[test]
    fn test_satisfies_unknown_syntax() {
        assert!(!satisfies("2.0.0", &["~1.0"]));
        assert!(!satisfies("2.0.0", &["<3.0.0"]));
    }

    #[test]
    fn test_classify_update() {
        assert_eq!(classify_update("1.0.0", "1.0.1"), UpdateType::Patch);
        assert_eq!(classify_update("1.0.0", "1.1.0"), UpdateType::Minor);
        assert_eq!(classify_update("1.4.2", "2.0.0"), UpdateType::Major);
        assert!(is_breaking("1.4.2", "2.0.0"));
        assert!(!is_breaking("1.0.0", "1.1.0"));
    }
}
