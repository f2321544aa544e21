//! Segment-wise semantic version comparison.

/// Returns `true` when `candidate` is strictly newer than `installed`.
///
/// Versions are split on `.` and compared numerically left to right; missing
/// trailing segments are treated as `0`, so `"1.0"` equals `"1.0.0"`.
/// Non-numeric segments also compare as `0`.
#[must_use]
pub fn is_newer_version(candidate: &str, installed: &str) -> bool {
    let a = segments(candidate);
    let b = segments(installed);
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        if x != y {
            return x > y;
        }
    }
    false
}

fn segments(version: &str) -> Vec<u64> {
    version
        .trim()
        .split('.')
        .map(|segment| segment.parse::<u64>().unwrap_or(0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_patch_wins() {
        assert!(is_newer_version("1.2.0", "1.1.9"));
    }

    #[test]
    fn equal_versions_are_not_newer() {
        assert!(!is_newer_version("1.0.0", "1.0.0"));
    }

    #[test]
    fn missing_segment_is_zero() {
        assert!(!is_newer_version("1.0", "1.0.0"));
        assert!(!is_newer_version("1.0.0", "1.0"));
        assert!(is_newer_version("1.0.1", "1.0"));
    }

    #[test]
    fn comparison_is_numeric_not_lexicographic() {
        assert!(is_newer_version("1.10.0", "1.9.0"));
    }

    #[test]
    fn non_numeric_segments_compare_as_zero() {
        assert!(is_newer_version("1.1", "1.beta"));
        assert!(!is_newer_version("1.beta", "1.0"));
    }
}
