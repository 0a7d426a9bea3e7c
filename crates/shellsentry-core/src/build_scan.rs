//! Build scan link extraction.
//!
//! Gradle prints the scan URL on the line after the publish marker:
//!
//! ```text
//! Publishing build scan...
//! https://gradle-enterprise.example.com/s/ueizlbptdqv6q
//! ```
//!
//! Callers may hold the log in reverse order, so both neighbours of the marker
//! are candidates.

/// Line that precedes the build scan URL.
pub const BUILD_SCAN_MARKER: &str = "Publishing build scan...";

/// Find the build scan URL next to the publish marker.
///
/// The line below the marker is checked first, then the line above. A
/// candidate qualifies when it contains `server` (if given) or `https`
/// otherwise. Returns the trimmed candidate.
pub fn find_build_scan_url<S: AsRef<str>>(lines: &[S], server: Option<&str>) -> Option<String> {
    let marker = lines
        .iter()
        .position(|l| l.as_ref().contains(BUILD_SCAN_MARKER))?;
    let needle = server.map_or("https", |s| s.trim_end_matches('/'));

    let below = lines.get(marker + 1);
    let above = marker.checked_sub(1).and_then(|i| lines.get(i));

    [below, above]
        .into_iter()
        .flatten()
        .map(|l| l.as_ref().trim())
        .find(|candidate| candidate.contains(needle))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER: &str = "https://gradle-enterprise.example.com";
    const SCAN: &str = "https://gradle-enterprise.example.com/s/ueizlbptdqv6q";

    fn log() -> Vec<String> {
        let mut lines: Vec<String> = (0..10).map(|i| format!("task output {i}")).collect();
        lines.push(BUILD_SCAN_MARKER.to_string());
        lines.push(format!("  {SCAN}  "));
        lines.push(String::new());
        lines.extend((10..20).map(|i| format!("more output {i}")));
        lines
    }

    #[test]
    fn finds_url_in_both_directions() {
        let forward = log();
        let reversed: Vec<String> = forward.iter().rev().cloned().collect();

        assert_eq!(find_build_scan_url(&forward, None).as_deref(), Some(SCAN));
        assert_eq!(find_build_scan_url(&reversed, None).as_deref(), Some(SCAN));
        assert_eq!(find_build_scan_url(&forward, Some(SERVER)).as_deref(), Some(SCAN));
        assert_eq!(find_build_scan_url(&reversed, Some(SERVER)).as_deref(), Some(SCAN));
    }

    #[test]
    fn two_line_block_is_symmetric() {
        let block = [BUILD_SCAN_MARKER, "https://host/s/id"];
        let reversed = ["https://host/s/id", BUILD_SCAN_MARKER];
        assert_eq!(find_build_scan_url(&block, None).as_deref(), Some("https://host/s/id"));
        assert_eq!(find_build_scan_url(&reversed, None).as_deref(), Some("https://host/s/id"));
    }

    #[test]
    fn prefers_line_below_marker() {
        let lines = ["https://above/s/1", BUILD_SCAN_MARKER, "https://below/s/2"];
        assert_eq!(find_build_scan_url(&lines, None).as_deref(), Some("https://below/s/2"));
    }

    #[test]
    fn missing_marker_yields_none() {
        let lines = ["https://host/s/id", "BUILD FAILED"];
        assert_eq!(find_build_scan_url(&lines, None), None);
    }

    #[test]
    fn neighbours_without_url_yield_none() {
        let lines = ["BUILD FAILED", BUILD_SCAN_MARKER, "Upload failed"];
        assert_eq!(find_build_scan_url(&lines, None), None);
    }

    #[test]
    fn marker_at_edges_does_not_panic() {
        assert_eq!(find_build_scan_url(&[BUILD_SCAN_MARKER], None), None);
        let lines = [BUILD_SCAN_MARKER, "plain text"];
        assert_eq!(find_build_scan_url(&lines, None), None);
    }

    #[test]
    fn server_filter_rejects_other_hosts() {
        let lines = [BUILD_SCAN_MARKER, "https://scans.gradle.com/s/abc"];
        assert_eq!(find_build_scan_url(&lines, Some(SERVER)), None);
        assert_eq!(
            find_build_scan_url(&lines, Some("https://scans.gradle.com/")).as_deref(),
            Some("https://scans.gradle.com/s/abc")
        );
    }
}
