//! Log classification against the issue catalog.
//!
//! Failure signatures are overwhelmingly near the end of CI output, so lines
//! are visited tail first. Matching itself is order-independent: an issue
//! hits if its matcher occurs in any line.

use crate::catalog::IssueCatalog;
use crate::types::{RetryPolicy, RetrySignal};
use std::path::Path;

/// Classify log lines (in their original, forward order).
///
/// Issues are tried in catalog order and the first actionable hit decides the
/// signal. Issues whose policy is `unknown` never decide. Returns
/// [`RetrySignal::Unknown`] when nothing matches.
pub fn classify<S: AsRef<str>>(lines: &[S], catalog: &IssueCatalog) -> RetrySignal {
    let tail_first: Vec<&str> = lines.iter().rev().map(|l| l.as_ref()).collect();
    classify_reversed(&tail_first, catalog)
}

/// Classify lines that are already in reverse (tail-first) order.
pub fn classify_reversed<S: AsRef<str>>(lines: &[S], catalog: &IssueCatalog) -> RetrySignal {
    let lowered: Vec<String> = lines.iter().map(|l| l.as_ref().to_lowercase()).collect();

    for entry in catalog.entries() {
        if entry.issue.retry_signal == RetryPolicy::Unknown {
            continue;
        }
        let hit = lines
            .iter()
            .zip(&lowered)
            .any(|(line, lower)| entry.matches(line.as_ref(), lower));
        if hit {
            return entry.issue.retry_signal.signal_for(entry.issue.clone());
        }
    }

    RetrySignal::Unknown
}

/// A classified log file.
#[derive(Debug, Clone)]
pub struct LogScan {
    /// Log lines, last line first.
    pub lines_reversed: Vec<String>,
    pub signal: RetrySignal,
}

/// Read a log file and classify it.
///
/// Invalid UTF-8 is replaced rather than rejected; command output is opaque.
pub fn scan_log_file(path: &Path, catalog: &IssueCatalog) -> std::io::Result<LogScan> {
    let bytes = std::fs::read(path)?;
    let content = String::from_utf8_lossy(&bytes);
    let lines_reversed: Vec<String> = content.lines().rev().map(str::to_string).collect();
    let signal = classify_reversed(&lines_reversed, catalog);
    Ok(LogScan {
        lines_reversed,
        signal,
    })
}
