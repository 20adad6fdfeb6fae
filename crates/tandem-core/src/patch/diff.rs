//! Line-level diffing between a file snapshot and proposed content
//!
//! Line numbers are 1-based and ranges are end-exclusive, so an insertion
//! before line `n` is the empty range `n..n`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use similar::TextDiff;

/// A hunk as produced by diffing, before the engine assigns an id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedHunk {
    pub start: usize,
    pub end: usize,
    pub original: String,
    pub replacement: String,
}

/// Split text into lines, keeping each line's terminator
pub fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

/// Compute the hunks that turn `old` into `new`
///
/// Changes separated by at least one unchanged line become separate hunks.
pub fn compute_hunks(old: &str, new: &str) -> Vec<ProposedHunk> {
    let diff = TextDiff::from_lines(old, new);
    let old_lines = diff.old_slices();
    let new_lines = diff.new_slices();

    let mut hunks = Vec::new();
    for group in diff.grouped_ops(0) {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };
        let old_range = first.old_range().start..last.old_range().end;
        let new_range = first.new_range().start..last.new_range().end;
        if old_range.is_empty() && new_range.is_empty() {
            continue;
        }

        hunks.push(ProposedHunk {
            start: old_range.start + 1,
            end: old_range.end + 1,
            original: old_lines[old_range].concat(),
            replacement: new_lines[new_range].concat(),
        });
    }
    hunks
}

/// Replace lines `start..end` (1-based, exclusive) of `lines` with `replacement`
pub fn splice(lines: &mut Vec<String>, start: usize, end: usize, replacement: &str) {
    let from = start.saturating_sub(1).min(lines.len());
    let to = end.saturating_sub(1).clamp(from, lines.len());
    let new_lines: Vec<String> = split_lines(replacement)
        .into_iter()
        .map(str::to_string)
        .collect();
    lines.splice(from..to, new_lines);
}

/// Unified diff used for tool results and review output
pub fn unified_diff(old: &str, new: &str, path: &Path) -> String {
    let diff = TextDiff::from_lines(old, new);
    let mut output = String::new();
    for hunk in diff.unified_diff().context_radius(3).iter_hunks() {
        output.push_str(&format!("{}", hunk));
    }
    if output.is_empty() {
        return String::new();
    }
    format!("--- {}\n+++ {}\n{}", path.display(), path.display(), output)
}
