//! Unified diff generation, statistics, parsing and application
//!
//! Inputs are normalized so every line ends in `\n` before diffing; a
//! missing trailing newline on either side never shifts line alignment.

use serde::Serialize;
use similar::{DiffTag, TextDiff};
use std::fmt;

pub const DEFAULT_CONTEXT_LINES: usize = 3;

/// Line-level change counts from the opcode alignment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffStats {
    pub additions: usize,
    pub deletions: usize,
    /// A replace span counts `max(old, new)` lines.
    pub modifications: usize,
    pub unchanged: usize,
}

impl DiffStats {
    pub fn total_changes(&self) -> usize {
        self.additions + self.deletions + self.modifications
    }
}

impl fmt::Display for DiffStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "+{} -{} ~{} ({} changed, {} unchanged)",
            self.additions,
            self.deletions,
            self.modifications,
            self.total_changes(),
            self.unchanged
        )
    }
}

#[derive(Debug, Clone)]
pub struct DiffGenerator {
    context_lines: usize,
}

impl Default for DiffGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_LINES)
    }
}

impl DiffGenerator {
    pub fn new(context_lines: usize) -> Self {
        Self { context_lines }
    }

    /// Unified diff text; empty when nothing changed.
    pub fn diff(
        &self,
        original: &str,
        modified: &str,
        original_label: &str,
        modified_label: &str,
    ) -> String {
        if is_identical(original, modified) {
            return String::new();
        }
        let original = normalize(original);
        let modified = normalize(modified);
        if original == modified {
            return String::new();
        }

        TextDiff::from_lines(original.as_str(), modified.as_str())
            .unified_diff()
            .context_radius(self.context_lines)
            .header(original_label, modified_label)
            .to_string()
    }

    pub fn stats(&self, original: &str, modified: &str) -> DiffStats {
        let original = normalize(original);
        let modified = normalize(modified);
        let diff = TextDiff::from_lines(original.as_str(), modified.as_str());

        let mut stats = DiffStats::default();
        for op in diff.ops() {
            let (tag, old_range, new_range) = op.as_tag_tuple();
            match tag {
                DiffTag::Equal => stats.unchanged += old_range.len(),
                DiffTag::Delete => stats.deletions += old_range.len(),
                DiffTag::Insert => stats.additions += new_range.len(),
                DiffTag::Replace => {
                    stats.modifications += old_range.len().max(new_range.len())
                }
            }
        }
        stats
    }
}

pub fn is_identical(a: &str, b: &str) -> bool {
    a == b
}

/// Ensure every line, including the last, ends in `\n`.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 1);
    for line in text.split_inclusive('\n') {
        out.push_str(line);
        if !line.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

/// Cap a diff for size-constrained transports: keep a head and a tail of
/// `max_lines` in total with one ellipsis line reporting what was dropped.
pub fn truncate_diff(diff: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = diff.lines().collect();
    if lines.len() <= max_lines {
        return diff.to_string();
    }

    let head = max_lines / 2;
    let tail = max_lines - head;
    let omitted = lines.len() - max_lines;

    let mut out = lines[..head].join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(&format!("... ({} lines omitted) ...", omitted));
    if tail > 0 {
        out.push('\n');
        out.push_str(&lines[lines.len() - tail..].join("\n"));
    }
    out
}

/// A single line in a diff hunk, newline included
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

/// A hunk in a unified diff
#[derive(Debug, Clone, PartialEq)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    /// (additions, removals) in this hunk
    pub fn summary(&self) -> (usize, usize) {
        let adds = self.lines.iter().filter(|l| matches!(l, DiffLine::Add(_))).count();
        let removes = self.lines.iter().filter(|l| matches!(l, DiffLine::Remove(_))).count();
        (adds, removes)
    }
}

/// A parsed unified diff
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedDiff {
    pub old_path: String,
    pub new_path: String,
    pub hunks: Vec<DiffHunk>,
}

impl UnifiedDiff {
    /// Total (additions, removals)
    pub fn stats(&self) -> (usize, usize) {
        self.hunks.iter().fold((0, 0), |acc, h| {
            let (a, r) = h.summary();
            (acc.0 + a, acc.1 + r)
        })
    }
}

/// Parse a unified diff string into structured data
pub fn parse_unified_diff(diff: &str) -> Result<UnifiedDiff, String> {
    let lines: Vec<&str> = diff.split_inclusive('\n').collect();

    let mut old_path = None;
    let mut new_path = None;
    let mut idx = 0;

    while idx < lines.len() {
        let line = lines[idx].trim_end_matches(['\n', '\r']);
        idx += 1;
        if let Some(rest) = line.strip_prefix("--- ") {
            old_path = Some(header_path(rest));
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            new_path = Some(header_path(rest));
            break;
        }
    }

    let (Some(old_path), Some(new_path)) = (old_path, new_path) else {
        return Err("Could not find file paths in diff".to_string());
    };

    let mut hunks = Vec::new();
    while idx < lines.len() {
        if lines[idx].starts_with("@@ ") {
            hunks.push(parse_hunk(&lines, &mut idx)?);
        } else {
            idx += 1;
        }
    }

    if hunks.is_empty() {
        return Err("No hunks found in diff".to_string());
    }

    Ok(UnifiedDiff {
        old_path,
        new_path,
        hunks,
    })
}

fn header_path(rest: &str) -> String {
    // Drop an optional tab-separated timestamp.
    rest.split('\t').next().unwrap_or(rest).to_string()
}

fn parse_hunk(lines: &[&str], idx: &mut usize) -> Result<DiffHunk, String> {
    let header = lines[*idx].trim_end();

    // @@ -old_start,old_count +new_start,new_count @@
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 4 || parts[0] != "@@" {
        return Err(format!("Invalid hunk header: {}", header));
    }

    let (old_start, old_count) = parse_range(parts[1].trim_start_matches('-'))?;
    let (new_start, new_count) = parse_range(parts[2].trim_start_matches('+'))?;

    *idx += 1;
    let mut diff_lines = Vec::new();
    let (mut seen_old, mut seen_new) = (0, 0);

    while *idx < lines.len() && (seen_old < old_count || seen_new < new_count) {
        let line = lines[*idx];
        if let Some(rest) = line.strip_prefix('+') {
            diff_lines.push(DiffLine::Add(rest.to_string()));
            seen_new += 1;
        } else if let Some(rest) = line.strip_prefix('-') {
            diff_lines.push(DiffLine::Remove(rest.to_string()));
            seen_old += 1;
        } else if let Some(rest) = line.strip_prefix(' ') {
            diff_lines.push(DiffLine::Context(rest.to_string()));
            seen_old += 1;
            seen_new += 1;
        } else if line == "\n" {
            // Some tools strip the space from empty context lines.
            diff_lines.push(DiffLine::Context("\n".to_string()));
            seen_old += 1;
            seen_new += 1;
        } else if !line.starts_with('\\') {
            return Err(format!("Unexpected line in hunk: {}", line.trim_end()));
        }
        *idx += 1;
    }

    if seen_old != old_count || seen_new != new_count {
        return Err(format!("Truncated hunk: {}", header));
    }

    Ok(DiffHunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: diff_lines,
    })
}

/// Parse a range like "10,5" or "10" into (start, count)
fn parse_range(s: &str) -> Result<(usize, usize), String> {
    if let Some((start, count)) = s.split_once(',') {
        let start: usize = start.parse().map_err(|_| format!("Invalid start: {}", s))?;
        let count: usize = count.parse().map_err(|_| format!("Invalid count: {}", s))?;
        Ok((start, count))
    } else {
        let start: usize = s.parse().map_err(|_| format!("Invalid line number: {}", s))?;
        Ok((start, 1))
    }
}

/// Apply a unified diff to the original content.
///
/// Context and removed lines must match the original exactly; the result
/// is newline-normalized like the diff itself.
pub fn apply_unified_diff(original: &str, diff: &UnifiedDiff) -> Result<String, String> {
    let normalized = normalize(original);
    let source: Vec<&str> = normalized.split_inclusive('\n').collect();
    let mut out = String::with_capacity(normalized.len());
    let mut cursor = 0;

    for hunk in &diff.hunks {
        // An empty old range names the line after which to insert.
        let start = if hunk.old_count == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        if start < cursor || start > source.len() {
            return Err(format!("Hunk at line {} is out of order or range", hunk.old_start));
        }
        for line in &source[cursor..start] {
            out.push_str(line);
        }
        cursor = start;

        for line in &hunk.lines {
            match line {
                DiffLine::Context(expected) | DiffLine::Remove(expected) => {
                    let actual = source.get(cursor).copied();
                    if actual != Some(expected.as_str()) {
                        return Err(format!(
                            "Hunk does not match original at line {}",
                            cursor + 1
                        ));
                    }
                    if matches!(line, DiffLine::Context(_)) {
                        out.push_str(expected);
                    }
                    cursor += 1;
                }
                DiffLine::Add(added) => out.push_str(added),
            }
        }
    }

    for line in &source[cursor..] {
        out.push_str(line);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn generator() -> DiffGenerator {
        DiffGenerator::default()
    }

    #[test]
    fn test_identical_inputs_produce_empty_diff() {
        let text = "a\nb\nc\n";
        assert_eq!(generator().diff(text, text, "a/x", "b/x"), "");
        assert!(is_identical(text, text));
    }

    #[test]
    fn test_missing_trailing_newline_does_not_desync() {
        assert_eq!(generator().diff("a\nb", "a\nb\n", "a/x", "b/x"), "");
        let stats = generator().stats("a\nb", "a\nb\nc");
        assert_eq!(stats.additions, 1);
        assert_eq!(stats.unchanged, 2);
    }

    #[test]
    fn test_headers_and_hunk_format() {
        let diff = generator().diff("one\ntwo\nthree\n", "one\n2\nthree\n", "a/f.py", "b/f.py");
        let lines: Vec<&str> = diff.lines().collect();
        assert_eq!(lines[0], "--- a/f.py");
        assert_eq!(lines[1], "+++ b/f.py");
        assert_eq!(lines[2], "@@ -1,3 +1,3 @@");
        assert!(lines.contains(&"-two"));
        assert!(lines.contains(&"+2"));
    }

    #[test]
    fn test_context_lines_are_configurable() {
        let original: String = (1..=20).map(|i| format!("line {}\n", i)).collect();
        let modified = original.replace("line 10\n", "line ten\n");
        let narrow = DiffGenerator::new(1).diff(&original, &modified, "a", "b");
        assert!(narrow.contains("@@ -9,3 +9,3 @@"));
        let wide = DiffGenerator::new(3).diff(&original, &modified, "a", "b");
        assert!(wide.contains("@@ -7,7 +7,7 @@"));
    }

    #[test]
    fn test_stats_insert_only() {
        let stats = generator().stats("", "x\ny\n");
        assert_eq!(
            stats,
            DiffStats {
                additions: 2,
                deletions: 0,
                modifications: 0,
                unchanged: 0
            }
        );
    }

    #[test]
    fn test_stats_replace_counts_longer_side() {
        let stats = generator().stats("keep\na\nb\nc\n", "keep\n1\n2\n3\n4\n5\n");
        assert_eq!(stats.modifications, 5);
        assert_eq!(stats.unchanged, 1);
        assert_eq!(stats.additions, 0);
        assert_eq!(stats.deletions, 0);
    }

    #[test]
    fn test_stats_pure_delete() {
        let stats = generator().stats("a\nb\nc\n", "a\nc\n");
        assert_eq!(stats.deletions, 1);
        assert_eq!(stats.unchanged, 2);
        assert_eq!(stats.total_changes(), 1);
    }

    #[test]
    fn test_truncate_keeps_head_and_tail() {
        let diff: String = (1..=100).map(|i| format!("l{}\n", i)).collect();
        let out = truncate_diff(&diff, 10);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 11);
        assert_eq!(lines[0], "l1");
        assert_eq!(lines[4], "l5");
        assert_eq!(lines[5], "... (90 lines omitted) ...");
        assert_eq!(lines[10], "l100");
    }

    #[test]
    fn test_truncate_short_diff_is_untouched() {
        assert_eq!(truncate_diff("a\nb\n", 10), "a\nb\n");
    }

    #[test]
    fn test_parse_simple_diff() {
        let diff = "--- a/src/example.py\n+++ b/src/example.py\n@@ -1,3 +1,4 @@\n def hello():\n-    print(\"old\")\n+    print(\"new\")\n+    print(\"extra\")\n     return True\n";
        let parsed = parse_unified_diff(diff).unwrap();
        assert_eq!(parsed.old_path, "a/src/example.py");
        assert_eq!(parsed.hunks.len(), 1);
        assert_eq!(parsed.stats(), (2, 1));
    }

    #[test]
    fn test_apply_rejects_mismatched_context() {
        let diff = generator().diff("a\nb\n", "a\nc\n", "a/x", "b/x");
        let parsed = parse_unified_diff(&diff).unwrap();
        assert!(apply_unified_diff("z\nb\n", &parsed).is_err());
    }

    #[test]
    fn test_apply_into_empty_original() {
        let diff = generator().diff("", "x\ny\n", "a/x", "b/x");
        let parsed = parse_unified_diff(&diff).unwrap();
        assert_eq!(apply_unified_diff("", &parsed).unwrap(), "x\ny\n");
    }

    fn text_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-d ]{0,3}", 0..12)
            .prop_map(|lines| lines.into_iter().map(|l| format!("{}\n", l)).collect())
    }

    proptest! {
        #[test]
        fn prop_identity_diff_is_empty(text in text_strategy()) {
            prop_assert_eq!(generator().diff(&text, &text, "a", "b"), "");
            prop_assert!(is_identical(&text, &text));
        }

        #[test]
        fn prop_diff_round_trips(a in text_strategy(), b in text_strategy()) {
            prop_assume!(a != b);
            let diff = generator().diff(&a, &b, "a/f", "b/f");
            let parsed = parse_unified_diff(&diff).unwrap();
            prop_assert_eq!(apply_unified_diff(&a, &parsed).unwrap(), b);
        }

        #[test]
        fn prop_stats_cover_both_sides(a in text_strategy(), b in text_strategy()) {
            let stats = generator().stats(&a, &b);
            let old_lines = a.lines().count();
            let new_lines = b.lines().count();
            prop_assert!(stats.unchanged + stats.deletions + stats.modifications >= old_lines);
            prop_assert!(stats.unchanged + stats.additions + stats.modifications >= new_lines);
        }
    }
}
