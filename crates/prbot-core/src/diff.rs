//! Unified diff hunk header parsing
//!
//! Only the `@@ -a[,b] +c[,d] @@` headers are interpreted; hunk bodies are
//! ignored. Headers that don't parse are skipped.

use crate::scope::LineRange;

/// Which image of the diff line numbers refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffSide {
    /// Pre-image (`-a,b`)
    Old,
    /// Post-image (`+c,d`)
    #[default]
    New,
}

impl DiffSide {
    /// Map GitHub's review-comment side names (`LEFT`/`RIGHT`).
    pub fn from_github(side: &str) -> Self {
        if side.eq_ignore_ascii_case("LEFT") {
            DiffSide::Old
        } else {
            DiffSide::New
        }
    }
}

/// A parsed hunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HunkHeader {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
}

impl HunkHeader {
    /// Line range touched on one side. A zero-count side collapses to the
    /// single line the hunk is anchored at.
    pub fn range(&self, side: DiffSide) -> LineRange {
        let (start, count) = match side {
            DiffSide::Old => (self.old_start, self.old_count),
            DiffSide::New => (self.new_start, self.new_count),
        };
        let start = start.max(1);
        let end = start + count.saturating_sub(1);
        LineRange::new(start, end)
    }
}

/// Parse a header line like `@@ -10,3 +20,4 @@ fn context()`.
pub fn parse_hunk_header(line: &str) -> Option<HunkHeader> {
    let rest = line.strip_prefix("@@ ")?;
    let mut parts = rest.split_whitespace();
    let old = parts.next()?.strip_prefix('-')?;
    let new = parts.next()?.strip_prefix('+')?;
    if parts.next() != Some("@@") {
        return None;
    }

    let (old_start, old_count) = parse_range(old)?;
    let (new_start, new_count) = parse_range(new)?;
    Some(HunkHeader {
        old_start,
        old_count,
        new_start,
        new_count,
    })
}

/// Parse a range like "10,5" or "10" into (start, count)
fn parse_range(s: &str) -> Option<(usize, usize)> {
    match s.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((s.parse().ok()?, 1)),
    }
}

/// All hunk headers in a patch, in order of appearance.
pub fn parse_hunk_headers(patch: &str) -> Vec<HunkHeader> {
    patch
        .lines()
        .filter(|line| line.starts_with("@@ "))
        .filter_map(parse_hunk_header)
        .collect()
}

/// Changed line ranges of a patch on the requested side.
pub fn parse_patch_line_ranges(patch: &str, side: DiffSide) -> Vec<LineRange> {
    parse_hunk_headers(patch)
        .iter()
        .map(|header| header.range(side))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_side_range() {
        let ranges = parse_patch_line_ranges("@@ -10,3 +20,4 @@\n-oldA\n+newA", DiffSide::New);
        assert_eq!(ranges, vec![LineRange::new(20, 23)]);
    }

    #[test]
    fn test_old_side_range() {
        let ranges = parse_patch_line_ranges("@@ -10,3 +20,4 @@\n-oldA\n+newA", DiffSide::Old);
        assert_eq!(ranges, vec![LineRange::new(10, 12)]);
    }

    #[test]
    fn test_omitted_counts_default_to_one() {
        let header = parse_hunk_header("@@ -7 +9 @@").unwrap();
        assert_eq!(header.old_count, 1);
        assert_eq!(header.new_count, 1);
        assert_eq!(header.range(DiffSide::New), LineRange::new(9, 9));
    }

    #[test]
    fn test_zero_count_collapses_to_anchor_line() {
        let ranges = parse_patch_line_ranges("@@ -5,2 +0,0 @@\n-a\n-b", DiffSide::New);
        assert_eq!(ranges, vec![LineRange::new(1, 1)]);
    }

    #[test]
    fn test_multiple_hunks_with_section_headings() {
        let patch = "@@ -1,3 +1,4 @@ fn main() {\n+x\n@@ -40,2 +41,6 @@ impl Foo {\n+y";
        let ranges = parse_patch_line_ranges(patch, DiffSide::New);
        assert_eq!(ranges, vec![LineRange::new(1, 4), LineRange::new(41, 46)]);
    }

    #[test]
    fn test_malformed_headers_are_skipped() {
        let patch = "@@ garbage @@\n@@ -a,b +c,d @@\n@@ -3,1 +3,2 @@";
        let ranges = parse_patch_line_ranges(patch, DiffSide::New);
        assert_eq!(ranges, vec![LineRange::new(3, 4)]);
    }

    #[test]
    fn test_github_side_names() {
        assert_eq!(DiffSide::from_github("LEFT"), DiffSide::Old);
        assert_eq!(DiffSide::from_github("RIGHT"), DiffSide::New);
        assert_eq!(DiffSide::from_github(""), DiffSide::New);
    }
}
