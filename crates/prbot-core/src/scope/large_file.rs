//! Reduction of very large files to a few bounded windows.
//!
//! Files at or under the line ceiling pass through whole. Above it, the file is
//! cut down to the enclosing block of an anchor, to merged windows around the
//! changed ranges, or to the top of the file when there is nothing to anchor on.

use super::{extract_enclosing_block, EnclosingOptions, LineRange, SourceText};
use crate::diff::{parse_patch_line_ranges, DiffSide};

pub const DEFAULT_MAX_FILE_LINES: usize = 10_000;
pub const DEFAULT_SLIDING_WINDOW: usize = 40;
pub const DEFAULT_MAX_WINDOWS: usize = 3;

/// How the scoped content was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeStrategy {
    EnclosingBlock,
    SlidingWindow,
    TopWindow,
    FullFile,
}

impl ScopeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeStrategy::EnclosingBlock => "enclosing_block",
            ScopeStrategy::SlidingWindow => "sliding_window",
            ScopeStrategy::TopWindow => "top_window",
            ScopeStrategy::FullFile => "full_file",
        }
    }
}

impl std::fmt::Display for ScopeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct LargeFileOptions {
    /// Files with more lines than this get scoped.
    pub max_file_lines: usize,
    /// Lines added on each side of a changed range.
    pub window_size: usize,
    /// Windows kept after merging.
    pub max_windows: usize,
    pub anchor_line: Option<usize>,
    pub prefer_enclosing_block: bool,
    /// Changed ranges supplied directly. Takes precedence over `patch`.
    pub changed_ranges: Vec<LineRange>,
    /// Unified diff for the file, used when `changed_ranges` is empty.
    pub patch: Option<String>,
    pub diff_side: DiffSide,
    pub enclosing: EnclosingOptions,
}

impl Default for LargeFileOptions {
    fn default() -> Self {
        Self {
            max_file_lines: DEFAULT_MAX_FILE_LINES,
            window_size: DEFAULT_SLIDING_WINDOW,
            max_windows: DEFAULT_MAX_WINDOWS,
            anchor_line: None,
            prefer_enclosing_block: false,
            changed_ranges: Vec::new(),
            patch: None,
            diff_side: DiffSide::New,
            enclosing: EnclosingOptions::default(),
        }
    }
}

/// Result of scoping a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedFile {
    pub content: String,
    pub strategy: ScopeStrategy,
    /// First file line covered by `content`.
    pub start_line: usize,
    /// Last file line covered by `content`.
    pub end_line: usize,
    pub windows: Vec<LineRange>,
    pub total_lines: usize,
    pub fallback: bool,
    pub note: Option<String>,
}

impl ScopedFile {
    /// Translate an absolute file range into coordinates relative to `content`.
    ///
    /// Only defined when `content` is one contiguous, unlabeled window that
    /// fully contains `range`.
    pub fn relative_range(&self, range: LineRange) -> Option<LineRange> {
        if self.windows.len() != 1 || range.start < self.start_line || range.end > self.end_line {
            return None;
        }
        let offset = self.start_line - 1;
        Some(LineRange::new(range.start - offset, range.end - offset))
    }
}

/// Sort and merge windows whose ranges overlap or touch.
pub fn merge_windows(mut windows: Vec<LineRange>) -> Vec<LineRange> {
    windows.sort_unstable();
    let mut merged: Vec<LineRange> = Vec::with_capacity(windows.len());
    for window in windows {
        if let Some(last) = merged.last_mut() {
            if window.start <= last.end + 1 {
                last.end = last.end.max(window.end);
                continue;
            }
        }
        merged.push(window);
    }
    merged
}

/// Reduce `text` to bounded content when it exceeds the line ceiling.
pub fn scope_large_file(text: &SourceText, options: &LargeFileOptions) -> ScopedFile {
    let total = text.line_count();

    if total <= options.max_file_lines {
        return ScopedFile {
            content: text.lines().join("\n"),
            strategy: ScopeStrategy::FullFile,
            start_line: 1,
            end_line: total,
            windows: vec![text.full_range()],
            total_lines: total,
            fallback: false,
            note: None,
        };
    }

    let valid_anchor = options
        .anchor_line
        .filter(|line| LineRange::single(*line).validate(total).is_ok());

    if let (Some(anchor), true) = (valid_anchor, options.prefer_enclosing_block) {
        let result = extract_enclosing_block(text, anchor, options.enclosing);
        let target_range = result.target_range();
        let (lines, range) = match (result.surrounding, result.surrounding_range) {
            (Some(lines), Some(range)) => (lines, range),
            _ => (result.target, target_range),
        };
        tracing::debug!(anchor, %range, fallback = result.fallback, "scoped to enclosing block");
        return ScopedFile {
            content: lines.join("\n"),
            strategy: ScopeStrategy::EnclosingBlock,
            start_line: range.start,
            end_line: range.end,
            windows: vec![range],
            total_lines: total,
            fallback: result.fallback,
            note: result.note,
        };
    }

    let mut ranges: Vec<LineRange> = if options.changed_ranges.is_empty() {
        options
            .patch
            .as_deref()
            .map(|patch| parse_patch_line_ranges(patch, options.diff_side))
            .unwrap_or_default()
    } else {
        options.changed_ranges.clone()
    };
    ranges.retain(|r| r.start >= 1 && r.start <= total && r.start <= r.end);
    if ranges.is_empty() {
        if let Some(anchor) = valid_anchor {
            ranges.push(LineRange::single(anchor));
        }
    }

    if ranges.is_empty() {
        let window = LineRange::new(1, (options.window_size * 2).clamp(1, total));
        tracing::debug!(%window, "no changed ranges, using top window");
        return ScopedFile {
            content: text.slice(window).join("\n"),
            strategy: ScopeStrategy::TopWindow,
            start_line: window.start,
            end_line: window.end,
            windows: vec![window],
            total_lines: total,
            fallback: true,
            note: Some(format!(
                "File has {} lines and no changed ranges; showing the first {} lines.",
                total,
                window.len()
            )),
        };
    }

    let expanded = ranges
        .iter()
        .map(|r| LineRange::new(r.start, r.end.min(total)).expand(options.window_size, total))
        .collect();
    let mut windows = merge_windows(expanded);
    let dropped = windows.len().saturating_sub(options.max_windows.max(1));
    windows.truncate(options.max_windows.max(1));

    let content = if windows.len() == 1 {
        text.slice(windows[0]).join("\n")
    } else {
        windows
            .iter()
            .enumerate()
            .map(|(i, w)| {
                format!(
                    "# Window {} (lines {}-{})\n{}",
                    i + 1,
                    w.start,
                    w.end,
                    text.slice(*w).join("\n")
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    let start_line = windows.first().map(|w| w.start).unwrap_or(1);
    let end_line = windows.last().map(|w| w.end).unwrap_or(start_line);
    tracing::debug!(
        windows = windows.len(),
        dropped,
        start_line,
        end_line,
        "scoped to sliding windows"
    );

    ScopedFile {
        content,
        strategy: ScopeStrategy::SlidingWindow,
        start_line,
        end_line,
        windows,
        total_lines: total,
        fallback: false,
        note: (dropped > 0).then(|| format!("{} further changed region(s) omitted.", dropped)),
    }
}
