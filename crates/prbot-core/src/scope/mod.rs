//! Code-scope extraction
//!
//! Produces bounded slices of a source file around a 1-indexed line range:
//! the exact target, the target plus surrounding context, or a heuristically
//! detected enclosing block. None of these operations fail. When a precise
//! answer isn't possible they return a best-effort [`ScopeResult`] with
//! `fallback` set and a `note` explaining why.

mod enclosing;
mod large_file;

pub use enclosing::{extract_enclosing_block, EnclosingOptions, MIN_ENCLOSING_SPAN};
pub use large_file::{
    merge_windows, scope_large_file, LargeFileOptions, ScopeStrategy, ScopedFile,
};

/// Default number of context lines on each side of a target.
pub const DEFAULT_WINDOW_SIZE: usize = 15;

/// Inclusive, 1-indexed line range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn single(line: usize) -> Self {
        Self::new(line, line)
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Check the range against a file of `line_count` lines.
    ///
    /// Returns a human-readable reason when the range can't be used.
    pub fn validate(&self, line_count: usize) -> Result<(), String> {
        if self.start < 1 {
            return Err(format!("start line {} is before line 1", self.start));
        }
        if self.start > self.end {
            return Err(format!(
                "start line {} is after end line {}",
                self.start, self.end
            ));
        }
        if self.end > line_count {
            return Err(format!(
                "end line {} is past the end of the file ({} lines)",
                self.end, line_count
            ));
        }
        Ok(())
    }

    /// Grow by `by` lines on each side, clamped to `[1, line_count]`.
    pub fn expand(&self, by: usize, line_count: usize) -> Self {
        let start = self.start.saturating_sub(by).max(1);
        let end = self.end.saturating_add(by).min(line_count.max(1));
        Self::new(start, end.max(start))
    }
}

impl std::fmt::Display for LineRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// An immutable, line-split view of a file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceText {
    lines: Vec<String>,
}

impl SourceText {
    pub fn new(text: &str) -> Self {
        Self {
            lines: text.lines().map(str::to_string).collect(),
        }
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// 1-indexed line lookup.
    pub fn line(&self, n: usize) -> Option<&str> {
        n.checked_sub(1)
            .and_then(|idx| self.lines.get(idx))
            .map(String::as_str)
    }

    /// Copy out a range. The range must already be validated.
    pub fn slice(&self, range: LineRange) -> Vec<String> {
        let start = range.start.saturating_sub(1).min(self.lines.len());
        let end = range.end.min(self.lines.len()).max(start);
        self.lines[start..end].to_vec()
    }

    pub fn full_range(&self) -> LineRange {
        LineRange::new(1, self.lines.len().max(1))
    }
}

/// Where a result sits in its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeBounds {
    pub start: usize,
    pub end: usize,
    pub max_lines: usize,
}

/// Unit returned by every extraction operation.
///
/// `fallback` is informational: the caller got something usable, just not
/// what was asked for precisely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeResult {
    pub target: Vec<String>,
    pub surrounding: Option<Vec<String>>,
    /// Position of `surrounding` in the file, when present.
    pub surrounding_range: Option<LineRange>,
    pub bounds: ScopeBounds,
    pub fallback: bool,
    pub note: Option<String>,
}

impl ScopeResult {
    pub fn target_range(&self) -> LineRange {
        LineRange::new(self.bounds.start, self.bounds.end)
    }
}

/// Exact target slice plus `window_size` lines of context on each side.
///
/// An invalid range yields the entire file as the target so a bad anchor still
/// produces a usable answer.
pub fn extract_window(text: &SourceText, start: usize, end: usize, window_size: usize) -> ScopeResult {
    let max_lines = text.line_count();
    let range = LineRange::new(start, end);

    if let Err(reason) = range.validate(max_lines) {
        tracing::debug!(%reason, "invalid range, returning the whole file");
        return ScopeResult {
            target: text.lines().to_vec(),
            surrounding: None,
            surrounding_range: None,
            bounds: ScopeBounds {
                start: 1,
                end: max_lines,
                max_lines,
            },
            fallback: true,
            note: Some(format!("Invalid line range {}: {}. Using the whole file.", range, reason)),
        };
    }

    let window = range.expand(window_size, max_lines);
    ScopeResult {
        target: text.slice(range),
        surrounding: Some(text.slice(window)),
        surrounding_range: Some(window),
        bounds: ScopeBounds {
            start,
            end,
            max_lines,
        },
        fallback: false,
        note: None,
    }
}

/// Exact target slice only. An invalid range yields an empty target.
pub fn extract_target_block(text: &SourceText, start: usize, end: usize) -> ScopeResult {
    let max_lines = text.line_count();
    let range = LineRange::new(start, end);

    match range.validate(max_lines) {
        Ok(()) => ScopeResult {
            target: text.slice(range),
            surrounding: None,
            surrounding_range: None,
            bounds: ScopeBounds {
                start,
                end,
                max_lines,
            },
            fallback: false,
            note: None,
        },
        Err(reason) => ScopeResult {
            target: Vec::new(),
            surrounding: None,
            surrounding_range: None,
            bounds: ScopeBounds {
                start,
                end,
                max_lines,
            },
            fallback: true,
            note: Some(format!("Invalid line range {}: {}", range, reason)),
        },
    }
}

/// Render lines with right-aligned 1-indexed line numbers, starting at `first_line`.
pub fn render_numbered(lines: &[String], first_line: usize) -> String {
    let last = first_line + lines.len().saturating_sub(1);
    let width = last.to_string().len();
    let mut out = String::new();
    for (offset, line) in lines.iter().enumerate() {
        out.push_str(&format!("{:>width$} | {}\n", first_line + offset, line, width = width));
    }
    out
}
