//! Heuristic enclosing-block detection.
//!
//! This is a brace/keyword scan, not a parser. It misfires on braces inside
//! strings, template literals and some multi-line signatures; every such case
//! degrades to a plain context window with `fallback` set.

use super::{extract_window, LineRange, ScopeBounds, ScopeResult, SourceText, DEFAULT_WINDOW_SIZE};
use regex::Regex;
use std::sync::OnceLock;

/// A detected block must span at least this many lines past its first line
/// and must reach the anchor. Shorter matches are treated as misfires.
pub const MIN_ENCLOSING_SPAN: usize = 2;

/// Start line used when nothing better is found: this many lines above the anchor.
const START_FALLBACK_OFFSET: usize = 10;

/// End line used when neither brace balance nor a terminator is found.
const END_FALLBACK_OFFSET: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnclosingOptions {
    /// How far above the anchor the start search may look.
    pub max_search_lines: usize,
    /// Context lines used when the block is rejected.
    pub window_size: usize,
}

impl Default for EnclosingOptions {
    fn default() -> Self {
        Self {
            max_search_lines: 100,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartKind {
    Declaration(&'static str),
    ArrowParams,
    UnmatchedBrace,
    Offset,
}

/// Declaration patterns, checked in priority order on each line.
fn declaration_patterns() -> &'static [(&'static str, Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let compile = |p: &str| Regex::new(p).unwrap_or_else(|e| panic!("bad pattern {p}: {e}"));
        vec![
            (
                "function",
                compile(
                    r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*[A-Za-z_$][\w$]*\s*\(",
                ),
            ),
            (
                "function",
                compile(r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s+\w+"),
            ),
            ("function", compile(r"^\s*func\s+(?:\([^)]*\)\s*)?\w+\s*\(")),
            ("function", compile(r"^\s*(?:async\s+)?def\s+\w+\s*\(")),
            (
                "class",
                compile(r"^\s*(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+[A-Za-z_$][\w$]*"),
            ),
            (
                "assigned function",
                compile(
                    r"^\s*(?:export\s+)?(?:const|let|var)\s+[A-Za-z_$][\w$]*\s*(?::[^=]+)?=\s*(?:async\s+)?(?:function\b|\([^)]*\)\s*(?::[^=]+)?=>|[A-Za-z_$][\w$]*\s*=>)",
                ),
            ),
            (
                "method arrow",
                compile(r"^\s*[A-Za-z_$][\w$]*\s*:\s*(?:async\s+)?(?:\([^)]*\)|[A-Za-z_$][\w$]*)\s*=>"),
            ),
        ]
    })
}

/// `=>` at line start or a bare `) =>`.
fn arrow_tail() -> &'static Regex {
    static ARROW: OnceLock<Regex> = OnceLock::new();
    ARROW.get_or_init(|| Regex::new(r"^\s*=>|\)\s*=>").unwrap_or_else(|e| panic!("{e}")))
}

/// Locate the smallest function/class/arrow-function block enclosing `anchor`.
///
/// Falls back to a `±window_size` window (with `fallback = true`) when the
/// discovered block doesn't actually enclose the anchor.
pub fn extract_enclosing_block(
    text: &SourceText,
    anchor: usize,
    options: EnclosingOptions,
) -> ScopeResult {
    let max_lines = text.line_count();
    if LineRange::single(anchor).validate(max_lines).is_err() {
        return extract_window(text, anchor, anchor, options.window_size);
    }

    let (start, start_kind) = find_block_start(text, anchor, options.max_search_lines);
    let (end, balanced) = find_block_end(text, start, anchor);

    let accepted = end >= anchor && end - start >= MIN_ENCLOSING_SPAN;
    if !accepted {
        tracing::debug!(anchor, start, end, "enclosing block rejected");
        let mut window = extract_window(text, anchor, anchor, options.window_size);
        window.fallback = true;
        window.note = Some(format!(
            "No enclosing block found around line {}; showing {} lines of context on each side.",
            anchor, options.window_size
        ));
        return window;
    }

    let range = LineRange::new(start, end);
    let mut notes = Vec::new();
    if start_kind == StartKind::Offset {
        notes.push(format!(
            "no declaration found above line {}; block start is approximate",
            anchor
        ));
    }
    if !balanced {
        notes.push(format!("braces never balanced; block end at line {} is approximate", end));
    }

    tracing::debug!(anchor, start, end, ?start_kind, balanced, "enclosing block found");
    ScopeResult {
        target: text.slice(range),
        surrounding: None,
        surrounding_range: None,
        bounds: ScopeBounds {
            start,
            end,
            max_lines,
        },
        fallback: !notes.is_empty(),
        note: if notes.is_empty() {
            None
        } else {
            Some(notes.join("; "))
        },
    }
}

fn find_block_start(text: &SourceText, anchor: usize, max_search_lines: usize) -> (usize, StartKind) {
    let floor = anchor.saturating_sub(max_search_lines).max(1);

    for line_no in (floor..=anchor).rev() {
        let Some(line) = text.line(line_no) else {
            continue;
        };
        if let Some((kind, _)) = declaration_patterns()
            .iter()
            .find(|(_, pattern)| pattern.is_match(line))
        {
            return (line_no, StartKind::Declaration(*kind));
        }
        if let Some(tail) = arrow_tail().find(line) {
            if let Some(open_line) = find_paren_open(text, line_no, tail.end(), floor) {
                return (open_line, StartKind::ArrowParams);
            }
        }
    }

    for line_no in (floor..=anchor).rev() {
        if let Some(line) = text.line(line_no) {
            if line.matches('{').count() > line.matches('}').count() {
                return (line_no, StartKind::UnmatchedBrace);
            }
        }
    }

    (
        anchor.saturating_sub(START_FALLBACK_OFFSET).max(1),
        StartKind::Offset,
    )
}

/// Walk backwards from an arrow tail to the line holding the `(` that opens
/// its parameter list.
fn find_paren_open(text: &SourceText, tail_line: usize, tail_end: usize, floor: usize) -> Option<usize> {
    let mut depth: i64 = 0;
    let mut seen_close = false;

    for line_no in (floor..=tail_line).rev() {
        let line = text.line(line_no)?;
        let segment = if line_no == tail_line {
            &line[..tail_end.min(line.len())]
        } else {
            line
        };
        for ch in segment.chars().rev() {
            match ch {
                ')' => {
                    depth += 1;
                    seen_close = true;
                }
                '(' => {
                    depth -= 1;
                    if seen_close && depth == 0 {
                        return Some(line_no);
                    }
                }
                _ => {}
            }
        }
    }
    None
}

/// Returns the end line and whether it came from brace balance.
fn find_block_end(text: &SourceText, start: usize, anchor: usize) -> (usize, bool) {
    let max_lines = text.line_count();
    let mut depth: i64 = 0;
    let mut seen_open = false;

    for line_no in start..=max_lines {
        let Some(line) = text.line(line_no) else {
            break;
        };
        for ch in line.chars() {
            match ch {
                '{' => {
                    depth += 1;
                    seen_open = true;
                }
                '}' if seen_open => depth -= 1,
                _ => {}
            }
        }
        if seen_open && depth <= 0 {
            return (line_no, true);
        }
    }

    for line_no in anchor..=max_lines {
        if let Some(line) = text.line(line_no) {
            if is_block_terminator(line.trim()) {
                return (line_no, false);
            }
        }
    }

    ((anchor + END_FALLBACK_OFFSET).min(max_lines), false)
}

fn is_block_terminator(trimmed: &str) -> bool {
    if trimmed == "}" || trimmed == "};" {
        return true;
    }
    ["return", "throw", "break", "continue"].iter().any(|kw| {
        trimmed
            .strip_prefix(kw)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with([' ', ';', '(']))
    })
}
