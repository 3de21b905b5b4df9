use super::client::ChatPrompt;
use prbot_core::truncate::truncate_with_marker;

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED BUILDING BLOCKS
// ═══════════════════════════════════════════════════════════════════════════════

const ANSWER_RULES: &str = r#"Rules:
- Ground every statement in the code and diff provided. Say so when context is missing.
- Cite line numbers as `L12` or `L12-L20` when referring to code.
- Be concise. Prefer short paragraphs and bullet lists.
- Respond in GitHub-flavored Markdown."#;

// ═══════════════════════════════════════════════════════════════════════════════
// PROMPTS
// ═══════════════════════════════════════════════════════════════════════════════

pub const ASK_SYSTEM: &str = r#"You are prbot, a senior engineer answering questions about a pull request.

Answer the reviewer's question using the pull request description, the changed files and any code excerpts provided."#;

pub const EXPLAIN_SYSTEM: &str = r#"You are prbot, a senior engineer explaining code in a pull request.

Explain what the focused code does, how it fits into the surrounding code, and anything surprising about it. If the reviewer asked a specific question, answer it first."#;

pub const REVIEW_SYSTEM: &str = r#"You are prbot, a careful code reviewer.

Review the changes provided. Report concrete problems (bugs, missing error handling, unsafe assumptions, confusing code) ordered by severity, each with the line it applies to. If nothing is wrong, say so briefly. Do not restate the diff."#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptTask {
    Ask,
    Explain,
    Review,
}

impl PromptTask {
    fn system(&self) -> String {
        let base = match self {
            PromptTask::Ask => ASK_SYSTEM,
            PromptTask::Explain => EXPLAIN_SYSTEM,
            PromptTask::Review => REVIEW_SYSTEM,
        };
        format!("{}\n\n{}", base, ANSWER_RULES)
    }
}

/// Scoped code for one file, rendered two ways.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeExcerpt {
    pub path: String,
    /// Human label of what `full` covers, e.g. `lines 10-40`.
    pub label: String,
    /// Scoped code with context.
    pub full: String,
    /// Just the focused lines, for the compact prompt.
    pub compact: String,
    /// Lines the question is about, if narrower than the excerpt.
    pub focus: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PromptInput<'a> {
    pub question: Option<&'a str>,
    pub pr_title: &'a str,
    pub pr_body: &'a str,
    pub excerpts: &'a [CodeExcerpt],
    /// Unified diff text (several files) for reviews and questions.
    pub diff: Option<&'a str>,
    /// One-line summary of the previous turn in this thread.
    pub history: Option<&'a str>,
}

const MAX_PR_BODY_CHARS: usize = 2_000;
const MAX_TITLE_CHARS: usize = 200;
const MAX_HISTORY_CHARS: usize = 300;
/// Room left for the `... [N chars omitted]` marker when text must fit a hard budget.
const MARKER_RESERVE: usize = 40;

/// Share of the prompt budget the question may take: 1/4 of a full prompt,
/// 1/8 of a compact one.
fn question_budget(max_chars: usize, compact: bool) -> usize {
    if compact {
        max_chars / 8
    } else {
        max_chars / 4
    }
}

/// Like `truncate_with_marker`, but the marker counts against `budget`.
fn fit(text: &str, budget: usize) -> String {
    if text.chars().count() <= budget {
        return text.to_string();
    }
    if budget < MARKER_RESERVE {
        return String::new();
    }
    truncate_with_marker(text, budget - MARKER_RESERVE)
}

fn header_section(task: PromptTask, input: &PromptInput<'_>, max_chars: usize, compact: bool) -> String {
    let mut out = format!(
        "Pull request: {}\n",
        truncate_with_marker(input.pr_title.trim(), MAX_TITLE_CHARS)
    );
    if !compact && !input.pr_body.trim().is_empty() {
        out.push_str("\nDescription:\n");
        out.push_str(&truncate_with_marker(input.pr_body.trim(), MAX_PR_BODY_CHARS));
        out.push('\n');
    }
    if let (false, Some(history)) = (compact, input.history) {
        out.push_str(&format!(
            "\nPrevious request in this thread: {}\n",
            truncate_with_marker(history, MAX_HISTORY_CHARS)
        ));
    }
    let question = input.question.map(str::trim).filter(|q| !q.is_empty());
    match (task, question) {
        (_, Some(q)) => out.push_str(&format!(
            "\nQuestion:\n{}\n",
            fit(q, question_budget(max_chars, compact))
        )),
        (PromptTask::Explain, None) => out.push_str("\nQuestion:\nExplain the focused code.\n"),
        (PromptTask::Review, None) => out.push_str("\nQuestion:\nReview these changes.\n"),
        (PromptTask::Ask, None) => {}
    }
    out
}

fn context_section(input: &PromptInput<'_>, compact: bool) -> String {
    let mut out = String::new();
    for excerpt in input.excerpts {
        let code = if compact { &excerpt.compact } else { &excerpt.full };
        out.push_str(&format!("\nFile `{}` ({}):\n", excerpt.path, excerpt.label));
        if let Some(focus) = &excerpt.focus {
            out.push_str(&format!("Focus on {}.\n", focus));
        }
        if let (false, Some(note)) = (compact, &excerpt.note) {
            out.push_str(&format!("Note: {}\n", note));
        }
        out.push_str("```\n");
        out.push_str(code);
        if !code.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("```\n");
    }
    if let Some(diff) = input.diff.filter(|d| !d.trim().is_empty()) {
        out.push_str("\nChanges:\n```diff\n");
        out.push_str(diff.trim_end());
        out.push_str("\n```\n");
    }
    out
}

fn assemble(task: PromptTask, input: &PromptInput<'_>, max_chars: usize, compact: bool) -> ChatPrompt {
    let system = task.system();
    let user_budget = max_chars.saturating_sub(system.chars().count());
    let header = fit(&header_section(task, input, max_chars, compact), user_budget);
    let context = context_section(input, compact);

    let context_budget = user_budget.saturating_sub(header.chars().count());
    let user = format!("{}{}", header, fit(&context, context_budget));

    ChatPrompt { system, user }
}

/// Full prompt: description, history, scoped code with context.
pub fn build_prompt(task: PromptTask, input: &PromptInput<'_>, max_chars: usize) -> ChatPrompt {
    assemble(task, input, max_chars, false)
}

/// Smaller prompt used after a timeout: focused lines only, no description
/// or history.
pub fn build_compact_prompt(task: PromptTask, input: &PromptInput<'_>, max_chars: usize) -> ChatPrompt {
    assemble(task, input, max_chars, true)
}

pub fn help_text(trigger: &str) -> String {
    format!(
        r#"**prbot commands**

| Command | What it does |
|---|---|
| `{t} ask <question>` | Answer a question about this pull request |
| `{t} explain [path[:start[-end]]] [question]` | Explain a file, a line range, or the line this review comment is on |
| `{t} review [path]` | Review the changes in one file or the whole pull request |
| `{t} help` | Show this message |

On a review comment, `{t} explain` with no path explains the commented lines."#,
        t = trigger
    )
}
