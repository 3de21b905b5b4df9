//! Command handling: scope the code, ask the model, publish the answer.
//!
//! One call to [`CommandHandler::handle`] is one short-lived run. Network calls
//! are awaited in sequence; the only deliberate delays are retry backoffs.

use crate::llm::client::{ChatCompletion, ChatPrompt};
use crate::llm::errors::{sanitize_error_message, ErrorCategory};
use crate::llm::prompts::{
    build_compact_prompt, build_prompt, help_text, CodeExcerpt, PromptInput, PromptTask,
};
use crate::llm::retry::{run_with_retry, Fallback, RetryPolicy};
use anyhow::Result;
use prbot_adapters::config::{ScopeSettings, Settings};
use prbot_core::comments::{find_marker_comment, upsert_marker_comment};
use prbot_core::scope::{
    extract_enclosing_block, extract_window, render_numbered, scope_large_file, EnclosingOptions,
    LargeFileOptions, ScopeStrategy, SourceText,
};
use prbot_core::state::{self, ConversationState};
use prbot_core::{
    CommentStore, CommentThread, DiffSide, DiffSource, FileContent, FilePatch, FileSource,
    LineRange, PullRequestInfo, PROGRESS_MARKER, RESULT_MARKER,
};
use thiserror::Error;

/// A parsed bot command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ask {
        question: String,
    },
    Explain {
        target: Option<FileTarget>,
        question: Option<String>,
    },
    Review {
        path: Option<String>,
    },
    Help,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ask { .. } => "ask",
            Command::Explain { .. } => "explain",
            Command::Review { .. } => "review",
            Command::Help => "help",
        }
    }

    /// Prompt kind and question for commands answered by the model. `None`
    /// for commands answered locally.
    fn prompt_task(&self) -> Option<(PromptTask, Option<&str>)> {
        match self {
            Command::Ask { question } => Some((PromptTask::Ask, Some(question.as_str()))),
            Command::Explain { question, .. } => Some((PromptTask::Explain, question.as_deref())),
            Command::Review { .. } => Some((PromptTask::Review, None)),
            Command::Help => None,
        }
    }

    /// Arguments as the user would have typed them.
    pub fn args(&self) -> String {
        match self {
            Command::Ask { question } => question.clone(),
            Command::Explain { target, question } => [
                target.as_ref().map(FileTarget::to_string),
                question.clone(),
            ]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" "),
            Command::Review { path } => path.clone().unwrap_or_default(),
            Command::Help => String::new(),
        }
    }
}

/// `path[:start[-end]]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTarget {
    pub path: String,
    pub range: Option<LineRange>,
}

impl std::fmt::Display for FileTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.range {
            Some(range) => write!(f, "{}:{}", self.path, range),
            None => f.write_str(&self.path),
        }
    }
}

/// Position of the review comment a command was posted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewAnchor {
    pub path: String,
    pub start_line: Option<usize>,
    pub line: Option<usize>,
    pub side: DiffSide,
    /// Set when the comment no longer maps onto the current diff: the commit
    /// its original line numbers belong to.
    pub outdated_commit: Option<String>,
}

impl ReviewAnchor {
    pub fn range(&self) -> Option<LineRange> {
        match (self.start_line, self.line) {
            (Some(start), Some(end)) if start <= end => Some(LineRange::new(start, end)),
            (_, Some(line)) => Some(LineRange::single(line)),
            (Some(start), None) => Some(LineRange::single(start)),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// `owner/repo`
    pub repo: String,
    pub thread: CommentThread,
    /// Root of the review-comment chain to answer in.
    pub reply_to: Option<u64>,
    pub author: String,
    pub command: Command,
    pub review_anchor: Option<ReviewAnchor>,
}

/// Failures that end a run before anything is published.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("no pull request number in the event")]
    MissingThread,
    #[error("`{command}` needs a file path (`path[:start[-end]]`) or a review comment to anchor on")]
    MissingPath { command: &'static str },
}

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub trigger: String,
    pub scope: ScopeSettings,
    pub retry: RetryPolicy,
    pub max_prompt_chars: usize,
    pub fallback_prompt_chars: usize,
}

impl HandlerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            trigger: settings.github.trigger.clone(),
            scope: settings.scope.clone(),
            retry: RetryPolicy::from(&settings.retry),
            max_prompt_chars: settings.llm.max_prompt_chars,
            fallback_prompt_chars: settings.llm.fallback_prompt_chars,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleOutcome {
    pub result_comment_id: u64,
    pub success: bool,
    pub used_fallback: bool,
    pub error_category: Option<ErrorCategory>,
    pub scope_strategy: Option<ScopeStrategy>,
}

/// What gets published as the result.
struct Answer {
    body: String,
    success: bool,
    used_fallback: bool,
    error_category: Option<ErrorCategory>,
    scope_strategy: Option<ScopeStrategy>,
}

impl Answer {
    fn notice(body: String) -> Self {
        Self {
            body,
            success: false,
            used_fallback: false,
            error_category: None,
            scope_strategy: None,
        }
    }

    fn failed(category: ErrorCategory) -> Self {
        Self {
            body: format!("**Could not answer:** {}", category.user_message()),
            success: false,
            used_fallback: false,
            error_category: Some(category),
            scope_strategy: None,
        }
    }
}

enum Scoped {
    Excerpt(CodeExcerpt, ScopeStrategy),
    Unavailable(String),
}

pub struct CommandHandler<'a> {
    comments: &'a dyn CommentStore,
    files: &'a dyn FileSource,
    diffs: &'a dyn DiffSource,
    llm: &'a dyn ChatCompletion,
    config: &'a HandlerConfig,
}

impl<'a> CommandHandler<'a> {
    pub fn new(
        comments: &'a dyn CommentStore,
        files: &'a dyn FileSource,
        diffs: &'a dyn DiffSource,
        llm: &'a dyn ChatCompletion,
        config: &'a HandlerConfig,
    ) -> Self {
        Self {
            comments,
            files,
            diffs,
            llm,
            config,
        }
    }

    pub async fn handle(&self, req: &CommandRequest) -> Result<HandleOutcome> {
        if req.thread.number == 0 {
            return Err(HandlerError::MissingThread.into());
        }
        let target = resolve_target(req)?;

        let Some((task, question)) = req.command.prompt_task() else {
            let outcome = upsert_marker_comment(
                self.comments,
                &req.thread,
                RESULT_MARKER,
                &help_text(&self.config.trigger),
                req.reply_to,
            )
            .await?;
            return Ok(HandleOutcome {
                result_comment_id: outcome.comment().id,
                success: true,
                used_fallback: false,
                error_category: None,
                scope_strategy: None,
            });
        };

        let invocation = format!("{} {}", self.config.trigger, req.command.name());
        upsert_marker_comment(
            self.comments,
            &req.thread,
            PROGRESS_MARKER,
            &format!("Working on `{}` for @{}...", invocation, req.author),
            req.reply_to,
        )
        .await?;

        let prior_token = self.prior_state_token(req).await?;
        let prior = prior_token.as_deref().and_then(state::decode);
        let answer = match self.answer(req, task, question, target.as_ref(), prior.as_ref()).await {
            Ok(answer) => answer,
            Err(err) => {
                tracing::error!(error = %sanitize_error_message(&format!("{:#}", err)), "failed to gather context");
                Answer::failed(ErrorCategory::Internal)
            }
        };

        let mut body = format!("{}\n\n{}", answer.body.trim_end(), self.footer(&answer));
        if answer.success {
            let turn = prior
                .as_ref()
                .and_then(|s| s.get_u64("turnCount"))
                .unwrap_or(0)
                + 1;
            let updates = ConversationState::new()
                .with("lastCommand", req.command.name())
                .with("lastArgs", prbot_core::truncate::truncate_ellipsis(&req.command.args(), 200))
                .with("lastUser", req.author.as_str())
                .with("turnCount", turn)
                .with("updatedAt", chrono::Utc::now().to_rfc3339());
            body = state::attach_state(&body, &state::merge(prior.as_ref(), updates));
        } else if let Some(token) = &prior_token {
            // unchanged state is carried over as written, version included
            body = state::embed_state(&body, token);
        }
        let result =
            upsert_marker_comment(self.comments, &req.thread, RESULT_MARKER, &body, req.reply_to)
                .await?;
        tracing::info!(
            comment_id = result.comment().id,
            success = answer.success,
            used_fallback = answer.used_fallback,
            "published result"
        );

        let done = if answer.success {
            format!("`{}` finished. See the answer below.", invocation)
        } else {
            format!("`{}` finished without an answer. See the reply below.", invocation)
        };
        upsert_marker_comment(self.comments, &req.thread, PROGRESS_MARKER, &done, req.reply_to)
            .await?;

        Ok(HandleOutcome {
            result_comment_id: result.comment().id,
            success: answer.success,
            used_fallback: answer.used_fallback,
            error_category: answer.error_category,
            scope_strategy: answer.scope_strategy,
        })
    }

    /// Readable state token embedded in the current result comment, if any.
    async fn prior_state_token(&self, req: &CommandRequest) -> Result<Option<String>> {
        let comments = self.comments.list_comments(&req.thread).await?;
        Ok(find_marker_comment(&comments, RESULT_MARKER, req.reply_to)
            .and_then(|c| state::extract_state_token(&c.body))
            .map(str::to_string))
    }

    async fn answer(
        &self,
        req: &CommandRequest,
        task: PromptTask,
        question: Option<&str>,
        target: Option<&FileTarget>,
        prior: Option<&ConversationState>,
    ) -> Result<Answer> {
        let pr = self.diffs.pull_request(req.thread.number).await?;
        let anchor = req
            .review_anchor
            .as_ref()
            .filter(|a| target.is_some_and(|t| t.path == a.path));
        let revision = Revision::for_anchor(&pr, anchor);

        let patches = self.diffs.pull_request_patches(pr.number).await?;
        let mut excerpts = Vec::new();
        let mut strategy = None;
        let diff = match (task, target) {
            (PromptTask::Explain, Some(target)) | (PromptTask::Ask, Some(target)) => {
                let patch = file_patch(&patches, &target.path);
                let prefer_enclosing =
                    task == PromptTask::Explain && target.range.is_some_and(|r| r.start == r.end);
                match self.scope_file(target, patch, &revision, prefer_enclosing).await? {
                    Scoped::Excerpt(excerpt, s) => {
                        excerpts.push(excerpt);
                        strategy = Some(s);
                    }
                    Scoped::Unavailable(message) => return Ok(Answer::notice(message)),
                }
                (task == PromptTask::Ask).then(|| render_patches(&patches, None))
            }
            (PromptTask::Review, Some(target)) => {
                let Some(patch) = file_patch(&patches, &target.path) else {
                    return Ok(Answer::notice(format!(
                        "`{}` has no text changes in this pull request.",
                        target.path
                    )));
                };
                match self.scope_file(target, Some(patch), &revision, false).await? {
                    Scoped::Excerpt(excerpt, s) => {
                        excerpts.push(excerpt);
                        strategy = Some(s);
                    }
                    Scoped::Unavailable(message) => return Ok(Answer::notice(message)),
                }
                Some(render_patches(&patches, Some(&target.path)))
            }
            (PromptTask::Explain, None) => {
                return Err(HandlerError::MissingPath { command: "explain" }.into())
            }
            (_, None) => Some(render_patches(&patches, None)),
        };

        let history = prior.and_then(|s| {
            Some(format!(
                "`{} {}` by @{}",
                s.get_str("lastCommand")?,
                s.get_str("lastArgs").unwrap_or(""),
                s.get_str("lastUser").unwrap_or("unknown")
            ))
        });
        let input = PromptInput {
            question,
            pr_title: &pr.title,
            pr_body: &pr.body,
            excerpts: &excerpts,
            diff: diff.as_deref(),
            history: history.as_deref(),
        };
        let full = build_prompt(task, &input, self.config.max_prompt_chars);
        let compact = build_compact_prompt(task, &input, self.config.fallback_prompt_chars);

        tracing::info!(
            repo = %req.repo,
            pr = pr.number,
            command = req.command.name(),
            prompt_chars = full.len_chars(),
            strategy = strategy.map(|s| s.as_str()),
            "calling model"
        );

        let llm = self.llm;
        let fallback = Fallback::new(move || compact).on_escalate(|attempt| {
            tracing::info!(attempt = attempt + 1, "retrying with compact prompt");
        });
        let outcome = run_with_retry(&self.config.retry, full, Some(fallback), |prompt: ChatPrompt, _| async move {
            llm.complete(&prompt).await
        })
        .await;

        if let Some(error) = &outcome.error {
            tracing::warn!(
                category = error.category.as_str(),
                attempts = error.attempts,
                duration_ms = error.total_duration_ms,
                error = %error.message,
                "model call failed"
            );
            let mut answer = Answer::failed(error.category);
            answer.scope_strategy = strategy;
            answer.used_fallback = outcome.used_fallback;
            return Ok(answer);
        }

        Ok(Answer {
            body: outcome.data.unwrap_or_default(),
            success: outcome.success,
            used_fallback: outcome.used_fallback,
            error_category: None,
            scope_strategy: strategy,
        })
    }

    async fn scope_file(
        &self,
        target: &FileTarget,
        patch: Option<&str>,
        revision: &Revision<'_>,
        prefer_enclosing: bool,
    ) -> Result<Scoped> {
        let git_ref = revision.git_ref;
        let text = match self.files.get_file_at(&target.path, git_ref).await? {
            FileContent::Text(text) => text,
            FileContent::Binary => {
                return Ok(Scoped::Unavailable(format!(
                    "`{}` is a binary file, so there is no code to show.",
                    target.path
                )))
            }
            FileContent::Directory => {
                return Ok(Scoped::Unavailable(format!(
                    "`{}` is a directory. Name a file instead.",
                    target.path
                )))
            }
            FileContent::NotFound => {
                return Ok(Scoped::Unavailable(format!(
                    "`{}` was not found at `{}`.",
                    target.path,
                    short_ref(git_ref)
                )))
            }
        };

        let source = SourceText::new(&text);
        let (mut excerpt, strategy) =
            scope_source(&self.config.scope, &source, target, patch, revision.side, prefer_enclosing);
        if let Some(note) = revision.note {
            excerpt.note = Some(match excerpt.note.take() {
                Some(existing) => format!("{} {}", note, existing),
                None => note.to_string(),
            });
        }
        tracing::debug!(path = %target.path, strategy = strategy.as_str(), label = %excerpt.label, "scoped file");
        Ok(Scoped::Excerpt(excerpt, strategy))
    }

    fn footer(&self, answer: &Answer) -> String {
        let mut parts = vec!["prbot".to_string(), self.llm.model().to_string()];
        if let Some(strategy) = answer.scope_strategy {
            parts.push(strategy.as_str().replace('_', " "));
        }
        if answer.used_fallback {
            parts.push("compact prompt".to_string());
        }
        format!("<sub>{}</sub>", parts.join(" · "))
    }
}

/// Commit a file is read at, and the diff side its line numbers belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Revision<'r> {
    git_ref: &'r str,
    side: DiffSide,
    note: Option<&'static str>,
}

const OUTDATED_NOTE: &str =
    "The review comment is outdated; its line numbers refer to an earlier revision of the diff.";

impl<'r> Revision<'r> {
    /// Pinned commits only: the head SHA for the new side, the base SHA for
    /// the old side, and the comment's own commit for outdated comments.
    fn for_anchor(pr: &'r PullRequestInfo, anchor: Option<&'r ReviewAnchor>) -> Self {
        let side = anchor.map(|a| a.side).unwrap_or_default();
        let outdated = anchor.and_then(|a| a.outdated_commit.as_deref());
        match (side, outdated) {
            (DiffSide::New, None) => Self {
                git_ref: &pr.head_sha,
                side,
                note: None,
            },
            (DiffSide::New, Some(commit)) => Self {
                git_ref: commit,
                side,
                note: None,
            },
            (DiffSide::Old, outdated) => Self {
                git_ref: &pr.base_sha,
                side,
                note: outdated.map(|_| OUTDATED_NOTE),
            },
        }
    }
}

fn resolve_target(req: &CommandRequest) -> Result<Option<FileTarget>, HandlerError> {
    let from_anchor = || {
        req.review_anchor.as_ref().map(|a| FileTarget {
            path: a.path.clone(),
            range: a.range(),
        })
    };
    match &req.command {
        Command::Explain { target: Some(t), .. } => Ok(Some(t.clone())),
        Command::Explain { target: None, .. } => from_anchor()
            .map(Some)
            .ok_or(HandlerError::MissingPath { command: "explain" }),
        Command::Review { path: Some(path) } => Ok(Some(FileTarget {
            path: path.clone(),
            range: None,
        })),
        Command::Review { path: None } | Command::Ask { .. } => Ok(from_anchor()),
        Command::Help => Ok(None),
    }
}

/// Pick the slice of `source` to show for `target`.
fn scope_source(
    config: &ScopeSettings,
    source: &SourceText,
    target: &FileTarget,
    patch: Option<&str>,
    side: DiffSide,
    prefer_enclosing: bool,
) -> (CodeExcerpt, ScopeStrategy) {
    let total = source.line_count();
    let enclosing = EnclosingOptions {
        max_search_lines: config.max_search_lines,
        window_size: config.window_size,
    };
    let focus = target.range.map(|r| format!("lines {}", r));
    let compact_for = |fallback: &str| match target.range {
        Some(range) if range.validate(total).is_ok() => {
            render_numbered(&source.slice(range), range.start)
        }
        _ => fallback.to_string(),
    };

    if total > config.max_file_lines {
        let options = LargeFileOptions {
            max_file_lines: config.max_file_lines,
            window_size: config.sliding_window,
            max_windows: config.max_windows,
            anchor_line: target.range.map(|r| r.start),
            prefer_enclosing_block: prefer_enclosing,
            changed_ranges: target.range.into_iter().collect(),
            patch: patch.map(str::to_string),
            diff_side: side,
            enclosing,
        };
        let scoped = scope_large_file(source, &options);
        let lines: Vec<String> = scoped.content.lines().map(str::to_string).collect();
        let full = if scoped.windows.len() == 1 {
            render_numbered(&lines, scoped.start_line)
        } else {
            scoped.content.clone()
        };
        let compact = target
            .range
            .and_then(|range| {
                let rel = scoped.relative_range(range)?;
                let focused = lines.get(rel.start.checked_sub(1)?..rel.end)?;
                Some(render_numbered(focused, range.start))
            })
            .unwrap_or_else(|| full.clone());
        let label = format!(
            "lines {}-{} of {}, {}",
            scoped.start_line,
            scoped.end_line,
            total,
            scoped.strategy.as_str().replace('_', " ")
        );
        let excerpt = CodeExcerpt {
            path: target.path.clone(),
            label,
            compact,
            full,
            focus,
            note: scoped.note.clone(),
        };
        return (excerpt, scoped.strategy);
    }

    let Some(range) = target.range else {
        let full = render_numbered(source.lines(), 1);
        let excerpt = CodeExcerpt {
            path: target.path.clone(),
            label: format!("all {} lines", total),
            compact: full.clone(),
            full,
            focus: None,
            note: None,
        };
        return (excerpt, ScopeStrategy::FullFile);
    };

    let (result, strategy) = if prefer_enclosing && range.start == range.end {
        (
            extract_enclosing_block(source, range.start, enclosing),
            ScopeStrategy::EnclosingBlock,
        )
    } else {
        (
            extract_window(source, range.start, range.end, config.window_size),
            ScopeStrategy::SlidingWindow,
        )
    };

    let (lines, first_line) = match (&result.surrounding, result.surrounding_range) {
        (Some(lines), Some(range)) => (lines.as_slice(), range.start),
        _ => (result.target.as_slice(), result.bounds.start),
    };
    let shown = LineRange::new(first_line, first_line + lines.len().saturating_sub(1));
    let strategy = if shown.start == 1 && shown.end >= total {
        ScopeStrategy::FullFile
    } else {
        strategy
    };
    let full = render_numbered(lines, first_line);
    let excerpt = CodeExcerpt {
        path: target.path.clone(),
        label: format!("lines {} of {}", shown, total),
        compact: compact_for(&full),
        full,
        focus,
        note: result.note.clone(),
    };
    (excerpt, strategy)
}

fn file_patch<'p>(patches: &'p [FilePatch], path: &str) -> Option<&'p str> {
    patches
        .iter()
        .find(|p| p.filename == path)
        .and_then(|p| p.patch.as_deref())
}

fn render_patches(patches: &[FilePatch], only: Option<&str>) -> String {
    patches
        .iter()
        .filter(|p| only.is_none_or(|path| p.filename == path))
        .filter_map(|p| {
            p.patch
                .as_deref()
                .map(|patch| format!("--- a/{f}\n+++ b/{f}\n{}\n", patch.trim_end(), f = p.filename))
        })
        .collect()
}

fn short_ref(git_ref: &str) -> &str {
    if git_ref.len() == 40 && git_ref.chars().all(|c| c.is_ascii_hexdigit()) {
        &git_ref[..7]
    } else {
        git_ref
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prbot_core::{Comment, ThreadKind};
    use std::collections::{HashMap, VecDeque};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeGitHub {
        comments: Mutex<Vec<Comment>>,
        files: HashMap<String, FileContent>,
        patches: Vec<FilePatch>,
        fetched_refs: Mutex<Vec<String>>,
    }

    impl FakeGitHub {
        fn with_file(mut self, path: &str, content: &str) -> Self {
            self.files
                .insert(path.to_string(), FileContent::Text(content.to_string()));
            self
        }

        fn snapshot(&self) -> Vec<Comment> {
            self.comments.lock().unwrap().clone()
        }

        fn marked(&self, marker: &str) -> Vec<Comment> {
            self.snapshot()
                .into_iter()
                .filter(|c| c.body.contains(marker))
                .collect()
        }
    }

    impl CommentStore for FakeGitHub {
        fn list_comments<'a>(
            &'a self,
            _thread: &'a CommentThread,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Comment>>> + Send + 'a>> {
            Box::pin(async move { Ok(self.snapshot()) })
        }

        fn create_comment<'a>(
            &'a self,
            _thread: &'a CommentThread,
            body: &'a str,
            reply_to: Option<u64>,
        ) -> Pin<Box<dyn Future<Output = Result<Comment>> + Send + 'a>> {
            Box::pin(async move {
                let mut comments = self.comments.lock().unwrap();
                let comment = Comment {
                    id: comments.len() as u64 + 1,
                    body: body.to_string(),
                    author: "prbot[bot]".to_string(),
                    in_reply_to: reply_to,
                };
                comments.push(comment.clone());
                Ok(comment)
            })
        }

        fn update_comment<'a>(
            &'a self,
            _thread: &'a CommentThread,
            id: u64,
            body: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Comment>> + Send + 'a>> {
            Box::pin(async move {
                let mut comments = self.comments.lock().unwrap();
                let comment = comments
                    .iter_mut()
                    .find(|c| c.id == id)
                    .ok_or_else(|| anyhow::anyhow!("no comment {}", id))?;
                comment.body = body.to_string();
                Ok(comment.clone())
            })
        }
    }

    impl FileSource for FakeGitHub {
        fn get_file_at<'a>(
            &'a self,
            path: &'a str,
            git_ref: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<FileContent>> + Send + 'a>> {
            Box::pin(async move {
                self.fetched_refs.lock().unwrap().push(git_ref.to_string());
                Ok(self
                    .files
                    .get(path)
                    .cloned()
                    .unwrap_or(FileContent::NotFound))
            })
        }
    }

    impl DiffSource for FakeGitHub {
        fn pull_request<'a>(
            &'a self,
            number: u64,
        ) -> Pin<Box<dyn Future<Output = Result<PullRequestInfo>> + Send + 'a>> {
            Box::pin(async move {
                Ok(PullRequestInfo {
                    number,
                    title: "Add math helpers".to_string(),
                    body: "Adds helpers.".to_string(),
                    head_sha: "a".repeat(40),
                    base_sha: "b".repeat(40),
                })
            })
        }

        fn pull_request_patches<'a>(
            &'a self,
            _number: u64,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<FilePatch>>> + Send + 'a>> {
            Box::pin(async move { Ok(self.patches.clone()) })
        }
    }

    /// Replays scripted results and records every prompt it receives.
    struct ScriptedLlm {
        script: Mutex<VecDeque<Result<String, String>>>,
        prompts: Mutex<Vec<ChatPrompt>>,
    }

    impl ScriptedLlm {
        fn new(script: Vec<Result<&str, &str>>) -> Self {
            Self {
                script: Mutex::new(
                    script
                        .into_iter()
                        .map(|r| r.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    impl ChatCompletion for ScriptedLlm {
        fn complete<'a>(
            &'a self,
            prompt: &'a ChatPrompt,
        ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
            Box::pin(async move {
                self.prompts.lock().unwrap().push(prompt.clone());
                let next = self.script.lock().unwrap().pop_front();
                match next {
                    Some(Ok(text)) => Ok(text),
                    Some(Err(err)) => Err(anyhow::anyhow!(err)),
                    None => Err(anyhow::anyhow!("script exhausted")),
                }
            })
        }

        fn model(&self) -> &str {
            "test-model"
        }
    }

    fn config() -> HandlerConfig {
        HandlerConfig {
            trigger: "/prbot".to_string(),
            scope: ScopeSettings::default(),
            retry: RetryPolicy {
                max_retries: 3,
                base_timeout_ms: 60_000,
                base_delay_ms: 0,
                max_jitter_ms: 0,
            },
            max_prompt_chars: 24_000,
            fallback_prompt_chars: 8_000,
        }
    }

    fn request(command: Command) -> CommandRequest {
        CommandRequest {
            repo: "octo/demo".to_string(),
            thread: CommentThread {
                number: 7,
                kind: ThreadKind::Conversation,
            },
            reply_to: None,
            author: "octocat".to_string(),
            command,
            review_anchor: None,
        }
    }

    fn explain(path: &str, start: usize, end: usize) -> Command {
        Command::Explain {
            target: Some(FileTarget {
                path: path.to_string(),
                range: Some(LineRange::new(start, end)),
            }),
            question: None,
        }
    }

    const MATH_RS: &str = "use std::ops::Add;\n\npub fn add(a: i32, b: i32) -> i32 {\n    let sum = a + b;\n    sum\n}\n\npub fn sub(a: i32, b: i32) -> i32 {\n    a - b\n}\n";

    #[tokio::test]
    async fn test_explain_publishes_result_with_state() {
        let gh = FakeGitHub::default().with_file("src/math.rs", MATH_RS);
        let llm = ScriptedLlm::new(vec![Ok("It adds two numbers.")]);
        let config = config();
        let handler = CommandHandler::new(&gh, &gh, &gh, &llm, &config);

        let outcome = handler.handle(&request(explain("src/math.rs", 4, 4))).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.scope_strategy, Some(ScopeStrategy::EnclosingBlock));

        let prompt = &llm.prompts.lock().unwrap()[0];
        assert!(prompt.user.contains("pub fn add"));
        assert!(prompt.user.contains("Focus on lines 4"));

        let results = gh.marked(RESULT_MARKER);
        assert_eq!(results.len(), 1);
        assert!(results[0].body.contains("It adds two numbers."));
        let state = state::extract_state(&results[0].body).unwrap();
        assert_eq!(state.get_str("lastCommand"), Some("explain"));
        assert_eq!(state.get_str("lastArgs"), Some("src/math.rs:4"));
        assert_eq!(state.get_u64("turnCount"), Some(1));

        let progress = gh.marked(PROGRESS_MARKER);
        assert_eq!(progress.len(), 1);
        assert!(progress[0].body.contains("finished"));
    }

    #[tokio::test]
    async fn test_second_turn_updates_same_comments() {
        let gh = FakeGitHub::default().with_file("src/math.rs", MATH_RS);
        let llm = ScriptedLlm::new(vec![Ok("first"), Ok("second")]);
        let config = config();
        let handler = CommandHandler::new(&gh, &gh, &gh, &llm, &config);

        handler.handle(&request(explain("src/math.rs", 8, 10))).await.unwrap();
        handler
            .handle(&request(Command::Ask {
                question: "Why two functions?".to_string(),
            }))
            .await
            .unwrap();

        let results = gh.marked(RESULT_MARKER);
        assert_eq!(results.len(), 1);
        assert!(results[0].body.contains("second"));
        let state = state::extract_state(&results[0].body).unwrap();
        assert_eq!(state.get_u64("turnCount"), Some(2));
        assert_eq!(state.get_str("lastCommand"), Some("ask"));
        assert_eq!(gh.marked(PROGRESS_MARKER).len(), 1);
        assert_eq!(gh.snapshot().len(), 2);

        let second_prompt = &llm.prompts.lock().unwrap()[1];
        assert!(second_prompt.user.contains("Previous request in this thread: `explain src/math.rs:8-10`"));
    }

    #[tokio::test]
    async fn test_help_is_local() {
        let gh = FakeGitHub::default();
        let llm = ScriptedLlm::new(vec![]);
        let config = config();
        let handler = CommandHandler::new(&gh, &gh, &gh, &llm, &config);

        let outcome = handler.handle(&request(Command::Help)).await.unwrap();
        assert!(outcome.success);
        assert_eq!(llm.calls(), 0);
        assert!(gh.marked(RESULT_MARKER)[0].body.contains("/prbot review"));
        assert!(gh.marked(PROGRESS_MARKER).is_empty());
    }

    #[tokio::test]
    async fn test_auth_failure_posts_safe_message() {
        let gh = FakeGitHub::default().with_file("src/math.rs", MATH_RS);
        let llm = ScriptedLlm::new(vec![Err(
            r#"HTTP 401: {"error":{"message":"Incorrect API key provided: sk-live-abcdefghijklmnop"}}"#,
        )]);
        let config = config();
        let handler = CommandHandler::new(&gh, &gh, &gh, &llm, &config);

        let outcome = handler.handle(&request(explain("src/math.rs", 3, 6))).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error_category, Some(ErrorCategory::Auth));
        assert_eq!(llm.calls(), 1);

        let body = &gh.marked(RESULT_MARKER)[0].body;
        assert!(body.contains(ErrorCategory::Auth.user_message()));
        assert!(!body.contains("sk-live"));
        assert!(state::extract_state(body).is_none());
    }

    #[tokio::test]
    async fn test_timeouts_escalate_to_compact_prompt() {
        let gh = FakeGitHub::default().with_file("src/math.rs", MATH_RS);
        let llm = ScriptedLlm::new(vec![
            Err("request timed out"),
            Err("request timed out"),
            Ok("short answer"),
        ]);
        let config = config();
        let handler = CommandHandler::new(&gh, &gh, &gh, &llm, &config);

        let outcome = handler.handle(&request(explain("src/math.rs", 3, 6))).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.used_fallback);

        let prompts = llm.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 3);
        assert_eq!(prompts[0], prompts[1]);
        assert!(prompts[2].user.len() < prompts[0].user.len());
        assert!(gh.marked(RESULT_MARKER)[0].body.contains("compact prompt"));
    }

    #[tokio::test]
    async fn test_missing_file_is_reported_without_model_call() {
        let gh = FakeGitHub::default();
        let llm = ScriptedLlm::new(vec![]);
        let config = config();
        let handler = CommandHandler::new(&gh, &gh, &gh, &llm, &config);

        let outcome = handler.handle(&request(explain("nope.rs", 1, 2))).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(llm.calls(), 0);
        assert!(gh.marked(RESULT_MARKER)[0].body.contains("`nope.rs` was not found at `aaaaaaa`"));
    }

    #[tokio::test]
    async fn test_explain_without_path_fails_before_publishing() {
        let gh = FakeGitHub::default();
        let llm = ScriptedLlm::new(vec![]);
        let config = config();
        let handler = CommandHandler::new(&gh, &gh, &gh, &llm, &config);

        let err = handler
            .handle(&request(Command::Explain {
                target: None,
                question: Some("what?".to_string()),
            }))
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<HandlerError>(),
            Some(&HandlerError::MissingPath { command: "explain" })
        );
        assert!(gh.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_review_comment_anchor_and_reply_chain() {
        let gh = FakeGitHub::default().with_file("src/math.rs", MATH_RS);
        let llm = ScriptedLlm::new(vec![Ok("explained")]);
        let config = config();
        let handler = CommandHandler::new(&gh, &gh, &gh, &llm, &config);

        let mut req = request(Command::Explain {
            target: None,
            question: None,
        });
        req.thread.kind = ThreadKind::Review;
        req.reply_to = Some(55);
        req.review_anchor = Some(ReviewAnchor {
            path: "src/math.rs".to_string(),
            start_line: None,
            line: Some(9),
            side: DiffSide::New,
            outdated_commit: None,
        });

        let outcome = handler.handle(&req).await.unwrap();
        assert!(outcome.success);
        let results = gh.marked(RESULT_MARKER);
        assert_eq!(results[0].in_reply_to, Some(55));
        assert!(llm.prompts.lock().unwrap()[0].user.contains("pub fn sub"));
    }

    fn anchored_explain(line: usize, side: DiffSide, outdated_commit: Option<String>) -> CommandRequest {
        let mut req = request(Command::Explain {
            target: None,
            question: None,
        });
        req.thread.kind = ThreadKind::Review;
        req.reply_to = Some(55);
        req.review_anchor = Some(ReviewAnchor {
            path: "src/math.rs".to_string(),
            start_line: None,
            line: Some(line),
            side,
            outdated_commit,
        });
        req
    }

    #[tokio::test]
    async fn test_old_side_anchor_reads_base_commit() {
        let gh = FakeGitHub::default().with_file("src/math.rs", MATH_RS);
        let llm = ScriptedLlm::new(vec![Ok("explained")]);
        let config = config();
        let handler = CommandHandler::new(&gh, &gh, &gh, &llm, &config);

        handler
            .handle(&anchored_explain(2, DiffSide::Old, None))
            .await
            .unwrap();
        assert_eq!(*gh.fetched_refs.lock().unwrap(), vec!["b".repeat(40)]);
    }

    #[tokio::test]
    async fn test_outdated_comment_reads_its_own_commit() {
        let gh = FakeGitHub::default().with_file("src/math.rs", MATH_RS);
        let llm = ScriptedLlm::new(vec![Ok("explained"), Ok("explained")]);
        let config = config();
        let handler = CommandHandler::new(&gh, &gh, &gh, &llm, &config);

        handler
            .handle(&anchored_explain(9, DiffSide::New, Some("c".repeat(40))))
            .await
            .unwrap();
        handler
            .handle(&anchored_explain(9, DiffSide::Old, Some("c".repeat(40))))
            .await
            .unwrap();
        assert_eq!(
            *gh.fetched_refs.lock().unwrap(),
            vec!["c".repeat(40), "b".repeat(40)]
        );
        let prompts = llm.prompts.lock().unwrap();
        assert!(!prompts[0].user.contains("outdated"));
        assert!(prompts[1].user.contains("Note: The review comment is outdated"));
    }

    #[tokio::test]
    async fn test_failed_turn_keeps_prior_state_token() {
        let newer = "eyJ2Ijo5LCJsYXN0Q29tbWFuZCI6ImFzayJ9"; // {"v":9,"lastCommand":"ask"}
        let gh = FakeGitHub::default().with_file("src/math.rs", MATH_RS);
        gh.comments.lock().unwrap().push(Comment {
            id: 1,
            body: state::embed_state(&format!("{}\nearlier answer", RESULT_MARKER), newer),
            author: "prbot[bot]".to_string(),
            in_reply_to: None,
        });
        let llm = ScriptedLlm::new(vec![Err("HTTP 401: bad key")]);
        let config = config();
        let handler = CommandHandler::new(&gh, &gh, &gh, &llm, &config);

        let outcome = handler.handle(&request(explain("src/math.rs", 3, 6))).await.unwrap();
        assert!(!outcome.success);
        let body = &gh.marked(RESULT_MARKER)[0].body;
        assert_eq!(state::extract_state_token(body), Some(newer));
        assert_eq!(state::extract_state(body).unwrap().v, 9);
    }

    #[tokio::test]
    async fn test_large_file_review_uses_patch_windows() {
        let big: String = (1..=12_050).map(|i| format!("line_{:05}\n", i)).collect();
        let mut gh = FakeGitHub::default().with_file("gen/big.txt", &big);
        gh.patches = vec![FilePatch {
            filename: "gen/big.txt".to_string(),
            patch: Some("@@ -11000,2 +11000,3 @@\n-a\n+b".to_string()),
        }];
        let llm = ScriptedLlm::new(vec![Ok("looks fine")]);
        let config = config();
        let handler = CommandHandler::new(&gh, &gh, &gh, &llm, &config);

        let outcome = handler
            .handle(&request(Command::Review {
                path: Some("gen/big.txt".to_string()),
            }))
            .await
            .unwrap();
        assert_eq!(outcome.scope_strategy, Some(ScopeStrategy::SlidingWindow));
        let prompt = &llm.prompts.lock().unwrap()[0];
        assert!(prompt.user.contains("line_11000"));
        assert!(!prompt.user.contains("line_00001"));
        assert!(prompt.user.contains("+++ b/gen/big.txt"));
    }

    #[test]
    fn test_review_anchor_ranges() {
        let mut anchor = ReviewAnchor {
            path: "a".to_string(),
            start_line: Some(3),
            line: Some(8),
            side: DiffSide::New,
            outdated_commit: None,
        };
        assert_eq!(anchor.range(), Some(LineRange::new(3, 8)));
        anchor.start_line = None;
        assert_eq!(anchor.range(), Some(LineRange::single(8)));
        anchor.line = None;
        assert_eq!(anchor.range(), None);
    }

    #[test]
    fn test_small_file_window_scope() {
        let lines: Vec<String> = (1..=100).map(|i| format!("x{} = {}", i, i)).collect();
        let source = SourceText::new(&lines.join("\n"));
        let target = FileTarget {
            path: "a.py".to_string(),
            range: Some(LineRange::new(50, 52)),
        };
        let (excerpt, strategy) =
            scope_source(&ScopeSettings::default(), &source, &target, None, DiffSide::New, false);
        assert_eq!(strategy, ScopeStrategy::SlidingWindow);
        assert_eq!(excerpt.label, "lines 35-67 of 100");
        assert!(excerpt.compact.starts_with("50 | x50 = 50"));
    }

    #[test]
    fn test_command_args_round_trip_format() {
        assert_eq!(explain("src/a.rs", 3, 9).args(), "src/a.rs:3-9");
        let cmd = Command::Explain {
            target: Some(FileTarget {
                path: "b.rs".to_string(),
                range: None,
            }),
            question: Some("why?".to_string()),
        };
        assert_eq!(cmd.args(), "b.rs why?");
    }
}
