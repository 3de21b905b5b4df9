//! Webhook event classification and dispatch.

use crate::command::parse_command;
use anyhow::{Context, Result};
use prbot_adapters::{GitHubClient, Settings};
use prbot_core::{CommentThread, DiffSide, ThreadKind};
use prbot_engine::llm::ChatClient;
use prbot_engine::{CommandHandler, CommandRequest, HandleOutcome, HandlerConfig, ReviewAnchor};
use serde::Deserialize;

pub const ISSUE_COMMENT: &str = "issue_comment";
pub const REVIEW_COMMENT: &str = "pull_request_review_comment";

#[derive(Debug, Deserialize)]
struct EventPayload {
    #[serde(default)]
    action: Option<String>,
    repository: Option<RepositoryPayload>,
    #[serde(default)]
    issue: Option<IssuePayload>,
    #[serde(default)]
    pull_request: Option<PullRequestPayload>,
    #[serde(default)]
    comment: Option<CommentPayload>,
}

#[derive(Debug, Deserialize)]
struct RepositoryPayload {
    name: String,
    owner: UserPayload,
}

#[derive(Debug, Deserialize)]
struct IssuePayload {
    number: u64,
    /// Present only when the issue is a pull request.
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    login: String,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct CommentPayload {
    id: u64,
    #[serde(default)]
    body: String,
    user: UserPayload,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    line: Option<usize>,
    #[serde(default)]
    original_line: Option<usize>,
    #[serde(default)]
    start_line: Option<usize>,
    #[serde(default)]
    original_start_line: Option<usize>,
    #[serde(default)]
    side: Option<String>,
    #[serde(default)]
    original_commit_id: Option<String>,
    #[serde(default)]
    in_reply_to_id: Option<u64>,
}

/// A newly created comment on a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentEvent {
    pub owner: String,
    pub repo: String,
    pub thread: CommentThread,
    pub comment_id: u64,
    pub body: String,
    pub author: String,
    pub reply_to: Option<u64>,
    pub review_anchor: Option<ReviewAnchor>,
}

fn is_bot(user: &UserPayload) -> bool {
    user.kind.eq_ignore_ascii_case("bot") || user.login.ends_with("[bot]")
}

/// Pick out the events the bot reacts to. `Ok(None)` means "not for us";
/// `Err` means the payload is malformed.
pub fn classify(event_name: &str, payload: &[u8]) -> Result<Option<CommentEvent>> {
    if event_name != ISSUE_COMMENT && event_name != REVIEW_COMMENT {
        tracing::debug!(event = event_name, "ignoring event type");
        return Ok(None);
    }
    let payload: EventPayload =
        serde_json::from_slice(payload).context("Failed to parse webhook payload")?;

    if payload.action.as_deref() != Some("created") {
        tracing::debug!(event = event_name, action = ?payload.action, "ignoring action");
        return Ok(None);
    }
    let repository = payload
        .repository
        .context("Webhook payload has no repository")?;
    let comment = payload.comment.context("Webhook payload has no comment")?;
    if is_bot(&comment.user) {
        tracing::debug!(author = %comment.user.login, "ignoring bot comment");
        return Ok(None);
    }

    let (thread, reply_to, review_anchor) = if event_name == ISSUE_COMMENT {
        let Some(issue) = payload.issue.filter(|i| i.pull_request.is_some()) else {
            tracing::debug!("ignoring comment on a plain issue");
            return Ok(None);
        };
        (
            CommentThread {
                number: issue.number,
                kind: ThreadKind::Conversation,
            },
            None,
            None,
        )
    } else {
        let pr = payload
            .pull_request
            .context("Review comment payload has no pull_request")?;
        let anchor = comment.path.clone().map(|path| ReviewAnchor {
            path,
            start_line: comment.start_line.or(comment.original_start_line),
            line: comment.line.or(comment.original_line),
            side: comment
                .side
                .as_deref()
                .map(DiffSide::from_github)
                .unwrap_or_default(),
            // a null `line` means the comment no longer maps onto the current diff
            outdated_commit: comment
                .original_commit_id
                .clone()
                .filter(|_| comment.line.is_none()),
        });
        (
            CommentThread {
                number: pr.number,
                kind: ThreadKind::Review,
            },
            // replies always attach to the root of the chain
            Some(comment.in_reply_to_id.unwrap_or(comment.id)),
            anchor,
        )
    };

    Ok(Some(CommentEvent {
        owner: repository.owner.login,
        repo: repository.name,
        thread,
        comment_id: comment.id,
        body: comment.body,
        author: comment.user.login,
        reply_to,
        review_anchor,
    }))
}

/// Classify, authorize and handle one webhook delivery.
pub async fn handle_event(
    settings: &Settings,
    event_name: &str,
    payload: &[u8],
) -> Result<Option<HandleOutcome>> {
    let Some(event) = classify(event_name, payload)? else {
        return Ok(None);
    };
    let Some(command) = parse_command(&event.body, &settings.github.trigger) else {
        tracing::debug!(comment_id = event.comment_id, "comment is not a command");
        return Ok(None);
    };

    let github = GitHubClient::new(&settings.github, &event.owner, &event.repo)?;
    let permission = github.collaborator_permission(&event.author).await?;
    if !permission.can_invoke() {
        tracing::info!(
            author = %event.author,
            ?permission,
            "ignoring command from user without write access"
        );
        return Ok(None);
    }

    let llm = ChatClient::new(&settings.llm)?;
    let config = HandlerConfig::from_settings(settings);
    let handler = CommandHandler::new(&github, &github, &github, &llm, &config);

    let request = CommandRequest {
        repo: github.full_name(),
        thread: event.thread,
        reply_to: event.reply_to,
        author: event.author,
        command,
        review_anchor: event.review_anchor,
    };
    tracing::info!(
        repo = %request.repo,
        pr = request.thread.number,
        command = request.command.name(),
        "handling command"
    );
    let outcome = handler.handle(&request).await?;
    Ok(Some(outcome))
}
