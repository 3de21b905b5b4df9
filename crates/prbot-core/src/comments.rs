//! Comment-store contract and marker-based idempotent upsert.
//!
//! A marker is a literal substring (an HTML comment) that identifies the one
//! comment owned by a response stream. Only the bot writes bodies containing a
//! marker, so "the latest comment containing it" is that stream's comment.
//!
//! The find-then-write sequence is not transactional. Two runs upserting the
//! same marker at the same moment can both miss the existing comment, and the
//! later write wins. The store offers no primitive to lock on.

use anyhow::Result;
use std::future::Future;
use std::pin::Pin;

/// Marker of the transient "working on it" comment.
pub const PROGRESS_MARKER: &str = "<!-- prbot:progress -->";

/// Marker of the comment holding the answer and the conversation state.
pub const RESULT_MARKER: &str = "<!-- prbot:result -->";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadKind {
    /// Top-level pull request conversation (issue comments).
    Conversation,
    /// Inline review comments on the diff.
    Review,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommentThread {
    /// Pull request number.
    pub number: u64,
    pub kind: ThreadKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: u64,
    pub body: String,
    pub author: String,
    pub in_reply_to: Option<u64>,
}

/// Storage for comments on a thread. Implementations must keep bodies
/// byte-for-byte since markers are matched as substrings.
pub trait CommentStore: Send + Sync {
    fn list_comments<'a>(
        &'a self,
        thread: &'a CommentThread,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Comment>>> + Send + 'a>>;

    fn create_comment<'a>(
        &'a self,
        thread: &'a CommentThread,
        body: &'a str,
        reply_to: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = Result<Comment>> + Send + 'a>>;

    fn update_comment<'a>(
        &'a self,
        thread: &'a CommentThread,
        id: u64,
        body: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Comment>> + Send + 'a>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(Comment),
    Updated(Comment),
}

impl UpsertOutcome {
    pub fn comment(&self) -> &Comment {
        match self {
            UpsertOutcome::Created(c) | UpsertOutcome::Updated(c) => c,
        }
    }
}

/// Prefix `body` with `marker` unless it already carries it.
pub fn with_marker(marker: &str, body: &str) -> String {
    if body.contains(marker) {
        body.to_string()
    } else {
        format!("{}\n{}", marker, body)
    }
}

/// Most recent comment carrying `marker`. With `reply_to`, only that reply
/// chain is considered.
pub fn find_marker_comment<'c>(
    comments: &'c [Comment],
    marker: &str,
    reply_to: Option<u64>,
) -> Option<&'c Comment> {
    comments
        .iter()
        .rev()
        .filter(|c| reply_to.is_none() || c.in_reply_to == reply_to)
        .find(|c| c.body.contains(marker))
}

/// Update the comment carrying `marker`, or create it.
pub async fn upsert_marker_comment(
    store: &dyn CommentStore,
    thread: &CommentThread,
    marker: &str,
    body: &str,
    reply_to: Option<u64>,
) -> Result<UpsertOutcome> {
    let body = with_marker(marker, body);
    let comments = store.list_comments(thread).await?;

    match find_marker_comment(&comments, marker, reply_to) {
        Some(existing) => {
            tracing::debug!(comment_id = existing.id, marker, "updating marker comment");
            let updated = store.update_comment(thread, existing.id, &body).await?;
            Ok(UpsertOutcome::Updated(updated))
        }
        None => {
            tracing::debug!(?reply_to, marker, "creating marker comment");
            let created = store.create_comment(thread, &body, reply_to).await?;
            Ok(UpsertOutcome::Created(created))
        }
    }
}
