//! Core domain logic for prbot: code scoping, diff ranges, conversation state
//! and the comment-store contract. Nothing in this crate performs I/O.

pub mod comments;
pub mod diff;
pub mod scope;
pub mod sources;
pub mod state;
pub mod truncate;

pub use comments::{
    upsert_marker_comment, Comment, CommentStore, CommentThread, ThreadKind, UpsertOutcome,
    PROGRESS_MARKER, RESULT_MARKER,
};
pub use diff::{parse_patch_line_ranges, DiffSide};
pub use scope::{LineRange, ScopeResult, ScopeStrategy, ScopedFile, SourceText};
pub use sources::{DiffSource, FileContent, FilePatch, FileSource, PullRequestInfo};
pub use state::ConversationState;
