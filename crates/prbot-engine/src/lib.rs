//! Command handling and chat-completion orchestration for prbot.

pub mod handler;
pub mod llm;

pub use handler::{
    Command, CommandHandler, CommandRequest, FileTarget, HandleOutcome, HandlerConfig,
    HandlerError, ReviewAnchor,
};
