pub mod client;
pub mod errors;
pub mod prompts;
pub mod retry;

pub use client::{ChatClient, ChatCompletion, ChatPrompt};
pub use errors::{categorize_error, sanitize_error_message, ApiError, ErrorCategory};
pub use retry::{run_with_retry, Fallback, RetryOutcome, RetryPolicy};
