//! Streaming chat client
//!
//! Sends the conversation to an OpenAI-compatible chat completions
//! endpoint, in batch or `data:` streaming mode, retrying transient
//! failures with exponential backoff.

mod client;
mod retry;
mod stream;
mod types;

pub use client::{ChatClient, StreamSession};
pub use retry::{RetryPolicy, delay_for_attempt, pause, with_backoff};
pub use stream::{StreamEvent, StreamParser};
pub use types::{Attachment, ConversationTurn, Role};
