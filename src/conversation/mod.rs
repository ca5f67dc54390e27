//! Turn-taking voice conversation
//!
//! The orchestrator runs the `Listening → Thinking → Speaking → Listening`
//! loop on a single task and reports progress as [`ConversationEvent`]s.

mod history;
mod orchestrator;

pub use history::History;
pub use orchestrator::{Orchestrator, OrchestratorHandle};

/// Where the conversation loop is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationState {
    /// Not running; waiting for `start`
    #[default]
    Idle,
    /// Capturing the user's utterance
    Listening,
    /// Waiting for the model's reply
    Thinking,
    /// Playing the reply
    Speaking,
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Listening => write!(f, "listening"),
            Self::Thinking => write!(f, "thinking"),
            Self::Speaking => write!(f, "speaking"),
        }
    }
}

/// Progress reported to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    /// The loop moved to a new state
    StateChanged(ConversationState),
    /// A finalized user utterance was accepted
    UserUtterance(String),
    /// A streamed increment of the assistant's reply
    AssistantChunk(String),
    /// The full reply, with action directives resolved
    AssistantReply(String),
    /// A short user-visible message about a failure
    Notice(String),
}
