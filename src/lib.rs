//! Parley - Full-duplex voice conversation with chat-completion models
//!
//! This library provides the pieces of a spoken turn-taking loop:
//! - Speech capture with silence endpointing
//! - A streaming chat client with transient-failure retries
//! - Speech playback with barge-in detection
//! - Action directives embedded in model replies
//! - The conversation state machine tying them together
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │               Conversation orchestrator              │
//! │   Idle → Listening → Thinking → Speaking → ...      │
//! └──────┬──────────────────┬──────────────────┬────────┘
//!        │                  │                  │
//! ┌──────▼───────┐  ┌───────▼────────┐  ┌──────▼───────┐
//! │ SpeechCapture│  │   ChatClient   │  │SpeechPlayback│
//! │  mic + STT   │  │ batch / stream │  │ TTS+barge-in │
//! └──────┬───────┘  └───────┬────────┘  └──────┬───────┘
//!        │                  │                  │
//! ┌──────▼──────────────────▼──────────────────▼────────┐
//! │      Microphone arbiter  │  Settings  │  Actions     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod actions;
pub mod chat;
pub mod config;
pub mod conversation;
pub mod error;
pub mod voice;

pub use actions::{ActionDirective, ActionExecutor, ChainExecutor, resolve};
pub use chat::{ChatClient, ConversationTurn, Role};
pub use config::{Preferences, Settings};
pub use conversation::{
    ConversationEvent, ConversationState, History, Orchestrator, OrchestratorHandle,
};
pub use error::{ActionError, CaptureError, ChatError, Error, FailureKind, Result};
pub use voice::{Microphone, SpeechCapture, SpeechPlayback};
