//! Conversation state machine
//!
//! All transitions happen on one task. Capture, chat and playback report
//! back through a channel, and every report carries the generation of the
//! stage that produced it; anything from an earlier generation is dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::history::History;
use super::{ConversationEvent, ConversationState};
use crate::actions::{self, ActionExecutor};
use crate::chat::{ChatClient, ConversationTurn};
use crate::config::Settings;
use crate::error::{CaptureError, ChatError, FailureKind};
use crate::voice::{CaptureOutcome, SpeechCapture, SpeechPlayback};

/// Pause before listening again after a capture failure
const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Consecutive capture failures before giving up
const MAX_CAPTURE_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Interrupt,
    Stop,
    Shutdown,
}

/// A report from a stage, tagged with the generation that started it
#[derive(Debug)]
struct Signal {
    generation: u64,
    kind: SignalKind,
}

#[derive(Debug)]
enum SignalKind {
    Heard(CaptureOutcome),
    Chunk(String),
    Reply(Result<String, ChatError>),
    Spoken { interrupted: bool },
    Resume,
}

/// Controls a running conversation loop
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConversationState>,
}

impl OrchestratorHandle {
    /// Begin listening, or barge in if a reply is playing
    pub fn start(&self) {
        self.send(Command::Start);
    }

    /// Tap-to-talk
    ///
    /// Cuts a playing reply or a pending request short and listens
    /// immediately; while listening, submits what has been heard so far.
    pub fn interrupt(&self) {
        self.send(Command::Interrupt);
    }

    /// Cancel whatever is running and go idle
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// Stop and end the loop; the event stream closes afterwards
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConversationState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConversationState> {
        self.state.clone()
    }

    /// Whether the loop is still running
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!(?command, "conversation loop has ended");
        }
    }
}

/// The components a conversation loop drives
pub struct Orchestrator {
    capture: SpeechCapture,
    playback: SpeechPlayback,
    chat: ChatClient,
    executor: Arc<dyn ActionExecutor>,
    settings: Settings,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        capture: SpeechCapture,
        playback: SpeechPlayback,
        chat: ChatClient,
        executor: Arc<dyn ActionExecutor>,
        settings: Settings,
    ) -> Self {
        Self {
            capture,
            playback,
            chat,
            executor,
            settings,
        }
    }

    /// Run the loop on a new task
    ///
    /// The loop starts idle. It ends on `shutdown` or when every handle has
    /// been dropped.
    #[must_use]
    pub fn spawn(self) -> (OrchestratorHandle, mpsc::UnboundedReceiver<ConversationEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConversationState::Idle);

        let history = History::new(self.settings.snapshot().chat.history_limit);
        let machine = Machine {
            parts: self,
            state: ConversationState::Idle,
            state_tx,
            events: event_tx,
            signals: signal_tx,
            generation: 0,
            history,
            pending_turn: None,
            in_flight: None,
            capture_failures: 0,
        };
        tokio::spawn(machine.run(command_rx, signal_rx));

        let handle = OrchestratorHandle {
            commands: command_tx,
            state: state_rx,
        };
        (handle, event_rx)
    }
}

struct Machine {
    parts: Orchestrator,
    state: ConversationState,
    state_tx: watch::Sender<ConversationState>,
    events: mpsc::UnboundedSender<ConversationEvent>,
    signals: mpsc::UnboundedSender<Signal>,
    generation: u64,
    history: History,
    /// User turn awaiting its reply
    pending_turn: Option<ConversationTurn>,
    /// Cancels the request in flight while thinking
    in_flight: Option<CancellationToken>,
    capture_failures: u32,
}

impl Machine {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<Signal>,
    ) {
        tracing::debug!("conversation loop started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                Some(signal) = signals.recv() => self.on_signal(signal),
            }
        }

        self.halt();
        tracing::debug!("conversation loop ended");
    }

    fn on_command(&mut self, command: Command) {
        tracing::debug!(?command, state = %self.state, "command");
        match (command, self.state) {
            (Command::Start | Command::Interrupt, ConversationState::Idle) => {
                self.capture_failures = 0;
                self.listen();
            }
            (Command::Start | Command::Interrupt, ConversationState::Speaking)
            | (Command::Interrupt, ConversationState::Thinking) => self.listen(),
            (Command::Interrupt, ConversationState::Listening) => self.submit_partial(),
            (Command::Start, ConversationState::Listening | ConversationState::Thinking) => {}
            (Command::Stop | Command::Shutdown, _) => self.halt(),
        }
    }

    fn on_signal(&mut self, signal: Signal) {
        if signal.generation != self.generation {
            tracing::trace!(
                generation = signal.generation,
                current = self.generation,
                "dropping stale signal"
            );
            return;
        }

        match signal.kind {
            SignalKind::Heard(Ok(utterance)) => self.on_utterance(utterance.into_text()),
            SignalKind::Heard(Err(e)) => self.on_capture_error(&e),
            SignalKind::Chunk(text) => self.emit(ConversationEvent::AssistantChunk(text)),
            SignalKind::Reply(Ok(text)) => self.on_reply(text),
            SignalKind::Reply(Err(e)) => self.on_chat_error(&e),
            SignalKind::Spoken { interrupted } => {
                if interrupted {
                    tracing::info!("reply interrupted, listening");
                }
                self.listen();
            }
            SignalKind::Resume => self.listen(),
        }
    }

    /// Start a fresh capture session, ending whatever ran before
    fn listen(&mut self) {
        let generation = self.advance();
        self.end_stages();
        self.set_state(ConversationState::Listening);

        let signals = self.signals.clone();
        self.parts.capture.start(move |outcome| {
            let _ = signals.send(Signal {
                generation,
                kind: SignalKind::Heard(outcome),
            });
        });
    }

    /// Treat the words heard so far as the finished utterance
    fn submit_partial(&mut self) {
        match self.parts.capture.stop() {
            Some(utterance) => self.on_utterance(utterance.into_text()),
            None => self.listen(),
        }
    }

    fn on_utterance(&mut self, text: String) {
        let text = text.trim();
        if text.is_empty() {
            tracing::debug!("empty utterance, listening again");
            self.listen();
            return;
        }

        self.capture_failures = 0;
        self.emit(ConversationEvent::UserUtterance(text.to_string()));
        self.think(ConversationTurn::user(text));
    }

    fn think(&mut self, turn: ConversationTurn) {
        let generation = self.advance();
        self.end_stages();
        self.set_state(ConversationState::Thinking);

        let prefs = self.parts.settings.snapshot();
        self.history.set_limit(prefs.chat.history_limit);
        let history = self.history.turns();
        self.pending_turn = Some(turn.clone());

        let cancel = CancellationToken::new();
        self.in_flight = Some(cancel.clone());

        let chat = self.parts.chat.clone();
        let executor = Arc::clone(&self.parts.executor);
        let signals = self.signals.clone();
        let stream = prefs.chat.stream;

        tokio::spawn(async move {
            let chunks = signals.clone();
            let on_chunk = move |chunk: &str| {
                let _ = chunks.send(Signal {
                    generation,
                    kind: SignalKind::Chunk(chunk.to_string()),
                });
            };

            let reply = fetch_reply(
                &chat,
                executor.as_ref(),
                &history,
                &turn,
                stream,
                &cancel,
                on_chunk,
            )
            .await;

            let _ = signals.send(Signal {
                generation,
                kind: SignalKind::Reply(reply),
            });
        });
    }

    fn on_reply(&mut self, text: String) {
        self.in_flight = None;
        if let Some(turn) = self.pending_turn.take() {
            self.history.push(turn);
        }
        self.history.push(ConversationTurn::assistant(text.clone()));

        self.emit(ConversationEvent::AssistantReply(text.clone()));
        self.speak(&text);
    }

    fn on_chat_error(&mut self, error: &ChatError) {
        self.in_flight = None;
        self.pending_turn = None;

        if matches!(error, ChatError::Cancelled) {
            return;
        }

        tracing::warn!(kind = %error.kind(), error = %error, "no reply from model");
        let apology = apology(error.kind());
        self.emit(ConversationEvent::Notice(apology.clone()));
        self.speak(&apology);
    }

    fn on_capture_error(&mut self, error: &CaptureError) {
        self.capture_failures += 1;
        tracing::warn!(error = %error, failures = self.capture_failures, "capture failed");
        self.emit(ConversationEvent::Notice(capture_notice(error)));

        if matches!(error, CaptureError::PermissionDenied)
            || self.capture_failures >= MAX_CAPTURE_FAILURES
        {
            self.halt();
            return;
        }

        let generation = self.advance();
        let signals = self.signals.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CAPTURE_RETRY_DELAY).await;
            let _ = signals.send(Signal {
                generation,
                kind: SignalKind::Resume,
            });
        });
    }

    fn speak(&mut self, text: &str) {
        let generation = self.advance();
        self.end_stages();
        self.set_state(ConversationState::Speaking);

        let completed = self.signals.clone();
        let interrupted = self.signals.clone();
        self.parts.playback.speak(
            text,
            move || {
                let _ = completed.send(Signal {
                    generation,
                    kind: SignalKind::Spoken { interrupted: false },
                });
            },
            move || {
                let _ = interrupted.send(Signal {
                    generation,
                    kind: SignalKind::Spoken { interrupted: true },
                });
            },
        );
    }

    /// Cancel everything and go idle
    fn halt(&mut self) {
        self.advance();
        self.end_stages();
        self.pending_turn = None;
        self.set_state(ConversationState::Idle);
    }

    /// Bring every stage to a terminal state
    ///
    /// Callers advance the generation first, so callbacks fired from here
    /// arrive stale.
    fn end_stages(&mut self) {
        if let Some(cancel) = self.in_flight.take() {
            cancel.cancel();
        }
        self.parts.playback.stop();
        self.parts.capture.stop();
    }

    fn advance(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    fn set_state(&mut self, state: ConversationState) {
        if self.state == state {
            return;
        }
        tracing::info!(from = %self.state, to = %state, "conversation state");
        self.state = state;
        self.state_tx.send_replace(state);
        self.emit(ConversationEvent::StateChanged(state));
    }

    fn emit(&self, event: ConversationEvent) {
        let _ = self.events.send(event);
    }
}

/// Stream the reply, fall back to one batch request, then resolve directives
///
/// Every step observes `cancel`.
async fn fetch_reply<F>(
    chat: &ChatClient,
    executor: &dyn ActionExecutor,
    history: &[ConversationTurn],
    turn: &ConversationTurn,
    stream: bool,
    cancel: &CancellationToken,
    on_chunk: F,
) -> Result<String, ChatError>
where
    F: FnMut(&str) + Send,
{
    let text = if stream {
        match chat.stream(history, turn, cancel, on_chunk).await {
            Ok(text) => text,
            Err(ChatError::Cancelled) => return Err(ChatError::Cancelled),
            Err(e) => {
                tracing::warn!(kind = %e.kind(), error = %e, "stream failed, retrying in batch mode");
                chat.send(history, turn, cancel).await?
            }
        }
    } else {
        chat.send(history, turn, cancel).await?
    };

    // Dropping the dispatches kills any action still running
    tokio::select! {
        biased;

        () = cancel.cancelled() => {
            tracing::debug!("turn cancelled during action dispatch");
            Err(ChatError::Cancelled)
        }
        resolved = actions::resolve(&text, executor) => Ok(resolved),
    }
}

fn apology(kind: FailureKind) -> String {
    let reason = match kind {
        FailureKind::Timeout => "the request timed out",
        FailureKind::Unreachable => "the server could not be reached",
        FailureKind::NoNetwork => "there is no network connection",
        FailureKind::ServerStatus => "the server returned an error",
        FailureKind::DecodeError => "the reply could not be read",
        FailureKind::Cancelled => "the request was cancelled",
        FailureKind::InvalidRequest => "the chat settings are incomplete",
    };
    format!("Sorry, I couldn't get a reply because {reason}.")
}

fn capture_notice(error: &CaptureError) -> String {
    match error {
        CaptureError::PermissionDenied => {
            "Microphone access was denied. Allow it and start again.".to_string()
        }
        CaptureError::DeviceBusy => "The microphone is in use.".to_string(),
        CaptureError::Route(message) => format!("The microphone stopped working ({message})."),
        CaptureError::Recognizer(message) => format!("Speech recognition failed ({message})."),
    }
}
