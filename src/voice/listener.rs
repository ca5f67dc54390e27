//! Endpointed speech capture
//!
//! A capture session owns the microphone, streams audio to the recognizer,
//! and finalizes the utterance once the transcript has stopped changing for
//! the configured silence timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::level::AudioLevelMeter;
use super::microphone::{MicEvent, MicLease, MicUse, Microphone};
use super::stt::{RecognitionSession, RecognizerEvent, SpeechRecognizer};
use crate::config::Settings;
use crate::error::CaptureError;

/// Transcript of one user turn
///
/// A finalized utterance is never modified; it is delivered exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    text: String,
    finalized: bool,
}

impl Utterance {
    fn finalized(text: String) -> Self {
        Self {
            text,
            finalized: true,
        }
    }

    fn in_progress(text: String) -> Self {
        Self {
            text,
            finalized: false,
        }
    }

    /// Transcript text
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether endpointing completed
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Whether the transcript has no words
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Take the transcript text
    #[must_use]
    pub fn into_text(self) -> String {
        self.text
    }
}

/// Outcome delivered to the `start` callback
pub type CaptureOutcome = Result<Utterance, CaptureError>;

/// Callback invoked once when a capture session ends on its own
pub type UtteranceCallback = Box<dyn FnOnce(CaptureOutcome) + Send + 'static>;

/// Handle to a capture session
///
/// Two handles are equal when they refer to the same session.
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    id: u64,
    level: watch::Receiver<f32>,
    transcript: watch::Receiver<String>,
}

impl PartialEq for CaptureHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CaptureHandle {}

impl CaptureHandle {
    /// Session identifier
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Latest normalized input level
    #[must_use]
    pub fn level(&self) -> f32 {
        *self.level.borrow()
    }

    /// Latest partial transcript
    #[must_use]
    pub fn transcript(&self) -> String {
        self.transcript.borrow().clone()
    }

    /// Subscribe to level updates
    #[must_use]
    pub fn watch_level(&self) -> watch::Receiver<f32> {
        self.level.clone()
    }

    /// Subscribe to partial transcript updates
    #[must_use]
    pub fn watch_transcript(&self) -> watch::Receiver<String> {
        self.transcript.clone()
    }
}

struct ActiveSession {
    handle: CaptureHandle,
    cancel: CancellationToken,
    // Held for ownership only; released when the session leaves the slot
    _lease: MicLease,
}

type Slot = Arc<Mutex<Option<ActiveSession>>>;

/// Turns microphone audio into finalized utterances
pub struct SpeechCapture {
    mic: Microphone,
    recognizer: Arc<dyn SpeechRecognizer>,
    settings: Settings,
    meter: AudioLevelMeter,
    next_id: AtomicU64,
    active: Slot,
}

impl SpeechCapture {
    /// Create a capture component
    #[must_use]
    pub fn new(mic: Microphone, recognizer: Arc<dyn SpeechRecognizer>, settings: Settings) -> Self {
        Self {
            mic,
            recognizer,
            settings,
            meter: AudioLevelMeter::default(),
            next_id: AtomicU64::new(1),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether a session currently owns the microphone
    #[must_use]
    pub fn is_active(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Start listening
    ///
    /// If a session is already active its handle is returned and
    /// `on_utterance` is dropped unused. Failures to open the microphone or
    /// the recognizer are delivered through `on_utterance`, never returned.
    pub fn start<F>(&self, on_utterance: F) -> CaptureHandle
    where
        F: FnOnce(CaptureOutcome) + Send + 'static,
    {
        let mut slot = lock(&self.active);
        if let Some(session) = slot.as_ref() {
            tracing::debug!(session = session.handle.id, "capture already active");
            return session.handle.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (level_tx, level_rx) = watch::channel(0.0_f32);
        let (transcript_tx, transcript_rx) = watch::channel(String::new());
        let handle = CaptureHandle {
            id,
            level: level_rx,
            transcript: transcript_rx,
        };

        let mut lease = match self.mic.claim(MicUse::Capture) {
            Ok(lease) => lease,
            Err(e) => {
                drop(slot);
                tracing::warn!(session = id, error = %e, "capture could not claim microphone");
                on_utterance(Err(e));
                return handle;
            }
        };

        let session = match self.recognizer.start_session() {
            Ok(session) => session,
            Err(e) => {
                drop(lease);
                drop(slot);
                tracing::warn!(session = id, error = %e, "recognizer failed to start");
                on_utterance(Err(CaptureError::Recognizer(e.to_string())));
                return handle;
            }
        };

        let Some(mic_rx) = lease.take_receiver() else {
            drop(lease);
            drop(slot);
            on_utterance(Err(CaptureError::Route("microphone stream unavailable".to_string())));
            return handle;
        };

        let cancel = CancellationToken::new();
        *slot = Some(ActiveSession {
            handle: handle.clone(),
            cancel: cancel.clone(),
            _lease: lease,
        });
        drop(slot);

        let silence_timeout = self.settings.snapshot().listening.silence_timeout;
        tracing::debug!(session = id, ?silence_timeout, "capture started");

        let task = CaptureTask {
            id,
            meter: self.meter,
            silence_timeout,
            level_tx,
            transcript_tx,
            cancel,
            active: Arc::clone(&self.active),
        };
        tokio::spawn(task.run(mic_rx, session, Box::new(on_utterance)));

        handle
    }

    /// Stop the active session, if any
    ///
    /// Returns the in-progress transcript (not finalized) when it has words.
    /// The session's callback does not fire.
    pub fn stop(&self) -> Option<Utterance> {
        let session = lock(&self.active).take()?;
        session.cancel.cancel();

        let text = session.handle.transcript();
        tracing::debug!(session = session.handle.id, "capture stopped");
        drop(session);

        (!text.trim().is_empty()).then(|| Utterance::in_progress(text))
    }
}

impl Drop for SpeechCapture {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.active).take() {
            session.cancel.cancel();
        }
    }
}

struct CaptureTask {
    id: u64,
    meter: AudioLevelMeter,
    silence_timeout: Duration,
    level_tx: watch::Sender<f32>,
    transcript_tx: watch::Sender<String>,
    cancel: CancellationToken,
    active: Slot,
}

impl CaptureTask {
    async fn run(
        self,
        mut mic_rx: mpsc::Receiver<MicEvent>,
        session: RecognitionSession,
        on_utterance: UtteranceCallback,
    ) {
        let RecognitionSession { audio, mut events } = session;
        let outcome = self.pump(&mut mic_rx, &audio, &mut events).await;

        // Closing the sink lets the recognizer wind down
        drop(audio);
        drop(mic_rx);

        // Whoever removes the session from the slot owns its ending; if stop()
        // got there first the callback must not fire.
        {
            let mut slot = lock(&self.active);
            if slot.as_ref().is_some_and(|s| s.handle.id == self.id) {
                *slot = None;
            } else {
                return;
            }
        }

        if let Some(outcome) = outcome {
            match &outcome {
                Ok(u) => tracing::info!(session = self.id, text = %u.text, "utterance finalized"),
                Err(e) => tracing::warn!(session = self.id, error = %e, "capture failed"),
            }
            on_utterance(outcome);
        }
    }

    async fn pump(
        &self,
        mic_rx: &mut mpsc::Receiver<MicEvent>,
        audio: &mpsc::Sender<Vec<f32>>,
        events: &mut mpsc::Receiver<RecognizerEvent>,
    ) -> Option<CaptureOutcome> {
        let mut transcript = String::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let silence = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now));

            tokio::select! {
                biased;

                () = self.cancel.cancelled() => return None,

                event = events.recv() => match event {
                    Some(RecognizerEvent::Partial(text)) => {
                        tracing::trace!(session = self.id, text = %text, "partial transcript");
                        self.transcript_tx.send_replace(text.clone());
                        transcript = text;
                        deadline = Some(Instant::now() + self.silence_timeout);
                    }
                    Some(RecognizerEvent::Final(text)) => {
                        let text = if text.trim().is_empty() { transcript } else { text };
                        return Some(Ok(Utterance::finalized(text)));
                    }
                    Some(RecognizerEvent::Error(message)) => {
                        if transcript.trim().is_empty() {
                            return Some(Err(CaptureError::Recognizer(message)));
                        }
                        tracing::debug!(session = self.id, error = %message, "recognizer failed, keeping transcript");
                        return Some(Ok(Utterance::finalized(transcript)));
                    }
                    None => return Some(Ok(Utterance::finalized(transcript))),
                },

                event = mic_rx.recv() => match event {
                    Some(MicEvent::Samples(samples)) => {
                        self.level_tx.send_replace(self.meter.level(&samples));
                        if audio.try_send(samples).is_err() {
                            tracing::trace!(session = self.id, "recognizer queue full, dropping buffer");
                        }
                    }
                    Some(MicEvent::Failed(message)) => {
                        return Some(Err(CaptureError::Route(message)));
                    }
                    None => {
                        return Some(Err(CaptureError::Route("microphone stream closed".to_string())));
                    }
                },

                () = silence, if deadline.is_some() && !transcript.trim().is_empty() => {
                    tracing::debug!(session = self.id, "silence timeout reached");
                    return Some(Ok(Utterance::finalized(transcript)));
                }
            }
        }
    }
}

fn lock(slot: &Mutex<Option<ActiveSession>>) -> MutexGuard<'_, Option<ActiveSession>> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
