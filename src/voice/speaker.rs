//! Speech playback with barge-in
//!
//! While a reply is playing, a low-rate level sampler watches the
//! microphone. Sustained speech energy interrupts playback. Each `speak`
//! call resolves exactly once: either `on_complete` or `on_interrupt`
//! fires, never both.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::level::AudioLevelMeter;
use super::microphone::{MicEvent, MicLease, MicUse, Microphone};
use super::prosody::normalize_for_speech;
use super::tts::{SpeechSynthesizer, TtsEvent, VoiceParams};
use crate::config::Settings;

/// Counts consecutive loud samples
///
/// A single spike (a click, an echo of our own audio) resets as soon as the
/// level drops, so only sustained speech reaches `required`.
#[derive(Debug, Clone)]
pub struct BargeInDetector {
    threshold: f32,
    required: u32,
    consecutive: u32,
}

impl BargeInDetector {
    /// `required` is clamped to at least one sample
    #[must_use]
    pub fn new(threshold: f32, required: u32) -> Self {
        Self {
            threshold,
            required: required.max(1),
            consecutive: 0,
        }
    }

    /// Feed one sampled level; returns true once speech is sustained
    pub fn observe(&mut self, level: f32) -> bool {
        if level > self.threshold {
            self.consecutive = self.consecutive.saturating_add(1);
        } else {
            self.consecutive = 0;
        }
        self.consecutive >= self.required
    }

    /// Forget any partial run
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Current run of loud samples
    #[must_use]
    pub const fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Lifecycle of one spoken reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Speaking,
    Cancelled,
    Completed,
}

/// Snapshot of a playback
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSession {
    /// Text handed to the synthesizer, after normalization
    pub utterance_text: String,
    pub state: PlaybackState,
    /// Whether the barge-in sampler is running
    pub interrupt_armed: bool,
}

/// Handle to a `speak` call
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    id: u64,
    session: Arc<Mutex<PlaybackSession>>,
}

impl PlaybackHandle {
    /// Playback identifier
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Current state of the playback
    #[must_use]
    pub fn session(&self) -> PlaybackSession {
        lock(&self.session).clone()
    }
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Completed,
    Interrupted,
}

/// The two mutually exclusive playback callbacks
///
/// Whoever resolves first takes both closures; the loser gets nothing.
struct ExclusiveOutcome {
    callbacks: Mutex<Option<(Callback, Callback)>>,
}

impl ExclusiveOutcome {
    fn new(on_complete: Callback, on_interrupt: Callback) -> Self {
        Self {
            callbacks: Mutex::new(Some((on_complete, on_interrupt))),
        }
    }

    fn resolve(&self, resolution: Resolution) -> Option<Callback> {
        let mut guard = lock(&self.callbacks);
        let (on_complete, on_interrupt) = guard.take()?;
        Some(match resolution {
            Resolution::Completed => on_complete,
            Resolution::Interrupted => on_interrupt,
        })
    }
}

/// State shared between `SpeechPlayback` and the playback task
struct ActivePlayback {
    id: u64,
    cancel: CancellationToken,
    outcome: ExclusiveOutcome,
    session: Arc<Mutex<PlaybackSession>>,
    sampler: Mutex<Option<MicLease>>,
}

impl ActivePlayback {
    /// Release the microphone, record the final state, then run the winning callback
    fn finish(&self, resolution: Resolution) -> bool {
        // Releasing first lets the next capture claim the microphone from
        // inside the callback.
        drop(lock(&self.sampler).take());

        let Some(callback) = self.outcome.resolve(resolution) else {
            return false;
        };

        {
            let mut session = lock(&self.session);
            session.interrupt_armed = false;
            session.state = match resolution {
                Resolution::Completed => PlaybackState::Completed,
                Resolution::Interrupted => PlaybackState::Cancelled,
            };
        }

        tracing::debug!(playback = self.id, ?resolution, "playback resolved");
        callback();
        true
    }
}

type Slot = Arc<Mutex<Option<Arc<ActivePlayback>>>>;

/// Speaks replies and listens for the user talking over them
pub struct SpeechPlayback {
    synth: Arc<dyn SpeechSynthesizer>,
    mic: Microphone,
    settings: Settings,
    meter: AudioLevelMeter,
    next_id: AtomicU64,
    active: Slot,
}

impl SpeechPlayback {
    /// Create a playback component
    #[must_use]
    pub fn new(synth: Arc<dyn SpeechSynthesizer>, mic: Microphone, settings: Settings) -> Self {
        Self {
            synth,
            mic,
            settings,
            meter: AudioLevelMeter::default(),
            next_id: AtomicU64::new(1),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether a reply is currently playing
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Speak `text`
    ///
    /// Exactly one of `on_complete` or `on_interrupt` fires, once. A reply
    /// that is already playing is stopped first (its `on_interrupt` fires).
    pub fn speak<C, I>(&self, text: &str, on_complete: C, on_interrupt: I) -> PlaybackHandle
    where
        C: FnOnce() + Send + 'static,
        I: FnOnce() + Send + 'static,
    {
        self.stop();

        let prefs = self.settings.snapshot();
        let params = VoiceParams::from(&prefs.voice);
        let barge_in = BargeInConfig {
            threshold: prefs.voice.barge_in_threshold,
            required: prefs.voice.barge_in_samples,
            interval: prefs.voice.barge_in_interval.max(Duration::from_millis(1)),
            warmup: prefs.voice.barge_in_warmup,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let normalized = normalize_for_speech(text);
        let session = Arc::new(Mutex::new(PlaybackSession {
            utterance_text: normalized.clone(),
            state: PlaybackState::Speaking,
            interrupt_armed: false,
        }));

        let active = Arc::new(ActivePlayback {
            id,
            cancel: CancellationToken::new(),
            outcome: ExclusiveOutcome::new(Box::new(on_complete), Box::new(on_interrupt)),
            session: Arc::clone(&session),
            sampler: Mutex::new(None),
        });
        *lock(&self.active) = Some(Arc::clone(&active));

        tracing::info!(playback = id, text = %normalized, "speaking");

        let task = PlaybackTask {
            active,
            slot: Arc::clone(&self.active),
            synth: Arc::clone(&self.synth),
            mic: self.mic.clone(),
            meter: self.meter,
            barge_in,
        };
        tokio::spawn(task.run(normalized, params));

        PlaybackHandle { id, session }
    }

    /// Stop the current reply as if the user had interrupted it
    ///
    /// Returns false when nothing was playing.
    pub fn stop(&self) -> bool {
        let Some(active) = lock(&self.active).take() else {
            return false;
        };
        active.cancel.cancel();
        tracing::debug!(playback = active.id, "playback stopped");
        active.finish(Resolution::Interrupted)
    }
}

impl Drop for SpeechPlayback {
    fn drop(&mut self) {
        if let Some(active) = lock(&self.active).take() {
            active.cancel.cancel();
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BargeInConfig {
    threshold: f32,
    required: u32,
    interval: Duration,
    warmup: Duration,
}

struct PlaybackTask {
    active: Arc<ActivePlayback>,
    slot: Slot,
    synth: Arc<dyn SpeechSynthesizer>,
    mic: Microphone,
    meter: AudioLevelMeter,
    barge_in: BargeInConfig,
}

impl PlaybackTask {
    async fn run(self, text: String, params: VoiceParams) {
        let resolution = if text.is_empty() {
            Resolution::Completed
        } else {
            self.play(&text, &params).await
        };
        self.conclude(resolution);
    }

    async fn play(&self, text: &str, params: &VoiceParams) -> Resolution {
        let id = self.active.id;
        let cancel = self.active.cancel.clone();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let speaking = self.synth.speak(text, params, events_tx, cancel.clone());
        tokio::pin!(speaking);

        let mut detector = BargeInDetector::new(self.barge_in.threshold, self.barge_in.required);
        let mut arm_at: Option<Instant> = None;
        let mut ticker: Option<Interval> = None;
        let mut events_open = true;

        loop {
            let arm = tokio::time::sleep_until(arm_at.unwrap_or_else(Instant::now));

            tokio::select! {
                biased;

                () = cancel.cancelled() => return Resolution::Interrupted,

                result = &mut speaking => {
                    if let Err(e) = result {
                        tracing::warn!(playback = id, error = %e, "speech engine failed, treating as complete");
                    }
                    return Resolution::Completed;
                }

                event = events_rx.recv(), if events_open => match event {
                    Some(TtsEvent::Started) => {
                        tracing::debug!(playback = id, "audio started");
                        if arm_at.is_none() && ticker.is_none() {
                            arm_at = Some(Instant::now() + self.barge_in.warmup);
                        }
                    }
                    Some(event) => tracing::debug!(playback = id, ?event, "engine event"),
                    None => events_open = false,
                },

                () = arm, if arm_at.is_some() => {
                    arm_at = None;
                    ticker = self.arm();
                }

                _ = tick(&mut ticker), if ticker.is_some() => {
                    match self.sample_level() {
                        Some(level) => {
                            if detector.observe(level) {
                                tracing::info!(playback = id, level, "barge-in detected");
                                cancel.cancel();
                                return Resolution::Interrupted;
                            }
                        }
                        None => {
                            tracing::debug!(playback = id, "level sampler closed, barge-in disabled");
                            ticker = None;
                        }
                    }
                }
            }
        }
    }

    /// Claim the microphone for level sampling
    fn arm(&self) -> Option<Interval> {
        {
            // stop() cancels and then empties this slot, so holding the lock
            // across the claim means the lease is either never taken or
            // visible to stop()
            let mut sampler = lock(&self.active.sampler);
            if self.active.cancel.is_cancelled() {
                return None;
            }
            match self.mic.claim(MicUse::LevelSampler) {
                Ok(lease) => *sampler = Some(lease),
                Err(e) => {
                    tracing::debug!(playback = self.active.id, error = %e, "barge-in unavailable");
                    return None;
                }
            }
        }
        lock(&self.active.session).interrupt_armed = true;
        tracing::debug!(playback = self.active.id, "barge-in armed");

        let interval = self.barge_in.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(ticker)
    }

    /// Level of everything buffered since the last sample
    ///
    /// `None` when the sampler's stream has ended.
    fn sample_level(&self) -> Option<f32> {
        let mut guard = lock(&self.active.sampler);
        let receiver = guard.as_mut()?.receiver_mut()?;

        let mut window: Vec<f32> = Vec::new();
        let mut closed = false;
        loop {
            match receiver.try_recv() {
                Ok(MicEvent::Samples(samples)) => window.extend_from_slice(&samples),
                Ok(MicEvent::Failed(message)) => {
                    tracing::warn!(error = %message, "level sampler failed");
                    closed = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    closed = true;
                    break;
                }
            }
        }

        if closed {
            drop(guard.take());
            lock(&self.active.session).interrupt_armed = false;
            return None;
        }
        Some(self.meter.level(&window))
    }

    fn conclude(&self, resolution: Resolution) {
        {
            let mut slot = lock(&self.slot);
            if slot.as_ref().is_some_and(|a| a.id == self.active.id) {
                *slot = None;
            }
        }
        self.active.finish(resolution);
    }
}

async fn tick(ticker: &mut Option<Interval>) -> Instant {
    match ticker {
        Some(ticker) => ticker.tick().await,
        None => std::future::pending().await,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
