//! Speech-to-text (STT) processing
//!
//! The capture pipeline only depends on [`SpeechRecognizer`]: push audio
//! buffers in, read partial and final transcripts out. [`HttpRecognizer`]
//! implements that contract on top of batch transcription APIs by
//! re-transcribing the growing utterance as voiced audio accumulates.

use futures::future::OptionFuture;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::capture::{SAMPLE_RATE, samples_to_wav};
use super::level::AudioLevelMeter;
use crate::config::{Settings, SttProvider};
use crate::{Error, Result};

/// Audio buffers queued towards the recognizer
const AUDIO_QUEUE_DEPTH: usize = 512;

/// Unvoiced audio kept ahead of the first voiced buffer (0.5 s)
const PRE_ROLL_SAMPLES: usize = SAMPLE_RATE as usize / 2;

/// Longest utterance sent for transcription (60 s)
const MAX_UTTERANCE_SAMPLES: usize = SAMPLE_RATE as usize * 60;

/// Event produced by a recognition session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    /// Growing transcript of the utterance so far
    Partial(String),
    /// The engine considers the utterance finished
    Final(String),
    /// The engine failed; no further events follow
    Error(String),
}

/// One live recognition session
///
/// Dropping `audio` tells the engine no more audio is coming.
#[derive(Debug)]
pub struct RecognitionSession {
    /// Sink for captured audio buffers
    pub audio: mpsc::Sender<Vec<f32>>,
    /// Transcript events
    pub events: mpsc::Receiver<RecognizerEvent>,
}

/// A speech recognition engine
pub trait SpeechRecognizer: Send + Sync + 'static {
    /// Start a new recognition session
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot accept audio
    fn start_session(&self) -> Result<RecognitionSession>;
}

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// Per-session transcription parameters, read from settings at session start
#[derive(Clone)]
struct TranscribeParams {
    provider: SttProvider,
    endpoint: String,
    model: String,
    api_key: SecretString,
}

/// Recognizer backed by Whisper-compatible or Deepgram batch APIs
#[derive(Debug, Clone)]
pub struct HttpRecognizer {
    client: reqwest::Client,
    settings: Settings,
}

impl HttpRecognizer {
    /// Create a recognizer that reads provider settings per session
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }

    fn params(&self) -> Result<(TranscribeParams, usize, f32)> {
        let prefs = self.settings.snapshot();
        let listening = prefs.listening;

        let api_key = match listening.stt_provider {
            SttProvider::Whisper => prefs.api_keys.openai,
            SttProvider::Deepgram => prefs.api_keys.deepgram,
        }
        .ok_or_else(|| Error::Config(format!("{:?} API key required for STT", listening.stt_provider)))?;

        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let interval_samples =
            (listening.partial_interval.as_secs_f32() * SAMPLE_RATE as f32) as usize;

        Ok((
            TranscribeParams {
                provider: listening.stt_provider,
                endpoint: listening.stt_endpoint,
                model: listening.stt_model,
                api_key,
            },
            interval_samples.max(1),
            listening.speech_threshold,
        ))
    }
}

impl SpeechRecognizer for HttpRecognizer {
    fn start_session(&self) -> Result<RecognitionSession> {
        let (params, interval_samples, threshold) = self.params()?;
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE_DEPTH);
        let (events_tx, events_rx) = mpsc::channel(32);

        let client = self.client.clone();
        tokio::spawn(run_session(
            client,
            params,
            interval_samples,
            threshold,
            audio_rx,
            events_tx,
        ));

        Ok(RecognitionSession {
            audio: audio_tx,
            events: events_rx,
        })
    }
}

/// Audio of the utterance being recognized
///
/// Before speech starts only a short pre-roll is kept. Once speech has
/// been heard audio accumulates up to a fixed cap; anything past the cap
/// is not transcribed.
#[derive(Debug)]
struct UtteranceBuffer {
    samples: Vec<f32>,
    heard_speech: bool,
    pre_roll: usize,
    max: usize,
}

impl UtteranceBuffer {
    const fn new(pre_roll: usize, max: usize) -> Self {
        Self {
            samples: Vec::new(),
            heard_speech: false,
            pre_roll,
            max,
        }
    }

    /// Append a buffer; returns how many of its samples were kept
    fn push(&mut self, chunk: &[f32], voiced: bool) -> usize {
        if !self.heard_speech && !voiced {
            self.samples.extend_from_slice(chunk);
            let excess = self.samples.len().saturating_sub(self.pre_roll);
            self.samples.drain(..excess);
            return 0;
        }

        self.heard_speech = true;
        let room = self.max.saturating_sub(self.samples.len());
        let kept = chunk.len().min(room);
        if kept < chunk.len() && room > 0 {
            tracing::debug!(max_samples = self.max, "utterance reached maximum length");
        }
        self.samples.extend_from_slice(&chunk[..kept]);
        kept
    }

    fn samples(&self) -> &[f32] {
        &self.samples
    }

    const fn heard_speech(&self) -> bool {
        self.heard_speech
    }
}

async fn run_session(
    client: reqwest::Client,
    params: TranscribeParams,
    interval_samples: usize,
    threshold: f32,
    mut audio_rx: mpsc::Receiver<Vec<f32>>,
    events_tx: mpsc::Sender<RecognizerEvent>,
) {
    let meter = AudioLevelMeter::default();
    let mut utterance = UtteranceBuffer::new(PRE_ROLL_SAMPLES, MAX_UTTERANCE_SAMPLES);
    let mut untranscribed_voiced = 0usize;
    let mut last_text = String::new();
    let mut pending: Option<JoinHandle<Result<String>>> = None;

    loop {
        tokio::select! {
            chunk = audio_rx.recv() => {
                let Some(chunk) = chunk else { break };

                let voiced = meter.level(&chunk) >= threshold;
                let kept = utterance.push(&chunk, voiced);
                if voiced {
                    untranscribed_voiced += kept;
                }

                // Re-transcribe once enough new speech has arrived, or as soon
                // as the speaker pauses with speech not yet transcribed
                let due = untranscribed_voiced >= interval_samples
                    || (!voiced && untranscribed_voiced > 0);
                if due && pending.is_none() {
                    untranscribed_voiced = 0;
                    pending = Some(spawn_transcription(&client, &params, utterance.samples()));
                }
            }
            Some(joined) = OptionFuture::from(pending.as_mut()), if pending.is_some() => {
                pending = None;
                match flatten(joined) {
                    Ok(text) => {
                        let text = text.trim().to_string();
                        if !text.is_empty() && text != last_text {
                            last_text.clone_from(&text);
                            if events_tx.send(RecognizerEvent::Partial(text)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "partial transcription failed");
                        let _ = events_tx.send(RecognizerEvent::Error(e.to_string())).await;
                        return;
                    }
                }
            }
        }
    }

    if let Some(handle) = pending.take() {
        handle.abort();
    }

    // Nobody is waiting for a final transcript
    if events_tx.is_closed() {
        return;
    }

    let event = if utterance.heard_speech() {
        match transcribe(&client, &params, utterance.samples()).await {
            Ok(text) => RecognizerEvent::Final(text.trim().to_string()),
            Err(e) => RecognizerEvent::Error(e.to_string()),
        }
    } else {
        RecognizerEvent::Final(String::new())
    };
    let _ = events_tx.send(event).await;
}

fn spawn_transcription(
    client: &reqwest::Client,
    params: &TranscribeParams,
    samples: &[f32],
) -> JoinHandle<Result<String>> {
    let client = client.clone();
    let params = params.clone();
    let samples = samples.to_vec();
    tokio::spawn(async move { transcribe(&client, &params, &samples).await })
}

fn flatten(joined: std::result::Result<Result<String>, tokio::task::JoinError>) -> Result<String> {
    joined.map_err(|e| Error::Stt(format!("transcription task failed: {e}")))?
}

/// Transcribe a complete buffer of 16kHz mono audio
async fn transcribe(
    client: &reqwest::Client,
    params: &TranscribeParams,
    samples: &[f32],
) -> Result<String> {
    let wav = samples_to_wav(samples, SAMPLE_RATE)?;
    match params.provider {
        SttProvider::Whisper => transcribe_whisper(client, params, wav).await,
        SttProvider::Deepgram => transcribe_deepgram(client, params, wav).await,
    }
}

/// Transcribe using OpenAI Whisper
async fn transcribe_whisper(
    client: &reqwest::Client,
    params: &TranscribeParams,
    audio: Vec<u8>,
) -> Result<String> {
    tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

    let form = reqwest::multipart::Form::new()
        .part(
            "file",
            reqwest::multipart::Part::bytes(audio)
                .file_name("audio.wav")
                .mime_str("audio/wav")
                .map_err(|e| Error::Stt(e.to_string()))?,
        )
        .text("model", params.model.clone());

    let response = client
        .post(&params.endpoint)
        .bearer_auth(params.api_key.expose_secret())
        .multipart(form)
        .send()
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Whisper request failed");
            e
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(status = %status, body = %body, "Whisper API error");
        return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
    }

    let result: WhisperResponse = response.json().await.map_err(|e| {
        tracing::error!(error = %e, "failed to parse response");
        e
    })?;

    tracing::debug!(transcript = %result.text, "transcription complete");
    Ok(result.text)
}

/// Transcribe using Deepgram
async fn transcribe_deepgram(
    client: &reqwest::Client,
    params: &TranscribeParams,
    audio: Vec<u8>,
) -> Result<String> {
    tracing::debug!(audio_bytes = audio.len(), "starting Deepgram transcription");

    let url = format!(
        "https://api.deepgram.com/v1/listen?model={}&punctuate=true",
        params.model
    );

    let response = client
        .post(&url)
        .header("Authorization", format!("Token {}", params.api_key.expose_secret()))
        .header("Content-Type", "audio/wav")
        .body(audio)
        .send()
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Deepgram request failed");
            e
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(status = %status, body = %body, "Deepgram API error");
        return Err(Error::Stt(format!("Deepgram API error {status}: {body}")));
    }

    let result: DeepgramResponse = response.json().await.map_err(|e| {
        tracing::error!(error = %e, "failed to parse Deepgram response");
        e
    })?;

    let transcript = result
        .results
        .channels
        .first()
        .and_then(|c| c.alternatives.first())
        .map(|a| a.transcript.clone())
        .unwrap_or_default();

    tracing::debug!(transcript = %transcript, "transcription complete");
    Ok(transcript)
}
