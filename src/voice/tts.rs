//! Text-to-speech (TTS) processing
//!
//! [`SpeechSynthesizer`] is the seam the playback component talks to.
//! [`CloudSynthesizer`] synthesizes through OpenAI or ElevenLabs and plays
//! the decoded audio on the default output device.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::playback::{AudioPlayback, PlaybackEnd, decode_mp3};
use crate::config::{Settings, TtsProvider, VoiceConfig};
use crate::{Error, Result};

/// Voice parameters for one utterance
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceParams {
    /// Backend to synthesize with
    pub provider: TtsProvider,
    /// Provider model identifier
    pub model: String,
    /// Voice identifier
    pub voice: String,
    /// Speaking rate multiplier
    pub rate: f32,
    /// Pitch multiplier
    pub pitch: f32,
}

impl From<&VoiceConfig> for VoiceParams {
    fn from(config: &VoiceConfig) -> Self {
        Self {
            provider: config.tts_provider,
            model: config.tts_model.clone(),
            voice: config.voice.clone(),
            rate: config.rate,
            pitch: config.pitch,
        }
    }
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self::from(&VoiceConfig::default())
    }
}

/// Lifecycle event emitted by a synthesizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsEvent {
    /// Audio started playing
    Started,
    /// Audio played to the end
    Finished,
    /// Playback was cancelled before the end
    Cancelled,
}

/// A speech synthesis engine
///
/// `speak` resolves once the utterance has finished, been cancelled, or
/// failed. A successful call emits `Started` (unless cancelled before audio
/// began) followed by exactly one of `Finished` or `Cancelled`.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync + 'static {
    /// Synthesize and play `text`
    ///
    /// # Errors
    ///
    /// Returns error if synthesis or playback fails
    async fn speak(
        &self,
        text: &str,
        params: &VoiceParams,
        events: mpsc::UnboundedSender<TtsEvent>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Synthesizer backed by `OpenAI` or `ElevenLabs`, played through cpal
#[derive(Debug, Clone)]
pub struct CloudSynthesizer {
    client: reqwest::Client,
    settings: Settings,
}

impl CloudSynthesizer {
    /// Create a synthesizer that reads API keys from settings per call
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }

    fn api_key(&self, provider: TtsProvider) -> Result<SecretString> {
        let keys = self.settings.snapshot().api_keys;
        match provider {
            TtsProvider::OpenAI => keys
                .openai
                .ok_or_else(|| Error::Config("OpenAI API key required for TTS".to_string())),
            TtsProvider::ElevenLabs => keys
                .elevenlabs
                .ok_or_else(|| Error::Config("ElevenLabs API key required for TTS".to_string())),
        }
    }

    /// Synthesize text to MP3 bytes
    ///
    /// # Errors
    ///
    /// Returns error if the key is missing or the provider rejects the request
    pub async fn synthesize(&self, text: &str, params: &VoiceParams) -> Result<Vec<u8>> {
        let api_key = self.api_key(params.provider)?;
        if (params.pitch - 1.0).abs() > f32::EPSILON {
            tracing::debug!(pitch = params.pitch, "pitch is not supported by this provider");
        }

        match params.provider {
            TtsProvider::OpenAI => self.synthesize_openai(text, params, &api_key).await,
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(text, params, &api_key).await,
        }
    }

    /// Synthesize using OpenAI TTS
    async fn synthesize_openai(
        &self,
        text: &str,
        params: &VoiceParams,
        api_key: &SecretString,
    ) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &params.model,
            input: text,
            voice: &params.voice,
            speed: params.rate.clamp(0.25, 4.0),
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .bearer_auth(api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }

    /// Synthesize using ElevenLabs TTS
    async fn synthesize_elevenlabs(
        &self,
        text: &str,
        params: &VoiceParams,
        api_key: &SecretString,
    ) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct VoiceSettings {
            speed: f32,
        }

        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
            voice_settings: VoiceSettings,
        }

        let url = format!("https://api.elevenlabs.io/v1/text-to-speech/{}", params.voice);

        // The OpenAI model default means nothing to ElevenLabs
        let model_id = if params.model.starts_with("eleven_") {
            params.model.as_str()
        } else {
            "eleven_monolingual_v1"
        };

        let request = ElevenLabsRequest {
            text,
            model_id,
            voice_settings: VoiceSettings {
                speed: params.rate.clamp(0.7, 1.2),
            },
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("ElevenLabs TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }
}

#[async_trait]
impl SpeechSynthesizer for CloudSynthesizer {
    async fn speak(
        &self,
        text: &str,
        params: &VoiceParams,
        events: mpsc::UnboundedSender<TtsEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let audio = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                let _ = events.send(TtsEvent::Cancelled);
                return Ok(());
            }
            audio = self.synthesize(text, params) => audio?,
        };

        let samples = decode_mp3(&audio)?;
        tracing::debug!(bytes = audio.len(), samples = samples.len(), "speech synthesized");

        let stop = Arc::new(AtomicBool::new(false));
        let player_stop = Arc::clone(&stop);
        let _stop_on_drop = StopOnDrop(Arc::clone(&stop));
        let mut player = tokio::task::spawn_blocking(move || {
            AudioPlayback::new()?.play_blocking(samples, &player_stop)
        });

        let _ = events.send(TtsEvent::Started);

        let joined = tokio::select! {
            () = cancel.cancelled() => {
                stop.store(true, Ordering::Release);
                (&mut player).await
            }
            joined = &mut player => joined,
        };

        let end = joined.map_err(|e| Error::Audio(format!("playback task failed: {e}")))??;
        let event = match end {
            PlaybackEnd::Completed => TtsEvent::Finished,
            PlaybackEnd::Stopped => TtsEvent::Cancelled,
        };
        let _ = events.send(event);
        Ok(())
    }
}

/// Raises the player's stop flag if the `speak` future is dropped early
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_follow_voice_config() {
        let config = VoiceConfig {
            voice: "nova".to_string(),
            rate: 1.25,
            ..VoiceConfig::default()
        };
        let params = VoiceParams::from(&config);
        assert_eq!(params.voice, "nova");
        assert!((params.rate - 1.25).abs() < f32::EPSILON);
        assert_eq!(params.provider, TtsProvider::OpenAI);
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let synth = CloudSynthesizer::new(Settings::default());
        let err = synth.synthesize("hi", &VoiceParams::default()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn cancelled_before_synthesis_emits_cancelled() {
        let synth = CloudSynthesizer::new(Settings::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        synth
            .speak("hi", &VoiceParams::default(), tx, cancel)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(TtsEvent::Cancelled));
    }
}
