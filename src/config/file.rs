//! TOML configuration file loading
//!
//! Supports `~/.config/parley/config.toml` as a persistent config source.
//! All fields are optional — the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ParleyConfigFile {
    /// Model endpoint configuration
    #[serde(default)]
    pub chat: ChatFileConfig,

    /// Speech output and barge-in configuration
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Speech capture configuration
    #[serde(default)]
    pub listening: ListeningFileConfig,

    /// Action handler configuration
    #[serde(default)]
    pub actions: ActionsFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Chat endpoint configuration
#[derive(Debug, Default, Deserialize)]
pub struct ChatFileConfig {
    /// Chat completions URL
    pub endpoint: Option<String>,

    /// Model identifier (e.g. "gpt-4o-mini")
    pub model: Option<String>,

    /// Sampling temperature
    pub temperature: Option<f32>,

    /// Maximum output tokens
    pub max_tokens: Option<u32>,

    /// System prompt prepended to every request
    pub system_prompt: Option<String>,

    /// Use incremental streaming responses
    pub stream: Option<bool>,

    /// Batch request timeout in seconds
    pub request_timeout_secs: Option<u64>,

    /// Stream idle timeout in seconds
    pub stream_idle_timeout_secs: Option<u64>,

    /// Number of prior turns kept in the conversation history
    pub history_limit: Option<usize>,
}

/// Speech output configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// TTS provider ("openai" or "elevenlabs")
    pub tts_provider: Option<String>,

    /// TTS model (e.g. "tts-1")
    pub tts_model: Option<String>,

    /// TTS voice identifier (e.g. "alloy")
    pub voice: Option<String>,

    /// Speaking rate multiplier
    pub rate: Option<f32>,

    /// Pitch multiplier
    pub pitch: Option<f32>,

    /// Normalized level above which speech counts as barge-in
    pub barge_in_threshold: Option<f32>,

    /// Consecutive loud samples required to interrupt
    pub barge_in_samples: Option<u32>,

    /// Milliseconds between barge-in samples
    pub barge_in_interval_ms: Option<u64>,

    /// Milliseconds after playback starts before barge-in is armed
    pub barge_in_warmup_ms: Option<u64>,
}

/// Speech capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct ListeningFileConfig {
    /// STT provider ("whisper" or "deepgram")
    pub stt_provider: Option<String>,

    /// STT model (e.g. "whisper-1")
    pub stt_model: Option<String>,

    /// STT endpoint override (Whisper-compatible)
    pub stt_endpoint: Option<String>,

    /// Silence after the last transcript update that ends an utterance
    pub silence_timeout_ms: Option<u64>,

    /// Voiced audio between partial transcriptions
    pub partial_interval_ms: Option<u64>,

    /// Normalized level that counts as speech
    pub speech_threshold: Option<f32>,
}

/// Action handler configuration
#[derive(Debug, Default, Deserialize)]
pub struct ActionsFileConfig {
    /// Directory holding action handler scripts
    pub dir: Option<String>,

    /// Handler timeout in seconds
    pub timeout_secs: Option<u64>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub chat: Option<String>,
    pub openai: Option<String>,
    pub elevenlabs: Option<String>,
    pub deepgram: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ParleyConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ParleyConfigFile {
    config_file_path().map_or_else(ParleyConfigFile::default, |path| load_from(&path))
}

/// Load a TOML config file from an explicit path
pub fn load_from(path: &Path) -> ParleyConfigFile {
    if !path.exists() {
        return ParleyConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::debug!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ParleyConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ParleyConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/parley/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("parley").join("config.toml"))
}
