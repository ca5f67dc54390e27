//! Configuration management for Parley
//!
//! `Preferences` is the resolved configuration (env > toml > default).
//! `Settings` is the shared, read-mostly store handed to every component;
//! components call [`Settings::snapshot`] at the start of each request so a
//! change made mid-conversation applies to the very next turn.

pub mod file;

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use secrecy::SecretString;

use file::ParleyConfigFile;

/// Default chat completions endpoint
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

/// Default Whisper-compatible transcription endpoint
pub const DEFAULT_STT_ENDPOINT: &str = "https://api.openai.com/v1/audio/transcriptions";

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct Preferences {
    /// Model endpoint configuration
    pub chat: ChatConfig,

    /// Speech output and barge-in configuration
    pub voice: VoiceConfig,

    /// Speech capture configuration
    pub listening: ListeningConfig,

    /// Action handler configuration
    pub actions: ActionsConfig,

    /// API keys
    pub api_keys: ApiKeys,
}

/// Chat endpoint configuration
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Chat completions URL
    pub endpoint: String,

    /// Model identifier
    pub model: String,

    /// Sampling temperature
    pub temperature: f32,

    /// Maximum output tokens
    pub max_tokens: u32,

    /// System prompt, sent as the first turn when non-empty
    pub system_prompt: Option<String>,

    /// Use incremental streaming responses
    pub stream: bool,

    /// Whole-request timeout in batch mode
    pub request_timeout: Duration,

    /// Maximum gap between stream reads
    pub stream_idle_timeout: Duration,

    /// Number of prior turns kept in the conversation history
    pub history_limit: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 512,
            system_prompt: Some(
                "You are a helpful voice assistant. Keep responses short and conversational."
                    .to_string(),
            ),
            stream: true,
            request_timeout: Duration::from_secs(30),
            stream_idle_timeout: Duration::from_secs(20),
            history_limit: 20,
        }
    }
}

/// TTS backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TtsProvider {
    #[default]
    OpenAI,
    ElevenLabs,
}

/// STT backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SttProvider {
    #[default]
    Whisper,
    Deepgram,
}

/// Speech output configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// TTS backend
    pub tts_provider: TtsProvider,

    /// TTS model
    pub tts_model: String,

    /// TTS voice identifier
    pub voice: String,

    /// Speaking rate multiplier (0.25 to 4.0)
    pub rate: f32,

    /// Pitch multiplier
    pub pitch: f32,

    /// Barge-in sensitivity: normalized level that counts as user speech
    pub barge_in_threshold: f32,

    /// Consecutive loud samples required to interrupt
    pub barge_in_samples: u32,

    /// Interval between barge-in samples
    pub barge_in_interval: Duration,

    /// Delay after playback starts before barge-in is armed
    pub barge_in_warmup: Duration,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            tts_provider: TtsProvider::OpenAI,
            tts_model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            rate: 1.0,
            pitch: 1.0,
            barge_in_threshold: 0.55,
            barge_in_samples: 3,
            barge_in_interval: Duration::from_millis(100),
            barge_in_warmup: Duration::from_millis(600),
        }
    }
}

/// Speech capture configuration
#[derive(Debug, Clone)]
pub struct ListeningConfig {
    /// STT backend
    pub stt_provider: SttProvider,

    /// STT model
    pub stt_model: String,

    /// Whisper-compatible transcription URL
    pub stt_endpoint: String,

    /// Silence after the last transcript update that ends an utterance
    pub silence_timeout: Duration,

    /// Voiced audio accumulated between partial transcriptions
    pub partial_interval: Duration,

    /// Normalized level that counts as speech
    pub speech_threshold: f32,
}

impl Default for ListeningConfig {
    fn default() -> Self {
        Self {
            stt_provider: SttProvider::Whisper,
            stt_model: "whisper-1".to_string(),
            stt_endpoint: DEFAULT_STT_ENDPOINT.to_string(),
            silence_timeout: Duration::from_millis(1200),
            partial_interval: Duration::from_millis(700),
            speech_threshold: 0.25,
        }
    }
}

/// Action handler configuration
#[derive(Debug, Clone)]
pub struct ActionsConfig {
    /// Directory holding `<name>.<ext>` handler scripts
    pub dir: PathBuf,

    /// Handler timeout
    pub timeout: Duration,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            dir: default_actions_dir(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// Bearer token for the chat endpoint
    pub chat: Option<SecretString>,

    /// `OpenAI` key (Whisper STT and TTS)
    pub openai: Option<SecretString>,

    /// `ElevenLabs` key (optional TTS)
    pub elevenlabs: Option<SecretString>,

    /// Deepgram key (optional STT)
    pub deepgram: Option<SecretString>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            chat: ChatConfig::default(),
            voice: VoiceConfig::default(),
            listening: ListeningConfig::default(),
            actions: ActionsConfig::default(),
            api_keys: ApiKeys::default(),
        }
    }
}

impl Preferences {
    /// Load preferences from the environment and the standard config file
    #[must_use]
    pub fn load() -> Self {
        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Resolve preferences from a parsed file and an environment lookup
    ///
    /// Precedence is env > toml > default.
    #[must_use]
    pub fn from_sources<E>(fc: ParleyConfigFile, env: E) -> Self
    where
        E: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let openai = env("OPENAI_API_KEY").or(fc.api_keys.openai);
        let api_keys = ApiKeys {
            chat: env("PARLEY_API_KEY")
                .or(fc.api_keys.chat)
                .or_else(|| openai.clone())
                .map(SecretString::from),
            openai: openai.map(SecretString::from),
            elevenlabs: env("ELEVENLABS_API_KEY")
                .or(fc.api_keys.elevenlabs)
                .map(SecretString::from),
            deepgram: env("DEEPGRAM_API_KEY")
                .or(fc.api_keys.deepgram)
                .map(SecretString::from),
        };

        let chat = ChatConfig {
            endpoint: env("PARLEY_ENDPOINT")
                .or(fc.chat.endpoint)
                .unwrap_or(defaults.chat.endpoint),
            model: env("PARLEY_MODEL")
                .or(fc.chat.model)
                .unwrap_or(defaults.chat.model),
            temperature: env_parse(&env, "PARLEY_TEMPERATURE")
                .or(fc.chat.temperature)
                .unwrap_or(defaults.chat.temperature),
            max_tokens: env_parse(&env, "PARLEY_MAX_TOKENS")
                .or(fc.chat.max_tokens)
                .unwrap_or(defaults.chat.max_tokens),
            system_prompt: env("PARLEY_SYSTEM_PROMPT")
                .or(fc.chat.system_prompt)
                .or(defaults.chat.system_prompt)
                .filter(|p| !p.trim().is_empty()),
            stream: fc.chat.stream.unwrap_or(defaults.chat.stream),
            request_timeout: fc
                .chat
                .request_timeout_secs
                .map_or(defaults.chat.request_timeout, Duration::from_secs),
            stream_idle_timeout: fc
                .chat
                .stream_idle_timeout_secs
                .map_or(defaults.chat.stream_idle_timeout, Duration::from_secs),
            history_limit: fc.chat.history_limit.unwrap_or(defaults.chat.history_limit),
        };

        let tts_provider = match fc.voice.tts_provider.as_deref() {
            Some(p) if p.eq_ignore_ascii_case("elevenlabs") => TtsProvider::ElevenLabs,
            _ => TtsProvider::OpenAI,
        };
        let voice = VoiceConfig {
            tts_provider,
            tts_model: env("PARLEY_TTS_MODEL")
                .or(fc.voice.tts_model)
                .unwrap_or(defaults.voice.tts_model),
            voice: env("PARLEY_TTS_VOICE")
                .or(fc.voice.voice)
                .unwrap_or(defaults.voice.voice),
            rate: env_parse(&env, "PARLEY_TTS_RATE")
                .or(fc.voice.rate)
                .unwrap_or(defaults.voice.rate)
                .clamp(0.25, 4.0),
            pitch: env_parse(&env, "PARLEY_TTS_PITCH")
                .or(fc.voice.pitch)
                .unwrap_or(defaults.voice.pitch),
            barge_in_threshold: env_parse(&env, "PARLEY_BARGE_IN_THRESHOLD")
                .or(fc.voice.barge_in_threshold)
                .unwrap_or(defaults.voice.barge_in_threshold)
                .clamp(0.0, 1.0),
            barge_in_samples: fc
                .voice
                .barge_in_samples
                .unwrap_or(defaults.voice.barge_in_samples)
                .max(1),
            barge_in_interval: fc
                .voice
                .barge_in_interval_ms
                .map_or(defaults.voice.barge_in_interval, Duration::from_millis),
            barge_in_warmup: fc
                .voice
                .barge_in_warmup_ms
                .map_or(defaults.voice.barge_in_warmup, Duration::from_millis),
        };

        let stt_provider = match fc.listening.stt_provider.as_deref() {
            Some(p) if p.eq_ignore_ascii_case("deepgram") => SttProvider::Deepgram,
            _ => SttProvider::Whisper,
        };
        let listening = ListeningConfig {
            stt_provider,
            stt_model: env("PARLEY_STT_MODEL")
                .or(fc.listening.stt_model)
                .unwrap_or(defaults.listening.stt_model),
            stt_endpoint: fc
                .listening
                .stt_endpoint
                .unwrap_or(defaults.listening.stt_endpoint),
            silence_timeout: env_parse(&env, "PARLEY_SILENCE_TIMEOUT_MS")
                .or(fc.listening.silence_timeout_ms)
                .map_or(defaults.listening.silence_timeout, Duration::from_millis),
            partial_interval: fc
                .listening
                .partial_interval_ms
                .map_or(defaults.listening.partial_interval, Duration::from_millis),
            speech_threshold: fc
                .listening
                .speech_threshold
                .unwrap_or(defaults.listening.speech_threshold),
        };

        let actions = ActionsConfig {
            dir: env("PARLEY_ACTIONS_DIR")
                .or(fc.actions.dir)
                .map_or(defaults.actions.dir, PathBuf::from),
            timeout: fc
                .actions
                .timeout_secs
                .map_or(defaults.actions.timeout, Duration::from_secs),
        };

        Self {
            chat,
            voice,
            listening,
            actions,
            api_keys,
        }
    }
}

/// Shared configuration store
///
/// Cloning is cheap; all clones observe the same values.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    inner: Arc<RwLock<Preferences>>,
}

impl Settings {
    /// Wrap resolved preferences
    #[must_use]
    pub fn new(preferences: Preferences) -> Self {
        Self {
            inner: Arc::new(RwLock::new(preferences)),
        }
    }

    /// Load from the environment and the standard config file
    #[must_use]
    pub fn load() -> Self {
        Self::new(Preferences::load())
    }

    /// Latest values
    #[must_use]
    pub fn snapshot(&self) -> Preferences {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Mutate the stored preferences in place
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut Preferences),
    {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }

    /// Replace the stored preferences with a fresh load from env and file
    pub fn reload(&self) {
        let fresh = Preferences::load();
        self.update(|p| *p = fresh);
        tracing::info!("settings reloaded");
    }
}

/// Parse an environment value, ignoring anything malformed
fn env_parse<T, E>(env: &E, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    E: Fn(&str) -> Option<String>,
{
    env(key).and_then(|v| v.trim().parse().ok())
}

/// Default action handler directory: `~/.config/parley/actions/`
fn default_actions_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".config/parley/actions"),
        |d| d.config_dir().join("parley").join("actions"),
    )
}
