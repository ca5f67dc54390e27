//! Voice processing module
//!
//! Handles microphone ownership, endpointed capture, STT and TTS
//! collaborators, and playback with barge-in.

mod capture;
mod level;
mod listener;
mod microphone;
mod playback;
mod prosody;
mod speaker;
mod stt;
mod tts;

pub use capture::{CpalSource, SAMPLE_RATE, samples_to_wav};
pub use level::{AudioLevelMeter, DEFAULT_FLOOR_DB, calculate_rms};
pub use listener::{CaptureHandle, CaptureOutcome, SpeechCapture, Utterance, UtteranceCallback};
pub use microphone::{AudioSource, MicEvent, MicLease, MicUse, Microphone};
pub use playback::{AudioPlayback, PLAYBACK_SAMPLE_RATE, PlaybackEnd, decode_mp3, resample, tone};
pub use prosody::normalize_for_speech;
pub use speaker::{BargeInDetector, PlaybackHandle, PlaybackSession, PlaybackState, SpeechPlayback};
pub use stt::{HttpRecognizer, RecognitionSession, RecognizerEvent, SpeechRecognizer};
pub use tts::{CloudSynthesizer, SpeechSynthesizer, TtsEvent, VoiceParams};
