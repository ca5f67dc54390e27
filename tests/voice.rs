//! Voice pipeline integration tests
//!
//! Tests capture and playback without requiring audio hardware

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use parley::voice::{
    MicUse, PlaybackState, RecognizerEvent, SAMPLE_RATE, SpeechCapture, SpeechPlayback,
    samples_to_wav,
};
use parley::{CaptureError, Microphone, Settings};
use tokio::sync::mpsc;

mod common;
use common::{ScriptedRecognizer, ScriptedSource, ScriptedSynthesizer, loud, quiet, test_settings};

const STEP: Duration = Duration::from_millis(100);

/// Generate sine wave audio samples
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

fn capture_settings() -> Settings {
    let settings = test_settings("http://127.0.0.1:9/unused");
    settings.update(|p| p.listening.silence_timeout = Duration::from_millis(1200));
    settings
}

fn playback_settings() -> Settings {
    let settings = test_settings("http://127.0.0.1:9/unused");
    settings.update(|p| {
        p.voice.barge_in_samples = 3;
        p.voice.barge_in_interval = Duration::from_millis(100);
        p.voice.barge_in_warmup = Duration::from_millis(50);
    });
    settings
}

#[test]
fn test_samples_to_wav() {
    let samples = generate_sine_samples(440.0, 0.1, 0.5);
    let wav_data = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

    // Check WAV header magic
    assert_eq!(&wav_data[0..4], b"RIFF");
    assert_eq!(&wav_data[8..12], b"WAVE");

    // WAV should have reasonable size
    assert!(wav_data.len() > 44); // WAV header is 44 bytes
}

#[test]
fn test_wav_roundtrip() {
    let original_samples: Vec<f32> = vec![0.0, 0.5, -0.5, 1.0, -1.0, 0.25];
    let wav_data = samples_to_wav(&original_samples, SAMPLE_RATE).unwrap();

    let cursor = Cursor::new(wav_data);
    let mut reader = hound::WavReader::new(cursor).unwrap();

    let spec = reader.spec();
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.channels, 1);

    let read_samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(read_samples.len(), original_samples.len());
}

#[tokio::test(start_paused = true)]
async fn test_silence_finalizes_last_partial() {
    let source = ScriptedSource::silent();
    let mic = Microphone::new(source.clone());
    let recognizer = ScriptedRecognizer::saying(&["what's the weather"], STEP);
    let capture = SpeechCapture::new(mic.clone(), Arc::new(recognizer), capture_settings());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = capture.start(move |outcome| tx.send(outcome).unwrap());
    assert!(capture.is_active());
    assert_eq!(mic.owner(), Some(MicUse::Capture));

    let outcome = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let utterance = outcome.unwrap();
    assert!(utterance.is_finalized());
    assert_eq!(utterance.text(), "what's the weather");
    assert_eq!(handle.transcript(), "what's the weather");

    // Exactly one delivery, and the microphone is free again
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(rx.try_recv().is_err());
    assert!(!capture.is_active());
    assert_eq!(mic.owner(), None);
}

#[tokio::test(start_paused = true)]
async fn test_partials_keep_the_session_open() {
    // Words arrive 1s apart, just under the 1.2s silence timeout
    let recognizer = ScriptedRecognizer::saying(&["one two three four"], Duration::from_secs(1));
    let capture = SpeechCapture::new(
        Microphone::new(ScriptedSource::silent()),
        Arc::new(recognizer),
        capture_settings(),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    capture.start(move |outcome| tx.send(outcome).unwrap());

    let outcome = rx.recv().await.unwrap().unwrap();
    assert_eq!(outcome.text(), "one two three four");
}

#[tokio::test(start_paused = true)]
async fn test_recognizer_final_ends_the_utterance() {
    let recognizer = ScriptedRecognizer::new(
        vec![vec![
            RecognizerEvent::Partial("turn on".to_string()),
            RecognizerEvent::Final("turn on the lights".to_string()),
        ]],
        STEP,
    );
    let capture = SpeechCapture::new(
        Microphone::new(ScriptedSource::silent()),
        Arc::new(recognizer),
        capture_settings(),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    capture.start(move |outcome| tx.send(outcome).unwrap());

    let started = tokio::time::Instant::now();
    let outcome = rx.recv().await.unwrap().unwrap();
    assert_eq!(outcome.text(), "turn on the lights");
    assert!(started.elapsed() < Duration::from_millis(1200));
}

#[tokio::test(start_paused = true)]
async fn test_start_is_idempotent() {
    let source = ScriptedSource::silent();
    let recognizer = ScriptedRecognizer::saying(&["hello"], STEP);
    let capture = SpeechCapture::new(
        Microphone::new(source.clone()),
        Arc::new(recognizer.clone()),
        capture_settings(),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let tx2 = tx.clone();
    let first = capture.start(move |outcome| tx.send(outcome).unwrap());
    let second = capture.start(move |outcome| tx2.send(outcome).unwrap());

    assert_eq!(first, second);
    assert_eq!(first.id(), second.id());
    assert_eq!(source.opens(), 1);
    assert_eq!(recognizer.sessions(), 1);

    assert_eq!(rx.recv().await.unwrap().unwrap().text(), "hello");
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_stop_returns_partial_without_callback() {
    let recognizer = ScriptedRecognizer::new(
        vec![vec![RecognizerEvent::Partial("remind me".to_string())]],
        STEP,
    );
    let mic = Microphone::new(ScriptedSource::silent());
    let capture = SpeechCapture::new(mic.clone(), Arc::new(recognizer), capture_settings());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = capture.start(move |outcome| tx.send(outcome).unwrap());

    let mut transcript = handle.watch_transcript();
    transcript.changed().await.unwrap();

    let utterance = capture.stop().unwrap();
    assert_eq!(utterance.text(), "remind me");
    assert!(!utterance.is_finalized());
    assert_eq!(mic.owner(), None);

    // Stopping again is a no-op
    assert!(capture.stop().is_none());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_is_reported_through_callback() {
    let recognizer = ScriptedRecognizer::saying(&["hello"], STEP);
    let capture = SpeechCapture::new(
        Microphone::new(ScriptedSource::denied()),
        Arc::new(recognizer.clone()),
        capture_settings(),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    capture.start(move |outcome| tx.send(outcome).unwrap());

    assert_eq!(rx.recv().await.unwrap(), Err(CaptureError::PermissionDenied));
    assert!(!capture.is_active());
    assert_eq!(recognizer.sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_recognizer_error_without_words_is_terminal() {
    let recognizer = ScriptedRecognizer::new(
        vec![vec![RecognizerEvent::Error("engine crashed".to_string())]],
        STEP,
    );
    let capture = SpeechCapture::new(
        Microphone::new(ScriptedSource::silent()),
        Arc::new(recognizer),
        capture_settings(),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    capture.start(move |outcome| tx.send(outcome).unwrap());

    assert!(matches!(
        rx.recv().await.unwrap(),
        Err(CaptureError::Recognizer(message)) if message == "engine crashed"
    ));
}

/// Speak with callbacks that report which one fired
fn speak_and_report(
    playback: &SpeechPlayback,
    text: &str,
) -> (parley::voice::PlaybackHandle, mpsc::UnboundedReceiver<&'static str>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let interrupted = tx.clone();
    let handle = playback.speak(
        text,
        move || tx.send("completed").unwrap(),
        move || interrupted.send("interrupted").unwrap(),
    );
    (handle, rx)
}

#[tokio::test(start_paused = true)]
async fn test_short_burst_does_not_barge_in() {
    // One sample short of the required run, then quiet
    let source = ScriptedSource::with_script(vec![loud(), loud(), quiet(), loud(), quiet()]);
    let mic = Microphone::new(source);
    let synth = ScriptedSynthesizer::new(Duration::from_secs(2));
    let playback = SpeechPlayback::new(Arc::new(synth), mic.clone(), playback_settings());

    let (handle, mut rx) = speak_and_report(&playback, "Here is a long answer");

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(handle.session().interrupt_armed);
    assert_eq!(mic.owner(), Some(MicUse::LevelSampler));

    assert_eq!(rx.recv().await, Some("completed"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(rx.try_recv().is_err());

    let session = handle.session();
    assert_eq!(session.state, PlaybackState::Completed);
    assert!(!session.interrupt_armed);
    assert_eq!(mic.owner(), None);
}

#[tokio::test(start_paused = true)]
async fn test_sustained_speech_barges_in() {
    let source = ScriptedSource::with_script(vec![loud(), loud(), loud()]);
    let mic = Microphone::new(source);
    let synth = ScriptedSynthesizer::new(Duration::from_secs(2));
    let playback = SpeechPlayback::new(Arc::new(synth), mic.clone(), playback_settings());

    let started = tokio::time::Instant::now();
    let (handle, mut rx) = speak_and_report(&playback, "Here is a long answer");

    assert_eq!(rx.recv().await, Some("interrupted"));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(mic.owner(), None);
    assert!(!playback.is_speaking());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(handle.session().state, PlaybackState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_no_barge_in_during_warmup() {
    let source = ScriptedSource::with_script(vec![loud(), loud(), loud()]);
    let synth = ScriptedSynthesizer::new(Duration::from_millis(30));
    let playback = SpeechPlayback::new(
        Arc::new(synth),
        Microphone::new(source.clone()),
        playback_settings(),
    );

    let (_handle, mut rx) = speak_and_report(&playback, "Short.");
    assert_eq!(rx.recv().await, Some("completed"));
    assert_eq!(source.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_fires_interrupt_once() {
    let synth = ScriptedSynthesizer::new(Duration::from_secs(2));
    let playback = SpeechPlayback::new(
        Arc::new(synth),
        Microphone::new(ScriptedSource::silent()),
        playback_settings(),
    );

    let (handle, mut rx) = speak_and_report(&playback, "Talking");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(playback.stop());
    assert_eq!(rx.try_recv(), Ok("interrupted"));
    assert!(!playback.stop());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(handle.session().state, PlaybackState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_new_reply_interrupts_the_previous_one() {
    let synth = ScriptedSynthesizer::new(Duration::from_millis(500));
    let playback = SpeechPlayback::new(
        Arc::new(synth.clone()),
        Microphone::new(ScriptedSource::silent()),
        playback_settings(),
    );

    let (_first, mut first_rx) = speak_and_report(&playback, "First");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (_second, mut second_rx) = speak_and_report(&playback, "Second");

    assert_eq!(first_rx.recv().await, Some("interrupted"));
    assert_eq!(second_rx.recv().await, Some("completed"));
    assert_eq!(synth.spoken(), vec!["First.", "Second."]);
}

#[tokio::test(start_paused = true)]
async fn test_engine_failure_counts_as_completion() {
    let synth = ScriptedSynthesizer::failing();
    let playback = SpeechPlayback::new(
        Arc::new(synth.clone()),
        Microphone::new(ScriptedSource::silent()),
        playback_settings(),
    );

    let (handle, mut rx) = speak_and_report(&playback, "Anything");
    assert_eq!(rx.recv().await, Some("completed"));
    assert_eq!(handle.session().state, PlaybackState::Completed);
    assert_eq!(synth.spoken().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_always_frees_the_microphone() {
    let settings = playback_settings();
    settings.update(|p| p.voice.barge_in_warmup = Duration::ZERO);

    for round in 0..200_u64 {
        let mic = Microphone::new(ScriptedSource::silent());
        let synth = ScriptedSynthesizer::new(Duration::from_secs(5));
        let playback = SpeechPlayback::new(Arc::new(synth), mic.clone(), settings.clone());

        let (_handle, _rx) = speak_and_report(&playback, "Talking");
        // Land the stop at different points around arming
        std::thread::sleep(Duration::from_micros(round % 7 * 50));
        playback.stop();

        assert_eq!(mic.owner(), None, "round {round}");
        let lease = mic.claim(MicUse::Capture);
        assert!(lease.is_ok(), "round {round}: {:?}", lease.err());
    }
}
