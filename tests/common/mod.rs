//! Shared test utilities
//!
//! Fakes for the audio device, speech recognizer and speech synthesizer,
//! plus a local chat completions server.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use parley::voice::{
    AudioSource, MicEvent, RecognitionSession, RecognizerEvent, SpeechRecognizer,
    SpeechSynthesizer, TtsEvent, VoiceParams,
};
use parley::{CaptureError, Error, Result, Settings};

/// Time between two buffers from [`ScriptedSource`]
pub const BUFFER_PACING: Duration = Duration::from_millis(10);

/// A buffer well above any barge-in threshold
#[must_use]
pub fn loud() -> Vec<f32> {
    vec![0.5; 160]
}

/// A silent buffer
#[must_use]
pub fn quiet() -> Vec<f32> {
    vec![0.0; 160]
}

/// Audio source that plays a fixed script of buffers, then silence
///
/// The stream holds one buffer at a time and the next one is only produced
/// after the previous was consumed, so a consumer polling with `try_recv`
/// sees exactly one scripted buffer per poll.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    script: Vec<Vec<f32>>,
    deny: bool,
    opens: Arc<AtomicUsize>,
}

impl ScriptedSource {
    #[must_use]
    pub fn silent() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_script(script: Vec<Vec<f32>>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// A source whose every open fails with `PermissionDenied`
    #[must_use]
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    /// Number of successful opens
    #[must_use]
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl AudioSource for ScriptedSource {
    fn open(&self) -> std::result::Result<mpsc::Receiver<MicEvent>, CaptureError> {
        if self.deny {
            return Err(CaptureError::PermissionDenied);
        }
        self.opens.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(1);
        let script = self.script.clone();
        tokio::spawn(async move {
            for samples in script {
                if tx.send(MicEvent::Samples(samples)).await.is_err() {
                    return;
                }
                tokio::time::sleep(BUFFER_PACING).await;
            }
            while tx.send(MicEvent::Samples(quiet())).await.is_ok() {
                tokio::time::sleep(BUFFER_PACING).await;
            }
        });
        Ok(rx)
    }
}

/// Recognizer that replays one script of events per session
///
/// Events are spaced by `step`. After its script a session stays open,
/// consuming audio, until capture closes the audio sink.
#[derive(Clone)]
pub struct ScriptedRecognizer {
    scripts: Arc<Mutex<VecDeque<Vec<RecognizerEvent>>>>,
    step: Duration,
    sessions: Arc<AtomicUsize>,
}

impl ScriptedRecognizer {
    #[must_use]
    pub fn new(scripts: Vec<Vec<RecognizerEvent>>, step: Duration) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            step,
            sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sessions with a single growing partial transcript per phrase
    #[must_use]
    pub fn saying(phrases: &[&str], step: Duration) -> Self {
        let scripts = phrases
            .iter()
            .map(|phrase| {
                let words: Vec<&str> = phrase.split_whitespace().collect();
                (1..=words.len())
                    .map(|n| RecognizerEvent::Partial(words[..n].join(" ")))
                    .collect()
            })
            .collect();
        Self::new(scripts, step)
    }

    #[must_use]
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

impl SpeechRecognizer for ScriptedRecognizer {
    fn start_session(&self) -> Result<RecognitionSession> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();

        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<f32>>(512);
        let (events_tx, events_rx) = mpsc::channel(16);
        let step = self.step;

        tokio::spawn(async move {
            for event in script {
                tokio::time::sleep(step).await;
                if events_tx.send(event).await.is_err() {
                    return;
                }
            }
            while audio_rx.recv().await.is_some() {}
            drop(events_tx);
        });

        Ok(RecognitionSession {
            audio: audio_tx,
            events: events_rx,
        })
    }
}

/// Synthesizer that "plays" for a fixed duration and records what it said
#[derive(Clone)]
pub struct ScriptedSynthesizer {
    duration: Duration,
    fail: bool,
    spoken: Arc<Mutex<Vec<String>>>,
}

impl ScriptedSynthesizer {
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            fail: false,
            spoken: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A synthesizer whose engine always errors
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Duration::ZERO)
        }
    }

    /// Texts passed to `speak`, in order
    #[must_use]
    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynthesizer {
    async fn speak(
        &self,
        text: &str,
        _params: &VoiceParams,
        events: mpsc::UnboundedSender<TtsEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.spoken.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(Error::Tts("engine unavailable".to_string()));
        }

        let _ = events.send(TtsEvent::Started);
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = events.send(TtsEvent::Cancelled);
            }
            () = tokio::time::sleep(self.duration) => {
                let _ = events.send(TtsEvent::Finished);
            }
        }
        Ok(())
    }
}

/// How the mock chat server answers
#[derive(Clone)]
pub struct MockChat {
    /// Reply increments; batch responses send them joined
    pub chunks: Vec<String>,
    /// Answer every request with this status instead
    pub status: Option<u16>,
    /// Answer streaming requests with this status instead
    pub stream_status: Option<u16>,
    /// Wait this long before answering
    pub delay: Option<Duration>,
    hits: Arc<AtomicUsize>,
    stream_hits: Arc<AtomicUsize>,
}

impl MockChat {
    #[must_use]
    pub fn replying(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(ToString::to_string).collect(),
            status: None,
            stream_status: None,
            delay: None,
            hits: Arc::new(AtomicUsize::new(0)),
            stream_hits: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Total requests served
    #[must_use]
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Streaming requests served
    #[must_use]
    pub fn stream_hits(&self) -> usize {
        self.stream_hits.load(Ordering::SeqCst)
    }
}

async fn completions(State(mock): State<MockChat>, Json(body): Json<Value>) -> Response {
    mock.hits.fetch_add(1, Ordering::SeqCst);
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    if stream {
        mock.stream_hits.fetch_add(1, Ordering::SeqCst);
    }
    if let Some(delay) = mock.delay {
        tokio::time::sleep(delay).await;
    }

    let status = if stream {
        mock.stream_status.or(mock.status)
    } else {
        mock.status
    };
    if let Some(code) = status {
        let code = StatusCode::from_u16(code).unwrap();
        return (code, "upstream unavailable").into_response();
    }

    if stream {
        let mut out = String::from(": keep-alive\n\n");
        for chunk in &mock.chunks {
            let frame = json!({ "choices": [{ "delta": { "content": chunk } }] });
            out.push_str(&format!("data: {frame}\n\n"));
        }
        out.push_str("data: [DONE]\n\n");
        ([(header::CONTENT_TYPE, "text/event-stream")], out).into_response()
    } else {
        Json(json!({
            "choices": [{ "message": { "role": "assistant", "content": mock.chunks.concat() } }]
        }))
        .into_response()
    }
}

/// Serve `mock` on a local port; returns the completions URL
pub async fn spawn_chat_server(mock: MockChat) -> String {
    let app = Router::new()
        .route("/v1/chat/completions", post(completions))
        .with_state(mock);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/v1/chat/completions")
}

/// A server that accepts connections and drops them without answering
///
/// Returns the URL and a counter of accepted connections.
pub async fn spawn_dropping_server() -> (String, Arc<AtomicUsize>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(socket);
        }
    });
    (format!("http://{addr}/v1/chat/completions"), accepted)
}

/// A streaming server that sends `chunks` and then cuts the connection
///
/// The response is chunked and never terminated, so the client sees the
/// increments followed by a broken body. Returns the URL and a counter of
/// accepted connections.
pub async fn spawn_truncating_server(chunks: &[&str]) -> (String, Arc<AtomicUsize>) {
    let mut body = String::new();
    for chunk in chunks {
        let frame = json!({ "choices": [{ "delta": { "content": chunk } }] });
        body.push_str(&format!("data: {frame}\n\n"));
    }
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{body}\r\n",
        body.len()
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let response = response.clone();
            tokio::spawn(async move {
                read_request(&mut socket).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.flush().await;
            });
        }
    });
    (format!("http://{addr}/v1/chat/completions"), accepted)
}

/// Consume one HTTP request with a `content-length` body
async fn read_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let Ok(n) = socket.read(&mut chunk).await else { return };
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);

        let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
        let length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= head_end + 4 + length {
            return;
        }
    }
}

/// A local address nothing listens on
pub async fn closed_port() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Settings pointed at `endpoint`, with short voice timings for tests
#[must_use]
pub fn test_settings(endpoint: &str) -> Settings {
    let settings = Settings::default();
    let endpoint = endpoint.to_string();
    settings.update(|p| {
        p.chat.endpoint = endpoint;
        p.chat.model = "test-model".to_string();
        p.chat.system_prompt = None;
        p.chat.request_timeout = Duration::from_secs(5);
        p.chat.stream_idle_timeout = Duration::from_secs(5);
        p.listening.silence_timeout = Duration::from_millis(150);
        p.voice.barge_in_threshold = 0.55;
        p.voice.barge_in_samples = 3;
        p.voice.barge_in_interval = Duration::from_millis(20);
        p.voice.barge_in_warmup = Duration::from_millis(30);
    });
    settings
}
