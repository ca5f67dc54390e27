//! Chat completions client
//!
//! Every call reads endpoint, model, and generation parameters from
//! [`Settings`] so a change takes effect on the very next request.

use std::time::Instant;

use futures::StreamExt;
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::retry::{RetryPolicy, delay_for_attempt, pause, with_backoff};
use super::stream::{StreamEvent, StreamParser};
use super::types::{ChatRequest, ChatResponse, ConversationTurn, WireMessage};
use crate::config::{Preferences, Settings};
use crate::error::ChatError;

/// Longest error body kept in a `Status` error
const MAX_ERROR_BODY: usize = 512;

/// Bookkeeping for one streamed request
#[derive(Debug, Clone)]
pub struct StreamSession {
    /// Identifier shared by every attempt of the request
    pub request_id: Uuid,
    /// Zero-based attempt number
    pub attempt: u32,
    /// Increments delivered so far
    pub chunks: usize,
    /// When the attempt started
    pub started: Instant,
}

impl StreamSession {
    fn new(request_id: Uuid, attempt: u32) -> Self {
        Self {
            request_id,
            attempt,
            chunks: 0,
            started: Instant::now(),
        }
    }
}

/// Client for an OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    settings: Settings,
    retry: RetryPolicy,
}

impl ChatClient {
    /// Create a client that reads its configuration from `settings`
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Request the whole reply at once
    ///
    /// Transient failures are retried with backoff.
    ///
    /// # Errors
    ///
    /// Returns the classified failure once retries are exhausted, or
    /// immediately for non-transient failures
    pub async fn send(
        &self,
        history: &[ConversationTurn],
        new_turn: &ConversationTurn,
        cancel: &CancellationToken,
    ) -> Result<String, ChatError> {
        let prefs = self.settings.snapshot();
        validate(&prefs)?;

        let request = build_request(&prefs, history, new_turn, false);
        let request_id = Uuid::new_v4();
        tracing::debug!(%request_id, model = %prefs.chat.model, turns = request.messages.len(), "chat request");

        let text = with_backoff(&self.retry, cancel, |attempt| {
            self.send_once(&prefs, &request, request_id, attempt, cancel)
        })
        .await?;

        tracing::info!(%request_id, chars = text.len(), "chat reply received");
        Ok(text)
    }

    async fn send_once(
        &self,
        prefs: &Preferences,
        request: &ChatRequest<'_>,
        request_id: Uuid,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<String, ChatError> {
        tracing::debug!(%request_id, attempt, "sending batch request");

        let exchange = async {
            let response = self
                .post(prefs, request)
                .timeout(prefs.chat.request_timeout)
                .send()
                .await
                .map_err(|e| ChatError::from_transport(&e))?;
            let response = check_status(response).await?;

            let body = response
                .text()
                .await
                .map_err(|e| ChatError::from_transport(&e))?;
            let parsed: ChatResponse =
                serde_json::from_str(&body).map_err(|e| ChatError::Decode(e.to_string()))?;

            parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message)
                .and_then(|m| m.content)
                .ok_or_else(|| ChatError::Decode("response has no message content".to_string()))
        };

        tokio::select! {
            biased;

            () = cancel.cancelled() => Err(ChatError::Cancelled),
            result = exchange => result,
        }
    }

    /// Request the reply incrementally
    ///
    /// Each text increment is passed to `on_chunk` in order as it arrives;
    /// the accumulated text is returned when the stream ends. Transient
    /// failures before any text was delivered are retried with backoff.
    /// Once text has been delivered a failure is returned as-is.
    ///
    /// # Errors
    ///
    /// Returns the classified failure
    pub async fn stream<F>(
        &self,
        history: &[ConversationTurn],
        new_turn: &ConversationTurn,
        cancel: &CancellationToken,
        mut on_chunk: F,
    ) -> Result<String, ChatError>
    where
        F: FnMut(&str) + Send,
    {
        let prefs = self.settings.snapshot();
        validate(&prefs)?;

        let request = build_request(&prefs, history, new_turn, true);
        let request_id = Uuid::new_v4();
        let attempts = self.retry.max_attempts.max(1);
        tracing::debug!(%request_id, model = %prefs.chat.model, turns = request.messages.len(), "chat stream request");

        let mut attempt = 0;
        loop {
            let mut session = StreamSession::new(request_id, attempt);
            match self
                .stream_once(&prefs, &request, &mut session, cancel, &mut on_chunk)
                .await
            {
                Ok(text) => {
                    tracing::info!(
                        %request_id,
                        attempt,
                        chunks = session.chunks,
                        elapsed_ms = session.started.elapsed().as_millis(),
                        "chat stream complete"
                    );
                    return Ok(text);
                }
                Err(e) if e.is_transient() && session.chunks == 0 && attempt + 1 < attempts => {
                    let delay = delay_for_attempt(&self.retry, attempt);
                    tracing::warn!(
                        %request_id,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        kind = %e.kind(),
                        delay_ms = delay.as_millis(),
                        "transient stream failure, retrying"
                    );
                    pause(delay, cancel).await?;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        %request_id,
                        attempt,
                        chunks = session.chunks,
                        kind = %e.kind(),
                        error = %e,
                        "chat stream failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn stream_once<F>(
        &self,
        prefs: &Preferences,
        request: &ChatRequest<'_>,
        session: &mut StreamSession,
        cancel: &CancellationToken,
        on_chunk: &mut F,
    ) -> Result<String, ChatError>
    where
        F: FnMut(&str) + Send,
    {
        let idle = prefs.chat.stream_idle_timeout;

        let send = tokio::time::timeout(idle, self.post(prefs, request).send());
        let response = tokio::select! {
            biased;

            () = cancel.cancelled() => return Err(ChatError::Cancelled),
            sent = send => sent
                .map_err(|_| ChatError::Timeout)?
                .map_err(|e| ChatError::from_transport(&e))?,
        };
        let response = check_status(response).await?;

        let mut body = response.bytes_stream();
        let mut parser = StreamParser::new();
        let mut text = String::new();

        loop {
            let read = tokio::select! {
                biased;

                () = cancel.cancelled() => return Err(ChatError::Cancelled),
                read = tokio::time::timeout(idle, body.next()) => read,
            };

            let events = match read {
                Err(_) => {
                    tracing::debug!(request_id = %session.request_id, "stream idle timeout");
                    return Err(ChatError::Timeout);
                }
                Ok(Some(Ok(bytes))) => parser.feed(&bytes),
                Ok(Some(Err(e))) => return Err(ChatError::from_transport(&e)),
                Ok(None) => {
                    let events = parser.finish();
                    if !parser.is_finished() {
                        tracing::debug!(request_id = %session.request_id, "stream closed without end marker");
                    }
                    deliver(events, &mut text, session, on_chunk);
                    break;
                }
            };

            if deliver(events, &mut text, session, on_chunk) {
                break;
            }
        }

        if parser.skipped() > 0 {
            tracing::debug!(request_id = %session.request_id, skipped = parser.skipped(), "skipped undecodable frames");
        }
        Ok(text)
    }

    fn post(&self, prefs: &Preferences, request: &ChatRequest<'_>) -> reqwest::RequestBuilder {
        let builder = self.http.post(&prefs.chat.endpoint).json(request);
        match &prefs.api_keys.chat {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }
}

/// Append increments to `text` and forward them; returns true at end of stream
fn deliver<F>(
    events: Vec<StreamEvent>,
    text: &mut String,
    session: &mut StreamSession,
    on_chunk: &mut F,
) -> bool
where
    F: FnMut(&str),
{
    for event in events {
        match event {
            StreamEvent::Delta(delta) => {
                text.push_str(&delta);
                session.chunks += 1;
                on_chunk(&delta);
            }
            StreamEvent::Done => return true,
        }
    }
    false
}

fn validate(prefs: &Preferences) -> Result<(), ChatError> {
    if prefs.chat.endpoint.trim().is_empty() {
        return Err(ChatError::InvalidRequest("no endpoint configured".to_string()));
    }
    if prefs.chat.model.trim().is_empty() {
        return Err(ChatError::InvalidRequest("no model configured".to_string()));
    }
    Ok(())
}

fn build_request<'a>(
    prefs: &'a Preferences,
    history: &[ConversationTurn],
    new_turn: &ConversationTurn,
    stream: bool,
) -> ChatRequest<'a> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    if let Some(prompt) = &prefs.chat.system_prompt {
        messages.push(WireMessage::from(&ConversationTurn::system(prompt.clone())));
    }
    messages.extend(history.iter().map(WireMessage::from));
    messages.push(WireMessage::from(new_turn));

    ChatRequest {
        model: &prefs.chat.model,
        messages,
        temperature: prefs.chat.temperature,
        max_tokens: prefs.chat.max_tokens,
        stream,
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ChatError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY)
            .rev()
            .find(|&i| body.is_char_boundary(i))
            .unwrap_or(0);
        body.truncate(cut);
    }

    tracing::error!(status = %status, body = %body, "chat endpoint error");
    Err(ChatError::Status {
        code: status.as_u16(),
        body,
    })
}
