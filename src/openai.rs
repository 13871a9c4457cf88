use crate::config::ClientConfig;
use crate::recording::{ApiRecorder, PlaybackState};
use crate::streaming::{
    classify_line, ChunkStream, HttpChunkStream, LineBuffer, PlaybackChunkStream, SseLine,
    DONE_SENTINEL,
};
use crate::types::*;
use crate::{utils, CompletionProvider, StreamingCallback};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIModelList {
    data: Vec<OpenAIModel>,
}

#[derive(Debug, Deserialize)]
struct OpenAIModel {
    id: String,
}

/// Rate limit information extracted from response headers
#[derive(Debug, Default)]
pub struct OpenAIRateLimitInfo {
    requests_limit: Option<u32>,
    requests_remaining: Option<u32>,
    requests_reset: Option<Duration>,
    tokens_limit: Option<u32>,
    tokens_remaining: Option<u32>,
    tokens_reset: Option<Duration>,
    retry_after: Option<Duration>,
}

/// Parse OpenAI's reset format ("1s", "6m0s", "120ms")
fn parse_reset_duration(value: &str) -> Option<Duration> {
    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut chars = value.trim().chars().peekable();
    let mut parsed_any = false;

    while let Some(c) = chars.next() {
        match c {
            '0'..='9' | '.' => number.push(c),
            'h' | 'm' | 's' => {
                let unit_nanos = if c == 'm' && chars.peek() == Some(&'s') {
                    chars.next();
                    1e6
                } else {
                    match c {
                        'h' => 3600e9,
                        'm' => 60e9,
                        _ => 1e9,
                    }
                };
                let amount: f64 = number.parse().ok()?;
                total += Duration::from_nanos((amount * unit_nanos).round() as u64);
                number.clear();
                parsed_any = true;
            }
            _ => return None,
        }
    }

    parsed_any.then_some(total)
}

impl RateLimitHandler for OpenAIRateLimitInfo {
    fn from_response(response: &Response) -> Self {
        let headers = response.headers();
        let header = |name: &str| headers.get(name).and_then(|h| h.to_str().ok());

        Self {
            requests_limit: header("x-ratelimit-limit-requests").and_then(|s| s.parse().ok()),
            requests_remaining: header("x-ratelimit-remaining-requests")
                .and_then(|s| s.parse().ok()),
            requests_reset: header("x-ratelimit-reset-requests").and_then(parse_reset_duration),
            tokens_limit: header("x-ratelimit-limit-tokens").and_then(|s| s.parse().ok()),
            tokens_remaining: header("x-ratelimit-remaining-tokens").and_then(|s| s.parse().ok()),
            tokens_reset: header("x-ratelimit-reset-tokens").and_then(parse_reset_duration),
            retry_after: header("retry-after")
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs),
        }
    }

    fn get_retry_delay(&self) -> Duration {
        [self.retry_after, self.requests_reset, self.tokens_reset]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(Duration::from_secs(2))
    }

    fn log_status(&self) {
        let show = |v: Option<u32>| v.map_or("?".to_string(), |v| v.to_string());
        debug!(
            "Rate limits - Requests: {}/{} (reset in: {}s), Tokens: {}/{} (reset in: {}s)",
            show(self.requests_remaining),
            show(self.requests_limit),
            self.requests_reset.map_or(0, |d| d.as_secs()),
            show(self.tokens_remaining),
            show(self.tokens_limit),
            self.tokens_reset.map_or(0, |d| d.as_secs()),
        );
    }
}

/// Decodes a streamed completion into text fragments
#[derive(Default)]
struct StreamDecoder {
    lines: LineBuffer,
    text: String,
    done: bool,
}

impl StreamDecoder {
    fn push(
        &mut self,
        chunk: &[u8],
        callback: &StreamingCallback,
        recorder: Option<&ApiRecorder>,
    ) -> Result<()> {
        for line in self.lines.push(chunk) {
            self.process_line(&line, callback, recorder)?;
            if self.done {
                break;
            }
        }
        Ok(())
    }

    fn finish(
        &mut self,
        callback: &StreamingCallback,
        recorder: Option<&ApiRecorder>,
    ) -> Result<()> {
        if let Some(line) = self.lines.finish() {
            if !self.done {
                self.process_line(&line, callback, recorder)?;
            }
        }
        Ok(())
    }

    fn process_line(
        &mut self,
        line: &str,
        callback: &StreamingCallback,
        recorder: Option<&ApiRecorder>,
    ) -> Result<()> {
        let data = match classify_line(line) {
            SseLine::Other => return Ok(()),
            SseLine::Done => {
                record(recorder, DONE_SENTINEL);
                self.done = true;
                return Ok(());
            }
            SseLine::Data(data) => data,
        };
        record(recorder, data);

        let event = match serde_json::from_str::<OpenAIStreamResponse>(data) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping malformed stream event '{}': {}", data, e);
                return Ok(());
            }
        };
        debug!("Received stream event: '{}'", data);

        if let Some(choice) = event.choices.first() {
            if let Some(content) = choice.delta.content.as_deref().filter(|c| !c.is_empty()) {
                self.text.push_str(content);
                callback(content).map_err(ClientError::Callback)?;
            }
            if let Some(reason) = &choice.finish_reason {
                debug!("Completion finished: {}", reason);
            }
        }
        Ok(())
    }
}

fn record(recorder: Option<&ApiRecorder>, data: &str) {
    if let Some(recorder) = recorder {
        if let Err(e) = recorder.record_chunk(data) {
            warn!("Failed to record chunk: {}", e);
        }
    }
}

fn parse_completion_body(body: &str) -> Result<String> {
    let response: OpenAIResponse = serde_json::from_str(body)
        .map_err(|e| ApiError::Unknown(format!("Failed to parse response: {e}")))?;
    Ok(response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .unwrap_or_default())
}

/// Client for OpenAI-compatible chat completion endpoints
pub struct OpenAIClient {
    client: Client,
    config: ClientConfig,
    recorder: Option<ApiRecorder>,
    playback: Option<PlaybackState>,
}

impl OpenAIClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            client: Client::new(),
            config,
            recorder: None,
            playback: None,
        }
    }

    pub fn from_env() -> Self {
        Self::new(ClientConfig::from_env())
    }

    /// Record every request and its streamed events to `recording_path`
    pub fn with_recorder<P: AsRef<std::path::Path>>(self, recording_path: P) -> Self {
        self.with_api_recorder(ApiRecorder::new(recording_path))
    }

    /// Record through an existing recorder, which may be shared with the caller
    pub fn with_api_recorder(mut self, recorder: ApiRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Answer requests from recorded sessions instead of the network
    pub fn with_playback(mut self, playback_state: PlaybackState) -> Self {
        self.playback = Some(playback_state);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send `messages` and return the completion.
    ///
    /// With a callback the response is streamed and every text fragment is
    /// passed to it in arrival order. Cancelling `cancel` stops reading and
    /// returns what has arrived so far.
    pub async fn send_messages(
        &self,
        messages: &[ChatMessage],
        streaming_callback: Option<&StreamingCallback>,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse> {
        if messages.is_empty() {
            return Err(ClientError::Config(
                "At least one message is required".to_string(),
            ));
        }

        if let Some(playback) = &self.playback {
            return self
                .playback_request(playback, streaming_callback, cancel)
                .await;
        }

        let api_key = self.config.require_api_key()?;
        debug!("API key available: true");

        let request = OpenAIRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            stream: streaming_callback.is_some(),
        };
        debug!(
            "Sending completion request: model={}, messages={}, stream={}",
            request.model,
            messages.len(),
            request.stream
        );

        if let Some(recorder) = &self.recorder {
            recorder.start_recording(serde_json::to_value(&request)?)?;
        }

        let result = self
            .send_request(api_key, &request, streaming_callback, cancel)
            .await;

        if let Some(recorder) = &self.recorder {
            // Only sessions that produced a real response are worth replaying
            let saved = match &result {
                Ok(response) if !response.fallback => recorder.end_recording(),
                _ => recorder.discard_recording(),
            };
            if let Err(e) = saved {
                warn!("Failed to save recording: {}", e);
            }
        }

        result
    }

    async fn send_request(
        &self,
        api_key: &str,
        request: &OpenAIRequest<'_>,
        streaming_callback: Option<&StreamingCallback>,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse> {
        let send = self
            .client
            .post(self.config.endpoint("chat/completions"))
            .bearer_auth(api_key)
            .header("Content-Type", "application/json")
            .json(request)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Request cancelled before response headers");
                return Ok(CompletionResponse {
                    cancelled: true,
                    ..Default::default()
                });
            }
            response = send => response.map_err(|e| ApiError::NetworkError(e.to_string()))?,
        };

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let rate_limits = OpenAIRateLimitInfo::from_response(&response);
            rate_limits.log_status();
            warn!(
                "Rate limited by the API (retry in {}s), using fallback response",
                rate_limits.get_retry_delay().as_secs()
            );
            return self
                .rate_limit_fallback(request.messages, streaming_callback, cancel)
                .await;
        }

        let response = utils::check_response_error(response).await?;
        OpenAIRateLimitInfo::from_response(&response).log_status();

        match streaming_callback {
            Some(callback) => {
                let mut chunk_stream = HttpChunkStream::new(response);
                self.process_chunk_stream(
                    &mut chunk_stream,
                    callback,
                    cancel,
                    self.recorder.as_ref(),
                )
                .await
            }
            None => self.read_complete_body(response, cancel).await,
        }
    }

    async fn read_complete_body(
        &self,
        response: Response,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse> {
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(CompletionResponse {
                    cancelled: true,
                    ..Default::default()
                });
            }
            body = response.text() => body.map_err(|e| ApiError::NetworkError(e.to_string()))?,
        };

        if let Some(recorder) = &self.recorder {
            record(Some(recorder), &body);
        }

        Ok(CompletionResponse::complete(parse_completion_body(&body)?))
    }

    async fn process_chunk_stream(
        &self,
        chunk_stream: &mut dyn ChunkStream,
        callback: &StreamingCallback,
        cancel: &CancellationToken,
        recorder: Option<&ApiRecorder>,
    ) -> Result<CompletionResponse> {
        let mut decoder = StreamDecoder::default();
        let mut response = CompletionResponse::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Stream cancelled after {} bytes of text", decoder.text.len());
                    response.cancelled = true;
                    break;
                }
                next = chunk_stream.next_chunk() => next,
            };

            match next {
                Ok(Some(chunk)) => {
                    decoder.push(&chunk, callback, recorder)?;
                    if decoder.done {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Stream ended early, keeping partial text: {}", e);
                    response.truncated = true;
                    break;
                }
            }
        }

        if !response.cancelled {
            decoder.finish(callback, recorder)?;
        }
        response.text = decoder.text;
        Ok(response)
    }

    async fn playback_request(
        &self,
        playback: &PlaybackState,
        streaming_callback: Option<&StreamingCallback>,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse> {
        let session = playback.next_session()?.ok_or_else(|| {
            ClientError::Config("No more recorded sessions available for playback".to_string())
        })?;
        info!(
            "Playing back recorded session from {} ({} chunks)",
            session.timestamp,
            session.chunks.len()
        );

        match streaming_callback {
            Some(callback) => {
                let mut chunk_stream = PlaybackChunkStream::new(session.chunks, playback.fast);
                self.process_chunk_stream(&mut chunk_stream, callback, cancel, None)
                    .await
            }
            None => {
                let body = session
                    .chunks
                    .first()
                    .map(|chunk| chunk.data.as_str())
                    .ok_or_else(|| {
                        ClientError::Config("Recorded session has no response body".to_string())
                    })?;
                Ok(CompletionResponse::complete(parse_completion_body(body)?))
            }
        }
    }

    async fn rate_limit_fallback(
        &self,
        messages: &[ChatMessage],
        streaming_callback: Option<&StreamingCallback>,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse> {
        let text = utils::rate_limit_fallback_text(messages);
        let mut response = CompletionResponse {
            fallback: true,
            ..Default::default()
        };

        if let Some(callback) = streaming_callback {
            let finished =
                utils::replay_words(&text, self.config.fallback_word_delay, callback, cancel)
                    .await?;
            response.cancelled = !finished;
        }

        response.text = text;
        Ok(response)
    }

    /// List model ids visible to the configured key; used to verify the key.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let api_key = self.config.require_api_key()?;
        let response = self
            .client
            .get(self.config.endpoint("models"))
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))?;
        let response = utils::check_response_error(response).await?;

        let body = response
            .text()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))?;
        let models: OpenAIModelList = serde_json::from_str(&body)
            .map_err(|e| ApiError::Unknown(format!("Failed to parse model list: {e}")))?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }
}

#[async_trait]
impl CompletionProvider for OpenAIClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        streaming_callback: Option<&StreamingCallback>,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse> {
        self.send_messages(messages, streaming_callback, cancel).await
    }
}
