//! OpenAI-compatible streaming engine.
//!
//! Posts to `{base_url}/v1/chat/completions` with `stream: true` and turns
//! `choices[0].delta.content` chunks into [`EngineEvent::Token`]s. Servers
//! such as vLLM accept the extra sampling fields (`top_k`, `min_p`,
//! `repetition_penalty`) and ignore them otherwise.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::engine::{
    EngineEvent, EngineRequestKey, EngineUsage, GenerationEngine, GenerationRequest, InFlight,
    TokenStream,
};
use crate::error::{EngineError, EngineResult};
use crate::prompt::{ChatMessage, build_messages};
use crate::sse::{SseData, parse_sse_lines};

/// Longest error body excerpt kept in [`EngineError::Status`].
const ERROR_BODY_LIMIT: usize = 512;

/// Connection settings for an [`HttpEngine`].
#[derive(Clone, Debug)]
pub struct HttpEngineConfig {
    /// Base URL without the `/v1/...` path.
    pub base_url: String,
    /// Model name sent with each request.
    pub model: String,
    /// Optional bearer token.
    pub api_key: Option<String>,
    /// Budget for connecting and receiving response headers.
    pub request_timeout: Duration,
}

impl HttpEngineConfig {
    /// Config with no API key and a 10 second request timeout.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            request_timeout: Duration::from_secs(10),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Streaming chat-completions engine.
#[derive(Debug)]
pub struct HttpEngine {
    config: HttpEngineConfig,
    client: reqwest::Client,
    in_flight: Arc<InFlight>,
}

impl HttpEngine {
    /// Create an engine with its own HTTP client.
    pub fn new(config: HttpEngineConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()?;
        Ok(Self::with_client(config, client))
    }

    /// Create an engine with a shared HTTP client.
    pub fn with_client(config: HttpEngineConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            in_flight: Arc::new(InFlight::new()),
        }
    }

    fn build_headers(&self) -> EngineResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = self.config.api_key.as_deref() {
            let value = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|e| {
                EngineError::Other {
                    message: format!("invalid API key header: {e}"),
                }
            })?;
            let _ = headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    fn build_body(&self, request: &GenerationRequest) -> CompletionRequest {
        let sampling = &request.sampling;
        CompletionRequest {
            model: self.config.model.clone(),
            messages: build_messages(request),
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
            max_tokens: request.max_tokens,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            min_p: sampling.min_p,
            repetition_penalty: sampling.repetition_penalty,
            presence_penalty: sampling.presence_penalty,
            frequency_penalty: sampling.frequency_penalty,
        }
    }
}

#[async_trait]
impl GenerationEngine for HttpEngine {
    fn name(&self) -> &str {
        "http"
    }

    async fn submit(&self, request: GenerationRequest) -> EngineResult<TokenStream> {
        let body = self.build_body(&request);
        let headers = self.build_headers()?;
        let (token, guard) = self.in_flight.register(request.key.clone(), &request.cancel);

        debug!(
            key = %request.key,
            role = request.role.as_str(),
            model = %body.model,
            messages = body.messages.len(),
            "sending completion request"
        );

        let send = self
            .client
            .post(self.config.endpoint())
            .headers(headers)
            .json(&body)
            .send();
        let timeout = self.config.request_timeout;
        let response = tokio::select! {
            () = token.cancelled() => return Err(EngineError::Cancelled),
            result = tokio::time::timeout(timeout, send) => match result {
                Ok(response) => response?,
                Err(_) => {
                    return Err(EngineError::Timeout {
                        after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            },
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message: String = text.chars().take(ERROR_BODY_LIMIT).collect();
            error!(key = %request.key, status = status.as_u16(), "engine returned error status");
            return Err(EngineError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let key = request.key;
        let lines = parse_sse_lines(Box::pin(response.bytes_stream()));
        let stream = async_stream::stream! {
            let _guard = guard;
            let mut lines = std::pin::pin!(lines);
            let mut usage = EngineUsage::default();
            let mut reported_usage = false;

            loop {
                let polled = tokio::select! {
                    biased;
                    () = token.cancelled() => None,
                    next = lines.next() => Some(next),
                };
                let Some(next) = polled else {
                    yield Err(EngineError::Cancelled);
                    return;
                };
                match next {
                    None | Some(Ok(SseData::Done)) => break,
                    Some(Err(e)) => {
                        warn!(%key, error = %e, "completion stream failed");
                        yield Err(e);
                        return;
                    }
                    Some(Ok(SseData::Json(data))) => {
                        let chunk: CompletionChunk = match serde_json::from_str(&data) {
                            Ok(chunk) => chunk,
                            Err(e) => {
                                yield Err(EngineError::Decode { message: e.to_string() });
                                return;
                            }
                        };
                        if let Some(u) = chunk.usage.as_ref() {
                            usage = EngineUsage {
                                prompt_tokens: u.prompt_tokens,
                                completion_tokens: u.completion_tokens,
                            };
                            reported_usage = true;
                        }
                        for text in chunk.into_texts() {
                            if !reported_usage {
                                usage.completion_tokens += 1;
                            }
                            yield Ok(EngineEvent::Token { text });
                        }
                    }
                }
            }

            yield Ok(EngineEvent::Finished { usage });
        };
        Ok(Box::pin(stream))
    }

    fn cancel(&self, key: &EngineRequestKey) {
        if self.in_flight.cancel(key) {
            debug!(%key, "http generation cancelled");
        }
    }
}

// ── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repetition_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f64>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

impl CompletionChunk {
    fn into_texts(self) -> impl Iterator<Item = String> {
        self.choices
            .into_iter()
            .filter_map(|c| c.delta.and_then(|d| d.content))
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use duplex_core::sampling::SamplingOverrides;
    use duplex_core::{ConnectionId, Epoch};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::engine::EngineRole;

    fn request() -> GenerationRequest {
        GenerationRequest {
            key: EngineRequestKey::new(ConnectionId::from_string("conn_h"), Epoch::new(1)),
            role: EngineRole::Chat,
            persona: Some("persona".into()),
            history: None,
            user_identity: None,
            utterance: "hi".into(),
            sampling: SamplingOverrides {
                temperature: Some(0.7),
                top_k: Some(40),
                ..SamplingOverrides::default()
            },
            max_tokens: Some(64),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn endpoint_trims_trailing_slash() {
        let config = HttpEngineConfig::new("http://llm:8000/", "m");
        assert_eq!(config.endpoint(), "http://llm:8000/v1/chat/completions");
    }

    #[test]
    fn body_includes_only_present_sampling_fields() {
        let engine = HttpEngine::new(HttpEngineConfig::new("http://llm", "qwen")).unwrap();
        let body = serde_json::to_value(engine.build_body(&request())).unwrap();
        assert_eq!(body["model"], "qwen");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["temperature"], 0.7);
        assert_eq!(body["top_k"], 40);
        assert!(body.get("top_p").is_none());
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1], json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn headers_include_bearer_when_configured() {
        let mut config = HttpEngineConfig::new("http://llm", "m");
        config.api_key = Some("secret".into());
        let engine = HttpEngine::new(config).unwrap();
        let headers = engine.build_headers().unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer secret");
    }

    #[test]
    fn chunk_texts_skip_empty_and_role_only_deltas() {
        let chunk: CompletionChunk = serde_json::from_value(json!({
            "choices": [
                {"delta": {"role": "assistant"}},
                {"delta": {"content": ""}},
                {"delta": {"content": "Hel"}}
            ]
        }))
        .unwrap();
        assert_eq!(chunk.into_texts().collect::<Vec<_>>(), vec!["Hel"]);
    }

    #[test]
    fn usage_only_chunk_parses() {
        let chunk: CompletionChunk = serde_json::from_value(json!({
            "choices": [],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }))
        .unwrap();
        assert_eq!(chunk.usage.unwrap().prompt_tokens, 12);
    }

    #[tokio::test]
    async fn unreachable_backend_fails_submit() {
        let mut config = HttpEngineConfig::new("http://127.0.0.1:9", "m");
        config.request_timeout = Duration::from_millis(500);
        let engine = HttpEngine::new(config).unwrap();
        let err = engine.submit(request()).await.err();
        assert_matches!(err, Some(EngineError::Http(_) | EngineError::Timeout { .. }));
    }

    #[tokio::test]
    async fn cancelled_request_fails_submit() {
        let engine = HttpEngine::new(HttpEngineConfig::new("http://10.255.255.1:81", "m")).unwrap();
        let req = request();
        req.cancel.cancel();
        let Err(err) = engine.submit(req).await else {
            panic!("cancelled request was sent");
        };
        assert_matches!(err, EngineError::Cancelled);
    }

    // ── Streaming (mock server) ─────────────────────────────────────

    fn sse(chunks: &[serde_json::Value]) -> String {
        let mut body: String = chunks.iter().map(|c| format!("data: {c}\n\n")).collect();
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn delta(text: &str) -> serde_json::Value {
        json!({"choices": [{"index": 0, "delta": {"content": text}}]})
    }

    async fn mock_completions(status: u16, body: String) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(status)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;
        server
    }

    fn engine_for(server: &MockServer) -> HttpEngine {
        HttpEngine::new(HttpEngineConfig::new(server.uri(), "qwen")).unwrap()
    }

    async fn drain(stream: TokenStream) -> Vec<EngineResult<EngineEvent>> {
        stream.collect().await
    }

    fn token(text: &str) -> EngineEvent {
        EngineEvent::Token { text: text.into() }
    }

    #[tokio::test]
    async fn streams_deltas_and_reported_usage() {
        let body = sse(&[
            json!({"choices": [{"index": 0, "delta": {"role": "assistant"}}]}),
            delta("Hel"),
            delta("lo"),
            json!({"choices": [], "usage": {"prompt_tokens": 9, "completion_tokens": 2}}),
        ]);
        let server = mock_completions(200, body).await;
        let engine = engine_for(&server);

        let events = drain(engine.submit(request()).await.unwrap()).await;
        let events: Vec<EngineEvent> = events.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            events,
            vec![
                token("Hel"),
                token("lo"),
                EngineEvent::Finished {
                    usage: EngineUsage {
                        prompt_tokens: 9,
                        completion_tokens: 2,
                    },
                },
            ]
        );
        assert!(engine.in_flight.is_empty());
    }

    #[tokio::test]
    async fn counts_tokens_without_usage_chunk() {
        let server = mock_completions(200, sse(&[delta("a"), delta("b"), delta("c")])).await;
        let engine = engine_for(&server);

        let events = drain(engine.submit(request()).await.unwrap()).await;
        assert_matches!(
            events.last(),
            Some(Ok(EngineEvent::Finished { usage })) if usage.completion_tokens == 3
        );
    }

    #[tokio::test]
    async fn done_marker_ends_stream() {
        let mut body = sse(&[delta("kept")]);
        body.push_str(&format!("data: {}\n\n", delta("dropped")));
        let server = mock_completions(200, body).await;
        let engine = engine_for(&server);

        let events = drain(engine.submit(request()).await.unwrap()).await;
        assert_eq!(events.len(), 2);
        assert_matches!(&events[0], Ok(EngineEvent::Token { text }) if text == "kept");
        assert_matches!(&events[1], Ok(EngineEvent::Finished { .. }));
    }

    #[tokio::test]
    async fn error_status_fails_submit_with_body_excerpt() {
        let server = mock_completions(503, "model is overloaded".into()).await;
        let engine = engine_for(&server);

        let Err(err) = engine.submit(request()).await else {
            panic!("error status produced a stream");
        };
        assert_matches!(
            err,
            EngineError::Status { status: 503, ref message } if message == "model is overloaded"
        );
        assert!(engine.in_flight.is_empty());
    }

    #[tokio::test]
    async fn undecodable_chunk_ends_with_decode_error() {
        let server = mock_completions(200, "data: {not json}\n\n".into()).await;
        let engine = engine_for(&server);

        let events = drain(engine.submit(request()).await.unwrap()).await;
        assert_eq!(events.len(), 1);
        assert_matches!(&events[0], Err(EngineError::Decode { .. }));
    }

    #[tokio::test]
    async fn cancel_mid_stream_stops_tokens() {
        let server = mock_completions(200, sse(&[delta("one"), delta("two"), delta("three")])).await;
        let engine = engine_for(&server);
        let req = request();
        let key = req.key.clone();

        let mut stream = engine.submit(req).await.unwrap();
        assert_matches!(stream.next().await, Some(Ok(EngineEvent::Token { text })) if text == "one");

        engine.cancel(&key);
        assert_matches!(stream.next().await, Some(Err(EngineError::Cancelled)));
        assert!(stream.next().await.is_none());
        drop(stream);
        assert!(engine.in_flight.is_empty());
    }

    #[tokio::test]
    async fn request_carries_model_sampling_and_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({
                "model": "qwen",
                "stream": true,
                "max_tokens": 64,
                "top_k": 40
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(sse(&[delta("ok")])))
            .expect(1)
            .mount(&server)
            .await;
        let mut config = HttpEngineConfig::new(server.uri(), "qwen");
        config.api_key = Some("secret".into());
        let engine = HttpEngine::new(config).unwrap();

        let events = drain(engine.submit(request()).await.unwrap()).await;
        assert_matches!(&events[0], Ok(EngineEvent::Token { text }) if text == "ok");
    }
}
