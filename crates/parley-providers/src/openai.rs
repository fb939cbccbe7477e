//! OpenAI Chat Completions generation backend.
//!
//! Streams `/v1/chat/completions` with `stream: true`. Works against any
//! OpenAI-compatible endpoint via `base_url`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace, warn};

use parley_core::config::GenerationConfig;
use parley_core::error::ParleyError;
use parley_core::types::GenerationToken;

use crate::sse::{SseEvent, parse_sse_stream};
use crate::{GenerationBackend, GenerationRequest, TokenStream};

const OPENAI_BASE_URL: &str = "https://api.openai.com";

/// Literal data payload that ends an OpenAI stream.
pub const DONE_SENTINEL: &str = "[DONE]";

pub struct OpenAiGenerator {
    pub base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiGenerator {
    pub fn new(api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &GenerationConfig) -> Result<Self, ParleyError> {
        let api_key = config.resolve_api_key().ok_or_else(|| {
            ParleyError::ProtocolConfiguration("generation API key is not set".into())
        })?;
        Ok(Self::new(api_key, config.base_url.as_deref()))
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

impl OpenAiRequest {
    fn from_request(request: &GenerationRequest) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(ref system) = request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.user }));

        Self {
            model: request.model.clone(),
            messages,
            stream: true,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// What one SSE segment of a chat completion stream means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Text(String),
    Done,
    /// Role-only deltas, empty content, usage records.
    Empty,
}

/// Decode one SSE data payload.
pub fn decode_chunk(data: &str) -> Result<ChunkOutcome, serde_json::Error> {
    let data = data.trim();
    if data == DONE_SENTINEL {
        return Ok(ChunkOutcome::Done);
    }
    let chunk: ChatCompletionChunk = serde_json::from_str(data)?;
    let text = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|t| !t.is_empty());
    Ok(text.map(ChunkOutcome::Text).unwrap_or(ChunkOutcome::Empty))
}

/// Turn parsed SSE events into generation tokens, ending with the sentinel.
pub fn token_stream<S>(sse: S) -> TokenStream
where
    S: futures::Stream<Item = anyhow::Result<SseEvent>> + Send + 'static,
{
    Box::pin(futures::stream::unfold(
        TokenState {
            sse: Box::pin(sse),
            index: 0,
            finished: false,
        },
        |mut state| async move {
            if state.finished {
                return None;
            }
            loop {
                match state.sse.next().await {
                    Some(Ok(event)) => match decode_chunk(&event.data) {
                        Ok(ChunkOutcome::Text(text)) => {
                            let token = GenerationToken::fragment(text, state.index);
                            state.index += 1;
                            return Some((Ok(token), state));
                        }
                        Ok(ChunkOutcome::Done) => {
                            state.finished = true;
                            return Some((Ok(GenerationToken::sentinel(state.index)), state));
                        }
                        Ok(ChunkOutcome::Empty) => continue,
                        Err(e) => {
                            warn!(error = %e, data = %event.data, "Skipping malformed generation chunk");
                            continue;
                        }
                    },
                    Some(Err(e)) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                    None => {
                        warn!("Generation stream ended without completion sentinel");
                        state.finished = true;
                        return Some((Ok(GenerationToken::sentinel(state.index)), state));
                    }
                }
            }
        },
    ))
}

struct TokenState<S> {
    sse: std::pin::Pin<Box<S>>,
    index: usize,
    finished: bool,
}

#[async_trait]
impl GenerationBackend for OpenAiGenerator {
    fn id(&self) -> &str {
        "openai"
    }

    async fn stream(&self, request: &GenerationRequest) -> anyhow::Result<TokenStream> {
        let body = OpenAiRequest::from_request(request);

        debug!(model = %body.model, base_url = %self.base_url, "Streaming OpenAI-compatible API");

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error {status}: {body}");
        }

        trace!("OpenAI stream accepted");
        Ok(token_stream(parse_sse_stream(response)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(data: &str) -> anyhow::Result<SseEvent> {
        Ok(SseEvent {
            event: None,
            data: data.to_string(),
            id: None,
        })
    }

    #[test]
    fn test_request_body_has_system_and_user() {
        let req = GenerationRequest::new("gpt-4o", "turn on the lights").with_system("Be brief.");
        let body = serde_json::to_value(OpenAiRequest::from_request(&req)).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "turn on the lights");
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_decode_chunk() {
        assert_eq!(
            decode_chunk(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#).unwrap(),
            ChunkOutcome::Text("Hi".into())
        );
        assert_eq!(
            decode_chunk(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            ChunkOutcome::Empty
        );
        assert_eq!(decode_chunk(" [DONE] ").unwrap(), ChunkOutcome::Done);
        assert!(decode_chunk("{not json").is_err());
    }

    #[tokio::test]
    async fn test_token_stream_skips_malformed_and_ends_on_sentinel() {
        let events = vec![
            sse(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#),
            sse(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#),
            sse("{garbage"),
            sse(r#"{"choices":[{"delta":{"content":" there"}}]}"#),
            sse("[DONE]"),
            sse(r#"{"choices":[{"delta":{"content":"late"}}]}"#),
        ];
        let tokens: Vec<GenerationToken> = token_stream(futures::stream::iter(events))
            .map(|t| t.unwrap())
            .collect()
            .await;
        assert_eq!(
            tokens,
            vec![
                GenerationToken::fragment("Hi", 0),
                GenerationToken::fragment(" there", 1),
                GenerationToken::sentinel(2),
            ]
        );
    }

    #[tokio::test]
    async fn test_token_stream_without_sentinel_still_completes() {
        let events = vec![sse(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#)];
        let tokens: Vec<GenerationToken> = token_stream(futures::stream::iter(events))
            .map(|t| t.unwrap())
            .collect()
            .await;
        assert_eq!(tokens.last(), Some(&GenerationToken::sentinel(1)));
    }

    #[test]
    fn test_from_config_requires_key() {
        let config = GenerationConfig {
            api_key: None,
            api_key_env: None,
            ..Default::default()
        };
        let err = OpenAiGenerator::from_config(&config).err().unwrap();
        assert!(err.is_fatal());

        let config = GenerationConfig {
            api_key: Some("sk-test".into()),
            base_url: Some("http://localhost:9999/".into()),
            ..Default::default()
        };
        let generator = OpenAiGenerator::from_config(&config).unwrap();
        assert_eq!(generator.base_url, "http://localhost:9999");
    }
}
