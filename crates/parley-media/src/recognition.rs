//! Deepgram live-streaming speech recognition.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use url::Url;

use parley_core::config::{RecognitionConfig, TurnTrigger};
use parley_core::error::{ParleyError, UpstreamError};
use parley_core::types::{ConnectionState, RecognitionEvent, TranscriptEvent};

use crate::framing::decode_frame;
use crate::queue::PushOutcome;
use crate::upstream::{
    InboundDecoder, Keepalive, Lifecycle, Outbound, PreOpenPolicy, RetryPolicy,
    UpstreamConnection, UpstreamSpec,
};
use crate::{AudioSink, RecognitionBackend};

const KEEPALIVE_MESSAGE: &str = r#"{"type":"KeepAlive"}"#;
const CLOSE_STREAM_MESSAGE: &str = r#"{"type":"CloseStream"}"#;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

pub struct DeepgramRecognizer {
    config: RecognitionConfig,
    api_key: String,
}

impl DeepgramRecognizer {
    pub fn new(config: RecognitionConfig, api_key: impl Into<String>) -> Self {
        Self {
            config,
            api_key: api_key.into(),
        }
    }

    pub fn from_config(config: &RecognitionConfig) -> Result<Self, ParleyError> {
        let api_key = config.resolve_api_key().ok_or_else(|| {
            ParleyError::ProtocolConfiguration("recognition API key is not set".into())
        })?;
        Ok(Self::new(config.clone(), api_key))
    }

    /// Listen URL with the streaming options as query parameters.
    pub fn listen_url(&self) -> Result<Url, ParleyError> {
        let config = &self.config;
        let mut url = Url::parse(&config.url).map_err(|e| {
            ParleyError::ProtocolConfiguration(format!("invalid recognition url: {e}"))
        })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("language", &config.language);
            query.append_pair("punctuate", if config.punctuate { "true" } else { "false" });
            query.append_pair("encoding", &config.encoding);
            if let Some(model) = &config.model {
                query.append_pair("model", model);
            }
            if let Some(rate) = config.sample_rate {
                query.append_pair("sample_rate", &rate.to_string());
            }
            if config.interim_results {
                query.append_pair("interim_results", "true");
            }
            if let Some(ms) = config.endpointing {
                query.append_pair("endpointing", &ms.to_string());
            }
        }
        Ok(url)
    }

    pub fn upstream_spec(&self) -> Result<UpstreamSpec, ParleyError> {
        let config = &self.config;
        let keepalive = (config.keepalive_interval_ms > 0).then(|| Keepalive {
            interval: Duration::from_millis(config.keepalive_interval_ms),
            message: KEEPALIVE_MESSAGE.to_string(),
        });

        let mut spec = UpstreamSpec::new("recognition", self.listen_url()?)
            .header("Authorization", format!("Token {}", self.api_key));
        spec.end_of_stream = Some(CLOSE_STREAM_MESSAGE.to_string());
        spec.keepalive = keepalive;
        spec.open_timeout = Duration::from_millis(config.open_timeout_ms);
        spec.drain_timeout = DRAIN_TIMEOUT;
        spec.retry = RetryPolicy::exponential(
            config.max_reconnect_attempts,
            Duration::from_millis(config.reconnect_backoff_ms),
        );
        spec.queue_capacity = config.queue_capacity;
        spec.pre_open = PreOpenPolicy::Queue;
        spec.persistent = true;
        Ok(spec)
    }
}

impl RecognitionBackend for DeepgramRecognizer {
    fn id(&self) -> &str {
        "deepgram"
    }

    fn open(
        &self,
        events: mpsc::Sender<RecognitionEvent>,
    ) -> Result<Arc<dyn AudioSink>, ParleyError> {
        let decoder = DeepgramDecoder::new(self.config.turn_trigger);
        let connection = UpstreamConnection::open(self.upstream_spec()?, decoder, events)?;
        Ok(Arc::new(DeepgramStream { connection }))
    }
}

/// Live recognition connection for one session.
pub struct DeepgramStream {
    connection: UpstreamConnection,
}

impl AudioSink for DeepgramStream {
    fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    fn send_audio(&self, frame: Vec<u8>) -> Result<PushOutcome, UpstreamError> {
        self.connection.send(Outbound::Binary(frame))
    }

    fn drain(&self) {
        self.connection.drain();
    }

    fn close(&self) {
        self.connection.close();
    }

    fn closed(&self) -> BoxFuture<'_, ConnectionState> {
        Box::pin(self.connection.closed())
    }
}

// --- Deepgram wire types ---

#[derive(Debug, Deserialize)]
struct DeepgramMessage {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    channel: Option<DeepgramChannel>,
    #[serde(default)]
    is_final: Option<bool>,
    #[serde(default)]
    speech_final: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct DeepgramChannel {
    #[serde(default)]
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Debug, Deserialize)]
struct DeepgramAlternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Parse one recognition message. `Ok(None)` for messages that carry no
/// transcript (metadata, speech-started, empty results).
pub fn parse_message(
    message: &str,
    trigger: TurnTrigger,
) -> Result<Option<TranscriptEvent>, serde_json::Error> {
    let message: DeepgramMessage = serde_json::from_str(message)?;
    Ok(transcript(message, trigger))
}

fn transcript(message: DeepgramMessage, trigger: TurnTrigger) -> Option<TranscriptEvent> {
    if let Some(kind) = message.kind.as_deref() {
        if kind != "Results" {
            trace!(kind, "Ignoring recognition message");
            return None;
        }
    }

    let alternative = message
        .channel
        .and_then(|c| c.alternatives.into_iter().next())?;

    let text = alternative.transcript.trim();
    if text.is_empty() {
        return None;
    }

    let is_final = match trigger {
        TurnTrigger::IsFinal => message.is_final,
        TurnTrigger::SpeechFinal => message.speech_final,
    }
    .unwrap_or(false);

    Some(TranscriptEvent {
        text: text.to_string(),
        is_final,
        confidence: alternative.confidence,
    })
}

/// Decodes recognition frames into [`RecognitionEvent`]s.
pub struct DeepgramDecoder {
    trigger: TurnTrigger,
}

impl DeepgramDecoder {
    pub fn new(trigger: TurnTrigger) -> Self {
        Self { trigger }
    }
}

impl InboundDecoder for DeepgramDecoder {
    type Output = RecognitionEvent;

    fn text(&mut self, text: &str) -> Vec<RecognitionEvent> {
        let decoded = decode_frame::<DeepgramMessage>(text);
        if let Some(e) = decoded.error {
            warn!(upstream = "recognition", error = %e, "Skipping malformed recognition message");
        }
        decoded
            .messages
            .into_iter()
            .filter_map(|message| transcript(message, self.trigger))
            .map(RecognitionEvent::Transcript)
            .collect()
    }

    fn binary(&mut self, data: &[u8]) -> Vec<RecognitionEvent> {
        debug!(upstream = "recognition", len = data.len(), "Ignoring binary recognition frame");
        Vec::new()
    }

    fn lifecycle(&mut self, event: Lifecycle) -> Option<RecognitionEvent> {
        match event {
            Lifecycle::Opened => Some(RecognitionEvent::Opened),
            Lifecycle::Reconnecting { attempt } => Some(RecognitionEvent::Reconnecting { attempt }),
            Lifecycle::Closed => Some(RecognitionEvent::Closed),
            Lifecycle::Failed(reason) => Some(RecognitionEvent::Failed(reason)),
        }
    }
}
