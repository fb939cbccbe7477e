//! ElevenLabs streaming-input speech synthesis, one connection per turn.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{trace, warn};
use url::Url;

use parley_core::config::SynthesisConfig;
use parley_core::error::{ParleyError, UpstreamError};
use parley_core::types::{AudioFrame, ConnectionState, SynthesisEvent, TurnId};

use crate::framing::decode_frame;
use crate::queue::PushOutcome;
use crate::upstream::{
    InboundDecoder, Lifecycle, Outbound, PreOpenPolicy, RetryPolicy, UpstreamConnection,
    UpstreamSpec,
};
use crate::{SynthesisBackend, TextSink};

/// An empty text increment tells the backend no more input follows.
pub const END_OF_INPUT: &str = r#"{"text":""}"#;

pub struct ElevenLabsSynthesizer {
    config: SynthesisConfig,
    api_key: String,
    voice_id: String,
}

impl ElevenLabsSynthesizer {
    pub fn new(
        config: SynthesisConfig,
        api_key: impl Into<String>,
        voice_id: impl Into<String>,
    ) -> Self {
        Self {
            config,
            api_key: api_key.into(),
            voice_id: voice_id.into(),
        }
    }

    /// A missing voice id or API key is a configuration error, never retried.
    pub fn from_config(config: &SynthesisConfig) -> Result<Self, ParleyError> {
        let voice_id = config.resolve_voice_id().ok_or_else(|| {
            ParleyError::ProtocolConfiguration("synthesis voice_id is not set".into())
        })?;
        let api_key = config.resolve_api_key().ok_or_else(|| {
            ParleyError::ProtocolConfiguration("synthesis API key is not set".into())
        })?;
        Ok(Self::new(config.clone(), api_key, voice_id))
    }

    pub fn stream_url(&self) -> Result<Url, ParleyError> {
        let config = &self.config;
        let raw = config.url.replace("{voice_id}", &self.voice_id);
        let mut url = Url::parse(&raw).map_err(|e| {
            ParleyError::ProtocolConfiguration(format!("invalid synthesis url: {e}"))
        })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("model_id", &config.model_id);
            if let Some(latency) = config.optimize_streaming_latency {
                query.append_pair("optimize_streaming_latency", &latency.to_string());
            }
            if let Some(format) = &config.output_format {
                query.append_pair("output_format", format);
            }
        }
        Ok(url)
    }

    /// First message on every connection: voice and model parameters.
    pub fn handshake(&self) -> String {
        json!({
            "text": " ",
            "voice_settings": {
                "stability": self.config.stability,
                "similarity_boost": self.config.similarity_boost,
            },
            "model_id": self.config.model_id,
        })
        .to_string()
    }

    pub fn upstream_spec(&self) -> Result<UpstreamSpec, ParleyError> {
        let config = &self.config;
        let mut spec = UpstreamSpec::new("synthesis", self.stream_url()?)
            .header("xi-api-key", self.api_key.clone());
        spec.handshake = Some(self.handshake());
        spec.end_of_stream = Some(END_OF_INPUT.to_string());
        spec.open_timeout = Duration::from_millis(config.open_timeout_ms);
        spec.drain_timeout = Duration::from_millis(config.drain_timeout_ms);
        spec.retry = RetryPolicy::none();
        spec.queue_capacity = config.queue_capacity;
        spec.pre_open = PreOpenPolicy::Queue;
        spec.persistent = false;
        Ok(spec)
    }
}

impl SynthesisBackend for ElevenLabsSynthesizer {
    fn id(&self) -> &str {
        "elevenlabs"
    }

    fn open(
        &self,
        turn: TurnId,
        events: mpsc::Sender<SynthesisEvent>,
    ) -> Result<Box<dyn TextSink>, ParleyError> {
        let connection =
            UpstreamConnection::open(self.upstream_spec()?, ElevenLabsDecoder::new(turn), events)?;
        Ok(Box::new(ElevenLabsStream { turn, connection }))
    }
}

/// Synthesis connection for one turn.
pub struct ElevenLabsStream {
    turn: TurnId,
    connection: UpstreamConnection,
}

/// One text increment on the wire.
pub fn text_message(text: &str) -> String {
    json!({ "text": text }).to_string()
}

impl TextSink for ElevenLabsStream {
    fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    fn send_text(&self, text: &str) -> Result<(), UpstreamError> {
        // An empty increment would end the stream early.
        if text.is_empty() {
            return Ok(());
        }
        if self.connection.send(Outbound::Text(text_message(text)))? == PushOutcome::DroppedOldest {
            warn!(upstream = "synthesis", turn = self.turn, "Synthesis queue full, dropped oldest text");
        }
        Ok(())
    }

    fn finish(&self) {
        self.connection.drain();
    }

    fn close(&self) {
        self.connection.close();
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ElevenLabsMessage {
    #[serde(default)]
    audio: Option<String>,
    #[serde(default)]
    is_final: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Decodes synthesis frames into [`SynthesisEvent`]s for one turn. Emits
/// exactly one `Finished` or `Failed`.
pub struct ElevenLabsDecoder {
    turn: TurnId,
    done: bool,
}

impl ElevenLabsDecoder {
    pub fn new(turn: TurnId) -> Self {
        Self {
            turn,
            done: false,
        }
    }

    fn decode_message(&mut self, message: ElevenLabsMessage) -> Vec<SynthesisEvent> {
        let mut events = Vec::new();
        if let Some(error) = message.error {
            if !self.done {
                self.done = true;
                let reason = match message.message {
                    Some(detail) => format!("{error}: {detail}"),
                    None => error,
                };
                events.push(SynthesisEvent::Failed {
                    turn: self.turn,
                    reason,
                });
            }
            return events;
        }

        if let Some(audio) = message.audio.filter(|a| !a.is_empty()) {
            match BASE64.decode(audio.as_bytes()) {
                Ok(data) => events.push(SynthesisEvent::Audio(AudioFrame::new(self.turn, data))),
                Err(e) => {
                    warn!(upstream = "synthesis", turn = self.turn, error = %e, "Skipping undecodable audio chunk")
                }
            }
        }
        if message.is_final == Some(true) && !self.done {
            self.done = true;
            events.push(SynthesisEvent::Finished { turn: self.turn });
        }
        events
    }
}

impl InboundDecoder for ElevenLabsDecoder {
    type Output = SynthesisEvent;

    fn text(&mut self, text: &str) -> Vec<SynthesisEvent> {
        let decoded = decode_frame::<ElevenLabsMessage>(text);
        if let Some(e) = decoded.error {
            warn!(upstream = "synthesis", turn = self.turn, error = %e, "Skipping malformed synthesis message");
        }
        decoded
            .messages
            .into_iter()
            .flat_map(|message| self.decode_message(message))
            .collect()
    }

    fn binary(&mut self, data: &[u8]) -> Vec<SynthesisEvent> {
        if data.is_empty() {
            return Vec::new();
        }
        trace!(upstream = "synthesis", turn = self.turn, len = data.len(), "Audio frame");
        vec![SynthesisEvent::Audio(AudioFrame::new(self.turn, data.to_vec()))]
    }

    fn lifecycle(&mut self, event: Lifecycle) -> Option<SynthesisEvent> {
        if self.done {
            return None;
        }
        match event {
            Lifecycle::Opened | Lifecycle::Reconnecting { .. } => None,
            Lifecycle::Closed => {
                self.done = true;
                Some(SynthesisEvent::Finished { turn: self.turn })
            }
            Lifecycle::Failed(reason) => {
                self.done = true;
                Some(SynthesisEvent::Failed {
                    turn: self.turn,
                    reason,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthesizer() -> ElevenLabsSynthesizer {
        ElevenLabsSynthesizer::new(SynthesisConfig::default(), "el-key", "voice-1")
    }

    #[test]
    fn test_missing_voice_id_fails_fast() {
        let config = SynthesisConfig {
            api_key: Some("el-key".into()),
            voice_id: None,
            voice_id_env: None,
            ..Default::default()
        };
        let err = ElevenLabsSynthesizer::from_config(&config).err().unwrap();
        assert!(matches!(err, ParleyError::ProtocolConfiguration(ref m) if m.contains("voice_id")));
    }

    #[test]
    fn test_stream_url_substitutes_voice() {
        let url = synthesizer().stream_url().unwrap();
        assert_eq!(url.path(), "/v1/text-to-speech/voice-1/stream-input");
        let query = url.query().unwrap();
        assert!(query.contains("model_id=eleven_multilingual_v2"));
        assert!(query.contains("optimize_streaming_latency=3"));
    }

    #[test]
    fn test_handshake_and_increments() {
        let handshake: serde_json::Value = serde_json::from_str(&synthesizer().handshake()).unwrap();
        assert_eq!(handshake["text"], " ");
        assert_eq!(handshake["voice_settings"]["stability"], 0.5);
        assert_eq!(handshake["voice_settings"]["similarity_boost"], 0.75);
        assert_eq!(handshake["model_id"], "eleven_multilingual_v2");
        assert_eq!(text_message("Hi"), r#"{"text":"Hi"}"#);
    }

    #[test]
    fn test_upstream_spec() {
        let spec = synthesizer().upstream_spec().unwrap();
        assert!(!spec.persistent);
        assert_eq!(spec.retry.max_attempts, 0);
        assert_eq!(spec.end_of_stream.as_deref(), Some(END_OF_INPUT));
        assert_eq!(spec.headers[0].0, "xi-api-key");
    }

    #[test]
    fn test_decoder_audio_and_final() {
        let mut decoder = ElevenLabsDecoder::new(4);
        let encoded = BASE64.encode([1u8, 2, 3]);
        let events = decoder.text(&format!(r#"{{"audio":"{encoded}","isFinal":null}}"#));
        assert_eq!(events, vec![SynthesisEvent::Audio(AudioFrame::new(4, vec![1, 2, 3]))]);

        let events = decoder.binary(&[9, 9]);
        assert_eq!(events, vec![SynthesisEvent::Audio(AudioFrame::new(4, vec![9, 9]))]);

        let events = decoder.text(r#"{"audio":null,"isFinal":true}"#);
        assert_eq!(events, vec![SynthesisEvent::Finished { turn: 4 }]);
        assert!(decoder.lifecycle(Lifecycle::Closed).is_none());
    }

    #[test]
    fn test_decoder_multi_line_final_message() {
        let mut decoder = ElevenLabsDecoder::new(3);
        let encoded = BASE64.encode([5u8, 6]);
        let frame = format!("{{\n  \"audio\": \"{encoded}\",\n  \"isFinal\": true\n}}");
        assert_eq!(
            decoder.text(&frame),
            vec![
                SynthesisEvent::Audio(AudioFrame::new(3, vec![5, 6])),
                SynthesisEvent::Finished { turn: 3 },
            ]
        );
    }

    #[test]
    fn test_decoder_close_finishes_once() {
        let mut decoder = ElevenLabsDecoder::new(1);
        assert_eq!(
            decoder.lifecycle(Lifecycle::Closed),
            Some(SynthesisEvent::Finished { turn: 1 })
        );
        assert!(decoder.lifecycle(Lifecycle::Failed("late".into())).is_none());
    }

    #[test]
    fn test_decoder_error_message_fails_turn() {
        let mut decoder = ElevenLabsDecoder::new(2);
        assert!(decoder.text("{bad").is_empty());
        let events = decoder.text(r#"{"error":"quota_exceeded","message":"out of credits"}"#);
        assert_eq!(
            events,
            vec![SynthesisEvent::Failed {
                turn: 2,
                reason: "quota_exceeded: out of credits".into()
            }]
        );
    }
}
