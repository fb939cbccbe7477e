use serde::{Deserialize, Serialize};

/// Monotonically increasing turn sequence number, scoped to one session.
pub type TurnId = u64;

/// A recognition result from the speech-recognition backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl TranscriptEvent {
    pub fn new(text: impl Into<String>, is_final: bool) -> Self {
        Self {
            text: text.into(),
            is_final,
            confidence: None,
        }
    }

    /// Only a non-empty final transcript starts a new turn.
    pub fn starts_turn(&self) -> bool {
        self.is_final && !self.text.trim().is_empty()
    }
}

/// One incremental fragment of generated text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationToken {
    pub text: String,
    /// Ordinal within the turn, starting at 0.
    pub index: usize,
    /// Set on the completion sentinel; `text` is empty then.
    pub is_final: bool,
}

impl GenerationToken {
    pub fn fragment(text: impl Into<String>, index: usize) -> Self {
        Self {
            text: text.into(),
            index,
            is_final: false,
        }
    }

    pub fn sentinel(index: usize) -> Self {
        Self {
            text: String::new(),
            index,
            is_final: true,
        }
    }
}

/// Synthesized audio bytes, tagged with the turn they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub turn: TurnId,
    pub data: Vec<u8>,
}

impl AudioFrame {
    pub fn new(turn: TurnId, data: Vec<u8>) -> Self {
        Self { turn, data }
    }
}

/// Lifecycle of one outbound backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    /// No new sends; queued payloads are flushed before closing.
    Draining,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Events from the recognition connection into the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// The connection is open and audio is being forwarded. Sent again after
    /// every successful reconnect.
    Opened,
    Transcript(TranscriptEvent),
    /// The connection dropped and a reconnect attempt is scheduled.
    Reconnecting { attempt: u32 },
    /// Retries are exhausted; the session can no longer hear the client.
    Failed(String),
    Closed,
}

/// Events from a per-turn generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationEvent {
    pub turn: TurnId,
    pub kind: GenerationEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEventKind {
    Token(GenerationToken),
    Failed(String),
}

impl GenerationEvent {
    pub fn token(turn: TurnId, token: GenerationToken) -> Self {
        Self {
            turn,
            kind: GenerationEventKind::Token(token),
        }
    }

    pub fn failed(turn: TurnId, reason: impl Into<String>) -> Self {
        Self {
            turn,
            kind: GenerationEventKind::Failed(reason.into()),
        }
    }
}

/// Events from a per-turn synthesis connection.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisEvent {
    Audio(AudioFrame),
    /// The backend finished (or closed) the stream for this turn.
    Finished { turn: TurnId },
    Failed { turn: TurnId, reason: String },
}

impl SynthesisEvent {
    pub fn turn(&self) -> TurnId {
        match self {
            Self::Audio(frame) => frame.turn,
            Self::Finished { turn } | Self::Failed { turn, .. } => *turn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_turn_requires_final_non_empty() {
        assert!(TranscriptEvent::new("turn on the lights", true).starts_turn());
        assert!(!TranscriptEvent::new("turn on the", false).starts_turn());
        assert!(!TranscriptEvent::new("   ", true).starts_turn());
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::Failed.is_terminal());
        assert!(!ConnectionState::Draining.is_terminal());
        assert!(!ConnectionState::Connecting.is_terminal());
    }

    #[test]
    fn test_synthesis_event_turn() {
        assert_eq!(SynthesisEvent::Audio(AudioFrame::new(4, vec![1])).turn(), 4);
        assert_eq!(SynthesisEvent::Finished { turn: 2 }.turn(), 2);
    }
}
