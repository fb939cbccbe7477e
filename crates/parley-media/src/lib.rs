//! Streaming speech backends for Parley.
//!
//! Recognition and synthesis both run over an outbound websocket
//! ([`upstream::UpstreamConnection`]). The session and orchestrator only see
//! the [`AudioSink`] / [`TextSink`] handles and the typed events the
//! connections deliver over mpsc channels.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use parley_core::error::{ParleyError, UpstreamError};
use parley_core::types::{ConnectionState, RecognitionEvent, SynthesisEvent, TurnId};

pub mod framing;
pub mod queue;
pub mod recognition;
pub mod synthesis;
pub mod upstream;

pub use queue::PushOutcome;
pub use recognition::DeepgramRecognizer;
pub use synthesis::ElevenLabsSynthesizer;

/// Write side of a recognition connection.
pub trait AudioSink: Send + Sync {
    fn state(&self) -> ConnectionState;

    /// Forward one raw audio frame. Frames sent while connecting are
    /// buffered (bounded, oldest dropped first).
    fn send_audio(&self, frame: Vec<u8>) -> Result<PushOutcome, UpstreamError>;

    /// Stop accepting audio, flush what is queued and ask the backend to
    /// finalize before it closes.
    fn drain(&self);

    /// Close immediately. Idempotent.
    fn close(&self);

    /// Resolves once the connection is Closed or Failed.
    fn closed(&self) -> BoxFuture<'_, ConnectionState>;
}

/// Write side of a per-turn synthesis connection.
pub trait TextSink: Send + Sync {
    fn state(&self) -> ConnectionState;

    /// Send one text increment, in order.
    fn send_text(&self, text: &str) -> Result<(), UpstreamError>;

    /// Close after drain: text already sent is still synthesized and the
    /// connection closes once the backend is done.
    fn finish(&self);

    /// Close immediately, abandoning pending audio. Idempotent.
    fn close(&self);
}

/// Opens the session's long-lived recognition connection.
pub trait RecognitionBackend: Send + Sync {
    fn id(&self) -> &str;

    fn open(
        &self,
        events: mpsc::Sender<RecognitionEvent>,
    ) -> Result<Arc<dyn AudioSink>, ParleyError>;
}

/// Opens one synthesis connection per turn. Every event it produces is
/// tagged with `turn`.
pub trait SynthesisBackend: Send + Sync {
    fn id(&self) -> &str;

    fn open(
        &self,
        turn: TurnId,
        events: mpsc::Sender<SynthesisEvent>,
    ) -> Result<Box<dyn TextSink>, ParleyError>;
}
