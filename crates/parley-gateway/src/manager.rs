//! Session manager: one session per accepted client connection.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use parley_core::config::Config;
use parley_core::error::ParleyError;
use parley_media::{
    DeepgramRecognizer, ElevenLabsSynthesizer, RecognitionBackend, SynthesisBackend,
};
use parley_providers::{GenerationBackend, OpenAiGenerator};

use crate::client::internal_error;
use crate::metrics;
use crate::session::Session;

/// The three backends a session talks to.
#[derive(Clone)]
pub struct Backends {
    pub recognition: Arc<dyn RecognitionBackend>,
    pub generation: Arc<dyn GenerationBackend>,
    pub synthesis: Arc<dyn SynthesisBackend>,
}

impl Backends {
    /// Build the configured providers. A missing key or voice id fails here,
    /// before any connection is opened.
    pub fn from_config(config: &Config) -> Result<Self, ParleyError> {
        let recognition = config.recognition();
        let generation = config.generation();
        let synthesis = config.synthesis();

        let recognition: Arc<dyn RecognitionBackend> = match recognition.provider.as_str() {
            "deepgram" => Arc::new(DeepgramRecognizer::from_config(&recognition)?),
            other => return Err(unsupported("recognition", other)),
        };
        let generation: Arc<dyn GenerationBackend> = match generation.provider.as_str() {
            "openai" => Arc::new(OpenAiGenerator::from_config(&generation)?),
            other => return Err(unsupported("generation", other)),
        };
        let synthesis: Arc<dyn SynthesisBackend> = match synthesis.provider.as_str() {
            "elevenlabs" => Arc::new(ElevenLabsSynthesizer::from_config(&synthesis)?),
            other => return Err(unsupported("synthesis", other)),
        };

        Ok(Self {
            recognition,
            generation,
            synthesis,
        })
    }
}

fn unsupported(stage: &str, provider: &str) -> ParleyError {
    ParleyError::ProtocolConfiguration(format!("unsupported {stage} provider: {provider}"))
}

/// Builds the backends for each new session.
pub type BackendFactory = Arc<dyn Fn(&Config) -> Result<Backends, ParleyError> + Send + Sync>;

pub struct SessionManager {
    config: Arc<Config>,
    factory: BackendFactory,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_factory(config, Arc::new(Backends::from_config))
    }

    pub fn with_factory(config: Arc<Config>, factory: BackendFactory) -> Self {
        Self {
            config,
            factory,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create a session for a newly accepted client. If the backends cannot
    /// be built or recognition cannot be opened, the client is closed with an
    /// internal-error close frame and no session is registered.
    pub async fn on_client_connect<W>(&self, writer: W) -> Result<Arc<Session>, ParleyError>
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: Display,
    {
        let session_id = Uuid::new_v4().to_string();

        let backends = match (self.factory)(&self.config) {
            Ok(backends) => backends,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Rejecting client");
                metrics::record_session_rejected();
                reject(writer, &e).await;
                return Err(e);
            }
        };

        let session = Session::start(session_id.clone(), &self.config, &backends, writer)
            .inspect_err(|_| metrics::record_session_rejected())?;

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session.clone());
        metrics::record_session_open();
        info!(session_id = %session_id, "Session created");
        Ok(session)
    }

    /// Dispose the session exactly once. Unknown or already-removed ids are
    /// ignored.
    pub async fn on_client_disconnect(&self, session_id: &str) {
        let session = self.sessions.write().await.remove(session_id);
        if let Some(session) = session {
            session.dispose();
            info!(session_id = %session_id, "Session closed");
        }
    }

    /// Run one client websocket to completion.
    pub async fn serve_client(&self, socket: WebSocket) {
        let (writer, reader) = socket.split();
        self.serve_split(writer, reader).await;
    }

    pub async fn serve_split<W, R, E>(&self, writer: W, reader: R)
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let Ok(session) = self.on_client_connect(writer).await else {
            return;
        };
        session.pump_client(reader).await;
        self.on_client_disconnect(session.id()).await;
    }

    pub async fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Dispose every live session (server shutdown).
    pub async fn shutdown_all(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().collect();
        if !sessions.is_empty() {
            info!(count = sessions.len(), "Closing all sessions");
        }
        for (_, session) in sessions {
            session.dispose();
        }
    }
}

async fn reject<W>(mut writer: W, error: &ParleyError)
where
    W: Sink<Message> + Unpin,
{
    let frame = internal_error(&error.to_string());
    let _ = writer.send(Message::Close(Some(frame))).await;
    let _ = writer.close().await;
}
