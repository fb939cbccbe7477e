//! One voice session: a client channel, a recognition connection, and the
//! orchestrator task that owns the per-turn generation and synthesis
//! connections.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use futures::{Sink, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use parley_core::config::Config;
use parley_core::error::ParleyError;
use parley_core::types::{ConnectionState, RecognitionEvent, TranscriptEvent};
use parley_media::{AudioSink, PushOutcome};

use crate::client::{ClientChannel, internal_error};
use crate::manager::Backends;
use crate::metrics;
use crate::orchestrator::{Orchestrator, TurnState};

/// How long disposal waits for session tasks before aborting them.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Session {
    id: String,
    started: Instant,
    client: ClientChannel,
    recognition: Arc<dyn AudioSink>,
    recognition_tx: mpsc::Sender<RecognitionEvent>,
    cancel: CancellationToken,
    disposed: AtomicBool,
    turn_state: watch::Receiver<TurnState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Open the recognition connection and start the orchestrator. On
    /// failure the client is closed with an internal-error close frame.
    pub fn start<W>(
        id: String,
        config: &Config,
        backends: &Backends,
        writer: W,
    ) -> Result<Arc<Self>, ParleyError>
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: Display,
    {
        let pipeline = config.pipeline();
        let cancel = CancellationToken::new();
        let (client, writer_task) =
            ClientChannel::spawn(&id, writer, pipeline.client_queue_capacity, cancel.clone());

        let (recognition_tx, recognition_rx) = mpsc::channel(pipeline.event_buffer.max(1));
        let recognition = match backends.recognition.open(recognition_tx.clone()) {
            Ok(recognition) => recognition,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to open recognition");
                client.close(Some(internal_error(&e.to_string())));
                return Err(e);
            }
        };

        let (orchestrator, inbox) = Orchestrator::new(
            &id,
            backends.generation.clone(),
            backends.synthesis.clone(),
            config,
            client.clone(),
        );
        let turn_state = orchestrator.subscribe();

        let orchestrator_task = tokio::spawn({
            let id = id.clone();
            let client = client.clone();
            let cancel = cancel.clone();
            async move {
                if let Err(e) = orchestrator.run(recognition_rx, inbox, cancel.clone()).await {
                    error!(session_id = %id, error = %e, "Session failed");
                    client.close(Some(internal_error(&e.to_string())));
                }
                cancel.cancel();
            }
        });

        debug!(
            session_id = %id,
            recognition = backends.recognition.id(),
            generation = backends.generation.id(),
            synthesis = backends.synthesis.id(),
            "Session started"
        );

        Ok(Arc::new(Self {
            id,
            started: Instant::now(),
            client,
            recognition,
            recognition_tx,
            cancel,
            disposed: AtomicBool::new(false),
            turn_state,
            tasks: Mutex::new(vec![writer_task, orchestrator_task]),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn turn_state(&self) -> TurnState {
        *self.turn_state.borrow()
    }

    /// Watch turn state transitions.
    pub fn subscribe(&self) -> watch::Receiver<TurnState> {
        self.turn_state.clone()
    }

    pub fn recognition_state(&self) -> ConnectionState {
        self.recognition.state()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Resolves once the session has been cancelled for any reason.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Read client frames until the client goes away or the session ends.
    /// Binary frames are audio; everything else is ignored. A close frame
    /// drains recognition so the backend can finalize what it has heard.
    pub async fn pump_client<R, E>(&self, mut reader: R)
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = reader.next() => message,
            };

            match message {
                Some(Ok(Message::Binary(data))) => self.forward_audio(data.to_vec()),
                Some(Ok(Message::Close(_))) => {
                    debug!(session_id = %self.id, "Client closed, draining recognition");
                    self.recognition.drain();
                    break;
                }
                None => {
                    debug!(session_id = %self.id, "Client disconnected");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session_id = %self.id, error = %e, "Client read failed");
                    break;
                }
            }
        }
    }

    /// Forward one client audio frame to recognition. Lossy: frames are
    /// dropped once the session is disposed or recognition has closed.
    pub fn forward_audio(&self, frame: Vec<u8>) {
        if self.is_disposed() {
            return;
        }
        match self.recognition.send_audio(frame) {
            Ok(PushOutcome::Queued) => {}
            Ok(PushOutcome::DroppedOldest) => metrics::record_dropped_frames("to_recognition", 1),
            Err(e) => {
                trace!(session_id = %self.id, error = %e, "Dropping client audio");
                metrics::record_dropped_frames("to_recognition", 1);
            }
        }
    }

    /// Feed a transcript from another producer (e.g. a batch transcription
    /// callback) into the same turn state machine.
    pub async fn submit_transcript(&self, transcript: TranscriptEvent) -> Result<(), ParleyError> {
        if self.is_disposed() {
            return Err(ParleyError::Session(format!("session {} is closed", self.id)));
        }
        self.recognition_tx
            .send(RecognitionEvent::Transcript(transcript))
            .await
            .map_err(|_| ParleyError::Session(format!("session {} is closed", self.id)))
    }

    /// Tear everything down. In-flight requests are cancelled, not awaited.
    /// A draining recognition connection is left to finish within
    /// [`REAP_TIMEOUT`]. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session_id = %self.id, "Disposing session");

        self.cancel.cancel();
        if self.recognition.state() != ConnectionState::Draining {
            self.recognition.close();
        }
        self.client.close(None);

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        tokio::spawn(reap(self.id.clone(), tasks, self.recognition.clone()));

        metrics::record_session_close(self.started.elapsed().as_secs_f64());
    }
}

async fn reap(session_id: String, tasks: Vec<JoinHandle<()>>, recognition: Arc<dyn AudioSink>) {
    for mut task in tasks {
        if tokio::time::timeout(REAP_TIMEOUT, &mut task).await.is_err() {
            warn!(session_id = %session_id, "Session task did not stop, aborting");
            task.abort();
        }
    }
    if tokio::time::timeout(REAP_TIMEOUT, recognition.closed()).await.is_err() {
        warn!(session_id = %session_id, "Recognition did not finish draining, closing");
        recognition.close();
    }
}
