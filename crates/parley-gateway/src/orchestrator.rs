//! Turn state machine for one session.
//!
//! The orchestrator is the single consumer of every upstream event channel.
//! All transitions happen inside [`Orchestrator::run`], one event at a time,
//! so no two transitions ever apply concurrently to the same session.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use parley_core::config::{Config, GenerationConfig};
use parley_core::error::ParleyError;
use parley_core::types::{
    AudioFrame, GenerationEvent, GenerationEventKind, RecognitionEvent, SynthesisEvent,
    TranscriptEvent, TurnId,
};
use parley_media::{SynthesisBackend, TextSink};
use parley_providers::{
    GenerationBackend, GenerationConnection, GenerationRequest, GenerationTimeouts,
};

use crate::client::ClientChannel;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// No turn in progress and recognition is not open.
    Idle,
    /// Recognition is open and forwarding; waiting for a final transcript.
    Listening,
    Generating,
    Speaking,
    /// Transient: the active turn is being torn down after a barge-in.
    Cancelling,
}

impl TurnState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Generating | Self::Speaking | Self::Cancelling)
    }
}

/// Receiving ends of the per-turn event channels. Handed to
/// [`Orchestrator::run`] separately so the select loop can borrow them while
/// the handlers borrow the orchestrator.
pub struct OrchestratorInbox {
    generation: mpsc::Receiver<GenerationEvent>,
    synthesis: mpsc::Receiver<SynthesisEvent>,
}

struct ActiveTurn {
    id: TurnId,
    generation: GenerationConnection,
    synthesis: Option<Box<dyn TextSink>>,
    generation_done: bool,
    started_at: Instant,
    first_audio: bool,
}

impl ActiveTurn {
    fn close(&self) {
        self.generation.close();
        if let Some(synthesis) = &self.synthesis {
            synthesis.close();
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

pub struct Orchestrator {
    session_id: String,
    generation: Arc<dyn GenerationBackend>,
    synthesis: Arc<dyn SynthesisBackend>,
    settings: GenerationConfig,
    timeouts: GenerationTimeouts,
    client: ClientChannel,
    state: watch::Sender<TurnState>,
    last_turn: TurnId,
    active: Option<ActiveTurn>,
    recognition_open: bool,
    generation_tx: mpsc::Sender<GenerationEvent>,
    synthesis_tx: mpsc::Sender<SynthesisEvent>,
}

impl Orchestrator {
    pub fn new(
        session_id: &str,
        generation: Arc<dyn GenerationBackend>,
        synthesis: Arc<dyn SynthesisBackend>,
        config: &Config,
        client: ClientChannel,
    ) -> (Self, OrchestratorInbox) {
        let buffer = config.pipeline().event_buffer.max(1);
        let (generation_tx, generation_rx) = mpsc::channel(buffer);
        let (synthesis_tx, synthesis_rx) = mpsc::channel(buffer);
        let settings = config.generation();

        let orchestrator = Self {
            session_id: session_id.to_string(),
            generation,
            synthesis,
            timeouts: GenerationTimeouts::from_config(&settings),
            settings,
            client,
            state: watch::Sender::new(TurnState::Idle),
            last_turn: 0,
            active: None,
            recognition_open: false,
            generation_tx,
            synthesis_tx,
        };
        let inbox = OrchestratorInbox {
            generation: generation_rx,
            synthesis: synthesis_rx,
        };
        (orchestrator, inbox)
    }

    pub fn state(&self) -> TurnState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TurnState> {
        self.state.subscribe()
    }

    /// Sequence number of the turn in progress, if any.
    pub fn active_turn(&self) -> Option<TurnId> {
        self.active.as_ref().map(|turn| turn.id)
    }

    /// Drive the state machine until the session is cancelled, recognition
    /// ends, or a fatal error occurs. Always leaves every per-turn
    /// connection closed.
    pub async fn run(
        mut self,
        mut recognition: mpsc::Receiver<RecognitionEvent>,
        mut inbox: OrchestratorInbox,
        cancel: CancellationToken,
    ) -> Result<(), ParleyError> {
        let result = loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Ok(Flow::Stop),
                event = recognition.recv() => match event {
                    Some(event) => self.handle_recognition(event),
                    None => Ok(Flow::Stop),
                },
                Some(event) = inbox.generation.recv() => {
                    self.handle_generation(event).map(|_| Flow::Continue)
                }
                Some(event) = inbox.synthesis.recv() => {
                    self.handle_synthesis(event);
                    Ok(Flow::Continue)
                }
            };

            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.shutdown();
        result
    }

    fn handle_recognition(&mut self, event: RecognitionEvent) -> Result<Flow, ParleyError> {
        match event {
            RecognitionEvent::Transcript(transcript) => {
                self.handle_transcript(transcript);
                Ok(Flow::Continue)
            }
            RecognitionEvent::Opened => {
                debug!(session_id = %self.session_id, "Recognition open");
                self.recognition_open = true;
                if self.active.is_none() {
                    self.set_state(TurnState::Listening);
                }
                Ok(Flow::Continue)
            }
            RecognitionEvent::Reconnecting { attempt } => {
                warn!(session_id = %self.session_id, attempt, "Recognition reconnecting");
                self.recognition_open = false;
                if self.active.is_none() {
                    self.set_state(TurnState::Idle);
                }
                Ok(Flow::Continue)
            }
            RecognitionEvent::Failed(reason) => {
                error!(session_id = %self.session_id, reason = %reason, "Recognition failed");
                metrics::record_upstream_failure("recognition");
                Err(ParleyError::Session(format!("recognition failed: {reason}")))
            }
            RecognitionEvent::Closed => {
                debug!(session_id = %self.session_id, "Recognition closed");
                Ok(Flow::Stop)
            }
        }
    }

    /// Only a final transcript starts a turn. If one is already in progress,
    /// it is cancelled first (barge-in).
    fn handle_transcript(&mut self, transcript: TranscriptEvent) {
        if !transcript.starts_turn() {
            trace!(session_id = %self.session_id, text = %transcript.text, "Partial transcript");
            return;
        }
        if self.active.is_some() {
            self.barge_in();
        }
        self.begin_turn(transcript.text.trim());
    }

    fn begin_turn(&mut self, text: &str) {
        self.last_turn += 1;
        let turn = self.last_turn;
        self.client.begin_turn(turn);

        let mut request = GenerationRequest::new(self.settings.model.clone(), text)
            .with_system(self.settings.system_prompt.clone());
        request.max_tokens = self.settings.max_tokens;
        request.temperature = self.settings.temperature;

        info!(session_id = %self.session_id, turn, text, "Turn started");
        metrics::record_turn_started();

        let generation = GenerationConnection::start(
            self.generation.clone(),
            turn,
            request,
            self.timeouts,
            self.generation_tx.clone(),
        );
        self.active = Some(ActiveTurn {
            id: turn,
            generation,
            synthesis: None,
            generation_done: false,
            started_at: Instant::now(),
            first_audio: false,
        });
        self.set_state(TurnState::Generating);
    }

    /// A fatal error (bad synthesis configuration) ends the session; every
    /// other failure only drops the turn.
    fn handle_generation(&mut self, event: GenerationEvent) -> Result<(), ParleyError> {
        if self.active_turn() != Some(event.turn) {
            trace!(session_id = %self.session_id, turn = event.turn, "Ignoring generation event for stale turn");
            return Ok(());
        }

        match event.kind {
            GenerationEventKind::Token(token) if token.is_final => {
                self.generation_finished();
                Ok(())
            }
            GenerationEventKind::Token(token) => self.forward_token(event.turn, &token.text),
            GenerationEventKind::Failed(reason) => {
                metrics::record_upstream_failure("generation");
                self.fail_turn("generation", &reason);
                Ok(())
            }
        }
    }

    fn forward_token(&mut self, turn: TurnId, text: &str) -> Result<(), ParleyError> {
        if text.is_empty() {
            return Ok(());
        }

        let needs_synthesis = self
            .active
            .as_ref()
            .is_some_and(|active| active.synthesis.is_none());
        if needs_synthesis {
            match self.synthesis.open(turn, self.synthesis_tx.clone()) {
                Ok(sink) => {
                    if let Some(active) = self.active.as_mut() {
                        active.synthesis = Some(sink);
                    }
                    self.set_state(TurnState::Speaking);
                }
                Err(e) if e.is_fatal() => {
                    error!(session_id = %self.session_id, turn, error = %e, "Synthesis misconfigured");
                    return Err(e);
                }
                Err(e) => {
                    metrics::record_upstream_failure("synthesis");
                    self.fail_turn("synthesis", &e.to_string());
                    return Ok(());
                }
            }
        }

        let sent = match self.active.as_ref().and_then(|a| a.synthesis.as_ref()) {
            Some(synthesis) => synthesis.send_text(text),
            None => return Ok(()),
        };
        if let Err(e) = sent {
            self.fail_turn("synthesis", &e.to_string());
        }
        Ok(())
    }

    /// Completion sentinel: let synthesis finish what it has, then close.
    fn generation_finished(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.generation_done = true;
        match &active.synthesis {
            Some(synthesis) => {
                debug!(session_id = %self.session_id, turn = active.id, "Generation complete, draining synthesis");
                synthesis.finish();
            }
            // Nothing was said; the turn is over.
            None => self.complete_turn(),
        }
    }

    fn handle_synthesis(&mut self, event: SynthesisEvent) {
        if self.active_turn() != Some(event.turn()) {
            if matches!(event, SynthesisEvent::Audio(_)) {
                trace!(session_id = %self.session_id, turn = event.turn(), "Dropping audio for stale turn");
                metrics::record_dropped_frames("stale", 1);
            }
            return;
        }

        match event {
            SynthesisEvent::Audio(frame) => self.forward_audio(frame),
            SynthesisEvent::Finished { .. } => {
                let generation_done = self
                    .active
                    .as_ref()
                    .is_some_and(|active| active.generation_done);
                if generation_done {
                    self.complete_turn();
                } else {
                    self.fail_turn("synthesis", "synthesis closed before generation completed");
                }
            }
            SynthesisEvent::Failed { reason, .. } => {
                metrics::record_upstream_failure("synthesis");
                self.fail_turn("synthesis", &reason);
            }
        }
    }

    fn forward_audio(&mut self, frame: AudioFrame) {
        if self.state() != TurnState::Speaking {
            return;
        }
        if let Some(active) = self.active.as_mut() {
            if !active.first_audio {
                active.first_audio = true;
                metrics::record_first_audio_latency(active.started_at.elapsed().as_secs_f64());
            }
        }
        if self.client.send_audio(frame).is_err() {
            debug!(session_id = %self.session_id, "Client channel closed, dropping audio");
        }
    }

    /// Normal completion. Audio already queued for the client still plays.
    fn complete_turn(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.close();
        let elapsed = active.started_at.elapsed();
        info!(session_id = %self.session_id, turn = active.id, elapsed_ms = elapsed.as_millis() as u64, "Turn completed");
        metrics::record_turn_completed(elapsed.as_secs_f64());
        self.set_state(self.resting_state());
    }

    /// Drop the turn silently; the session keeps listening.
    fn fail_turn(&mut self, stage: &str, reason: &str) {
        let Some(active) = self.active.take() else {
            return;
        };
        warn!(session_id = %self.session_id, turn = active.id, stage, reason, "Turn failed");
        active.close();
        self.client.discard_turn(active.id);
        metrics::record_turn_failed(stage);
        self.set_state(self.resting_state());
    }

    fn barge_in(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.set_state(TurnState::Cancelling);
        active.close();
        let discarded = self.client.discard_turn(active.id);
        info!(session_id = %self.session_id, turn = active.id, discarded, "Barge-in, turn cancelled");
        metrics::record_barge_in();
        self.set_state(self.resting_state());
    }

    /// Close whatever the active turn holds. Idempotent.
    fn shutdown(&mut self) {
        if let Some(active) = self.active.take() {
            active.close();
            self.client.discard_turn(active.id);
        }
        self.set_state(TurnState::Idle);
    }

    /// State between turns: Listening only while recognition is open.
    fn resting_state(&self) -> TurnState {
        if self.recognition_open {
            TurnState::Listening
        } else {
            TurnState::Idle
        }
    }

    fn set_state(&self, next: TurnState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            debug!(session_id = %self.session_id, from = ?*state, to = ?next, "Turn state");
            *state = next;
            true
        });
    }
}
