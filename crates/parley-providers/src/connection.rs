//! Per-turn generation connection.
//!
//! Generation is a one-shot exchange: the request is the only send, so there
//! is no pre-open queue. The connection task reports tokens and failures
//! into the orchestrator's event channel, tagged with the turn.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use parley_core::config::GenerationConfig;
use parley_core::error::UpstreamError;
use parley_core::types::{ConnectionState, GenerationEvent, TurnId};

use crate::{GenerationBackend, GenerationRequest};

const UPSTREAM: &str = "generation";

#[derive(Debug, Clone, Copy)]
pub struct GenerationTimeouts {
    /// Until the backend accepts the request and starts streaming.
    pub open: Duration,
    /// Until the completion sentinel arrives, measured from open.
    pub completion: Duration,
}

impl GenerationTimeouts {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            open: Duration::from_millis(config.open_timeout_ms),
            completion: Duration::from_millis(config.completion_timeout_ms),
        }
    }
}

impl Default for GenerationTimeouts {
    fn default() -> Self {
        Self::from_config(&GenerationConfig::default())
    }
}

/// One in-flight generation request. Dropping it cancels the request.
pub struct GenerationConnection {
    turn: TurnId,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

impl GenerationConnection {
    /// Issue `request` for `turn` and stream its tokens into `events`.
    pub fn start(
        backend: Arc<dyn GenerationBackend>,
        turn: TurnId,
        request: GenerationRequest,
        timeouts: GenerationTimeouts,
        events: mpsc::Sender<GenerationEvent>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            backend,
            turn,
            request,
            timeouts,
            events,
            state_tx,
            cancel.clone(),
        ));

        Self {
            turn,
            state: state_rx,
            cancel,
            _task: task,
        }
    }

    pub fn turn(&self) -> TurnId {
        self.turn
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Abandon the request. Safe to call from any state, any number of times.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait until the connection reaches a terminal state.
    pub async fn closed(&mut self) -> ConnectionState {
        match self.state.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => ConnectionState::Closed,
        }
    }
}

impl Drop for GenerationConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    backend: Arc<dyn GenerationBackend>,
    turn: TurnId,
    request: GenerationRequest,
    timeouts: GenerationTimeouts,
    events: mpsc::Sender<GenerationEvent>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
) {
    debug!(upstream = UPSTREAM, turn, backend = backend.id(), "Opening generation request");

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            state.send_replace(ConnectionState::Closed);
            return;
        }
        opened = tokio::time::timeout(timeouts.open, backend.stream(&request)) => opened,
    };

    let mut tokens = match opened {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let err = UpstreamError::Connect {
                upstream: UPSTREAM.into(),
                reason: e.to_string(),
            };
            fail(turn, err, &events, &state, &cancel).await;
            return;
        }
        Err(_) => {
            let err = UpstreamError::Timeout {
                upstream: UPSTREAM.into(),
                what: "open".into(),
            };
            fail(turn, err, &events, &state, &cancel).await;
            return;
        }
    };

    state.send_replace(ConnectionState::Open);
    debug!(upstream = UPSTREAM, turn, state = ?ConnectionState::Open, "Generation stream open");

    let deadline = tokio::time::sleep(timeouts.completion);
    tokio::pin!(deadline);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                state.send_replace(ConnectionState::Closed);
                return;
            }
            _ = &mut deadline => {
                let err = UpstreamError::Timeout {
                    upstream: UPSTREAM.into(),
                    what: "completion sentinel".into(),
                };
                fail(turn, err, &events, &state, &cancel).await;
                return;
            }
            next = tokens.next() => next,
        };

        match next {
            Some(Ok(token)) => {
                let is_final = token.is_final;
                let delivered = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    sent = events.send(GenerationEvent::token(turn, token)) => sent.is_ok(),
                };
                if !delivered || is_final {
                    state.send_replace(ConnectionState::Closed);
                    return;
                }
            }
            Some(Err(e)) => {
                let err = UpstreamError::Closed(format!("{UPSTREAM}: {e}"));
                fail(turn, err, &events, &state, &cancel).await;
                return;
            }
            None => {
                let err = UpstreamError::Closed(format!(
                    "{UPSTREAM}: stream ended without completion sentinel"
                ));
                fail(turn, err, &events, &state, &cancel).await;
                return;
            }
        }
    }
}

async fn fail(
    turn: TurnId,
    err: UpstreamError,
    events: &mpsc::Sender<GenerationEvent>,
    state: &watch::Sender<ConnectionState>,
    cancel: &CancellationToken,
) {
    if cancel.is_cancelled() {
        state.send_replace(ConnectionState::Closed);
        return;
    }
    warn!(upstream = UPSTREAM, turn, error = %err, "Generation request failed");
    state.send_replace(ConnectionState::Failed);
    let _ = events.send(GenerationEvent::failed(turn, err.to_string())).await;
}
