//! Client channel adapter: the only writer to the client socket.
//!
//! Audio frames from the orchestrator go through a bounded drop-oldest queue
//! into a single writer task, so frames are never interleaved and a slow
//! client cannot stall the pipeline. Frames whose turn is no longer the
//! active turn are dropped at write time.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{CloseFrame, Message, close_code};
use futures::{Sink, SinkExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use parley_core::types::{AudioFrame, TurnId};
use parley_media::queue::{FrameQueue, PushOutcome, QueueClosed};

use crate::metrics;

/// No turn is active; every queued frame is stale.
const NO_TURN: TurnId = 0;

#[derive(Clone)]
pub struct ClientChannel {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    session_id: String,
    queue: FrameQueue<AudioFrame>,
    active_turn: AtomicU64,
    close_frame: Mutex<Option<CloseFrame>>,
}

impl ClientChannel {
    /// Start the writer task. A write error cancels `session_cancel`, which
    /// is how the session learns the client is gone.
    pub fn spawn<W>(
        session_id: &str,
        writer: W,
        capacity: usize,
        session_cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>)
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: Display,
    {
        let inner = Arc::new(ClientInner {
            session_id: session_id.to_string(),
            queue: FrameQueue::new(capacity),
            active_turn: AtomicU64::new(NO_TURN),
            close_frame: Mutex::new(None),
        });
        let task = tokio::spawn(write_loop(inner.clone(), writer, session_cancel));
        (Self { inner }, task)
    }

    /// Only frames tagged with `turn` are written from now on.
    pub fn begin_turn(&self, turn: TurnId) {
        self.inner.active_turn.store(turn, Ordering::SeqCst);
    }

    pub fn active_turn(&self) -> Option<TurnId> {
        match self.inner.active_turn.load(Ordering::SeqCst) {
            NO_TURN => None,
            turn => Some(turn),
        }
    }

    /// Drop every queued frame of `turn` and stop writing it. Returns how many
    /// queued frames were discarded.
    pub fn discard_turn(&self, turn: TurnId) -> usize {
        let _ = self.inner.active_turn.compare_exchange(
            turn,
            NO_TURN,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let removed = self.inner.queue.retain(|frame| frame.turn != turn);
        if removed > 0 {
            trace!(session_id = %self.inner.session_id, turn, removed, "Discarded queued audio");
            metrics::record_dropped_frames("stale", removed as u64);
        }
        removed
    }

    pub fn send_audio(&self, frame: AudioFrame) -> Result<PushOutcome, QueueClosed> {
        let outcome = self.inner.queue.push(frame)?;
        if outcome == PushOutcome::DroppedOldest {
            metrics::record_dropped_frames("to_client", 1);
        }
        Ok(outcome)
    }

    /// Stop writing audio, then send `frame` (or a normal close) and close
    /// the socket. Idempotent.
    pub fn close(&self, frame: Option<CloseFrame>) {
        if self.inner.queue.is_closed() {
            return;
        }
        if let Ok(mut slot) = self.inner.close_frame.lock() {
            *slot = frame;
        }
        self.inner.queue.clear();
        self.inner.queue.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.queue.is_closed()
    }
}

/// Close frame for a session that could not be set up or failed.
pub fn internal_error(reason: &str) -> CloseFrame {
    CloseFrame {
        code: close_code::ERROR,
        reason: reason.chars().take(120).collect::<String>().into(),
    }
}

async fn write_loop<W>(inner: Arc<ClientInner>, mut writer: W, session_cancel: CancellationToken)
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display,
{
    while let Some(frame) = inner.queue.pop().await {
        let active = inner.active_turn.load(Ordering::SeqCst);
        if frame.turn != active {
            trace!(session_id = %inner.session_id, turn = frame.turn, active, "Dropping stale audio frame");
            metrics::record_dropped_frames("stale", 1);
            continue;
        }
        if let Err(e) = writer.send(Message::Binary(frame.data.into())).await {
            warn!(session_id = %inner.session_id, error = %e, "Client write failed");
            inner.queue.close();
            session_cancel.cancel();
            return;
        }
    }

    let frame = inner
        .close_frame
        .lock()
        .ok()
        .and_then(|mut slot| slot.take())
        .unwrap_or(CloseFrame {
            code: close_code::NORMAL,
            reason: "session closed".into(),
        });
    debug!(session_id = %inner.session_id, code = frame.code, "Closing client socket");
    let _ = writer.send(Message::Close(Some(frame))).await;
    let _ = writer.close().await;
}
