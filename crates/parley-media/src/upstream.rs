//! Outbound websocket connection to a streaming backend.
//!
//! One task per connection owns the socket. Callers talk to it through a
//! bounded drop-oldest queue and observe its [`ConnectionState`] through a
//! watch channel; inbound frames are decoded by an [`InboundDecoder`] and
//! delivered as typed events over an mpsc channel.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use parley_core::error::{ParleyError, UpstreamError};
use parley_core::types::ConnectionState;

use crate::queue::{FrameQueue, PushOutcome};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on sending our own close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// What to do with sends issued before the connection is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreOpenPolicy {
    /// Buffer (bounded, drop-oldest) and flush once open.
    Queue,
    /// Fail with [`UpstreamError::NotReady`].
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Reconnect attempts after a failure; 0 means fail immediately.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    pub fn exponential(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
            max_backoff: MAX_BACKOFF,
        }
    }

    /// Delay before reconnect `attempt` (1-based): exponential, capped, plus
    /// up to 25% random jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let capped = self
            .base_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff);
        let jitter_ms = (capped.as_millis() as u64 / 4).max(1);
        capped + Duration::from_millis(rand::rng().random_range(0..jitter_ms))
    }
}

#[derive(Debug, Clone)]
pub struct Keepalive {
    pub interval: Duration,
    pub message: String,
}

/// Static description of one upstream connection.
#[derive(Clone)]
pub struct UpstreamSpec {
    /// Short label used in logs and errors ("recognition", "synthesis").
    pub name: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Sent first on every (re)connect, before any queued payload.
    pub handshake: Option<String>,
    /// Sent once the queue is drained after [`UpstreamConnection::drain`].
    pub end_of_stream: Option<String>,
    /// Sent whenever nothing else went out for `interval`.
    pub keepalive: Option<Keepalive>,
    pub open_timeout: Duration,
    pub drain_timeout: Duration,
    pub retry: RetryPolicy,
    pub queue_capacity: usize,
    pub pre_open: PreOpenPolicy,
    /// Reconnect when the server closes the socket. Non-persistent
    /// connections treat a server close as normal completion.
    pub persistent: bool,
}

impl UpstreamSpec {
    pub fn new(name: &'static str, url: impl Into<String>) -> Self {
        Self {
            name,
            url: url.into(),
            headers: Vec::new(),
            handshake: None,
            end_of_stream: None,
            keepalive: None,
            open_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(15),
            retry: RetryPolicy::none(),
            queue_capacity: 256,
            pre_open: PreOpenPolicy::Queue,
            persistent: false,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Outbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Binary(Vec<u8>),
    Text(String),
}

impl Outbound {
    fn into_message(self) -> Message {
        match self {
            Self::Binary(data) => Message::Binary(data.into()),
            Self::Text(text) => Message::Text(text.into()),
        }
    }
}

/// Connection lifecycle notifications handed to the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Opened,
    Reconnecting { attempt: u32 },
    Closed,
    Failed(String),
}

/// Turns raw inbound frames into typed events. Decoding failures are the
/// decoder's to log; they never close the connection.
pub trait InboundDecoder: Send + 'static {
    type Output: Send + 'static;

    fn text(&mut self, text: &str) -> Vec<Self::Output>;

    fn binary(&mut self, data: &[u8]) -> Vec<Self::Output>;

    fn lifecycle(&mut self, event: Lifecycle) -> Option<Self::Output>;
}

/// Handle to a running upstream connection. Dropping it closes the socket.
pub struct UpstreamConnection {
    name: &'static str,
    pre_open: PreOpenPolicy,
    state: Arc<watch::Sender<ConnectionState>>,
    queue: Arc<FrameQueue<Outbound>>,
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

impl UpstreamConnection {
    /// Start connecting in the background. Fails synchronously only when the
    /// `UpstreamSpec` is unusable (bad URL or header).
    pub fn open<D: InboundDecoder>(
        spec: UpstreamSpec,
        decoder: D,
        events: mpsc::Sender<D::Output>,
    ) -> Result<Self, ParleyError> {
        build_request(&spec).map_err(|reason| {
            ParleyError::ProtocolConfiguration(format!("{} upstream: {reason}", spec.name))
        })?;

        let state = Arc::new(watch::Sender::new(ConnectionState::Connecting));
        let queue = Arc::new(FrameQueue::new(spec.queue_capacity));
        let cancel = CancellationToken::new();
        let name = spec.name;
        let pre_open = spec.pre_open;

        debug!(upstream = name, state = ?ConnectionState::Connecting, "Opening upstream");
        let task = tokio::spawn(run(
            Arc::new(spec),
            decoder,
            events,
            queue.clone(),
            state.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            name,
            pre_open,
            state,
            queue,
            cancel,
            _task: task,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Queue a payload. While connecting this depends on the pre-open
    /// policy; once draining or terminal it fails with `Closed`.
    pub fn send(&self, payload: Outbound) -> Result<PushOutcome, UpstreamError> {
        let current = *self.state.borrow();
        match current {
            ConnectionState::Open => {}
            ConnectionState::Connecting if self.pre_open == PreOpenPolicy::Queue => {}
            ConnectionState::Connecting => return Err(UpstreamError::NotReady(self.name.into())),
            _ => return Err(UpstreamError::Closed(self.name.into())),
        }
        self.queue
            .push(payload)
            .map_err(|_| UpstreamError::Closed(self.name.into()))
    }

    /// Stop accepting sends, flush what is queued, send the end-of-stream
    /// message, and wait (bounded) for the server to finish.
    pub fn drain(&self) {
        transition(&self.state, self.name, ConnectionState::Draining);
        self.queue.close();
    }

    /// Close immediately, dropping anything queued. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        self.queue.close();
        transition(&self.state, self.name, ConnectionState::Closed);
    }

    /// Wait until the connection is Closed or Failed.
    pub async fn closed(&self) -> ConnectionState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => ConnectionState::Closed,
        }
    }
}

impl Drop for UpstreamConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.queue.close();
    }
}

/// Apply a state change unless it would leave a terminal state or undo a
/// drain. Returns whether the state changed.
fn transition(
    state: &watch::Sender<ConnectionState>,
    name: &'static str,
    next: ConnectionState,
) -> bool {
    state.send_if_modified(|current| {
        let allowed = match (*current, next) {
            (from, _) if from.is_terminal() => false,
            (from, to) if from == to => false,
            (ConnectionState::Draining, ConnectionState::Open | ConnectionState::Connecting) => {
                false
            }
            _ => true,
        };
        if allowed {
            debug!(upstream = name, from = ?*current, to = ?next, "Upstream state change");
            *current = next;
        }
        allowed
    })
}

fn build_request(spec: &UpstreamSpec) -> Result<Request, String> {
    let mut request = spec
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| format!("invalid url: {e}"))?;
    for (name, value) in &spec.headers {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| format!("invalid header name {name}: {e}"))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| format!("invalid value for header {name}: {e}"))?;
        request.headers_mut().insert(header, value);
    }
    Ok(request)
}

async fn connect(spec: &UpstreamSpec) -> Result<WsStream, UpstreamError> {
    let request = build_request(spec).map_err(|reason| UpstreamError::Connect {
        upstream: spec.name.into(),
        reason,
    })?;
    let (ws, response) = connect_async(request).await.map_err(|e| match e {
        WsError::Http(response) => UpstreamError::Rejected {
            upstream: spec.name.into(),
            reason: format!("HTTP {}", response.status()),
        },
        other => UpstreamError::Connect {
            upstream: spec.name.into(),
            reason: other.to_string(),
        },
    })?;
    trace!(upstream = spec.name, status = %response.status(), "Upstream handshake accepted");
    Ok(ws)
}

async fn emit<T>(events: &mpsc::Sender<T>, outputs: impl IntoIterator<Item = T>) -> bool {
    for output in outputs {
        if events.send(output).await.is_err() {
            return false;
        }
    }
    true
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

enum PumpEnd {
    /// Closed on purpose (drain, cancel, non-persistent server close).
    Done,
    Lost(String),
}

async fn run<D: InboundDecoder>(
    spec: Arc<UpstreamSpec>,
    mut decoder: D,
    events: mpsc::Sender<D::Output>,
    queue: Arc<FrameQueue<Outbound>>,
    state: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
) {
    let name = spec.name;
    let mut failures: u32 = 0;
    let mut last_error = String::new();

    loop {
        if failures > 0 {
            if failures > spec.retry.max_attempts {
                give_up(name, last_error, &mut decoder, &events, &queue, &state, &cancel).await;
                return;
            }
            if queue.is_closed() {
                finish(name, &mut decoder, &events, &queue, &state, &cancel).await;
                return;
            }

            transition(&state, name, ConnectionState::Connecting);
            let delay = spec.retry.backoff(failures);
            warn!(
                upstream = name,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "Reconnecting upstream"
            );
            if !emit(
                &events,
                decoder.lifecycle(Lifecycle::Reconnecting { attempt: failures }),
            )
            .await
            {
                finish(name, &mut decoder, &events, &queue, &state, &cancel).await;
                return;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    finish(name, &mut decoder, &events, &queue, &state, &cancel).await;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                finish(name, &mut decoder, &events, &queue, &state, &cancel).await;
                return;
            }
            connected = tokio::time::timeout(spec.open_timeout, connect(&spec)) => connected,
        };

        let ws = match connected {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                last_error = e.to_string();
                failures += 1;
                continue;
            }
            Err(_) => {
                last_error = UpstreamError::Timeout {
                    upstream: name.into(),
                    what: "open".into(),
                }
                .to_string();
                failures += 1;
                continue;
            }
        };

        match pump(&spec, ws, &mut decoder, &events, &queue, &state, &cancel).await {
            PumpEnd::Done => {
                finish(name, &mut decoder, &events, &queue, &state, &cancel).await;
                return;
            }
            PumpEnd::Lost(reason) if spec.persistent => {
                last_error = reason;
                failures = 1;
            }
            PumpEnd::Lost(reason) => {
                give_up(name, reason, &mut decoder, &events, &queue, &state, &cancel).await;
                return;
            }
        }
    }
}

async fn pump<D: InboundDecoder>(
    spec: &UpstreamSpec,
    ws: WsStream,
    decoder: &mut D,
    events: &mpsc::Sender<D::Output>,
    queue: &FrameQueue<Outbound>,
    state: &watch::Sender<ConnectionState>,
    cancel: &CancellationToken,
) -> PumpEnd {
    let name = spec.name;
    let (mut sink, mut stream) = ws.split();

    if let Some(handshake) = &spec.handshake {
        if let Err(e) = sink.send(Message::Text(handshake.clone().into())).await {
            return PumpEnd::Lost(format!("handshake send failed: {e}"));
        }
    }

    transition(state, name, ConnectionState::Open);
    info!(upstream = name, "Upstream connected");
    if !emit(events, decoder.lifecycle(Lifecycle::Opened)).await {
        return PumpEnd::Done;
    }

    let mut keepalive = spec.keepalive.as_ref().map(|k| {
        let mut interval = tokio::time::interval_at(Instant::now() + k.interval, k.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = tokio::time::timeout(CLOSE_GRACE, sink.send(Message::Close(None))).await;
                return PumpEnd::Done;
            }
            item = queue.pop() => match item {
                Some(payload) => {
                    if let Err(e) = sink.send(payload.into_message()).await {
                        return PumpEnd::Lost(format!("send failed: {e}"));
                    }
                    if let Some(interval) = keepalive.as_mut() {
                        interval.reset();
                    }
                }
                None => {
                    drain_inbound(spec, &mut sink, &mut stream, decoder, events, cancel).await;
                    return PumpEnd::Done;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if !emit(events, decoder.text(text.as_str())).await {
                        return PumpEnd::Done;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if !emit(events, decoder.binary(&data)).await {
                        return PumpEnd::Done;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(upstream = name, ?frame, "Upstream closed by server");
                    return if spec.persistent {
                        PumpEnd::Lost("closed by server".into())
                    } else {
                        PumpEnd::Done
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return PumpEnd::Lost(e.to_string()),
                None => {
                    return if spec.persistent {
                        PumpEnd::Lost("stream ended".into())
                    } else {
                        PumpEnd::Done
                    };
                }
            },
            _ = tick(&mut keepalive) => {
                if let Some(k) = &spec.keepalive {
                    trace!(upstream = name, "Sending keepalive");
                    if let Err(e) = sink.send(Message::Text(k.message.clone().into())).await {
                        return PumpEnd::Lost(format!("keepalive failed: {e}"));
                    }
                }
            }
        }
    }
}

async fn drain_inbound<D: InboundDecoder>(
    spec: &UpstreamSpec,
    sink: &mut SplitSink<WsStream, Message>,
    stream: &mut SplitStream<WsStream>,
    decoder: &mut D,
    events: &mpsc::Sender<D::Output>,
    cancel: &CancellationToken,
) {
    let name = spec.name;
    if let Some(eos) = &spec.end_of_stream {
        if let Err(e) = sink.send(Message::Text(eos.clone().into())).await {
            warn!(upstream = name, error = %e, "Failed to send end of stream");
            return;
        }
    }
    debug!(upstream = name, "Draining upstream");

    let wait = async {
        while let Some(message) = stream.next().await {
            let delivered = match message {
                Ok(Message::Text(text)) => emit(events, decoder.text(text.as_str())).await,
                Ok(Message::Binary(data)) => emit(events, decoder.binary(&data)).await,
                Ok(Message::Close(_)) | Err(_) => return,
                Ok(_) => true,
            };
            if !delivered {
                return;
            }
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        waited = tokio::time::timeout(spec.drain_timeout, wait) => {
            if waited.is_err() {
                warn!(upstream = name, "Upstream did not finish within drain timeout");
            }
        }
    }
    let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
}

async fn finish<D: InboundDecoder>(
    name: &'static str,
    decoder: &mut D,
    events: &mpsc::Sender<D::Output>,
    queue: &FrameQueue<Outbound>,
    state: &watch::Sender<ConnectionState>,
    cancel: &CancellationToken,
) {
    queue.close();
    transition(state, name, ConnectionState::Closed);
    debug!(upstream = name, "Upstream closed");
    if !cancel.is_cancelled() {
        emit(events, decoder.lifecycle(Lifecycle::Closed)).await;
    }
}

async fn give_up<D: InboundDecoder>(
    name: &'static str,
    reason: String,
    decoder: &mut D,
    events: &mpsc::Sender<D::Output>,
    queue: &FrameQueue<Outbound>,
    state: &watch::Sender<ConnectionState>,
    cancel: &CancellationToken,
) {
    queue.close();
    if cancel.is_cancelled() {
        transition(state, name, ConnectionState::Closed);
        return;
    }
    error!(upstream = name, error = %reason, "Upstream failed");
    transition(state, name, ConnectionState::Failed);
    emit(events, decoder.lifecycle(Lifecycle::Failed(reason))).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100));
        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(126));
        let third = policy.backoff(3);
        assert!(third >= Duration::from_millis(400) && third < Duration::from_millis(501));
        let huge = policy.backoff(30);
        assert!(huge >= MAX_BACKOFF && huge <= MAX_BACKOFF + Duration::from_millis(1250));
    }

    #[test]
    fn test_transition_never_leaves_terminal() {
        let state = watch::Sender::new(ConnectionState::Connecting);
        assert!(transition(&state, "t", ConnectionState::Draining));
        assert!(!transition(&state, "t", ConnectionState::Open));
        assert!(transition(&state, "t", ConnectionState::Failed));
        assert!(!transition(&state, "t", ConnectionState::Closed));
        assert_eq!(*state.borrow(), ConnectionState::Failed);
    }

    #[test]
    fn test_bad_header_is_configuration_error() {
        let spec = UpstreamSpec::new("t", "ws://127.0.0.1:1/").header("bad header", "x");
        assert!(build_request(&spec).is_err());
        let spec = UpstreamSpec::new("t", "ws://127.0.0.1:1/").header("x-api-key", "abc");
        let request = build_request(&spec).unwrap();
        assert_eq!(request.headers()["x-api-key"], "abc");
    }
}
