//! Fake backends and a client harness shared by the gateway tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Message;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::channel::mpsc as chan;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use parley_core::config::Config;
use parley_core::error::{ParleyError, UpstreamError};
use parley_core::types::{
    ConnectionState, GenerationToken, RecognitionEvent, SynthesisEvent, TranscriptEvent, TurnId,
};
use parley_gateway::{Backends, Session, SessionManager, TurnState};
use parley_media::{
    AudioSink, PushOutcome, RecognitionBackend, SynthesisBackend, TextSink,
};
use parley_providers::{GenerationBackend, GenerationRequest, TokenStream};

pub const WAIT: Duration = Duration::from_secs(3);

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn within<T>(what: &str, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

// --- Recognition ---

#[derive(Default)]
pub struct FakeAudioSink {
    frames: Mutex<Vec<Vec<u8>>>,
    drains: AtomicUsize,
    draining: AtomicBool,
    closes: AtomicUsize,
    closed: AtomicBool,
}

impl FakeAudioSink {
    pub fn frames(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn drains(&self) -> usize {
        self.drains.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl AudioSink for FakeAudioSink {
    fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::SeqCst) {
            ConnectionState::Closed
        } else if self.draining.load(Ordering::SeqCst) {
            ConnectionState::Draining
        } else {
            ConnectionState::Open
        }
    }

    fn send_audio(&self, frame: Vec<u8>) -> Result<PushOutcome, UpstreamError> {
        if self.closed.load(Ordering::SeqCst) || self.draining.load(Ordering::SeqCst) {
            return Err(UpstreamError::Closed("recognition".into()));
        }
        self.frames.lock().unwrap().push(frame);
        Ok(PushOutcome::Queued)
    }

    fn drain(&self) {
        self.drains.fetch_add(1, Ordering::SeqCst);
        self.draining.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Stays pending while draining; the test plays a backend that never
    /// finishes.
    fn closed(&self) -> BoxFuture<'_, ConnectionState> {
        Box::pin(async move {
            while !self.closed.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            ConnectionState::Closed
        })
    }
}

/// Hands out one shared sink and keeps the event sender so tests can play
/// the recognition backend.
#[derive(Clone, Default)]
pub struct FakeRecognition {
    pub sink: Arc<FakeAudioSink>,
    events: Arc<Mutex<Option<mpsc::Sender<RecognitionEvent>>>>,
    hold_open: Arc<AtomicBool>,
}

impl FakeRecognition {
    /// Don't report `Opened` on open; the test emits it.
    pub fn hold_open(&self) {
        self.hold_open.store(true, Ordering::SeqCst);
    }

    pub async fn emit(&self, event: RecognitionEvent) {
        let sender = self.events.lock().unwrap().clone();
        sender
            .expect("recognition not opened")
            .send(event)
            .await
            .expect("orchestrator gone");
    }

    pub async fn say(&self, text: &str, is_final: bool) {
        self.emit(RecognitionEvent::Transcript(TranscriptEvent::new(text, is_final)))
            .await;
    }
}

impl RecognitionBackend for FakeRecognition {
    fn id(&self) -> &str {
        "fake-recognition"
    }

    fn open(
        &self,
        events: mpsc::Sender<RecognitionEvent>,
    ) -> Result<Arc<dyn AudioSink>, ParleyError> {
        if !self.hold_open.load(Ordering::SeqCst) {
            events
                .try_send(RecognitionEvent::Opened)
                .expect("fresh event channel");
        }
        *self.events.lock().unwrap() = Some(events);
        Ok(self.sink.clone())
    }
}

// --- Generation ---

type TokenSender = chan::UnboundedSender<anyhow::Result<GenerationToken>>;

/// Every request gets a stream the test feeds by hand.
#[derive(Clone, Default)]
pub struct FakeGeneration {
    requests: Arc<Mutex<Vec<GenerationRequest>>>,
    streams: Arc<Mutex<Vec<TokenSender>>>,
}

impl FakeGeneration {
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Push a token into the `n`th request's stream (0-based).
    pub fn token(&self, n: usize, index: usize, text: &str) {
        self.send(n, Ok(GenerationToken::fragment(text, index)));
    }

    pub fn complete(&self, n: usize, index: usize) {
        self.send(n, Ok(GenerationToken::sentinel(index)));
    }

    pub fn fail(&self, n: usize, reason: &str) {
        self.send(n, Err(anyhow::anyhow!(reason.to_string())));
    }

    /// Whether the consumer of the `n`th stream has gone away.
    pub fn is_cancelled(&self, n: usize) -> bool {
        self.streams.lock().unwrap()[n].is_closed()
    }

    fn send(&self, n: usize, item: anyhow::Result<GenerationToken>) {
        let _ = self.streams.lock().unwrap()[n].unbounded_send(item);
    }
}

#[async_trait]
impl GenerationBackend for FakeGeneration {
    fn id(&self) -> &str {
        "fake-generation"
    }

    async fn stream(&self, request: &GenerationRequest) -> anyhow::Result<TokenStream> {
        let (tx, rx) = chan::unbounded();
        self.requests.lock().unwrap().push(request.clone());
        self.streams.lock().unwrap().push(tx);
        Ok(Box::pin(rx))
    }
}

// --- Synthesis ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Text(String),
    Finish,
    Close,
}

struct FakeTextSink {
    turn: TurnId,
    calls: Arc<Mutex<HashMap<TurnId, Vec<SinkCall>>>>,
    closed: AtomicBool,
}

impl FakeTextSink {
    fn record(&self, call: SinkCall) {
        self.calls
            .lock()
            .unwrap()
            .entry(self.turn)
            .or_default()
            .push(call);
    }
}

impl TextSink for FakeTextSink {
    fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::SeqCst) {
            ConnectionState::Closed
        } else {
            ConnectionState::Open
        }
    }

    fn send_text(&self, text: &str) -> Result<(), UpstreamError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(UpstreamError::Closed("synthesis".into()));
        }
        self.record(SinkCall::Text(text.to_string()));
        Ok(())
    }

    fn finish(&self) {
        self.record(SinkCall::Finish);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.record(SinkCall::Close);
    }
}

/// Records every call per turn and lets the test emit synthesis events.
#[derive(Clone, Default)]
pub struct FakeSynthesis {
    calls: Arc<Mutex<HashMap<TurnId, Vec<SinkCall>>>>,
    events: Arc<Mutex<HashMap<TurnId, mpsc::Sender<SynthesisEvent>>>>,
    opened: Arc<Mutex<Vec<TurnId>>>,
    misconfigured: Arc<AtomicBool>,
}

impl FakeSynthesis {
    /// Make every open fail the way a missing voice id does.
    pub fn misconfigure(&self) {
        self.misconfigured.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self, turn: TurnId) -> Vec<SinkCall> {
        self.calls
            .lock()
            .unwrap()
            .get(&turn)
            .cloned()
            .unwrap_or_default()
    }

    pub fn opened(&self) -> Vec<TurnId> {
        self.opened.lock().unwrap().clone()
    }

    pub async fn emit(&self, event: SynthesisEvent) {
        let sender = self.events.lock().unwrap().get(&event.turn()).cloned();
        sender
            .expect("synthesis not opened for turn")
            .send(event)
            .await
            .expect("orchestrator gone");
    }
}

impl SynthesisBackend for FakeSynthesis {
    fn id(&self) -> &str {
        "fake-synthesis"
    }

    fn open(
        &self,
        turn: TurnId,
        events: mpsc::Sender<SynthesisEvent>,
    ) -> Result<Box<dyn TextSink>, ParleyError> {
        if self.misconfigured.load(Ordering::SeqCst) {
            return Err(ParleyError::ProtocolConfiguration(
                "synthesis voice_id is not set".into(),
            ));
        }
        self.opened.lock().unwrap().push(turn);
        self.events.lock().unwrap().insert(turn, events);
        Ok(Box::new(FakeTextSink {
            turn,
            calls: self.calls.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

// --- Harness ---

pub struct Harness {
    pub manager: Arc<SessionManager>,
    pub recognition: FakeRecognition,
    pub generation: FakeGeneration,
    pub synthesis: FakeSynthesis,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let recognition = FakeRecognition::default();
        let generation = FakeGeneration::default();
        let synthesis = FakeSynthesis::default();
        let backends = Backends {
            recognition: Arc::new(recognition.clone()),
            generation: Arc::new(generation.clone()),
            synthesis: Arc::new(synthesis.clone()),
        };
        let manager = Arc::new(SessionManager::with_factory(
            Arc::new(config),
            Arc::new(move |_: &Config| -> Result<Backends, ParleyError> {
                Ok(backends.clone())
            }),
        ));
        Self {
            manager,
            recognition,
            generation,
            synthesis,
        }
    }

    /// Connect a client over in-memory channels.
    pub async fn connect(&self) -> TestClient {
        let (writer, from_server) = chan::unbounded::<Message>();
        let (to_server, reader) = chan::unbounded::<Result<Message, std::io::Error>>();

        let session = self
            .manager
            .on_client_connect(writer)
            .await
            .expect("session should start");

        let serve = tokio::spawn({
            let manager = self.manager.clone();
            let session = session.clone();
            async move {
                session.pump_client(reader).await;
                manager.on_client_disconnect(session.id()).await;
            }
        });

        TestClient {
            session,
            to_server: Some(to_server),
            from_server,
            serve,
        }
    }
}

pub struct TestClient {
    pub session: Arc<Session>,
    to_server: Option<chan::UnboundedSender<Result<Message, std::io::Error>>>,
    pub from_server: chan::UnboundedReceiver<Message>,
    pub serve: JoinHandle<()>,
}

impl TestClient {
    pub fn send_audio(&self, data: &[u8]) {
        if let Some(tx) = &self.to_server {
            let _ = tx.unbounded_send(Ok(Message::Binary(data.to_vec().into())));
        }
    }

    /// Hang up without a close frame.
    pub fn disconnect(&mut self) {
        self.to_server.take();
    }

    /// Send a close frame, then hang up.
    pub fn close(&mut self) {
        if let Some(tx) = self.to_server.take() {
            let _ = tx.unbounded_send(Ok(Message::Close(None)));
        }
    }

    /// Next binary frame written to the client.
    pub async fn next_audio(&mut self) -> Vec<u8> {
        loop {
            match within("client audio", self.from_server.next()).await {
                Some(Message::Binary(data)) => return data.to_vec(),
                Some(_) => continue,
                None => panic!("client channel closed"),
            }
        }
    }

    pub async fn wait_state(&self, wanted: TurnState) {
        let mut states = self.session.subscribe();
        within("turn state", states.wait_for(|state| *state == wanted))
            .await
            .expect("session state channel closed");
    }
}
