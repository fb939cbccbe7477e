//! Session and turn state machine tests against fake backends.
//!
//! Run with: `cargo test -p parley-gateway --test pipeline`

mod common;

use std::time::Duration;

use axum::extract::ws::{Message, close_code};
use futures::StreamExt;

use common::{Harness, SinkCall, eventually, within};
use parley_core::types::{AudioFrame, ConnectionState, RecognitionEvent, SynthesisEvent};
use parley_gateway::TurnState;

#[tokio::test]
async fn test_client_disconnect_closes_all_upstreams() {
    let harness = Harness::new();
    let mut client = harness.connect().await;
    client.wait_state(TurnState::Listening).await;

    harness.recognition.say("turn on the lights", true).await;
    eventually("generation request", || harness.generation.request_count() == 1).await;
    harness.generation.token(0, 0, "Sure");
    client.wait_state(TurnState::Speaking).await;

    client.disconnect();
    within("serve loop", &mut client.serve).await.unwrap();

    let sink = harness.recognition.sink.clone();
    eventually("recognition closed", || sink.closes() == 1).await;
    eventually("generation cancelled", || harness.generation.is_cancelled(0)).await;
    eventually("synthesis closed", || {
        harness.synthesis.calls(1).contains(&SinkCall::Close)
    })
    .await;
    assert_eq!(harness.manager.active_sessions().await, 0);
    assert!(client.session.is_disposed());

    // Nothing reaches recognition after teardown.
    let frames = sink.frames();
    client.session.forward_audio(vec![0; 320]);
    assert_eq!(sink.frames(), frames);
}

#[tokio::test]
async fn test_client_close_frame_drains_recognition() {
    let harness = Harness::new();
    let mut client = harness.connect().await;
    client.send_audio(&[1, 2]);
    let sink = harness.recognition.sink.clone();
    eventually("frame forwarded", || sink.frames() == 1).await;

    client.close();
    within("serve loop", &mut client.serve).await.unwrap();

    assert!(client.session.is_disposed());
    assert_eq!(sink.drains(), 1);
    assert_eq!(sink.closes(), 0, "a draining connection is not cut off");
    assert_eq!(client.session.recognition_state(), ConnectionState::Draining);
    assert_eq!(harness.manager.active_sessions().await, 0);
}

#[tokio::test]
async fn test_listening_follows_recognition_connection() {
    let harness = Harness::new();
    harness.recognition.hold_open();
    let client = harness.connect().await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.session.turn_state(), TurnState::Idle);

    harness.recognition.emit(RecognitionEvent::Opened).await;
    client.wait_state(TurnState::Listening).await;

    harness
        .recognition
        .emit(RecognitionEvent::Reconnecting { attempt: 1 })
        .await;
    client.wait_state(TurnState::Idle).await;

    harness.recognition.emit(RecognitionEvent::Opened).await;
    client.wait_state(TurnState::Listening).await;
}

#[tokio::test]
async fn test_client_audio_forwarded_to_recognition() {
    let harness = Harness::new();
    let client = harness.connect().await;

    client.send_audio(&[1, 2, 3, 4]);
    client.send_audio(&[5, 6]);
    let sink = harness.recognition.sink.clone();
    eventually("frames forwarded", || sink.frames() == 2).await;
}

#[tokio::test]
async fn test_final_transcript_issues_exactly_one_request() {
    let harness = Harness::new();
    let client = harness.connect().await;

    harness.recognition.say("turn on the", false).await;
    harness.recognition.say("turn on the lights", true).await;
    eventually("generation request", || harness.generation.request_count() == 1).await;
    client.wait_state(TurnState::Generating).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let requests = harness.generation.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].user, "turn on the lights");
    assert_eq!(requests[0].model, "gpt-4o");
    assert!(requests[0].system.is_some());
}

#[tokio::test]
async fn test_tokens_stream_to_synthesis_then_drain() {
    let harness = Harness::new();
    let mut client = harness.connect().await;

    harness.recognition.say("hello", true).await;
    eventually("generation request", || harness.generation.request_count() == 1).await;
    harness.generation.token(0, 0, "Hi");
    harness.generation.token(0, 1, " there");
    harness.generation.complete(0, 2);

    eventually("synthesis drain", || {
        harness.synthesis.calls(1).contains(&SinkCall::Finish)
    })
    .await;
    assert_eq!(
        harness.synthesis.calls(1),
        vec![
            SinkCall::Text("Hi".into()),
            SinkCall::Text(" there".into()),
            SinkCall::Finish,
        ]
    );
    assert_eq!(client.session.turn_state(), TurnState::Speaking);

    harness
        .synthesis
        .emit(SynthesisEvent::Audio(AudioFrame::new(1, vec![7, 7])))
        .await;
    assert_eq!(client.next_audio().await, vec![7, 7]);

    harness.synthesis.emit(SynthesisEvent::Finished { turn: 1 }).await;
    client.wait_state(TurnState::Listening).await;

    let calls = harness.synthesis.calls(1);
    let texts = calls
        .iter()
        .filter(|call| matches!(call, SinkCall::Text(_)))
        .count();
    assert_eq!(texts, 2, "no sends after the completion sentinel");
}

#[tokio::test]
async fn test_barge_in_cancels_turn_and_drops_stale_audio() {
    let harness = Harness::new();
    let mut client = harness.connect().await;

    harness.recognition.say("tell me a story", true).await;
    eventually("first request", || harness.generation.request_count() == 1).await;
    harness.generation.token(0, 0, "Once upon a time");
    client.wait_state(TurnState::Speaking).await;
    harness
        .synthesis
        .emit(SynthesisEvent::Audio(AudioFrame::new(1, vec![1])))
        .await;
    assert_eq!(client.next_audio().await, vec![1]);

    harness.recognition.say("stop", true).await;
    eventually("second request", || harness.generation.request_count() == 2).await;

    assert!(harness.synthesis.calls(1).contains(&SinkCall::Close));
    eventually("first generation cancelled", || harness.generation.is_cancelled(0)).await;

    // Late audio from the cancelled turn never reaches the client.
    harness
        .synthesis
        .emit(SynthesisEvent::Audio(AudioFrame::new(1, vec![9])))
        .await;
    harness.generation.token(1, 0, "Okay");
    client.wait_state(TurnState::Speaking).await;
    harness
        .synthesis
        .emit(SynthesisEvent::Audio(AudioFrame::new(2, vec![2])))
        .await;
    assert_eq!(client.next_audio().await, vec![2]);

    assert_eq!(harness.synthesis.opened(), vec![1, 2]);
    assert_eq!(harness.generation.requests()[1].user, "stop");
    assert_eq!(harness.generation.request_count(), 2);
}

#[tokio::test]
async fn test_partial_transcript_does_not_interrupt() {
    let harness = Harness::new();
    let client = harness.connect().await;

    harness.recognition.say("what time is it", true).await;
    eventually("request", || harness.generation.request_count() == 1).await;
    harness.generation.token(0, 0, "It is");
    client.wait_state(TurnState::Speaking).await;

    harness.recognition.say("wait", false).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.session.turn_state(), TurnState::Speaking);
    assert_eq!(harness.generation.request_count(), 1);
    assert!(!harness.synthesis.calls(1).contains(&SinkCall::Close));
}

#[tokio::test]
async fn test_teardown_is_idempotent() {
    let harness = Harness::new();
    let client = harness.connect().await;
    let id = client.session.id().to_string();

    client.session.dispose();
    client.session.dispose();
    harness.manager.on_client_disconnect(&id).await;
    harness.manager.on_client_disconnect(&id).await;

    assert_eq!(harness.recognition.sink.closes(), 1);
    assert_eq!(client.session.recognition_state(), ConnectionState::Closed);
    assert_eq!(harness.manager.active_sessions().await, 0);
}

#[tokio::test]
async fn test_generation_failure_drops_turn_only() {
    let harness = Harness::new();
    let client = harness.connect().await;

    harness.recognition.say("first", true).await;
    eventually("first request", || harness.generation.request_count() == 1).await;
    harness.generation.fail(0, "connection reset");
    client.wait_state(TurnState::Listening).await;

    harness.recognition.say("second", true).await;
    eventually("second request", || harness.generation.request_count() == 2).await;
    client.wait_state(TurnState::Generating).await;
    assert!(!client.session.is_disposed());
}

#[tokio::test]
async fn test_synthesis_closing_early_fails_turn() {
    let harness = Harness::new();
    let client = harness.connect().await;

    harness.recognition.say("hello", true).await;
    eventually("request", || harness.generation.request_count() == 1).await;
    harness.generation.token(0, 0, "Hi");
    client.wait_state(TurnState::Speaking).await;

    harness.synthesis.emit(SynthesisEvent::Finished { turn: 1 }).await;
    client.wait_state(TurnState::Listening).await;
    eventually("generation cancelled", || harness.generation.is_cancelled(0)).await;
    assert!(!client.session.is_disposed());
}

#[tokio::test]
async fn test_misconfigured_synthesis_closes_session() {
    let harness = Harness::new();
    harness.synthesis.misconfigure();
    let mut client = harness.connect().await;

    harness.recognition.say("hello", true).await;
    eventually("request", || harness.generation.request_count() == 1).await;
    harness.generation.token(0, 0, "Hi");

    let close = loop {
        match within("close frame", client.from_server.next()).await {
            Some(Message::Close(frame)) => break frame,
            Some(_) => continue,
            None => panic!("client closed without a close frame"),
        }
    };
    let frame = close.expect("close frame should carry a code");
    assert_eq!(frame.code, close_code::ERROR);
    assert!(frame.reason.as_str().contains("voice_id"));

    within("serve loop", &mut client.serve).await.unwrap();
    assert_eq!(harness.manager.active_sessions().await, 0);
    assert_eq!(harness.recognition.sink.closes(), 1);
}

#[tokio::test]
async fn test_recognition_failure_ends_session() {
    let harness = Harness::new();
    let mut client = harness.connect().await;

    harness
        .recognition
        .emit(RecognitionEvent::Reconnecting { attempt: 1 })
        .await;
    assert!(!client.session.is_disposed());

    harness
        .recognition
        .emit(RecognitionEvent::Failed("retries exhausted".into()))
        .await;
    within("serve loop", &mut client.serve).await.unwrap();
    assert!(client.session.is_disposed());
}

#[tokio::test]
async fn test_submitted_transcript_drives_turn() {
    let harness = Harness::new();
    let client = harness.connect().await;

    client
        .session
        .submit_transcript(parley_core::types::TranscriptEvent::new(
            "from the batch path",
            true,
        ))
        .await
        .unwrap();
    eventually("request", || harness.generation.request_count() == 1).await;
    assert_eq!(harness.generation.requests()[0].user, "from the batch path");

    client.session.dispose();
    assert!(
        client
            .session
            .submit_transcript(parley_core::types::TranscriptEvent::new("late", true))
            .await
            .is_err()
    );
}
