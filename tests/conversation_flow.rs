//! End-to-end conversation scenarios over the in-memory transport
//!
//! The test plays both the backend (through [`MemoryPeer`]) and the user
//! (through [`MockRecognizer`]); time runs on tokio's paused clock.

use brief::conversation::{ConversationEvent, ConversationSnapshot, ConversationState};
use brief::identity::{Credentials, IdentityContext, UserProfile};
use brief::integration::{BriefConfig, Orchestrator, OrchestratorHandle, OrchestratorParts};
use brief::messages::Role;
use brief::testing::{MockRecognizer, MockSessionApi, MockSynthesizer};
use brief::transport::{ChannelFrame, MemoryConnector, MemoryListener, MemoryPeer};
use brief::utils::RetryPolicy;
use brief::BriefError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const GREETING: &str = "Good morning! You have 3 new emails.";

struct Harness {
    handle: OrchestratorHandle,
    task: JoinHandle<()>,
    listener: MemoryListener,
    connector: MemoryConnector,
    api: Arc<MockSessionApi>,
    recognizer: Arc<MockRecognizer>,
    synth: Arc<MockSynthesizer>,
    ended: Arc<AtomicUsize>,
    events: Vec<ConversationEvent>,
}

impl Harness {
    fn new() -> Self {
        Self::with_api(MockSessionApi::with_session("s1"))
    }

    fn with_api(api: MockSessionApi) -> Self {
        let identity = IdentityContext::in_memory();
        identity
            .save(&Credentials {
                token: "token-1".into(),
                user: UserProfile::new("u1", "ada@example.com"),
            })
            .unwrap();

        let (connector, listener) = MemoryConnector::new();
        let api = Arc::new(api);
        let recognizer = Arc::new(MockRecognizer::new());
        let synth = Arc::new(MockSynthesizer::with_word_delay(Duration::from_millis(50)));
        let ended = Arc::new(AtomicUsize::new(0));

        let on_end = {
            let ended = ended.clone();
            Arc::new(move || {
                ended.fetch_add(1, Ordering::SeqCst);
            })
        };

        let config = BriefConfig::default()
            .with_turn_debounce(Duration::from_millis(800))
            .with_retry(RetryPolicy::new(3, Duration::from_millis(500)));

        let (orchestrator, handle) = Orchestrator::new(
            config,
            OrchestratorParts {
                identity,
                session_api: api.clone(),
                connector: Arc::new(connector.clone()),
                recognizer: recognizer.clone(),
                synthesizer: synth.clone(),
                on_end: Some(on_end),
            },
        )
        .unwrap();

        Self {
            handle,
            task: orchestrator.start(),
            listener,
            connector,
            api,
            recognizer,
            synth,
            ended,
            events: Vec::new(),
        }
    }

    fn drain_events(&mut self) {
        while let Some(event) = self.handle.try_recv_event() {
            self.events.push(event);
        }
    }

    async fn wait_until(&mut self, what: &str, done: impl Fn(&ConversationSnapshot) -> bool) {
        for _ in 0..4000 {
            self.drain_events();
            if done(&self.handle.state()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {}: {:?}", what, self.handle.state());
    }

    async fn wait_for_state(&mut self, state: ConversationState) {
        self.wait_until(&state.to_string(), |s| s.state == state).await;
    }

    /// Start, accept the channel and play the greeting through to listening
    async fn greeted(&mut self) -> MemoryPeer {
        self.handle.start().unwrap();
        let peer = self.listener.accept().await.unwrap();
        assert!(peer.send("greeting", GREETING));
        self.wait_for_state(ConversationState::Listening).await;
        peer
    }

    fn states(&self) -> Vec<ConversationState> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ConversationEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    fn count(&self, matches: impl Fn(&ConversationEvent) -> bool) -> usize {
        self.events.iter().filter(|e| matches(e)).count()
    }

    async fn shutdown(self) {
        self.handle.shutdown().unwrap();
        self.task.await.unwrap();
    }
}

/// Next user turn the client wrote to the channel
async fn next_message(peer: &mut MemoryPeer) -> String {
    loop {
        match peer.recv().await {
            Some(ChannelFrame::Text(text)) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                if value["type"] == "message" {
                    return value["content"].as_str().unwrap().to_string();
                }
            }
            Some(frame) => panic!("unexpected frame {:?}", frame),
            None => panic!("client closed the channel"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_greeting_then_listening() {
    let mut h = Harness::new();
    let peer = h.greeted().await;

    assert_eq!(peer.url, "ws://localhost:3000/api/session/s1/chat?userId=u1");
    assert_eq!(h.synth.spoken(), vec![GREETING]);
    assert!(h.recognizer.is_listening());
    assert_eq!(
        h.states(),
        vec![
            ConversationState::Connecting,
            ConversationState::Speaking,
            ConversationState::Listening,
        ]
    );

    let snapshot = h.handle.state();
    assert_eq!(snapshot.session_id.as_deref(), Some("s1"));
    assert_eq!(snapshot.turns.len(), 1);
    assert_eq!(snapshot.turns[0].content, GREETING);
    assert!(h
        .events
        .contains(&ConversationEvent::SessionOpened { session_id: "s1".into() }));

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_streamed_reply_is_spoken_chunk_by_chunk() {
    let mut h = Harness::new();
    let mut peer = h.greeted().await;

    assert!(h.recognizer.final_segment("read my mail"));
    assert_eq!(next_message(&mut peer).await, "read my mail");
    h.wait_for_state(ConversationState::Processing).await;
    assert!(!h.recognizer.is_listening());

    for chunk in ["Sure, ", "you have ", "3 emails."] {
        assert!(peer.send("chunk", chunk));
    }
    assert!(peer.send("response", "Sure, you have 3 emails."));

    h.wait_until("second listening turn", |s| {
        s.state == ConversationState::Listening && s.turns.len() == 3
    })
    .await;

    // Every chunk spoken once, in order, and the final message not again
    assert_eq!(
        h.synth.spoken(),
        vec![GREETING, "Sure, ", "you have ", "3 emails."]
    );
    assert_eq!(h.synth.spoken()[1..].concat(), "Sure, you have 3 emails.");

    let turns = h.handle.state().turns;
    assert_eq!(turns[1].role, Role::User);
    assert_eq!(turns[1].content, "read my mail");
    assert_eq!(turns[2].content, "Sure, you have 3 emails.");
    assert!(!turns[2].is_partial);

    assert_eq!(
        h.count(|e| matches!(e, ConversationEvent::AssistantChunk { .. })),
        3
    );
    assert!(h.events.contains(&ConversationEvent::AssistantChunk {
        chunk: "3 emails.".into(),
        text: "Sure, you have 3 emails.".into(),
    }));

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_abnormal_close_stops_everything() {
    let mut h = Harness::new();
    let peer = h.greeted().await;

    assert!(peer.close(1006, "abnormal closure"));
    h.wait_for_state(ConversationState::Error).await;

    assert_eq!(
        h.handle.state().last_error,
        Some(BriefError::ConnectionError {
            code: 1006,
            reason: "abnormal closure".into()
        })
    );
    assert!(!h.recognizer.is_listening());
    assert_eq!(h.ended.load(Ordering::SeqCst), 0);
    assert_eq!(
        h.count(|e| matches!(e, ConversationEvent::Error(_))),
        1
    );

    // Nothing moves until the user starts again
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.handle.state().state, ConversationState::Error);

    h.handle.start().unwrap();
    let peer = h.listener.accept().await.unwrap();
    h.wait_for_state(ConversationState::Connecting).await;
    assert!(peer.send("greeting", "Welcome back."));
    h.wait_for_state(ConversationState::Listening).await;
    assert!(h.handle.state().last_error.is_none());
    assert_eq!(h.api.calls(), 2);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_normal_close_ends_conversation() {
    let mut h = Harness::new();
    let peer = h.greeted().await;

    assert!(peer.close_normal());
    h.wait_for_state(ConversationState::Idle).await;

    assert_eq!(h.ended.load(Ordering::SeqCst), 1);
    assert!(h.events.contains(&ConversationEvent::Ended));
    assert!(h.handle.state().last_error.is_none());

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_double_start_opens_one_session() {
    let mut h = Harness::with_api(
        MockSessionApi::with_session("s1").delayed(Duration::from_millis(200)),
    );

    h.handle.start().unwrap();
    h.handle.start().unwrap();
    let peer = h.listener.accept().await.unwrap();
    assert!(peer.send("greeting", GREETING));
    h.wait_for_state(ConversationState::Listening).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(h.api.calls(), 1);
    assert_eq!(h.connector.attempts(), 1);
    assert!(h.listener.try_accept().is_none());
    assert_eq!(
        h.count(|e| matches!(
            e,
            ConversationEvent::StateChanged {
                to: ConversationState::Connecting,
                ..
            }
        )),
        1
    );

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_end_silences_pending_work() {
    let mut h = Harness::new();
    let mut peer = h.greeted().await;

    // Words are pending in the debounce window when the user ends
    assert!(h.recognizer.final_segment("read my mail"));
    h.handle.end().unwrap();
    h.wait_for_state(ConversationState::Idle).await;

    // Only the close handshake reaches the server
    let mut frames = Vec::new();
    while let Some(frame) = peer.recv().await {
        frames.push(frame);
    }
    assert_eq!(
        frames,
        vec![
            ChannelFrame::Text("{\"type\":\"close\"}".into()),
            ChannelFrame::Close {
                code: 1000,
                reason: "Client disconnect".into()
            },
        ]
    );

    // Late server traffic changes nothing
    let _ = peer.send("response", "too late");
    tokio::time::sleep(Duration::from_secs(3)).await;
    h.drain_events();

    let snapshot = h.handle.state();
    assert_eq!(snapshot.state, ConversationState::Idle);
    assert_eq!(h.synth.spoken(), vec![GREETING]);
    assert_eq!(h.count(|e| matches!(e, ConversationEvent::UserTurn(_))), 0);
    assert!(!h.recognizer.is_listening());
    assert_eq!(h.ended.load(Ordering::SeqCst), 1);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_end_right_after_start_opens_no_session() {
    let mut h = Harness::new();
    h.handle.start().unwrap();
    h.handle.end().unwrap();
    h.wait_until("end of first conversation", |s| {
        s.state == ConversationState::Idle && s.epoch == 2
    })
    .await;

    // Give a leaked connect every chance to run
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.api.calls(), 0);
    assert_eq!(h.connector.attempts(), 0);
    assert!(h.listener.try_accept().is_none());
    assert_eq!(h.ended.load(Ordering::SeqCst), 1);

    let _peer = h.greeted().await;
    assert_eq!(h.api.calls(), 1);
    assert_eq!(h.synth.spoken(), vec![GREETING]);
    assert!(h.recognizer.is_listening());

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_end_start_reaches_listening() {
    let mut h = Harness::new();
    h.handle.start().unwrap();
    h.handle.end().unwrap();
    h.handle.start().unwrap();

    let peer = h.listener.accept().await.unwrap();
    assert!(peer.send("greeting", GREETING));
    h.wait_for_state(ConversationState::Listening).await;

    assert_eq!(h.handle.state().epoch, 3);
    assert_eq!(h.api.calls(), 1);
    assert!(h.listener.try_accept().is_none());
    assert_eq!(h.synth.spoken(), vec![GREETING]);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_finals_within_debounce_make_one_turn() {
    let mut h = Harness::new();
    let mut peer = h.greeted().await;

    assert!(h.recognizer.final_segment("read my"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.recognizer.final_segment("mail"));

    assert_eq!(next_message(&mut peer).await, "read my mail");
    h.wait_for_state(ConversationState::Processing).await;

    tokio::time::sleep(Duration::from_secs(3)).await;
    h.drain_events();
    assert!(peer.try_recv().is_none());
    assert_eq!(h.count(|e| matches!(e, ConversationEvent::UserTurn(_))), 1);
    assert_eq!(
        h.count(|e| matches!(
            e,
            ConversationEvent::StateChanged {
                to: ConversationState::Processing,
                ..
            }
        )),
        1
    );

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_playback_and_listening() {
    let mut h = Harness::new();
    h.handle.start().unwrap();
    let peer = h.listener.accept().await.unwrap();
    assert!(peer.send("greeting", GREETING));
    h.wait_for_state(ConversationState::Speaking).await;

    h.handle.pause().unwrap();
    h.wait_until("paused", |s| s.paused).await;
    assert_eq!(h.synth.pauses(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.handle.state().state, ConversationState::Speaking);
    assert!(!h.recognizer.is_listening());

    h.handle.pause_resume().unwrap();
    h.wait_for_state(ConversationState::Listening).await;
    assert!(!h.handle.state().paused);
    assert_eq!(h.synth.spoken(), vec![GREETING]);

    // Pausing while listening closes the window until resumed
    h.handle.pause().unwrap();
    h.wait_until("paused", |s| s.paused).await;
    assert!(!h.recognizer.is_listening());
    h.handle.resume().unwrap();
    h.wait_until("listening again", |s| !s.paused).await;
    assert!(h.recognizer.is_listening());

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_handshake_failure_is_reported() {
    let mut h = Harness::with_api(MockSessionApi::with_error(BriefError::HandshakeError(
        "Failed to create session".into(),
    )));

    h.handle.start().unwrap();
    h.wait_for_state(ConversationState::Error).await;

    assert_eq!(h.api.calls(), 1);
    assert_eq!(h.connector.attempts(), 0);
    assert!(h.events.iter().any(|e| matches!(
        e,
        ConversationEvent::Error(BriefError::HandshakeError(_))
    )));

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_server_error_frame_stops_conversation() {
    let mut h = Harness::new();
    let peer = h.greeted().await;

    assert!(peer.send("error", "Inbox unavailable"));
    h.wait_for_state(ConversationState::Error).await;
    assert_eq!(
        h.handle.state().last_error,
        Some(BriefError::ServerError("Inbox unavailable".into()))
    );

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_emits_event() {
    let mut h = Harness::new();
    let _peer = h.greeted().await;

    h.handle.shutdown().unwrap();
    (&mut h.task).await.unwrap();
    h.drain_events();

    assert_eq!(h.events.last(), Some(&ConversationEvent::Shutdown));
    assert!(!h.recognizer.is_listening());
    assert!(h.handle.start().is_err());
}
