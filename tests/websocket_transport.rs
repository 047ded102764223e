//! `SessionTransport` over `WsConnector` against a local WebSocket server

use brief::identity::{Credentials, IdentityContext, UserProfile};
use brief::testing::MockSessionApi;
use brief::transport::{
    ChannelConnector, ConnectOutcome, ConnectionStatus, MessageKind, SessionTransport,
    TransportEnvelope, TransportEvent, WsConnector,
};
use brief::utils::RetryPolicy;
use brief::BriefError;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type ServerSocket = WebSocketStream<TcpStream>;

fn text(json: &str) -> Message {
    Message::Text(json.to_string().into())
}

/// Accept one WebSocket client and run `script` on it; returns the base URL
async fn serve_once<F, Fut>(script: F) -> String
where
    F: FnOnce(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        script(ws).await;
    });
    format!("ws://{}", addr)
}

fn signed_in() -> IdentityContext {
    let identity = IdentityContext::in_memory();
    identity
        .save(&Credentials {
            token: "token-1".into(),
            user: UserProfile::new("u1", "ada@example.com"),
        })
        .unwrap();
    identity
}

fn transport(base: &str) -> (SessionTransport, mpsc::UnboundedReceiver<TransportEnvelope>) {
    SessionTransport::new(
        Arc::new(MockSessionApi::with_session("s1")),
        Arc::new(WsConnector::new()),
        base,
        RetryPolicy::no_retry(),
    )
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEnvelope>) -> TransportEvent {
    let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("transport event channel closed");
    envelope.event
}

#[tokio::test]
async fn test_session_round_trip() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let base = serve_once(move |mut ws| async move {
        ws.send(text(r#"{"type":"greeting","content":"Hello"}"#))
            .await
            .unwrap();
        if let Some(Ok(Message::Text(body))) = ws.next().await {
            let _ = seen_tx.send(body.as_str().to_owned());
        }
        ws.send(text(r#"{"type":"chunk","content":"Two "}"#)).await.unwrap();
        ws.send(text(r#"{"type":"typing"}"#)).await.unwrap();
        ws.send(text("not json")).await.unwrap();
        ws.send(text(r#"{"type":"response","content":"Two emails"}"#))
            .await
            .unwrap();
        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "done".to_string().into(),
            }))
            .await;
    })
    .await;

    let (transport, mut events) = transport(&base);
    let outcome = transport.connect(&signed_in(), 7).await.unwrap();
    assert!(matches!(outcome, ConnectOutcome::Connected(ref s) if s.session_id == "s1"));
    assert_eq!(transport.status(), ConnectionStatus::Connected);

    assert_eq!(next_event(&mut events).await, TransportEvent::Opened);
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Message {
            content: "Hello".into(),
            kind: MessageKind::Greeting
        }
    );

    transport.send("how many emails").unwrap();
    assert_eq!(
        seen_rx.recv().await.unwrap(),
        r#"{"type":"message","content":"how many emails"}"#
    );

    // Unknown and malformed frames are skipped
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Chunk("Two ".into())
    );
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Message {
            content: "Two emails".into(),
            kind: MessageKind::Response
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Closed {
            code: 1000,
            reason: "done".into()
        }
    );
    assert_eq!(transport.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_dropped_socket_is_abnormal() {
    let base = serve_once(|ws| async move {
        drop(ws);
    })
    .await;

    let (transport, mut events) = transport(&base);
    transport.connect(&signed_in(), 1).await.unwrap();
    assert_eq!(next_event(&mut events).await, TransportEvent::Opened);

    match next_event(&mut events).await {
        TransportEvent::Closed { code, .. } => assert_eq!(code, 1006),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(transport.status(), ConnectionStatus::Error);
}

#[tokio::test]
async fn test_close_without_status() {
    let base = serve_once(|mut ws| async move {
        let _ = ws.close(None).await;
    })
    .await;

    let (transport, mut events) = transport(&base);
    transport.connect(&signed_in(), 1).await.unwrap();
    assert_eq!(next_event(&mut events).await, TransportEvent::Opened);
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Closed {
            code: 1005,
            reason: String::new()
        }
    );
    assert_eq!(transport.status(), ConnectionStatus::Error);
}

#[tokio::test]
async fn test_client_disconnect_closes_normally() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let base = serve_once(move |mut ws| async move {
        while let Some(Ok(message)) = ws.next().await {
            let seen = match message {
                Message::Text(body) => body.as_str().to_owned(),
                Message::Close(Some(frame)) => {
                    format!("close {} {}", u16::from(frame.code), frame.reason.as_str())
                }
                _ => continue,
            };
            let _ = seen_tx.send(seen);
        }
    })
    .await;

    let (transport, mut events) = transport(&base);
    transport.connect(&signed_in(), 1).await.unwrap();
    assert_eq!(next_event(&mut events).await, TransportEvent::Opened);

    transport.disconnect();
    assert_eq!(transport.status(), ConnectionStatus::Disconnected);
    assert_eq!(seen_rx.recv().await.unwrap(), r#"{"type":"close"}"#);
    assert_eq!(seen_rx.recv().await.unwrap(), "close 1000 Client disconnect");

    assert!(matches!(
        transport.send("anyone there"),
        Err(BriefError::TransportError(_))
    ));
}

#[tokio::test]
async fn test_rejected_upgrade_is_an_authentication_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 2048];
        let _ = stream.read(&mut request).await;
        let _ = stream
            .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
            .await;
    });

    let result = WsConnector::new()
        .open(&format!("ws://{}/api/session/s1/chat", addr))
        .await;
    assert!(matches!(result, Err(BriefError::AuthenticationError(_))));
}
