//! Bidirectional text channel underneath a session
//!
//! A connector opens a channel and hands back a pair of queues. The
//! WebSocket connector drives the socket with two pump tasks; the memory
//! connector hands the far ends to a test harness instead.

use super::protocol::{CLOSE_ABNORMAL, CLOSE_NORMAL};
use crate::{BriefError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

/// Close code reported when the peer closes without a status
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Frame written by the client
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Frame read from the server
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelInbound {
    Text(String),
    Closed { code: u16, reason: String },
}

/// Client side of an open channel
#[derive(Debug)]
pub struct ChannelIo {
    pub outbound: mpsc::UnboundedSender<ChannelFrame>,
    pub inbound: mpsc::UnboundedReceiver<ChannelInbound>,
}

/// Opens channels to a URL
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn open(&self, url: &str) -> Result<ChannelIo>;
}

/// WebSocket channels via tokio-tungstenite
#[derive(Clone, Debug, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

fn map_connect_error(err: tungstenite::Error) -> BriefError {
    match err {
        tungstenite::Error::Http(resp) => {
            let code = resp.status().as_u16();
            if code == 401 || code == 403 {
                BriefError::AuthenticationError(format!("Channel rejected with status {}", code))
            } else {
                BriefError::ChannelError(format!("Channel upgrade failed with status {}", code))
            }
        }
        other => BriefError::ChannelError(other.to_string()),
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn open(&self, url: &str) -> Result<ChannelIo> {
        debug!("Opening channel {}", url);
        let (ws_stream, _) = connect_async(url).await.map_err(map_connect_error)?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ChannelFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ChannelInbound>();

        // Writer: runs until the client drops its sender or sends Close
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let result = match frame {
                    ChannelFrame::Text(text) => ws_tx.send(Message::Text(text.into())).await,
                    ChannelFrame::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let _ = ws_tx.send(Message::Close(Some(frame))).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    warn!("Channel write failed: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
            debug!("Channel writer stopped");
        });

        // Reader: runs until the socket ends or the client stops listening
        tokio::spawn(async move {
            let closed = loop {
                let msg = tokio::select! {
                    msg = ws_rx.next() => msg,
                    _ = in_tx.closed() => break None,
                };

                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let text = text.as_str().to_owned();
                        if in_tx.send(ChannelInbound::Text(text)).is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(frame) => {
                                (u16::from(frame.code), frame.reason.as_str().to_owned())
                            }
                            None => (CLOSE_NO_STATUS, String::new()),
                        };
                        break Some((code, reason));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Channel read failed: {}", e);
                        break Some((CLOSE_ABNORMAL, e.to_string()));
                    }
                    None => break Some((CLOSE_ABNORMAL, "abnormal closure".to_string())),
                }
            };

            if let Some((code, reason)) = closed {
                info!("Channel closed by peer: {} {}", code, reason);
                let _ = in_tx.send(ChannelInbound::Closed { code, reason });
            }
        });

        Ok(ChannelIo {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Server side of an in-memory channel
#[derive(Debug)]
pub struct MemoryPeer {
    pub url: String,
    to_client: mpsc::UnboundedSender<ChannelInbound>,
    from_client: mpsc::UnboundedReceiver<ChannelFrame>,
}

impl MemoryPeer {
    /// Push a raw text frame to the client
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(ChannelInbound::Text(text.into())).is_ok()
    }

    /// Push a `{type, content}` frame to the client
    pub fn send(&self, kind: &str, content: &str) -> bool {
        let frame = serde_json::json!({ "type": kind, "content": content });
        self.send_text(frame.to_string())
    }

    /// Close the channel from the server side
    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.to_client
            .send(ChannelInbound::Closed {
                code,
                reason: reason.to_string(),
            })
            .is_ok()
    }

    /// Close normally
    pub fn close_normal(&self) -> bool {
        self.close(CLOSE_NORMAL, "")
    }

    /// Next frame written by the client; `None` once the client is gone
    pub async fn recv(&mut self) -> Option<ChannelFrame> {
        self.from_client.recv().await
    }

    /// Next frame if one is already queued
    pub fn try_recv(&mut self) -> Option<ChannelFrame> {
        self.from_client.try_recv().ok()
    }
}

/// Receives peers for channels opened through a [`MemoryConnector`]
#[derive(Debug)]
pub struct MemoryListener {
    accepted: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accepted.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.accepted.try_recv().ok()
    }
}

/// Loopback connector for tests and offline runs
#[derive(Clone, Debug)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<MemoryPeer>,
    failures: Arc<Mutex<VecDeque<BriefError>>>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted: tx,
                failures: Arc::new(Mutex::new(VecDeque::new())),
                attempts: Arc::new(AtomicUsize::new(0)),
            },
            MemoryListener { accepted: rx },
        )
    }

    /// Make the next open attempt fail with `error`
    pub fn fail_next(&self, error: BriefError) {
        self.failures.lock().push_back(error);
    }

    /// Number of open attempts so far, failed ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelConnector for MemoryConnector {
    async fn open(&self, url: &str) -> Result<ChannelIo> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            url: url.to_string(),
            to_client: in_tx,
            from_client: out_rx,
        };
        self.accepted
            .send(peer)
            .map_err(|_| BriefError::ChannelError("Listener dropped".into()))?;

        Ok(ChannelIo {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
