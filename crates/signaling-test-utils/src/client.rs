//! Signaling WebSocket client for end-to-end tests.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut alice = SignalingClient::connect(&server.ws_url(Some(&token))).await?;
//! alice.recv_type("connection-ready").await;
//! let joined = alice.recv_type("joined").await;
//! alice.send(json!({"type": "send-message", "data": {"text": "hi"}})).await;
//! ```

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Default wait for a single frame.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closed {
    /// Close code, if the peer sent a close frame with one.
    pub code: Option<u16>,
    pub reason: String,
}

/// A signaling client over a real WebSocket.
pub struct SignalingClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl SignalingClient {
    /// Open a connection to `url` (`ws://host:port/ws?token=...`).
    pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to {url}: {e}"))?;
        Ok(Self { ws })
    }

    /// Send a JSON message.
    pub async fn send(&mut self, message: Value) {
        self.send_raw(&message.to_string()).await;
    }

    /// Send a raw text frame.
    pub async fn send_raw(&mut self, frame: &str) {
        self.ws
            .send(Message::Text(frame.to_string()))
            .await
            .expect("Failed to send frame");
    }

    /// Next JSON message, or `None` if the connection ended first.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("Timed out waiting for a frame");
            match frame {
                Some(Ok(Message::Text(text))) => {
                    return Some(serde_json::from_str(&text).expect("Server sent invalid JSON"))
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => {}
            }
        }
    }

    /// Skip messages until one of type `kind` arrives.
    ///
    /// # Panics
    ///
    /// Panics if the connection ends or nothing matching arrives in time.
    pub async fn recv_type(&mut self, kind: &str) -> Value {
        loop {
            match self.recv().await {
                Some(message) if message["type"] == kind => return message,
                Some(_) => {}
                None => panic!("Connection ended while waiting for '{kind}'"),
            }
        }
    }

    /// Wait for the close frame, skipping any text frames before it.
    pub async fn closed(&mut self) -> Closed {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("Timed out waiting for close");
            match frame {
                Some(Ok(Message::Close(frame))) => return closed_from(frame),
                Some(Ok(_)) => {}
                Some(Err(_)) | None => {
                    return Closed {
                        code: None,
                        reason: String::new(),
                    }
                }
            }
        }
    }

    /// Assert nothing arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(Some(Ok(Message::Text(text)))) = tokio::time::timeout(wait, self.ws.next()).await
        {
            panic!("Unexpected frame: {text}");
        }
    }

    /// Assert no message of type `kind` arrives within `wait`. Other
    /// messages are discarded.
    pub async fn expect_no_type(&mut self, kind: &str, wait: Duration) {
        let deadline = tokio::time::Instant::now() + wait;
        while let Ok(frame) = tokio::time::timeout_at(deadline, self.ws.next()).await {
            match frame {
                Some(Ok(Message::Text(text))) => {
                    let message: Value =
                        serde_json::from_str(&text).expect("Server sent invalid JSON");
                    assert_ne!(message["type"], kind, "Unexpected message: {text}");
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return,
            }
        }
    }

    /// Close the connection from the client side.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

fn closed_from(frame: Option<CloseFrame<'_>>) -> Closed {
    match frame {
        Some(frame) => Closed {
            code: Some(frame.code.into()),
            reason: frame.reason.into_owned(),
        },
        None => Closed {
            code: None,
            reason: String::new(),
        },
    }
}
