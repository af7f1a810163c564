//! Minimal DevTools protocol client.
//!
//! One websocket connection serves the whole browser: commands are
//! correlated to replies by an integer id, events fan out to a single
//! consumer channel. Sessions are flat: a command scoped to a tab
//! carries its `sessionId` at the top level of the frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{trace, warn};

use crate::BrowserError;

/// One protocol event received from the browser.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

type Reply = Result<Value, BrowserError>;
type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Cloneable handle to the browser's DevTools websocket.
#[derive(Clone)]
pub struct CdpConnection {
    out_tx: mpsc::UnboundedSender<Message>,
    pending: PendingCalls,
    next_id: Arc<AtomicU64>,
}

fn lock_pending(pending: &PendingCalls) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CdpConnection {
    /// Connect to a `ws://…/devtools/browser/…` endpoint. Returns the
    /// command handle plus the stream of protocol events.
    pub async fn connect(
        ws_url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CdpEvent>), BrowserError> {
        // Page bodies and injected scripts routinely exceed the default
        // frame limits.
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = None;
        ws_config.max_frame_size = None;

        let (stream, _) =
            tokio_tungstenite::connect_async_with_config(ws_url, Some(ws_config), false)
                .await
                .map_err(|e| BrowserError::Connect(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<CdpEvent>();
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));

        // Writer half.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(err) = sink.send(msg).await {
                    warn!(target: "browser.cdp", %err, "devtools socket write failed");
                    break;
                }
            }
        });

        // Reader half: correlate replies, fan out events.
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            while let Some(next) = source.next().await {
                let text = match next {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let value: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(err) => {
                        warn!(target: "browser.cdp", %err, "unparseable devtools frame");
                        continue;
                    }
                };
                if let Some(id) = value.get("id").and_then(Value::as_u64) {
                    let reply = match value.get("error") {
                        Some(err) => Err(BrowserError::Protocol(
                            err.get("message")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown error")
                                .to_string(),
                        )),
                        None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
                    };
                    if let Some(tx) = lock_pending(&reader_pending).remove(&id) {
                        let _ = tx.send(reply);
                    }
                } else if let Some(method) = value.get("method").and_then(Value::as_str) {
                    let event = CdpEvent {
                        method: method.to_string(),
                        params: value.get("params").cloned().unwrap_or(Value::Null),
                        session_id: value
                            .get("sessionId")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    };
                    if event_tx.send(event).is_err() {
                        break;
                    }
                }
            }
            // Socket gone: wake every caller so pipelines can unwind.
            for (_, tx) in lock_pending(&reader_pending).drain() {
                let _ = tx.send(Err(BrowserError::ConnectionClosed));
            }
        });

        Ok((
            Self {
                out_tx,
                pending,
                next_id: Arc::new(AtomicU64::new(1)),
            },
            event_rx,
        ))
    }

    /// Issue a protocol command, optionally scoped to a flat session, and
    /// await its reply.
    pub async fn call(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value, BrowserError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut message = json!({ "id": id, "method": method, "params": params });
        if let Some(session) = session_id {
            message["sessionId"] = json!(session);
        }

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        trace!(target: "browser.cdp", id, method, "sending command");

        if self
            .out_tx
            .send(Message::Text(message.to_string()))
            .is_err()
        {
            lock_pending(&self.pending).remove(&id);
            return Err(BrowserError::ConnectionClosed);
        }

        rx.await.map_err(|_| BrowserError::ConnectionClosed)?
    }
}
