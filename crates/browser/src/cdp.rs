//! Low-level Chrome DevTools Protocol (CDP) client over WebSocket.
//!
//! Communicates with a page target via its debugging WebSocket endpoint.
//! Commands are matched to responses by id; events are not consumed.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// A CDP WebSocket client that can send commands and receive responses.
pub struct CdpClient {
    /// Sender to write messages to the WebSocket.
    ws_tx: mpsc::Sender<String>,
    /// Pending command responses, keyed by request ID.
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    /// Auto-incrementing command ID.
    next_id: AtomicU64,
    /// Cleared once the reader observes the socket closing.
    connected: Arc<AtomicBool>,
    _reader_handle: tokio::task::JoinHandle<()>,
    _writer_handle: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a Chrome CDP WebSocket endpoint.
    pub async fn connect(ws_url: &str) -> Result<Self, String> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| format!("Failed to connect to CDP WebSocket {}: {}", ws_url, e))?;

        let (mut ws_sink, mut ws_stream_read) = ws_stream.split();

        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let pending_clone = pending.clone();

        let connected = Arc::new(AtomicBool::new(true));
        let connected_reader = connected.clone();
        let connected_writer = connected.clone();

        // Writer task: owns the sink, forwards messages from channel
        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!("CDP WebSocket write error: {}", e);
                    connected_writer.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        // Reader task: reads from WebSocket, dispatches responses
        let reader_handle = tokio::spawn(async move {
            while let Some(msg_result) = ws_stream_read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if let Ok(val) = serde_json::from_str::<Value>(&text) {
                            if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
                                let mut pending = pending_clone.lock().await;
                                if let Some(tx) = pending.remove(&id) {
                                    let _ = tx.send(val);
                                }
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP WebSocket closed by browser");
                        break;
                    }
                    Err(e) => {
                        warn!("CDP WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            connected_reader.store(false, Ordering::SeqCst);
            // Dropping the senders wakes every waiter with a closed channel
            pending_clone.lock().await.clear();
        });

        Ok(Self {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            connected,
            _reader_handle: reader_handle,
            _writer_handle: writer_handle,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a CDP command and wait for the response.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value, String> {
        if !self.is_connected() {
            return Err(format!("CDP WebSocket closed, cannot send '{}'", method));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }

        self.ws_tx
            .send(msg.to_string())
            .await
            .map_err(|e| format!("Failed to send CDP command: {}", e))?;

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.get("error") {
                    Err(format!("CDP error: {}", error))
                } else {
                    Ok(response.get("result").cloned().unwrap_or(Value::Null))
                }
            }
            Ok(Err(_)) => Err("CDP response channel closed".to_string()),
            Err(_) => {
                let mut pending = self.pending.lock().await;
                pending.remove(&id);
                Err(format!(
                    "CDP command '{}' timed out after {}s",
                    method,
                    COMMAND_TIMEOUT.as_secs()
                ))
            }
        }
    }

    /// Enable a CDP domain (e.g., "Page", "Runtime", "DOM").
    pub async fn enable_domain(&self, domain: &str) -> Result<(), String> {
        self.send_command(&format!("{}.enable", domain), json!({}))
            .await?;
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<Value, String> {
        self.send_command("Page.navigate", json!({"url": url})).await
    }

    pub async fn reload(&self) -> Result<(), String> {
        self.send_command("Page.reload", json!({"ignoreCache": false}))
            .await?;
        Ok(())
    }

    /// Evaluate JavaScript in the page context and return its value.
    /// A thrown exception is reported as an error.
    pub async fn evaluate_js(&self, expression: &str) -> Result<Value, String> {
        let result = self
            .send_command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .or_else(|| details.get("text"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown exception");
            return Err(format!("JS exception: {}", text));
        }
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Dispatch a mouse event via Input domain.
    pub async fn dispatch_mouse_event(
        &self,
        event_type: &str,
        x: f64,
        y: f64,
        click_count: i32,
    ) -> Result<(), String> {
        self.send_command(
            "Input.dispatchMouseEvent",
            json!({
                "type": event_type,
                "x": x,
                "y": y,
                "button": "left",
                "clickCount": click_count,
            }),
        )
        .await?;
        Ok(())
    }

    /// Left click at viewport coordinates.
    pub async fn click_at(&self, x: f64, y: f64) -> Result<(), String> {
        self.dispatch_mouse_event("mouseMoved", x, y, 0).await?;
        self.dispatch_mouse_event("mousePressed", x, y, 1).await?;
        self.dispatch_mouse_event("mouseReleased", x, y, 1).await
    }

    /// Insert text into the focused element (bypasses key events).
    pub async fn insert_text(&self, text: &str) -> Result<(), String> {
        self.send_command("Input.insertText", json!({"text": text}))
            .await?;
        Ok(())
    }

    /// Press and release Enter on the focused element.
    pub async fn press_enter(&self) -> Result<(), String> {
        self.send_command(
            "Input.dispatchKeyEvent",
            json!({
                "type": "keyDown",
                "key": "Enter",
                "code": "Enter",
                "text": "\r",
                "windowsVirtualKeyCode": 13,
            }),
        )
        .await?;
        self.send_command(
            "Input.dispatchKeyEvent",
            json!({
                "type": "keyUp",
                "key": "Enter",
                "code": "Enter",
                "windowsVirtualKeyCode": 13,
            }),
        )
        .await?;
        Ok(())
    }

    /// Ask the browser process to exit.
    pub async fn close_browser(&self) -> Result<(), String> {
        self.send_command("Browser.close", json!({})).await?;
        Ok(())
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self._reader_handle.abort();
        self._writer_handle.abort();
    }
}
