//! WebSocket layer — the persistent device channel and the custom
//! connection pool.
//!
//! DESIGN
//! ======
//! Both sides of the facade are client connections built on
//! tokio-tungstenite: an unbounded mpsc channel feeds the write half, and a
//! read loop fans inbound JSON out to a handler set. The device channel is
//! a single connection keyed by a target id; reconnecting with the same
//! target is a no-op so repeated script runs cannot open duplicate sockets.
//! The custom pool is keyed by URL and deliberately survives per-script
//! cleanup: a long-lived external connection outlives script edits, and
//! clearing its handler set on recompile is an explicit host call
//! (`ConnectionPool::clear_handlers`), not a side effect.
//!
//! Both services are plain injectable handles, shared across runtime
//! instances by cloning; tests substitute traffic by calling
//! `dispatch_inbound` directly instead of opening sockets.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::events::Unsubscribe;
use crate::runtime::CleanupBag;
use crate::wire;

/// Callback invoked with each parsed inbound message.
pub type MessageCallback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("websocket connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

type HandlerSet = Arc<Mutex<HashMap<u64, MessageCallback>>>;

/// Fan a raw inbound text frame out to a snapshot of the handler set.
/// Non-JSON frames are dropped with a diagnostic.
fn fan_out(handlers: &HandlerSet, text: &str) {
    let message: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "dropping non-JSON inbound frame");
            return;
        }
    };
    let snapshot: Vec<MessageCallback> = handlers.lock().values().cloned().collect();
    for handler in snapshot {
        handler(&message);
    }
}

/// Open a socket and spawn its relay task: outbound channel to sink,
/// read loop to the handler set. The task ends when either side closes.
async fn spawn_relay(
    url: &str,
    handlers: HandlerSet,
) -> Result<(mpsc::UnboundedSender<String>, JoinHandle<()>), WsError> {
    let (socket, _) = connect_async(url).await?;
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    let Some(text) = outbound else { break };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => fan_out(&handlers, text.as_str()),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "websocket read failed");
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok((tx, task))
}

// =============================================================================
// DEVICE CHANNEL
// =============================================================================

struct ChannelConn {
    target: String,
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

struct DeviceChannelInner {
    conn: Mutex<Option<ChannelConn>>,
    handlers: HandlerSet,
    next_handler: AtomicU64,
}

/// The single persistent device-telemetry connection. Cheap to clone;
/// clones share the connection and handler set.
#[derive(Clone)]
pub struct DeviceChannel {
    inner: Arc<DeviceChannelInner>,
}

impl DeviceChannel {
    /// Create a detached channel. `send` returns `false` until
    /// [`DeviceChannel::connect`] succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DeviceChannelInner {
                conn: Mutex::new(None),
                handlers: Arc::new(Mutex::new(HashMap::new())),
                next_handler: AtomicU64::new(0),
            }),
        }
    }

    /// Connect the channel for a target id. A no-op returning `false` if
    /// already connected for the same target; an existing connection for a
    /// different target is replaced.
    ///
    /// # Errors
    ///
    /// Returns `WsError::Connect` if the socket cannot be established.
    pub async fn connect(&self, url: &str, target: &str) -> Result<bool, WsError> {
        {
            let conn = self.inner.conn.lock();
            if let Some(existing) = conn.as_ref() {
                if existing.target == target && !existing.task.is_finished() {
                    debug!(target, "device channel already connected");
                    return Ok(false);
                }
            }
        }

        let (outbound, task) = spawn_relay(url, self.inner.handlers.clone()).await?;
        let previous = self.inner.conn.lock().replace(ChannelConn {
            target: target.to_owned(),
            outbound,
            task,
        });
        if let Some(previous) = previous {
            previous.task.abort();
        }
        Ok(true)
    }

    /// Send a payload to a target over the channel, wrapped in the
    /// `{targetId, payload}` envelope. Fire-and-forget: returns `false`
    /// (with a log entry) when disconnected.
    pub fn send(&self, target: &str, payload: &Value) -> bool {
        let conn = self.inner.conn.lock();
        let Some(conn) = conn.as_ref() else {
            warn!(target, "device channel send while disconnected");
            return false;
        };
        let message = wire::envelope(target, payload.clone());
        conn.outbound.send(message.to_string()).is_ok()
    }

    /// Subscribe to all inbound messages. Returns the handler id for
    /// [`DeviceChannel::unsubscribe`].
    pub fn subscribe(&self, callback: MessageCallback) -> u64 {
        let id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.lock().insert(id, callback);
        id
    }

    /// Remove a handler registered with [`DeviceChannel::subscribe`].
    pub fn unsubscribe(&self, id: u64) {
        self.inner.handlers.lock().remove(&id);
    }

    /// Whether a live connection exists.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner
            .conn
            .lock()
            .as_ref()
            .is_some_and(|c| !c.task.is_finished())
    }

    /// Tear down the connection, if any. Handlers stay registered.
    pub fn disconnect(&self) {
        if let Some(conn) = self.inner.conn.lock().take() {
            conn.task.abort();
        }
    }

    /// Feed an inbound message to the handler set. Normally called by the
    /// relay task; exposed so hosts and tests can inject traffic.
    pub fn dispatch_inbound(&self, text: &str) {
        fan_out(&self.inner.handlers, text);
    }
}

impl Default for DeviceChannel {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// CUSTOM CONNECTION POOL
// =============================================================================

struct PoolConn {
    outbound: mpsc::UnboundedSender<String>,
    handlers: HandlerSet,
    task: JoinHandle<()>,
}

struct PoolInner {
    conns: Mutex<HashMap<String, PoolConn>>,
    next_handler: AtomicU64,
}

/// Ad hoc WebSocket connections keyed by URL, opened by scripts and shared
/// process-wide. Persists across script re-executions by design.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                conns: Mutex::new(HashMap::new()),
                next_handler: AtomicU64::new(0),
            }),
        }
    }

    /// Open a connection to a URL, or reuse the existing one. The optional
    /// handler is added to the connection's handler set either way.
    ///
    /// # Errors
    ///
    /// Returns `WsError::Connect` if a new socket cannot be established.
    pub async fn connect(&self, url: &str, on_message: Option<MessageCallback>) -> Result<bool, WsError> {
        let existing_handlers = {
            let conns = self.inner.conns.lock();
            conns
                .get(url)
                .filter(|c| !c.task.is_finished())
                .map(|c| c.handlers.clone())
        };

        if let Some(handlers) = existing_handlers {
            if let Some(callback) = on_message {
                let id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
                handlers.lock().insert(id, callback);
            }
            debug!(url, "reusing pooled connection");
            return Ok(true);
        }

        let handlers: HandlerSet = Arc::new(Mutex::new(HashMap::new()));
        if let Some(callback) = on_message {
            let id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
            handlers.lock().insert(id, callback);
        }

        let (outbound, task) = spawn_relay(url, handlers.clone()).await?;
        let previous = self
            .inner
            .conns
            .lock()
            .insert(url.to_owned(), PoolConn { outbound, handlers, task });
        if let Some(previous) = previous {
            previous.task.abort();
        }
        Ok(true)
    }

    /// Send a JSON value over a pooled connection. Returns `false` (with a
    /// log entry) when no live connection exists for the URL.
    pub fn send_to(&self, url: &str, data: &Value) -> bool {
        let conns = self.inner.conns.lock();
        let Some(conn) = conns.get(url).filter(|c| !c.task.is_finished()) else {
            warn!(url, "send_to with no pooled connection");
            return false;
        };
        conn.outbound.send(data.to_string()).is_ok()
    }

    /// Close and remove a pooled connection. Its handlers go with it.
    pub fn disconnect(&self, url: &str) {
        if let Some(conn) = self.inner.conns.lock().remove(url) {
            conn.task.abort();
        }
    }

    /// Whether a live pooled connection exists for the URL.
    #[must_use]
    pub fn is_connected(&self, url: &str) -> bool {
        self.inner
            .conns
            .lock()
            .get(url)
            .is_some_and(|c| !c.task.is_finished())
    }

    /// Add a handler to an existing pooled connection. Returns `None` when
    /// the URL has no connection.
    pub fn add_handler(&self, url: &str, callback: MessageCallback) -> Option<u64> {
        let conns = self.inner.conns.lock();
        let conn = conns.get(url)?;
        let id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
        conn.handlers.lock().insert(id, callback);
        Some(id)
    }

    /// Empty a connection's handler set without dropping the socket. The
    /// recompile hook for hosts that do not want handlers to accumulate
    /// across script edits.
    pub fn clear_handlers(&self, url: &str) {
        if let Some(conn) = self.inner.conns.lock().get(url) {
            conn.handlers.lock().clear();
        }
    }

    /// Feed an inbound message to a connection's handler set. Normally
    /// called by the relay task; exposed so hosts and tests can inject
    /// traffic.
    pub fn dispatch_inbound(&self, url: &str, text: &str) {
        let handlers = {
            let conns = self.inner.conns.lock();
            conns.get(url).map(|c| c.handlers.clone())
        };
        if let Some(handlers) = handlers {
            fan_out(&handlers, text);
        }
    }

    #[cfg(test)]
    fn insert_loopback(&self, url: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(std::future::pending::<()>());
        self.inner.conns.lock().insert(
            url.to_owned(),
            PoolConn { outbound: tx, handlers: Arc::new(Mutex::new(HashMap::new())), task },
        );
        rx
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// FACADE
// =============================================================================

/// WebSocket capability facade handed to the script sandbox. Wraps the
/// shared device channel and custom pool; device-channel subscriptions are
/// tracked by the runtime's cleanup bag, pool handlers intentionally are not.
#[derive(Clone)]
pub struct WsApi {
    channel: DeviceChannel,
    pool: ConnectionPool,
    cleanups: CleanupBag,
}

impl WsApi {
    pub(crate) fn new(channel: DeviceChannel, pool: ConnectionPool, cleanups: CleanupBag) -> Self {
        Self { channel, pool, cleanups }
    }

    /// Send a payload to a device-channel target. Fire-and-forget.
    pub fn send(&self, target: &str, payload: &Value) -> bool {
        self.channel.send(target, payload)
    }

    /// Subscribe to all inbound device-channel messages. The subscription
    /// is also tracked by the runtime so `cleanup()` removes it.
    pub fn on_message(&self, callback: MessageCallback) -> Unsubscribe {
        let id = self.channel.subscribe(callback);
        let channel = self.channel.clone();
        self.cleanups.push({
            let channel = channel.clone();
            move || channel.unsubscribe(id)
        });
        Box::new(move || channel.unsubscribe(id))
    }

    /// Open (or reuse) a custom connection.
    ///
    /// # Errors
    ///
    /// Returns `WsError::Connect` if the socket cannot be established.
    pub async fn connect(&self, url: &str, on_message: Option<MessageCallback>) -> Result<bool, WsError> {
        self.pool.connect(url, on_message).await
    }

    /// Send over a custom connection.
    pub fn send_to(&self, url: &str, data: &Value) -> bool {
        self.pool.send_to(url, data)
    }

    /// Close a custom connection.
    pub fn disconnect(&self, url: &str) {
        self.pool.disconnect(url);
    }

    /// Whether a custom connection is live.
    #[must_use]
    pub fn is_connected(&self, url: &str) -> bool {
        self.pool.is_connected(url)
    }

    /// The underlying device channel handle.
    #[must_use]
    pub fn channel(&self) -> &DeviceChannel {
        &self.channel
    }

    /// The underlying custom connection pool handle.
    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn detached_channel_send_returns_false() {
        let channel = DeviceChannel::new();
        assert!(!channel.is_connected());
        assert!(!channel.send("dev-1", &json!({"widgetId": "w1", "value": 1})));
    }

    #[test]
    fn channel_fan_out_reaches_all_handlers() {
        let channel = DeviceChannel::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let sink = count.clone();
            channel.subscribe(Arc::new(move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
            }));
        }

        channel.dispatch_inbound(r#"{"widgetId":"w1","value":5}"#);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn channel_unsubscribe_stops_delivery() {
        let channel = DeviceChannel::new();
        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();
        let id = channel.subscribe(Arc::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        channel.unsubscribe(id);
        channel.dispatch_inbound(r#"{"x":1}"#);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn non_json_frames_are_dropped() {
        let channel = DeviceChannel::new();
        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();
        channel.subscribe(Arc::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        channel.dispatch_inbound("not json");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pool_without_connection_reports_disconnected() {
        let pool = ConnectionPool::new();
        assert!(!pool.is_connected("ws://example/feed"));
        assert!(!pool.send_to("ws://example/feed", &json!(1)));
        assert!(pool.add_handler("ws://example/feed", Arc::new(|_| {})).is_none());
    }

    #[tokio::test]
    async fn pool_loopback_send_and_handlers() {
        let pool = ConnectionPool::new();
        let mut outbound = pool.insert_loopback("ws://example/feed");
        assert!(pool.is_connected("ws://example/feed"));

        assert!(pool.send_to("ws://example/feed", &json!({"hello": true})));
        assert_eq!(outbound.recv().await.unwrap(), r#"{"hello":true}"#);

        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();
        pool.add_handler(
            "ws://example/feed",
            Arc::new(move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
        );
        pool.dispatch_inbound("ws://example/feed", r#"{"v":1}"#);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        pool.clear_handlers("ws://example/feed");
        pool.dispatch_inbound("ws://example/feed", r#"{"v":2}"#);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(pool.is_connected("ws://example/feed"));

        pool.disconnect("ws://example/feed");
        assert!(!pool.is_connected("ws://example/feed"));
    }
}
