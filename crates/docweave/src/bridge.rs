//! Tool execution bridge: request/response correlation over a one-way stream.
//!
//! The orchestrator cannot call the document executor directly. It emits a
//! `{ id, tool, payload }` event on the session's outbound stream and the
//! executor answers later, out of band, with `{ id, ok, data?, error? }`.
//! [`ToolBridge`] pairs the two: every outgoing call registers a oneshot
//! waiter under its id, and [`ToolBridge::resolve`] completes exactly that
//! waiter. Unknown and late results are dropped.
//!
//! ```text
//! invoke ──register(id)──► pending map ◄──resolve(result)── inbound endpoint
//!    │                                       ▲
//!    └──dispatch(event)──► session listener ─┘ (remote executor)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::tracing::generate_call_id;
use crate::document::ExecutorResponse;
use crate::error::{DocError, Result};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(45);

// ── Wire events ────────────────────────────────────────────────────

/// Outbound request to the remote executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallEvent {
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub payload: Value,
}

/// Inbound answer from the remote executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultEvent {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ToolResultEvent {
    pub fn success(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            data: None,
            error: Some(error.into()),
            code: None,
        }
    }

    pub fn from_response(id: &str, resp: ExecutorResponse) -> Self {
        Self {
            id: id.to_string(),
            ok: resp.ok,
            data: resp.data,
            error: resp.error,
            code: resp.code,
        }
    }

    /// Render for the model: the data as JSON, or an `Error: ...` line.
    pub fn to_tool_output(&self) -> String {
        if self.ok {
            match &self.data {
                Some(Value::String(s)) => s.clone(),
                Some(v) => v.to_string(),
                None => "ok".to_string(),
            }
        } else {
            let msg = self.error.as_deref().unwrap_or("executor reported failure");
            match &self.code {
                Some(code) => format!("Error: [{code}] {msg}"),
                None => format!("Error: {msg}"),
            }
        }
    }
}

/// Book-keeping for one outstanding call.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub id: String,
    pub issued_at: Instant,
    pub tool_name: String,
    pub session_id: String,
}

// ── Dispatch ───────────────────────────────────────────────────────

/// Delivers tool-call events to one session's remote executor.
pub trait ToolDispatcher: Send + Sync {
    /// Hand the event to the outbound stream. Fails with `ChannelClosed`
    /// when the stream is gone.
    fn dispatch(&self, call: &ToolCallEvent) -> Result<()>;
}

impl<F> ToolDispatcher for F
where
    F: Fn(&ToolCallEvent) -> Result<()> + Send + Sync,
{
    fn dispatch(&self, call: &ToolCallEvent) -> Result<()> {
        self(call)
    }
}

struct Waiter {
    call: PendingCall,
    tx: oneshot::Sender<Result<ToolResultEvent>>,
}

// ── ToolBridge ─────────────────────────────────────────────────────

/// Correlates outbound tool calls with inbound results by id.
///
/// Shared as `Arc<ToolBridge>` between the session controllers (which
/// invoke) and the inbound endpoint (which resolves).
pub struct ToolBridge {
    pending: Mutex<HashMap<String, Waiter>>,
    listeners: Mutex<HashMap<String, Arc<dyn ToolDispatcher>>>,
    timeout: Duration,
}

impl Default for ToolBridge {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ToolBridge {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Attach the outbound listener for a session. The listener stays
    /// registered until the returned guard is dropped.
    pub fn register_listener(
        self: &Arc<Self>,
        session_id: impl Into<String>,
        dispatcher: Arc<dyn ToolDispatcher>,
    ) -> ListenerGuard {
        let session_id = session_id.into();
        lock(&self.listeners).insert(session_id.clone(), dispatcher);
        debug!(session_id, "Listener registered");
        ListenerGuard {
            bridge: Arc::downgrade(self),
            session_id,
        }
    }

    fn remove_listener(&self, session_id: &str) {
        if lock(&self.listeners).remove(session_id).is_some() {
            debug!(session_id, "Listener deregistered");
        }
    }

    /// Register a waiter for `id`. At most one waiter may exist per id.
    pub fn register(
        &self,
        id: &str,
        tool_name: &str,
        session_id: &str,
    ) -> Result<oneshot::Receiver<Result<ToolResultEvent>>> {
        let mut pending = lock(&self.pending);
        if pending.contains_key(id) {
            return Err(DocError::DuplicateCallId(id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(
            id.to_string(),
            Waiter {
                call: PendingCall {
                    id: id.to_string(),
                    issued_at: Instant::now(),
                    tool_name: tool_name.to_string(),
                    session_id: session_id.to_string(),
                },
                tx,
            },
        );
        Ok(rx)
    }

    /// Invoke a host-bound tool with a freshly generated id.
    pub async fn invoke(&self, session_id: &str, tool: &str, payload: Value) -> Result<ToolResultEvent> {
        self.invoke_with_id(session_id, &generate_call_id(), tool, payload)
            .await
    }

    /// Invoke a host-bound tool under a caller-chosen correlation id.
    ///
    /// Returns the correlated result (including application-level failures
    /// reported by the executor) or `ToolTimeout` if nothing arrives in time.
    pub async fn invoke_with_id(
        &self,
        session_id: &str,
        id: &str,
        tool: &str,
        payload: Value,
    ) -> Result<ToolResultEvent> {
        let listener = lock(&self.listeners)
            .get(session_id)
            .cloned()
            .ok_or_else(|| DocError::ChannelClosed(format!("no listener for session {session_id}")))?;

        let rx = self.register(id, tool, session_id)?;
        let event = ToolCallEvent {
            id: id.to_string(),
            tool: tool.to_string(),
            payload,
        };
        if let Err(e) = listener.dispatch(&event) {
            lock(&self.pending).remove(id);
            return Err(e);
        }
        debug!(id, tool, session_id, "Tool call dispatched");

        let started = Instant::now();
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => {
                debug!(id, tool, elapsed_ms = started.elapsed().as_millis() as u64, "Tool call resolved");
                result
            }
            Ok(Err(_)) => Err(DocError::ChannelClosed(format!("waiter for {id} dropped"))),
            Err(_) => {
                lock(&self.pending).remove(id);
                let waited_ms = self.timeout.as_millis() as u64;
                warn!(id, tool, waited_ms, "Tool call timed out");
                Err(DocError::ToolTimeout {
                    id: id.to_string(),
                    tool: tool.to_string(),
                    waited_ms,
                })
            }
        }
    }

    /// Deliver an inbound result to its waiter.
    ///
    /// Returns `false` when no waiter is registered for the id (unknown,
    /// already resolved, or timed out); such results are discarded.
    pub fn resolve(&self, result: ToolResultEvent) -> bool {
        let waiter = lock(&self.pending).remove(&result.id);
        match waiter {
            Some(w) => {
                let id = result.id.clone();
                let delivered = w.tx.send(Ok(result)).is_ok();
                debug!(id, delivered, "Tool result delivered");
                delivered
            }
            None => {
                debug!(id = %result.id, "Discarding result with no waiter");
                false
            }
        }
    }

    /// Remove waiters older than `older_than`, failing each with a
    /// synthetic timeout. Returns how many were removed.
    pub fn sweep_stale(&self, older_than: Duration) -> usize {
        let expired: Vec<Waiter> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<String> = pending
                .values()
                .filter(|w| w.call.issued_at.elapsed() >= older_than)
                .map(|w| w.call.id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        let count = expired.len();
        for w in expired {
            let waited_ms = w.call.issued_at.elapsed().as_millis() as u64;
            warn!(id = %w.call.id, tool = %w.call.tool_name, waited_ms, "Sweeping orphaned tool call");
            let _ = w.tx.send(Err(DocError::ToolTimeout {
                id: w.call.id,
                tool: w.call.tool_name,
                waited_ms,
            }));
        }
        count
    }

    /// Run [`sweep_stale`](Self::sweep_stale) every `interval` until the
    /// handle is dropped or the bridge goes away.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, stale_after: Duration) -> SweeperHandle {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(bridge) = weak.upgrade() else {
                    break;
                };
                let swept = bridge.sweep_stale(stale_after);
                if swept > 0 {
                    info!(swept, "Sweeper removed stale tool calls");
                }
            }
        });
        SweeperHandle { task }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn pending_calls(&self) -> Vec<PendingCall> {
        let mut calls: Vec<_> = lock(&self.pending).values().map(|w| w.call.clone()).collect();
        calls.sort_by_key(|c| c.issued_at);
        calls
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn has_listener(&self, session_id: &str) -> bool {
        lock(&self.listeners).contains_key(session_id)
    }
}

/// Deregisters a session listener on drop.
pub struct ListenerGuard {
    bridge: Weak<ToolBridge>,
    session_id: String,
}

impl ListenerGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.remove_listener(&self.session_id);
        }
    }
}

/// Aborts the sweeper task on drop.
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn channel_listener(
        bridge: &Arc<ToolBridge>,
        session: &str,
    ) -> (ListenerGuard, mpsc::UnboundedReceiver<ToolCallEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let guard = bridge.register_listener(
            session,
            Arc::new(move |call: &ToolCallEvent| {
                tx.send(call.clone())
                    .map_err(|_| DocError::ChannelClosed("test listener".into()))
            }),
        );
        (guard, rx)
    }

    #[tokio::test]
    async fn invoke_returns_correlated_result() {
        let bridge = Arc::new(ToolBridge::new());
        let (_guard, mut calls) = channel_listener(&bridge, "s1");

        let b = Arc::clone(&bridge);
        let executor = tokio::spawn(async move {
            let call = calls.recv().await.unwrap();
            assert_eq!(call.tool, "doc_search");
            assert!(b.resolve(ToolResultEvent::success(&call.id, json!({"hits": []}))));
        });

        let result = bridge
            .invoke("s1", "doc_search", json!({"query": "fee"}))
            .await
            .unwrap();
        assert!(result.ok);
        executor.await.unwrap();
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn application_errors_are_results_not_failures() {
        let bridge = Arc::new(ToolBridge::new());
        let (_guard, mut calls) = channel_listener(&bridge, "s1");
        let b = Arc::clone(&bridge);
        tokio::spawn(async move {
            let call = calls.recv().await.unwrap();
            b.resolve(ToolResultEvent::failure(&call.id, "hit is stale"));
        });
        let result = bridge.invoke("s1", "doc_patch", json!({})).await.unwrap();
        assert!(!result.ok);
        assert_eq!(result.to_tool_output(), "Error: hit is stale");
    }

    #[tokio::test]
    async fn timeout_removes_waiter_and_late_result_is_dropped() {
        let bridge = Arc::new(ToolBridge::new().with_timeout(Duration::from_millis(30)));
        let (_guard, mut calls) = channel_listener(&bridge, "s1");

        let err = bridge
            .invoke_with_id("s1", "late-1", "doc_search", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DocError::ToolTimeout { .. }));
        assert_eq!(bridge.pending_count(), 0);

        let call = calls.recv().await.unwrap();
        assert!(!bridge.resolve(ToolResultEvent::success(&call.id, json!(1))));
    }

    #[tokio::test]
    async fn unknown_and_duplicate_results() {
        let bridge = ToolBridge::new();
        assert!(!bridge.resolve(ToolResultEvent::success("nobody", json!(null))));

        let _rx = bridge.register("dup", "doc_search", "s1").unwrap();
        assert!(matches!(
            bridge.register("dup", "doc_search", "s1"),
            Err(DocError::DuplicateCallId(_))
        ));
        assert!(bridge.resolve(ToolResultEvent::success("dup", json!(1))));
        // At-most-once: the second delivery finds no waiter.
        assert!(!bridge.resolve(ToolResultEvent::success("dup", json!(2))));
    }

    #[tokio::test]
    async fn missing_listener_fails_without_registering() {
        let bridge = Arc::new(ToolBridge::new());
        let err = bridge.invoke("ghost", "doc_search", json!({})).await.unwrap_err();
        assert!(matches!(err, DocError::ChannelClosed(_)));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn guard_drop_deregisters() {
        let bridge = Arc::new(ToolBridge::new());
        let (guard, _rx) = channel_listener(&bridge, "s1");
        assert!(bridge.has_listener("s1"));
        assert_eq!(guard.session_id(), "s1");
        drop(guard);
        assert!(!bridge.has_listener("s1"));
        assert_eq!(bridge.listener_count(), 0);
    }

    #[tokio::test]
    async fn closed_listener_fails_fast() {
        let bridge = Arc::new(ToolBridge::new());
        let (_guard, rx) = channel_listener(&bridge, "s1");
        drop(rx);
        let err = bridge.invoke("s1", "doc_snapshot", json!({})).await.unwrap_err();
        assert!(matches!(err, DocError::ChannelClosed(_)));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn sweep_delivers_synthetic_timeout() {
        let bridge = ToolBridge::new();
        let rx = bridge.register("orphan", "doc_patch", "s1").unwrap();
        assert_eq!(bridge.sweep_stale(Duration::from_secs(60)), 0);
        assert_eq!(bridge.pending_calls().len(), 1);
        assert_eq!(bridge.sweep_stale(Duration::ZERO), 1);
        let delivered = rx.await.unwrap();
        assert!(matches!(delivered, Err(DocError::ToolTimeout { .. })));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn sweeper_task_runs_periodically() {
        let bridge = Arc::new(ToolBridge::new());
        let rx = bridge.register("orphan", "doc_patch", "s1").unwrap();
        let _sweeper = bridge.spawn_sweeper(Duration::from_millis(10), Duration::ZERO);
        let delivered = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(delivered.is_err());
    }

    #[tokio::test]
    async fn concurrent_sessions_resolve_out_of_order() {
        let bridge = Arc::new(ToolBridge::new());
        let (_g1, mut c1) = channel_listener(&bridge, "s1");
        let (_g2, mut c2) = channel_listener(&bridge, "s2");

        let b1 = Arc::clone(&bridge);
        let first = tokio::spawn(async move { b1.invoke("s1", "doc_search", json!({"n": 1})).await });
        let b2 = Arc::clone(&bridge);
        let second = tokio::spawn(async move { b2.invoke("s2", "doc_search", json!({"n": 2})).await });

        let call1 = c1.recv().await.unwrap();
        let call2 = c2.recv().await.unwrap();
        assert!(bridge.resolve(ToolResultEvent::success(&call2.id, json!("two"))));
        assert!(bridge.resolve(ToolResultEvent::success(&call1.id, json!("one"))));

        assert_eq!(first.await.unwrap().unwrap().data, Some(json!("one")));
        assert_eq!(second.await.unwrap().unwrap().data, Some(json!("two")));
    }

    #[test]
    fn result_wire_shape() {
        let json = r#"{"id":"c1","ok":false,"error":"boom"}"#;
        let ev: ToolResultEvent = serde_json::from_str(json).unwrap();
        assert!(!ev.ok);
        assert_eq!(ev.to_tool_output(), "Error: boom");
        let ok = ToolResultEvent::success("c2", json!({"a": 1}));
        let v = serde_json::to_value(&ok).unwrap();
        assert!(v.get("error").is_none());
    }
}
