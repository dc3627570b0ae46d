//! Serializable projection of the [`ToolBridge`] for `GET /api/state`.
//!
//! [`PendingCall`](docweave::bridge::PendingCall) holds an `Instant`, which
//! has no wire form; [`PendingCallView`] converts it to an age in
//! milliseconds.

use docweave::bridge::ToolBridge;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCallView {
    pub id: String,
    pub tool: String,
    pub session_id: String,
    pub age_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSnapshot {
    pub pending_count: usize,
    pub listener_count: usize,
    /// Oldest first.
    pub pending_calls: Vec<PendingCallView>,
    pub call_timeout_ms: u64,
}

impl BridgeSnapshot {
    pub fn from_bridge(bridge: &ToolBridge) -> Self {
        let mut pending_calls: Vec<PendingCallView> = bridge
            .pending_calls()
            .into_iter()
            .map(|call| PendingCallView {
                age_ms: call.issued_at.elapsed().as_millis() as u64,
                id: call.id,
                tool: call.tool_name,
                session_id: call.session_id,
            })
            .collect();
        pending_calls.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));

        Self {
            pending_count: pending_calls.len(),
            listener_count: bridge.listener_count(),
            pending_calls,
            call_timeout_ms: bridge.timeout().as_millis() as u64,
        }
    }
}
