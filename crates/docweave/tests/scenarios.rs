//! End-to-end behavior of the document pipeline and the tool bridge.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use docweave::bridge::{ToolBridge, ToolCallEvent, ToolResultEvent};
use docweave::config::DocAgentConfig;
use docweave::context::dedup::{SUPERSEDED_PREFIX, dedupe_whole_document_reads};
use docweave::document::{
    DocumentExecutor, InMemoryDocument, Path, PatchRequest, SearchMode, SearchPayload,
};
use docweave::session::{ScriptedModel, ScriptedTurn, SessionController, SessionDeps, SessionEvent};
use docweave::{CallType, DocError, FunctionCallData, Message, ToolCall};
use serde_json::json;
use tokio::sync::mpsc;

fn listen(bridge: &Arc<ToolBridge>, session: &str) -> (docweave::bridge::ListenerGuard, mpsc::UnboundedReceiver<ToolCallEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let guard = bridge.register_listener(
        session,
        Arc::new(move |call: &ToolCallEvent| {
            tx.send(call.clone())
                .map_err(|_| DocError::ChannelClosed("listener gone".into()))
        }),
    );
    (guard, rx)
}

#[test]
fn literal_search_finds_the_one_matching_paragraph() {
    let mut executor = DocumentExecutor::new(InMemoryDocument::from_paragraphs(&[
        "Introduction to the plan.",
        "The budget for next year is fixed.",
        "Closing remarks.",
    ]));
    let result = executor
        .search(&SearchPayload {
            query: "budget".into(),
            mode: Some(SearchMode::Literal),
            max_hits: Some(5),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(result.hits.len(), 1);
    assert_eq!(result.total_hits, 1);
    assert!(!result.truncated);
    assert_eq!(result.hits[0].path, Path::Paragraph { index: 1 });
    assert!(result.hits[0].excerpt.to_lowercase().contains("budget"));
}

#[tokio::test]
async fn delivered_result_resolves_once() {
    let bridge = Arc::new(ToolBridge::new());
    let (_guard, mut calls) = listen(&bridge, "s1");

    let b = Arc::clone(&bridge);
    let host = tokio::spawn(async move {
        let call = calls.recv().await.unwrap();
        assert_eq!(call.id, "t1");
        assert!(b.resolve(ToolResultEvent::success("t1", json!({"x": 1}))));
        // A duplicate for the same id is a no-op.
        assert!(!b.resolve(ToolResultEvent::success("t1", json!({"x": 2}))));
    });

    let result = bridge
        .invoke_with_id("s1", "t1", "doc_search", json!({"query": "x"}))
        .await
        .unwrap();
    host.await.unwrap();

    assert!(result.ok);
    assert_eq!(result.data, Some(json!({"x": 1})));
    assert_eq!(bridge.pending_count(), 0);
}

#[tokio::test]
async fn undelivered_result_times_out_and_leaves_no_entry() {
    let bridge = Arc::new(ToolBridge::new().with_timeout(Duration::from_millis(100)));
    let (_guard, _calls) = listen(&bridge, "s1");

    let started = Instant::now();
    let err = bridge
        .invoke_with_id("s1", "t2", "doc_snapshot", json!({}))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, DocError::ToolTimeout { ref id, .. } if id == "t2"));
    assert_eq!(err.code(), "TOOL_TIMEOUT");
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(2));
    assert!(bridge.pending_calls().iter().all(|c| c.id != "t2"));
}

#[test]
fn older_whole_document_read_is_superseded() {
    let read = |id: &str| {
        Message::assistant_tool_calls(vec![ToolCall {
            id: id.into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: "doc_snapshot".into(),
                arguments: "{}".into(),
            },
        }])
    };
    let mut messages = vec![
        Message::system("sys"),
        Message::user("tidy the headings"),
        read("r1"),
        Message::tool_result("r1", "A".repeat(8000)),
        read("r2"),
        Message::tool_result("r2", "B".repeat(8000)),
    ];

    dedupe_whole_document_reads(&mut messages, &["doc_snapshot".to_string()]);

    let earlier = messages[3].content.as_deref().unwrap();
    assert!(earlier.starts_with(SUPERSEDED_PREFIX));
    assert!(earlier.len() < 200);
    assert_eq!(messages[5].content.as_deref(), Some("B".repeat(8000).as_str()));
    assert_eq!(messages.len(), 6);
}

#[test]
fn replayed_hit_is_stale_and_leaves_document_alone() {
    let mut executor = DocumentExecutor::new(InMemoryDocument::from_paragraphs(&["The fee is due on Friday."]));
    let hit = executor
        .search(&SearchPayload {
            query: "fee".into(),
            mode: Some(SearchMode::Pattern),
            ..Default::default()
        })
        .unwrap()
        .hits
        .remove(0);

    let replace = PatchRequest::ReplaceByHitId {
        hit_id: hit.hit_id.clone(),
        new_text: "charge".into(),
    };
    executor.patch(&replace).unwrap();
    let revision = executor.host().revision();

    let err = executor.patch(&replace).unwrap_err();
    assert!(matches!(err, DocError::HitStale { .. }));
    assert_eq!(err.code(), "HIT_STALE");
    assert_eq!(executor.host().revision(), revision);
    assert_eq!(
        executor.host().text_at(&Path::Paragraph { index: 0 }),
        Some("The charge is due on Friday.")
    );
}

#[test]
fn replayed_hit_is_stale_when_the_text_repeats() {
    let mut executor = DocumentExecutor::new(InMemoryDocument::from_paragraphs(&["fee A, fee B"]));
    let hits = executor
        .search(&SearchPayload {
            query: "fee".into(),
            mode: Some(SearchMode::Pattern),
            ..Default::default()
        })
        .unwrap()
        .hits;
    assert_eq!(hits.len(), 2);

    let replace = PatchRequest::ReplaceByHitId {
        hit_id: hits[0].hit_id.clone(),
        new_text: "charge".into(),
    };
    executor.patch(&replace).unwrap();
    let revision = executor.host().revision();

    let err = executor.patch(&replace).unwrap_err();
    assert_eq!(err.code(), "HIT_STALE");
    assert_eq!(executor.host().revision(), revision);
    assert_eq!(
        executor.host().text_at(&Path::Paragraph { index: 0 }),
        Some("charge A, fee B")
    );
}

#[tokio::test]
async fn scripted_session_edits_a_document_end_to_end() {
    let bridge = Arc::new(ToolBridge::new());
    let model = Arc::new(ScriptedModel::new([
        ScriptedTurn::tool("m1", "doc_search", json!({"query": "Friday", "mode": "pattern"})),
        ScriptedTurn::tool(
            "m2",
            "doc_patch",
            json!({"op": "replace", "hit_id": "h1-0", "text": "Monday"}),
        ),
        ScriptedTurn::text("Moved the due date to Monday."),
    ]));
    let (mut session, mut events) = SessionController::start(
        "e2e",
        SessionDeps::new(model.clone(), bridge.clone()),
        DocAgentConfig::default(),
    );

    let executor = Arc::new(Mutex::new(DocumentExecutor::new(InMemoryDocument::from_paragraphs(&[
        "The fee is due on Friday.",
    ]))));
    let host_executor = Arc::clone(&executor);
    let host_bridge = Arc::clone(&bridge);
    let host = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            if let SessionEvent::ToolUse { id, tool, payload } = &event {
                let call = ToolCallEvent {
                    id: id.clone(),
                    tool: tool.clone(),
                    payload: payload.clone(),
                };
                let result = host_executor.lock().unwrap().handle_tool_call(&call);
                host_bridge.resolve(result);
            }
            let done = event.is_terminal();
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    });

    let turn = session.run_turn("Move the due date to Monday").await.unwrap();
    assert!(turn.finished);
    assert_eq!(turn.rounds_used, 3);
    assert_eq!(turn.text, "Moved the due date to Monday.");
    assert_eq!(model.remaining(), 0);

    let seen = host.await.unwrap();
    assert!(matches!(seen.last(), Some(SessionEvent::Complete { .. })));
    assert_eq!(
        executor.lock().unwrap().host().text_at(&Path::Paragraph { index: 0 }),
        Some("The fee is due on Monday.")
    );
    assert_eq!(bridge.pending_count(), 0);
}
