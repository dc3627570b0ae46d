//! The per-session turn loop.
//!
//! A [`SessionController`] owns one conversation: its transcript, its tool
//! set, its context manager, and the sending half of its event stream. Each
//! call to [`run_turn`](SessionController::run_turn) appends the user's
//! message, trims the transcript to fit the budget, then alternates model
//! rounds and tool execution until the model answers with text only.
//!
//! Document tools reach the host through the shared [`ToolBridge`]: the
//! controller registers itself as the session's listener, so every bridged
//! call goes out on the same stream as the content deltas, as a
//! [`SessionEvent::ToolUse`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::tracing::{generate_span_id, generate_trace_id};
use crate::bridge::{ListenerGuard, ToolBridge, ToolCallEvent};
use crate::config::DocAgentConfig;
use crate::context::ContextManager;
use crate::context::compaction::summarize_args;
use crate::error::{DocError, Result};
use crate::memory::{MemoryStore, SharedMemory, WorkingMemory};
use crate::session::events::{SessionEvent, TokenUsage};
use crate::session::model::ModelBackend;
use crate::tools::core::{ThinkTool, ToolSet};
use crate::tools::names;
use crate::{ChatRequest, Message, ToolDef};

/// What a session needs from the outside world.
pub struct SessionDeps {
    pub model: Arc<dyn ModelBackend>,
    pub bridge: Arc<ToolBridge>,
    /// Working memory to share with the caller. When `None` the controller
    /// loads it from `memory_path`, or starts empty.
    pub memory: Option<SharedMemory>,
}

impl SessionDeps {
    pub fn new(model: Arc<dyn ModelBackend>, bridge: Arc<ToolBridge>) -> Self {
        Self {
            model,
            bridge,
            memory: None,
        }
    }

    pub fn with_memory(mut self, memory: SharedMemory) -> Self {
        self.memory = Some(memory);
        self
    }
}

/// Outcome of one user turn.
#[derive(Debug, Clone)]
pub struct TurnResult {
    /// The model's final text reply. Empty if the round limit was hit.
    pub text: String,
    pub rounds_used: u32,
    /// `false` when the round limit cut the turn off.
    pub finished: bool,
    /// Cumulative session usage after this turn.
    pub usage: TokenUsage,
    /// Fraction of the effective budget the transcript now occupies.
    pub budget_used: f64,
}

pub struct SessionController {
    session_id: String,
    trace_id: String,
    config: DocAgentConfig,
    model: Arc<dyn ModelBackend>,
    tools: ToolSet,
    context: ContextManager,
    memory: SharedMemory,
    store: Option<MemoryStore>,
    messages: Vec<Message>,
    usage: TokenUsage,
    events: mpsc::UnboundedSender<SessionEvent>,
    listener: Option<ListenerGuard>,
    emitting: bool,
}

impl SessionController {
    /// Create a session, register it as the bridge listener for
    /// `session_id`, and return it with its outbound event stream.
    pub fn start(
        session_id: impl Into<String>,
        deps: SessionDeps,
        config: DocAgentConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let session_id = session_id.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let dispatch_tx = tx.clone();
        let listener = deps.bridge.register_listener(
            session_id.clone(),
            Arc::new(move |call: &ToolCallEvent| {
                dispatch_tx
                    .send(SessionEvent::from(call))
                    .map_err(|_| DocError::ChannelClosed(format!("event stream for call {} is gone", call.id)))
            }),
        );

        let store = config.memory_path.clone().map(MemoryStore::new);
        let memory = match deps.memory {
            Some(memory) => memory,
            None => load_memory(store.as_ref()).shared(),
        };

        let tools = ToolSet::new()
            .with_arg_validation(config.validate_tool_args)
            .with_document_tools(&session_id, &deps.bridge)
            .with_memory_tools(&memory)
            .with(ThinkTool);

        let trace_id = generate_trace_id();
        info!(session_id, trace_id, model = config.model, tools = tools.len(), "Session started");

        let controller = Self {
            messages: vec![Message::system(config.system_prompt.clone())],
            context: config.context_manager(),
            session_id,
            trace_id,
            model: deps.model,
            tools,
            memory,
            store,
            usage: TokenUsage::default(),
            events: tx,
            listener: Some(listener),
            emitting: true,
            config,
        };
        (controller, rx)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Cumulative token usage across all turns so far.
    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    pub fn tool_definitions(&self) -> Vec<ToolDef> {
        self.tools.definitions()
    }

    /// Whether the outbound stream is still open.
    pub fn is_emitting(&self) -> bool {
        self.emitting
    }

    /// Run one user turn to completion.
    ///
    /// Emits content deltas and tool-use events as they happen, then exactly
    /// one terminal event: `Complete`, or `Error` if the turn could not run.
    pub async fn run_turn(&mut self, user_text: &str) -> Result<TurnResult> {
        if !self.emitting {
            return Err(DocError::ChannelClosed(format!("session {} is no longer emitting", self.session_id)));
        }

        let defs = self.tools.definitions();
        let before_turn = self.messages.clone();
        self.messages.push(Message::user(user_text));

        let open_items = self.with_memory(|mem| mem.open_items());
        let report = self.context.prepare(&mut self.messages, &defs, &open_items);
        if let Some(compaction) = &report.compaction {
            info!(
                session_id = self.session_id,
                summarized = compaction.summarized_messages,
                hard_truncated = compaction.hard_truncated,
                "Transcript compacted"
            );
        }

        let start_usage = match self.context.budget().preflight(&self.messages, &defs) {
            Ok(usage) => usage,
            Err(e) => {
                // The turn never ran, so it leaves no trace in the transcript.
                self.messages = before_turn;
                warn!(session_id = self.session_id, "{e}");
                self.emit(SessionEvent::error(&e));
                return Err(e);
            }
        };
        self.usage.input += start_usage.estimated_tokens;
        let accountant = *self.context.budget().accountant();

        let mut final_text = String::new();
        let mut rounds_used = 0;
        let mut finished = false;

        for round in 0..self.config.max_rounds {
            rounds_used = round + 1;
            let span_id = generate_span_id(&self.trace_id, rounds_used);
            let request = ChatRequest {
                model: Some(self.config.model.clone()),
                messages: self.messages.clone(),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
                stop: None,
                tools: Some(defs.clone()),
            };

            let content_tx = self.events.clone();
            let on_text = move |delta: &str| {
                let _ = content_tx.send(SessionEvent::Content {
                    delta: delta.to_string(),
                });
            };
            let turn = match self.model.complete(&request, &on_text).await {
                Ok(turn) => turn,
                Err(e) => {
                    warn!(session_id = self.session_id, span_id, "Model request failed: {e}");
                    self.emit(SessionEvent::error(&e));
                    return Err(e);
                }
            };
            if self.events.is_closed() {
                return Err(self.stop_emitting());
            }

            self.usage.output += accountant.text(&turn.text);
            for call in &turn.tool_calls {
                self.usage.tool_calls += accountant.text(&call.function.name) + accountant.text(&call.function.arguments);
            }
            debug!(
                session_id = self.session_id,
                span_id,
                chars = turn.text.len(),
                tool_calls = turn.tool_calls.len(),
                "Model round complete"
            );

            self.messages.push(Message::assistant(turn.text.clone(), turn.tool_calls.clone()));
            if turn.tool_calls.is_empty() {
                final_text = turn.text;
                finished = true;
                break;
            }

            // Sequential, in the order the model issued them: a patch may
            // depend on the search before it.
            for call in &turn.tool_calls {
                let name = call.function.name.as_str();
                let events = self.events.clone();
                let execution = self.tools.execute(name, &call.function.arguments);
                tokio::pin!(execution);
                // A closed stream releases the listener at once; the call
                // itself still ends through its own timeout.
                let output = tokio::select! {
                    output = &mut execution => output,
                    _ = events.closed(), if self.emitting => {
                        warn!(session_id = self.session_id, tool = name, "Event stream closed during a tool call");
                        self.emitting = false;
                        self.listener = None;
                        execution.await
                    }
                };
                if names::is_document_tool(name) {
                    let op = format!("{name}({})", summarize_args(&call.function.arguments, 80));
                    self.with_memory(|mem| mem.status.last_op = Some(op));
                }
                self.usage.tool_responses += accountant.text(&output);
                self.messages.push(Message::tool_result(call.id.clone(), output));
            }

            let usage = self.context.budget().estimate_usage(&self.messages, &defs);
            if let Some(notice) = self.context.budget().advisory(&usage)
                && let Some(last) = self.messages.last_mut()
            {
                let content = last.content.get_or_insert_with(String::new);
                content.push_str("\n\n");
                content.push_str(&notice);
            }

            if self.events.is_closed() {
                return Err(self.stop_emitting());
            }
        }

        if !finished {
            warn!(
                session_id = self.session_id,
                max_rounds = self.config.max_rounds,
                "Round limit reached before a final reply"
            );
        }

        let usage = self.usage;
        self.with_memory(|mem| {
            mem.status.turns_taken += 1;
            mem.status.last_token_usage = Some(usage);
        });
        self.persist_memory();

        let budget_used = self.context.budget().estimate_usage(&self.messages, &defs).usage_pct;
        info!(
            session_id = self.session_id,
            rounds = rounds_used,
            tokens = usage.total(),
            budget_used = format!("{:.0}%", budget_used * 100.0),
            "Turn complete"
        );
        self.emit(SessionEvent::Complete { usage, budget_used });

        Ok(TurnResult {
            text: final_text,
            rounds_used,
            finished,
            usage,
            budget_used,
        })
    }

    fn with_memory<R>(&self, f: impl FnOnce(&mut WorkingMemory) -> R) -> R {
        let mut guard = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn persist_memory(&self) {
        let Some(store) = &self.store else { return };
        let snapshot = self.with_memory(|mem| mem.clone());
        if let Err(e) = store.save(&snapshot) {
            warn!(path = %store.path().display(), "Failed to save working memory: {e}");
        }
    }

    /// Send an event; the first failure turns emission off for good.
    fn emit(&mut self, event: SessionEvent) -> bool {
        if !self.emitting {
            return false;
        }
        if self.events.send(event).is_err() {
            self.stop_emitting();
            return false;
        }
        true
    }

    /// Stop emitting and drop the bridge listener. Calls still in flight
    /// are left to time out.
    fn stop_emitting(&mut self) -> DocError {
        if self.emitting {
            warn!(session_id = self.session_id, "Event stream closed; session stops emitting");
            self.emitting = false;
            self.listener = None;
        }
        DocError::ChannelClosed(format!("event stream for session {} is gone", self.session_id))
    }
}

fn load_memory(store: Option<&MemoryStore>) -> WorkingMemory {
    let Some(store) = store else {
        return WorkingMemory::default();
    };
    match store.load() {
        Ok(memory) => memory,
        Err(e) => {
            warn!(path = %store.path().display(), "Failed to load working memory, starting empty: {e}");
            WorkingMemory::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentExecutor, InMemoryDocument};
    use crate::session::model::{ScriptedModel, ScriptedTurn};
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::task::JoinHandle;

    /// Answer every ToolUse with a local executor; collect everything else.
    fn spawn_host(
        bridge: Arc<ToolBridge>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        executor: Arc<Mutex<DocumentExecutor>>,
    ) -> JoinHandle<Vec<SessionEvent>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(event) = events.recv().await {
                if let SessionEvent::ToolUse { id, tool, payload } = &event {
                    let call = ToolCallEvent {
                        id: id.clone(),
                        tool: tool.clone(),
                        payload: payload.clone(),
                    };
                    let result = executor.lock().unwrap().handle_tool_call(&call);
                    bridge.resolve(result);
                }
                let terminal = event.is_terminal();
                seen.push(event);
                if terminal {
                    break;
                }
            }
            seen
        })
    }

    fn executor(paragraphs: &[&str]) -> Arc<Mutex<DocumentExecutor>> {
        Arc::new(Mutex::new(DocumentExecutor::new(InMemoryDocument::from_paragraphs(paragraphs))))
    }

    #[tokio::test]
    async fn text_only_turn_completes() {
        let bridge = Arc::new(ToolBridge::new());
        let model = Arc::new(ScriptedModel::new([ScriptedTurn::text("Nothing to change.")]));
        let (mut session, events) = SessionController::start(
            "s1",
            SessionDeps::new(model.clone(), bridge.clone()),
            DocAgentConfig::default(),
        );
        assert!(bridge.has_listener("s1"));
        let host = spawn_host(bridge.clone(), events, executor(&["a"]));

        let result = session.run_turn("Anything to fix?").await.unwrap();
        assert!(result.finished);
        assert_eq!(result.rounds_used, 1);
        assert_eq!(result.text, "Nothing to change.");

        let seen = host.await.unwrap();
        let text: String = seen
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Content { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Nothing to change.");
        assert!(matches!(seen.last(), Some(SessionEvent::Complete { .. })));

        assert_eq!(session.messages().len(), 3);
        assert_eq!(session.memory().lock().unwrap().status.turns_taken, 1);
        let request = &model.requests()[0];
        assert_eq!(request.model.as_deref(), Some(crate::DEFAULT_MODEL));
        assert!(request.tools.as_ref().unwrap().iter().any(|t| t.function.name == "doc_patch"));
    }

    #[tokio::test]
    async fn search_then_patch_through_the_bridge() {
        let bridge = Arc::new(ToolBridge::new());
        let model = Arc::new(ScriptedModel::new([
            ScriptedTurn::tool("m1", "doc_search", json!({"query": "fee", "mode": "pattern"})),
        ]));
        let (mut session, events) = SessionController::start(
            "s1",
            SessionDeps::new(model.clone(), bridge.clone()),
            DocAgentConfig::default(),
        );
        let doc = executor(&["The fee is 10 dollars.", "Other text."]);
        let host = spawn_host(bridge.clone(), events, doc.clone());

        // The hit id is only known after the search, so script the patch
        // once the first request has been made.
        let search_hit = {
            let mut probe = DocumentExecutor::new(InMemoryDocument::from_paragraphs(&["The fee is 10 dollars.", "Other text."]));
            let result = probe
                .search(&crate::document::SearchPayload {
                    query: "fee".into(),
                    mode: Some(crate::document::SearchMode::Pattern),
                    ..Default::default()
                })
                .unwrap();
            result.hits[0].hit_id.clone()
        };
        model.push(ScriptedTurn::tool(
            "m2",
            "doc_patch",
            json!({"op": "replace", "hit_id": search_hit, "text": "charge"}),
        ));
        model.push(ScriptedTurn::text("Renamed the fee."));

        let result = session.run_turn("Call the fee a charge").await.unwrap();
        assert!(result.finished);
        assert_eq!(result.rounds_used, 3);
        assert!(result.usage.tool_calls > 0);
        assert!(result.usage.tool_responses > 0);

        let seen = host.await.unwrap();
        let tools: Vec<&str> = seen
            .iter()
            .filter_map(|e| match e {
                SessionEvent::ToolUse { tool, .. } => Some(tool.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(tools, vec!["doc_search", "doc_patch"]);

        let snapshot = doc.lock().unwrap().snapshot().unwrap();
        assert!(snapshot.outline().contains("The charge is 10 dollars."));

        let tool_results: Vec<&str> = session
            .messages()
            .iter()
            .filter(|m| m.tool_call_id.is_some())
            .filter_map(|m| m.content.as_deref())
            .collect();
        assert_eq!(tool_results.len(), 2);
        assert!(!tool_results[1].starts_with("Error"));
        let last_op = session.memory().lock().unwrap().status.last_op.clone().unwrap();
        assert!(last_op.starts_with("doc_patch("));
    }

    #[tokio::test]
    async fn budget_exceeded_emits_error_and_leaves_transcript() {
        let bridge = Arc::new(ToolBridge::new());
        let model = Arc::new(ScriptedModel::new([ScriptedTurn::text("unused")]));
        let config = DocAgentConfig::default().with_token_budget(50);
        let (mut session, mut events) =
            SessionController::start("s1", SessionDeps::new(model.clone(), bridge), config);

        let err = session.run_turn("hello").await.unwrap_err();
        assert_eq!(err.code(), "BUDGET_EXCEEDED");
        assert_eq!(session.messages().len(), 1);
        assert_eq!(model.requests().len(), 0);
        match events.recv().await {
            Some(SessionEvent::Error { code, .. }) => assert_eq!(code, "BUDGET_EXCEEDED"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_request_fails_preflight_instead_of_being_summarized() {
        let bridge = Arc::new(ToolBridge::new());
        let model = Arc::new(ScriptedModel::new([ScriptedTurn::text("unused")]));
        let config = DocAgentConfig::default().with_token_budget(6000);
        let (mut session, mut events) =
            SessionController::start("s1", SessionDeps::new(model.clone(), bridge), config);

        let request = format!("Rewrite this clause: {}", "y".repeat(20_000));
        let err = session.run_turn(&request).await.unwrap_err();
        assert_eq!(err.code(), "BUDGET_EXCEEDED");
        assert!(model.requests().is_empty());
        assert_eq!(session.messages().len(), 1);
        assert!(matches!(events.recv().await, Some(SessionEvent::Error { .. })));
    }

    #[tokio::test]
    async fn model_failure_emits_error() {
        let bridge = Arc::new(ToolBridge::new());
        let model = Arc::new(ScriptedModel::new([ScriptedTurn::fail("HTTP 503")]));
        let (mut session, mut events) =
            SessionController::start("s1", SessionDeps::new(model, bridge), DocAgentConfig::default());

        let err = session.run_turn("hello").await.unwrap_err();
        assert_eq!(err.code(), "MODEL_ERROR");
        match events.recv().await {
            Some(SessionEvent::Error { code, message }) => {
                assert_eq!(code, "MODEL_ERROR");
                assert!(message.contains("HTTP 503"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn round_limit_cuts_the_turn() {
        let bridge = Arc::new(ToolBridge::new());
        let model = Arc::new(ScriptedModel::new([
            ScriptedTurn::tool("m1", "think", json!({"reasoning": "a"})),
            ScriptedTurn::tool("m2", "think", json!({"reasoning": "b"})),
        ]));
        let config = DocAgentConfig::default().with_max_rounds(2);
        let (mut session, mut events) = SessionController::start("s1", SessionDeps::new(model, bridge), config);

        let result = session.run_turn("think hard").await.unwrap();
        assert!(!result.finished);
        assert_eq!(result.rounds_used, 2);
        assert!(result.text.is_empty());
        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        assert!(matches!(last, Some(SessionEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn dropped_stream_stops_emission_and_deregisters() {
        let bridge = Arc::new(ToolBridge::new());
        let model = Arc::new(ScriptedModel::new([ScriptedTurn::text("hi")]));
        let (mut session, events) =
            SessionController::start("s1", SessionDeps::new(model, bridge.clone()), DocAgentConfig::default());
        drop(events);

        let err = session.run_turn("hello").await.unwrap_err();
        assert_eq!(err.code(), "CHANNEL_CLOSED");
        assert!(!session.is_emitting());
        assert!(!bridge.has_listener("s1"));
        assert!(session.run_turn("again").await.is_err());
    }

    #[tokio::test]
    async fn stream_closed_mid_call_deregisters_before_the_call_times_out() {
        let timeout = std::time::Duration::from_secs(3);
        let bridge = Arc::new(ToolBridge::new().with_timeout(timeout));
        let model = Arc::new(ScriptedModel::new([
            ScriptedTurn::tool("m1", "doc_search", json!({"query": "fee"})),
            ScriptedTurn::text("unreachable"),
        ]));
        let (mut session, mut events) =
            SessionController::start("s1", SessionDeps::new(model, bridge.clone()), DocAgentConfig::default());
        let started = std::time::Instant::now();
        let turn = tokio::spawn(async move {
            let result = session.run_turn("find the fee").await;
            (result, session)
        });

        // The host sees the call, then goes away without answering.
        loop {
            match events.recv().await {
                Some(SessionEvent::ToolUse { .. }) => break,
                Some(_) => continue,
                None => panic!("stream ended before the tool call"),
            }
        }
        drop(events);

        let mut released = false;
        for _ in 0..50 {
            if !bridge.has_listener("s1") {
                released = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(released);
        assert!(started.elapsed() < timeout);
        assert_eq!(bridge.pending_count(), 1);

        let (result, session) = turn.await.unwrap();
        assert_eq!(result.unwrap_err().code(), "CHANNEL_CLOSED");
        assert!(!session.is_emitting());
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn memory_persists_between_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        let config = DocAgentConfig::default().with_memory_path(&path);

        let bridge = Arc::new(ToolBridge::new());
        let model = Arc::new(ScriptedModel::new([
            ScriptedTurn::tool("m1", "plan", json!({"action": "add", "title": "Fix totals"})),
            ScriptedTurn::text("Planned."),
        ]));
        let (mut session, _events) =
            SessionController::start("s1", SessionDeps::new(model, bridge.clone()), config.clone());
        session.run_turn("plan it").await.unwrap();
        drop(session);

        let model = Arc::new(ScriptedModel::new([ScriptedTurn::text("ok")]));
        let (session, _events) = SessionController::start("s2", SessionDeps::new(model, bridge), config);
        let mem = session.memory().lock().unwrap().clone();
        assert_eq!(mem.status.turns_taken, 1);
        assert_eq!(mem.open_items(), vec!["[todo] p1: Fix totals"]);
    }
}
