//! Model backends: where a session's completions come from.
//!
//! [`OpenRouterBackend`] streams from the OpenRouter API with retry.
//! [`ScriptedModel`] replays canned turns so the controller can be tested
//! without a network.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use tracing::debug;

use crate::api::retry::{RetryConfig, retry_api_call};
use crate::api::streaming::{StreamEvent, assemble_tool_calls, collect_text, extract_usage};
use crate::error::{DocError, Result};
use crate::{ChatRequest, OpenRouterClient, ToolCall, UsageInfo};

/// One model response: text, tool calls, or both.
#[derive(Debug, Clone, Default)]
pub struct ModelTurn {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<UsageInfo>,
}

/// Receives text deltas while a response is generated.
pub type TextSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

pub type ModelFuture<'a> = Pin<Box<dyn Future<Output = Result<ModelTurn>> + Send + 'a>>;

pub trait ModelBackend: Send + Sync {
    /// Produce the next assistant turn for `request`, passing text deltas
    /// to `on_text` as they arrive.
    fn complete<'a>(&'a self, request: &'a ChatRequest, on_text: TextSink<'a>) -> ModelFuture<'a>;
}

// ── OpenRouter ─────────────────────────────────────────────────────

pub struct OpenRouterBackend {
    client: OpenRouterClient,
    retry: RetryConfig,
    streaming: bool,
}

impl OpenRouterBackend {
    pub fn new(client: OpenRouterClient) -> Self {
        Self {
            client,
            retry: RetryConfig::default(),
            streaming: true,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }
}

impl ModelBackend for OpenRouterBackend {
    fn complete<'a>(&'a self, request: &'a ChatRequest, on_text: TextSink<'a>) -> ModelFuture<'a> {
        Box::pin(async move {
            if self.streaming {
                let events = retry_api_call(&self.retry, move || {
                    self.client.chat_stream_live(request, move |event| {
                        if let StreamEvent::TextDelta(delta) = event {
                            on_text(delta);
                        }
                    })
                })
                .await
                .map_err(DocError::Model)?;
                let turn = ModelTurn {
                    text: collect_text(&events),
                    tool_calls: assemble_tool_calls(&events),
                    usage: extract_usage(&events),
                };
                debug!(
                    chars = turn.text.len(),
                    tool_calls = turn.tool_calls.len(),
                    "Streamed model turn"
                );
                Ok(turn)
            } else {
                let completion = retry_api_call(&self.retry, move || self.client.chat(request))
                    .await
                    .map_err(DocError::Model)?;
                let text = completion.content.unwrap_or_default();
                if !text.is_empty() {
                    on_text(&text);
                }
                Ok(ModelTurn {
                    text,
                    tool_calls: completion.tool_calls,
                    usage: completion.usage,
                })
            }
        })
    }
}

// ── Scripted ───────────────────────────────────────────────────────

/// One canned response for [`ScriptedModel`].
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    Reply { text: String, tool_calls: Vec<ToolCall> },
    Fail(String),
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        ScriptedTurn::Reply {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    /// A turn with one tool call and no text. The call id is `id`.
    pub fn tool(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        ScriptedTurn::Reply {
            text: String::new(),
            tool_calls: vec![ToolCall::function(id, name, arguments.to_string())],
        }
    }

    /// Add another tool call to a reply.
    pub fn and_tool(mut self, id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        if let ScriptedTurn::Reply { tool_calls, .. } = &mut self {
            tool_calls.push(ToolCall::function(id, name, arguments.to_string()));
        }
        self
    }

    pub fn fail(message: impl Into<String>) -> Self {
        ScriptedTurn::Fail(message.into())
    }
}

/// Replays scripted turns in order and records every request it receives.
/// Text is delivered word by word to mimic streaming.
#[derive(Default)]
pub struct ScriptedModel {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, turn: ScriptedTurn) {
        self.turns.lock().unwrap_or_else(|e| e.into_inner()).push_back(turn);
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ModelBackend for ScriptedModel {
    fn complete<'a>(&'a self, request: &'a ChatRequest, on_text: TextSink<'a>) -> ModelFuture<'a> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        let next = self.turns.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        Box::pin(async move {
            match next {
                Some(ScriptedTurn::Reply { text, tool_calls }) => {
                    for chunk in text.split_inclusive(' ') {
                        on_text(chunk);
                    }
                    Ok(ModelTurn {
                        text,
                        tool_calls,
                        usage: None,
                    })
                }
                Some(ScriptedTurn::Fail(message)) => Err(DocError::Model(message)),
                None => Err(DocError::Model("script exhausted".into())),
            }
        })
    }
}
