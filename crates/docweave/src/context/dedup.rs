//! Superseded-read deduplication.
//!
//! Whole-document reads (a `doc_snapshot`) are the largest tool results in a
//! session, and only the most recent one describes the document the agent is
//! editing. Older copies are replaced with a short marker. Message count and
//! role order never change, so call/result pairing survives, and a marker is
//! never rewritten, so running the pass twice changes nothing.

use crate::{Message, MessageRole};
use std::collections::HashMap;

/// Prefix of superseded-result markers. Also the "already replaced?" check.
pub const SUPERSEDED_PREFIX: &str = "[Superseded:";

/// Replace every whole-document read result except the latest.
///
/// Results are attributed to tools through the `tool_call_id` of each tool
/// message and the ids of the assistant's tool calls. Returns the number of
/// characters freed.
pub fn dedupe_whole_document_reads(messages: &mut [Message], whole_document_tools: &[String]) -> usize {
    let mut tool_by_call: HashMap<String, String> = HashMap::new();
    for msg in messages.iter() {
        if let Some(calls) = &msg.tool_calls {
            for call in calls {
                tool_by_call.insert(call.id.clone(), call.function.name.clone());
            }
        }
    }

    let reads: Vec<(usize, String)> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == MessageRole::Tool)
        .filter_map(|(i, m)| {
            let tool = tool_by_call.get(m.tool_call_id.as_deref()?)?;
            whole_document_tools
                .iter()
                .any(|t| t == tool)
                .then(|| (i, tool.clone()))
        })
        .collect();

    let Some(((latest, _), older)) = reads.split_last() else {
        return 0;
    };

    let mut freed = 0;
    for (i, tool) in older {
        let Some(content) = messages[*i].content.as_ref() else {
            continue;
        };
        if content.starts_with(SUPERSEDED_PREFIX) {
            continue;
        }
        let marker = format!(
            "{SUPERSEDED_PREFIX} {tool} result of {} chars replaced by a later read at message {latest}]",
            content.chars().count()
        );
        freed += content.len().saturating_sub(marker.len());
        messages[*i].content = Some(marker);
    }
    freed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CallType, FunctionCallData, ToolCall};

    fn call(id: &str, name: &str) -> Message {
        Message::assistant_tool_calls(vec![ToolCall {
            id: id.into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: name.into(),
                arguments: "{}".into(),
            },
        }])
    }

    fn transcript() -> Vec<Message> {
        vec![
            Message::system("sys"),
            Message::user("edit"),
            call("a", "doc_snapshot"),
            Message::tool_result("a", "S".repeat(5000)),
            call("b", "doc_search"),
            Message::tool_result("b", "hits"),
            call("c", "doc_snapshot"),
            Message::tool_result("c", "T".repeat(5000)),
            call("d", "doc_snapshot"),
            Message::tool_result("d", "latest"),
        ]
    }

    fn tools() -> Vec<String> {
        vec!["doc_snapshot".into()]
    }

    #[test]
    fn keeps_only_latest_snapshot() {
        let mut msgs = transcript();
        let freed = dedupe_whole_document_reads(&mut msgs, &tools());
        assert!(freed > 9000);
        assert!(msgs[3].content.as_ref().unwrap().starts_with(SUPERSEDED_PREFIX));
        assert!(msgs[7].content.as_ref().unwrap().starts_with(SUPERSEDED_PREFIX));
        assert_eq!(msgs[5].content.as_deref(), Some("hits"));
        assert_eq!(msgs[9].content.as_deref(), Some("latest"));
    }

    #[test]
    fn preserves_count_and_roles() {
        let mut msgs = transcript();
        let roles: Vec<_> = msgs.iter().map(|m| m.role.clone()).collect();
        dedupe_whole_document_reads(&mut msgs, &tools());
        assert_eq!(msgs.len(), 10);
        assert_eq!(msgs.iter().map(|m| m.role.clone()).collect::<Vec<_>>(), roles);
        assert_eq!(msgs[3].tool_call_id.as_deref(), Some("a"));
    }

    #[test]
    fn second_pass_is_noop() {
        let mut msgs = transcript();
        dedupe_whole_document_reads(&mut msgs, &tools());
        let after_first: Vec<_> = msgs.iter().map(|m| m.content.clone()).collect();
        assert_eq!(dedupe_whole_document_reads(&mut msgs, &tools()), 0);
        let after_second: Vec<_> = msgs.iter().map(|m| m.content.clone()).collect();
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn single_read_untouched() {
        let mut msgs = vec![call("a", "doc_snapshot"), Message::tool_result("a", "only")];
        assert_eq!(dedupe_whole_document_reads(&mut msgs, &tools()), 0);
        assert_eq!(msgs[1].content.as_deref(), Some("only"));
    }
}
