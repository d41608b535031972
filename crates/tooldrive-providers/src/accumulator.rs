//! Reassembles Responses API streaming events into text and tool calls.
//!
//! Argument fragments may be tagged with the call id, the output item id, or
//! both. Fragments are buffered under whichever id is known; once an event
//! ties an item id to a call id the item buffer is folded into the call
//! buffer, keeping arrival order.

use std::collections::HashMap;

use serde_json::Value;
use tooldrive_core::message::ToolCallRequest;
use tracing::{debug, trace};

use crate::AssistantTurn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorState {
    Idle,
    Accumulating,
    Done,
}

#[derive(Debug, Default)]
struct CallBuffer {
    name: Option<String>,
    /// (arrival sequence, fragment)
    fragments: Vec<(u64, String)>,
    /// Complete arguments from a terminal event; wins over fragments.
    final_arguments: Option<String>,
}

impl CallBuffer {
    fn absorb(&mut self, other: CallBuffer) {
        if self.name.is_none() {
            self.name = other.name;
        }
        self.fragments.extend(other.fragments);
        self.fragments.sort_by_key(|(seq, _)| *seq);
        if self.final_arguments.is_none() {
            self.final_arguments = other.final_arguments;
        }
    }

    fn arguments(&self) -> String {
        if let Some(done) = &self.final_arguments {
            return done.clone();
        }
        if self.fragments.is_empty() {
            return "{}".to_string();
        }
        self.fragments.iter().map(|(_, f)| f.as_str()).collect()
    }
}

#[derive(Debug)]
pub struct StreamAccumulator {
    state: AccumulatorState,
    text: String,
    saw_text_delta: bool,
    fallback_text: Option<String>,
    item_to_call: HashMap<String, String>,
    buffers: HashMap<String, CallBuffer>,
    order: Vec<String>,
    seq: u64,
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self {
            state: AccumulatorState::Idle,
            text: String::new(),
            saw_text_delta: false,
            fallback_text: None,
            item_to_call: HashMap::new(),
            buffers: HashMap::new(),
            order: Vec::new(),
            seq: 0,
        }
    }

    pub fn state(&self) -> AccumulatorState {
        self.state
    }

    /// Feed one event. Returns a text delta to display, if the event carried one.
    pub fn push(&mut self, event: &Value) -> Option<String> {
        if self.state == AccumulatorState::Done {
            trace!("Ignoring event after completion");
            return None;
        }
        self.state = AccumulatorState::Accumulating;

        let kind = event.get("type").and_then(Value::as_str).unwrap_or("");
        match kind {
            "response.output_text.delta" => {
                let delta = str_field(event, "delta")?;
                self.text.push_str(delta);
                self.saw_text_delta = true;
                return Some(delta.to_string());
            }
            "response.output_text.done" => {
                if let Some(text) = str_field(event, "text") {
                    self.fallback_text = Some(text.to_string());
                }
                return None;
            }
            "response.completed" | "response.done" => {
                self.state = AccumulatorState::Done;
                return None;
            }
            _ => {}
        }

        let item = event.get("item").filter(|i| i.is_object());
        let is_item_event = kind.starts_with("response.output_item.");
        if is_item_event {
            let is_call = item
                .and_then(|i| i.get("type"))
                .and_then(Value::as_str)
                .is_some_and(|t| t == "function_call");
            if !is_call {
                return None;
            }
        }

        let is_fragment = matches!(
            kind,
            "response.function_call_arguments.delta"
                | "response.tool_call_arguments.delta"
                | "response.function_call.delta"
        );
        let is_final = kind == "response.function_call_arguments.done";
        if !(is_item_event || is_fragment || is_final) {
            return None;
        }

        let Some(key) = self.resolve_key(event, item) else {
            debug!(event_type = kind, "Function call event without any identifier");
            return None;
        };

        let name = str_field(event, "name").or_else(|| item.and_then(|i| str_field(i, "name")));
        let seq = self.next_seq();
        let buffer = self.buffer_mut(&key);
        if let Some(name) = name {
            buffer.name = Some(name.to_string());
        }

        match kind {
            "response.output_item.done" => {
                if let Some(args) = item.and_then(|i| arguments_of(i)) {
                    buffer.final_arguments = Some(args);
                }
            }
            "response.function_call_arguments.done" => {
                if let Some(args) = arguments_of(event) {
                    buffer.final_arguments = Some(args);
                }
            }
            "response.output_item.added" => {
                if let Some(args) = item.and_then(|i| arguments_of(i)) {
                    buffer.fragments.push((seq, args));
                }
            }
            _ => {
                if let Some(delta) = str_field(event, "delta") {
                    buffer.fragments.push((seq, delta.to_string()));
                }
            }
        }
        None
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn buffer_mut(&mut self, key: &str) -> &mut CallBuffer {
        if !self.buffers.contains_key(key) {
            self.order.push(key.to_string());
        }
        self.buffers.entry(key.to_string()).or_default()
    }

    /// Pick the buffer key for an event, learning item → call correlations.
    fn resolve_key(&mut self, event: &Value, item: Option<&Value>) -> Option<String> {
        let call_id = str_field(event, "call_id")
            .or_else(|| item.and_then(|i| str_field(i, "call_id")))
            .map(String::from);
        let item_id = str_field(event, "item_id")
            .or_else(|| item.and_then(|i| str_field(i, "id")))
            .map(String::from);

        match (call_id, item_id) {
            (Some(call_id), Some(item_id)) => {
                self.link(&item_id, &call_id);
                Some(call_id)
            }
            (Some(call_id), None) => Some(call_id),
            (None, Some(item_id)) => Some(
                self.item_to_call
                    .get(&item_id)
                    .cloned()
                    .unwrap_or(item_id),
            ),
            (None, None) => str_field(event, "id").map(String::from),
        }
    }

    fn link(&mut self, item_id: &str, call_id: &str) {
        if item_id == call_id {
            return;
        }
        self.item_to_call
            .insert(item_id.to_string(), call_id.to_string());

        let Some(orphan) = self.buffers.remove(item_id) else {
            return;
        };
        debug!(item_id, call_id, "Merging item-keyed arguments into call");

        let item_pos = self.order.iter().position(|k| k == item_id);
        let call_pos = self.order.iter().position(|k| k == call_id);
        match (item_pos, call_pos) {
            (Some(i), Some(c)) if i < c => {
                self.order.remove(c);
                self.order[i] = call_id.to_string();
            }
            (Some(i), Some(_)) => {
                self.order.remove(i);
            }
            (Some(i), None) => self.order[i] = call_id.to_string(),
            _ => {}
        }

        self.buffers
            .entry(call_id.to_string())
            .or_default()
            .absorb(orphan);
    }

    /// Final text and tool calls in first-seen order.
    pub fn finish(mut self) -> AssistantTurn {
        self.state = AccumulatorState::Done;
        let text = if self.saw_text_delta {
            self.text
        } else {
            self.fallback_text.unwrap_or_default()
        };

        let tool_calls = self
            .order
            .iter()
            .filter_map(|key| {
                let buf = self.buffers.get(key)?;
                Some(ToolCallRequest::new(
                    key.clone(),
                    buf.name.clone().unwrap_or_else(|| "unknown".to_string()),
                    buf.arguments(),
                ))
            })
            .collect();

        AssistantTurn {
            text,
            tool_calls,
            envelope: None,
        }
    }
}

/// `arguments` as a string; objects are serialised.
fn arguments_of(v: &Value) -> Option<String> {
    match v.get("arguments")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(_) => v.get("arguments").map(Value::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn run(events: &[Value]) -> (Vec<String>, AssistantTurn) {
        let mut acc = StreamAccumulator::new();
        let deltas = events.iter().filter_map(|e| acc.push(e)).collect();
        (deltas, acc.finish())
    }

    #[test]
    fn test_text_deltas_are_returned_and_joined() {
        let (deltas, turn) = run(&[
            json!({"type": "response.output_text.delta", "delta": "Hel"}),
            json!({"type": "response.output_text.delta", "delta": "lo"}),
            json!({"type": "response.output_text.done", "text": "ignored"}),
        ]);
        assert_eq!(deltas, vec!["Hel", "lo"]);
        assert_eq!(turn.text, "Hello");
        assert!(turn.tool_calls.is_empty());
    }

    #[test]
    fn test_done_text_used_without_deltas() {
        let (_, turn) = run(&[json!({"type": "response.output_text.done", "text": "full"})]);
        assert_eq!(turn.text, "full");
    }

    #[test]
    fn test_item_keyed_fragments_merge_into_call() {
        let (_, turn) = run(&[
            json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": "{\"a\":"}),
            json!({"type": "response.output_item.added", "item": {"type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "f"}}),
            json!({"type": "response.function_call_arguments.delta", "call_id": "call_1", "delta": "1}"}),
        ]);
        assert_eq!(turn.tool_calls.len(), 1);
        let call = &turn.tool_calls[0];
        assert_eq!(call.id, "call_1");
        assert_eq!(call.name, "f");
        assert_eq!(call.arguments, "{\"a\":1}");
    }

    #[test]
    fn test_learned_mapping_routes_later_item_fragments() {
        let (_, turn) = run(&[
            json!({"type": "response.output_item.added", "item": {"type": "function_call", "id": "fc_9", "call_id": "call_9", "name": "g"}}),
            json!({"type": "response.function_call_arguments.delta", "item_id": "fc_9", "delta": "{\"x\""}),
            json!({"type": "response.function_call_arguments.delta", "item_id": "fc_9", "delta": ":2}"}),
        ]);
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].id, "call_9");
        assert_eq!(turn.tool_calls[0].arguments, "{\"x\":2}");
    }

    #[test]
    fn test_done_event_replaces_fragments() {
        let (_, turn) = run(&[
            json!({"type": "response.function_call_arguments.delta", "call_id": "c", "delta": "{\"bro"}),
            json!({"type": "response.output_item.done", "item": {"type": "function_call", "call_id": "c", "name": "late_name", "arguments": "{\"ok\":true}"}}),
        ]);
        assert_eq!(turn.tool_calls[0].arguments, "{\"ok\":true}");
        assert_eq!(turn.tool_calls[0].name, "late_name");
    }

    #[test]
    fn test_defaults_for_name_and_arguments() {
        let (_, turn) = run(&[
            json!({"type": "response.output_item.added", "item": {"type": "function_call", "call_id": "c0"}}),
            json!({"type": "response.function_call_arguments.delta", "call_id": "c1", "delta": ""}),
        ]);
        assert_eq!(turn.tool_calls.len(), 2);
        assert_eq!(turn.tool_calls[0].name, "unknown");
        assert_eq!(turn.tool_calls[0].arguments, "{}");
    }

    #[test]
    fn test_calls_keep_first_seen_order() {
        let (_, turn) = run(&[
            json!({"type": "response.function_call_arguments.delta", "call_id": "b", "delta": "{}"}),
            json!({"type": "response.function_call_arguments.delta", "call_id": "a", "delta": "{}"}),
            json!({"type": "response.function_call_arguments.delta", "call_id": "b", "delta": ""}),
        ]);
        let ids: Vec<_> = turn.tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_state_transitions() {
        let mut acc = StreamAccumulator::new();
        assert_eq!(acc.state(), AccumulatorState::Idle);
        acc.push(&json!({"type": "response.created"}));
        assert_eq!(acc.state(), AccumulatorState::Accumulating);
        acc.push(&json!({"type": "response.completed"}));
        assert_eq!(acc.state(), AccumulatorState::Done);
        assert_eq!(acc.push(&json!({"type": "response.output_text.delta", "delta": "late"})), None);
    }

    #[test]
    fn test_message_items_are_not_calls() {
        let (_, turn) = run(&[
            json!({"type": "response.output_item.added", "item": {"type": "message", "id": "msg_1"}}),
        ]);
        assert!(turn.tool_calls.is_empty());
    }
}
