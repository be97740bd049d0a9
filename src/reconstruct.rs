//! Turns interleaved partial chunks into delta messages and one final message per turn.
//!
//! Tool-call fragments are the hard part: several calls may stream at once, and some
//! providers continue a call with fragments that carry neither an id nor a real name.
//! Each fragment is routed to a builder by the first matching rule:
//!
//! 1. a non-empty id,
//! 2. a real (non-placeholder) name, keyed as `name:{name}`,
//! 3. a placeholder name, which continues the last resolved call,
//! 4. otherwise a fresh positional key `pos:{n}`.

use crate::message::{ContentBlock, LiveMessage, Role};
use indexmap::IndexMap;
use serde_json::{Map, Value};

/// Canonical placeholder meaning "more of the previous call".
pub const PLACEHOLDER_NAME: &str = "__fragment__";
const PLACEHOLDER_PREFIX: &str = "__";

#[must_use]
pub fn is_placeholder_name(name: &str) -> bool {
    name.starts_with(PLACEHOLDER_PREFIX)
}

/// One partial piece of a tool invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallFragment {
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<Map<String, Value>>,
    pub raw: Option<String>,
}

impl ToolCallFragment {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn arguments(mut self, arguments: Map<String, Value>) -> Self {
        self.arguments = Some(arguments);
        self
    }

    #[must_use]
    pub fn raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = Some(raw.into());
        self
    }

    fn real_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }

    fn has_placeholder_name(&self) -> bool {
        self.name.as_deref().is_some_and(is_placeholder_name)
    }

    fn real_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .filter(|name| !name.is_empty() && !is_placeholder_name(name))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Text(String),
    Thinking(String),
    ToolCall(ToolCallFragment),
}

/// Accumulates fragments of one tool call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallBuilder {
    id: Option<String>,
    name: Option<String>,
    arguments: Map<String, Value>,
    raw: String,
}

impl ToolCallBuilder {
    fn merge(&mut self, fragment: ToolCallFragment) {
        if let Some(id) = fragment.real_id() {
            self.id = Some(id.to_string());
        }
        if let Some(name) = fragment.real_name() {
            self.name = Some(name.to_string());
        }
        if let Some(arguments) = fragment.arguments {
            self.arguments.extend(arguments);
        }
        if let Some(raw) = fragment.raw {
            self.raw.push_str(&raw);
        }
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    fn resolved_arguments(&self) -> Map<String, Value> {
        if !self.arguments.is_empty() {
            return self.arguments.clone();
        }
        if self.raw.trim().is_empty() {
            return Map::new();
        }
        match serde_json::from_str::<Value>(&self.raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                tracing::debug!(
                    "tool call {:?} arguments never became a JSON object",
                    self.name
                );
                Map::new()
            }
        }
    }

    fn build(&self, fallback_id: impl FnOnce() -> String) -> ContentBlock {
        ContentBlock::ToolUse {
            id: self.id.clone().unwrap_or_else(fallback_id),
            name: self.name.clone().unwrap_or_default(),
            input: self.resolved_arguments(),
        }
    }
}

/// Reconstruction state for one model turn.
#[derive(Debug, Clone, Default)]
pub struct ReconstructionContext {
    text: String,
    thinking: String,
    builders: IndexMap<String, ToolCallBuilder>,
    last_key: Option<String>,
    next_position: usize,
    last_chunk: Option<StreamChunk>,
}

impl ReconstructionContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.thinking.is_empty() && self.builders.is_empty()
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn thinking(&self) -> &str {
        &self.thinking
    }

    #[must_use]
    pub fn tool_call_count(&self) -> usize {
        self.builders.len()
    }

    #[must_use]
    pub fn builder(&self, key: &str) -> Option<&ToolCallBuilder> {
        self.builders.get(key)
    }

    /// Builder keys in creation order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }

    /// Feed one chunk. Text and reasoning come straight back as a delta message;
    /// tool-call fragments are buffered and return `None`.
    pub fn push(&mut self, chunk: StreamChunk) -> Option<LiveMessage> {
        self.last_chunk = Some(chunk.clone());
        match chunk {
            StreamChunk::Text(text) => {
                self.text.push_str(&text);
                Some(LiveMessage::assistant(vec![ContentBlock::Text { text }]))
            }
            StreamChunk::Thinking(thinking) => {
                self.thinking.push_str(&thinking);
                Some(LiveMessage::assistant(vec![ContentBlock::Thinking { thinking }]))
            }
            StreamChunk::ToolCall(fragment) => {
                self.push_fragment(fragment);
                None
            }
        }
    }

    /// Route a fragment to its builder and return the key it resolved to.
    pub fn push_fragment(&mut self, fragment: ToolCallFragment) -> String {
        let key = self.resolve_key(&fragment);
        self.builders.entry(key.clone()).or_default().merge(fragment);
        key
    }

    fn resolve_key(&mut self, fragment: &ToolCallFragment) -> String {
        if let Some(id) = fragment.real_id() {
            if !fragment.has_placeholder_name() {
                self.last_key = Some(id.to_string());
            }
            return id.to_string();
        }
        if let Some(name) = fragment.real_name() {
            let key = format!("name:{name}");
            self.last_key = Some(key.clone());
            return key;
        }
        if fragment.has_placeholder_name() {
            if let Some(key) = &self.last_key {
                return key.clone();
            }
        }
        let key = format!("pos:{}", self.next_position);
        self.next_position += 1;
        key
    }

    /// Finished tool calls in key-creation order. Missing ids become `call_{n}`.
    #[must_use]
    pub fn tool_calls(&self) -> Vec<ContentBlock> {
        self.builders
            .values()
            .enumerate()
            .map(|(index, builder)| builder.build(|| format!("call_{index}")))
            .collect()
    }

    /// The message the turn would produce if it ended now.
    #[must_use]
    pub fn snapshot(&self) -> Option<LiveMessage> {
        let mut content = Vec::with_capacity(self.builders.len() + 2);
        if !self.thinking.is_empty() {
            content.push(ContentBlock::thinking(self.thinking.clone()));
        }
        if !self.text.is_empty() {
            content.push(ContentBlock::text(self.text.clone()));
        }
        content.extend(self.tool_calls());
        (!content.is_empty()).then(|| LiveMessage::new(Role::Assistant, content))
    }

    /// End the turn: reasoning, then text, then tool calls. `None` if nothing arrived.
    #[must_use]
    pub fn finish(self) -> Option<LiveMessage> {
        self.snapshot()
    }

    /// Single representative message for non-streaming consumers.
    ///
    /// Prefers the last tool call, then text, then reasoning, then the last raw chunk.
    #[must_use]
    pub fn representative(&self) -> Option<LiveMessage> {
        if let Some(last) = self.tool_calls().pop() {
            return Some(LiveMessage::assistant(vec![last]));
        }
        if !self.text.is_empty() {
            return Some(LiveMessage::assistant(vec![ContentBlock::text(self.text.clone())]));
        }
        if !self.thinking.is_empty() {
            return Some(LiveMessage::assistant(vec![ContentBlock::thinking(
                self.thinking.clone(),
            )]));
        }
        self.last_chunk.as_ref().and_then(|chunk| match chunk {
            StreamChunk::Text(text) => Some(LiveMessage::assistant(vec![ContentBlock::text(text.clone())])),
            StreamChunk::Thinking(thinking) => Some(LiveMessage::assistant(vec![
                ContentBlock::thinking(thinking.clone()),
            ])),
            StreamChunk::ToolCall(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn calls(message: &LiveMessage) -> Vec<(String, String, Map<String, Value>)> {
        message
            .tool_uses()
            .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
            .collect()
    }

    #[test]
    fn deltas_are_echoed_and_accumulated() {
        let mut ctx = ReconstructionContext::new();
        let delta = ctx.push(StreamChunk::Text("Hel".into())).unwrap();
        assert_eq!(delta.text(), "Hel");
        ctx.push(StreamChunk::Text("lo".into()));
        let thought = ctx.push(StreamChunk::Thinking("plan".into())).unwrap();
        assert_eq!(thought.thinking(), "plan");
        assert_eq!(ctx.text(), "Hello");

        let message = ctx.finish().unwrap();
        assert_eq!(
            message.content,
            vec![ContentBlock::thinking("plan"), ContentBlock::text("Hello")]
        );
    }

    #[test]
    fn fragments_are_buffered() {
        let mut ctx = ReconstructionContext::new();
        let out = ctx.push(StreamChunk::ToolCall(ToolCallFragment::new().id("c1")));
        assert!(out.is_none());
        assert_eq!(ctx.tool_call_count(), 1);
    }

    #[test]
    fn id_then_arguments_merge() {
        let mut ctx = ReconstructionContext::new();
        ctx.push_fragment(ToolCallFragment::new().id("c1").name("get_weather"));
        ctx.push_fragment(ToolCallFragment::new().id("c1").arguments(args(json!({"city": "a"}))));
        let message = ctx.finish().unwrap();
        assert_eq!(
            calls(&message),
            vec![("c1".into(), "get_weather".into(), args(json!({"city": "a"})))]
        );
    }

    #[test]
    fn interleaved_ids_stay_separate() {
        let mut ctx = ReconstructionContext::new();
        ctx.push_fragment(ToolCallFragment::new().id("c1").name("first"));
        ctx.push_fragment(ToolCallFragment::new().id("c2").name("second"));
        ctx.push_fragment(ToolCallFragment::new().id("c2").raw(r#"{"b":"#));
        ctx.push_fragment(ToolCallFragment::new().id("c1").raw(r#"{"a":1}"#));
        ctx.push_fragment(ToolCallFragment::new().id("c2").raw("2}"));

        let message = ctx.finish().unwrap();
        assert_eq!(
            calls(&message),
            vec![
                ("c1".into(), "first".into(), args(json!({"a": 1}))),
                ("c2".into(), "second".into(), args(json!({"b": 2}))),
            ]
        );
    }

    #[test]
    fn placeholder_continues_named_call() {
        let mut ctx = ReconstructionContext::new();
        let key = ctx.push_fragment(ToolCallFragment::new().name("foo").raw(r#"{"x":"#));
        assert_eq!(key, "name:foo");
        let next = ctx.push_fragment(
            ToolCallFragment::new().id("").name(PLACEHOLDER_NAME).raw("true}"),
        );
        assert_eq!(next, "name:foo");
        assert_eq!(ctx.tool_call_count(), 1);

        let message = ctx.finish().unwrap();
        let (id, name, input) = &calls(&message)[0];
        assert_eq!(name, "foo");
        assert_eq!(input, &args(json!({"x": true})));
        assert_eq!(id, "call_0");
    }

    #[test]
    fn placeholder_with_id_does_not_move_last_key() {
        let mut ctx = ReconstructionContext::new();
        ctx.push_fragment(ToolCallFragment::new().id("c1").name("foo"));
        ctx.push_fragment(ToolCallFragment::new().id("c9").name("__more"));
        let key = ctx.push_fragment(ToolCallFragment::new().name(PLACEHOLDER_NAME).raw("{}"));
        assert_eq!(key, "c1");
    }

    #[test]
    fn orphan_fragments_get_positions() {
        let mut ctx = ReconstructionContext::new();
        assert_eq!(ctx.push_fragment(ToolCallFragment::new().raw("{")), "pos:0");
        assert_eq!(ctx.push_fragment(ToolCallFragment::new().name(PLACEHOLDER_NAME)), "pos:1");
        assert_eq!(ctx.keys().collect::<Vec<_>>(), vec!["pos:0", "pos:1"]);
    }

    #[test]
    fn raw_only_valid_object_parses() {
        let mut ctx = ReconstructionContext::new();
        ctx.push_fragment(ToolCallFragment::new().id("c1").name("f").raw(r#"{"q": "#));
        ctx.push_fragment(ToolCallFragment::new().id("c1").raw(r#""rust", "n": [1, 2]}"#));
        let message = ctx.finish().unwrap();
        assert_eq!(calls(&message)[0].2, args(json!({"q": "rust", "n": [1, 2]})));
    }

    #[test]
    fn raw_never_valid_yields_empty_arguments() {
        let mut ctx = ReconstructionContext::new();
        ctx.push_fragment(ToolCallFragment::new().raw(r#"{"q": "#));
        let message = ctx.finish().unwrap();
        let (id, _, input) = &calls(&message)[0];
        assert!(input.is_empty());
        assert!(!id.is_empty());
    }

    #[test]
    fn structured_arguments_win_over_raw() {
        let mut ctx = ReconstructionContext::new();
        ctx.push_fragment(ToolCallFragment::new().id("c1").raw(r#"{"a":1}"#));
        ctx.push_fragment(ToolCallFragment::new().id("c1").arguments(args(json!({"b": 2}))));
        ctx.push_fragment(ToolCallFragment::new().id("c1").arguments(args(json!({"b": 3}))));
        let message = ctx.finish().unwrap();
        assert_eq!(calls(&message)[0].2, args(json!({"b": 3})));
    }

    #[test]
    fn synthesized_ids_are_unique_within_turn() {
        let mut ctx = ReconstructionContext::new();
        ctx.push_fragment(ToolCallFragment::new().name("a"));
        ctx.push_fragment(ToolCallFragment::new().name("b"));
        let message = ctx.finish().unwrap();
        let ids: Vec<_> = calls(&message).into_iter().map(|(id, _, _)| id).collect();
        assert_eq!(ids, vec!["call_0", "call_1"]);
    }

    #[test]
    fn final_message_orders_blocks() {
        let mut ctx = ReconstructionContext::new();
        ctx.push(StreamChunk::ToolCall(ToolCallFragment::new().id("c1").name("t")));
        ctx.push(StreamChunk::Text("answer".into()));
        ctx.push(StreamChunk::Thinking("why".into()));
        let message = ctx.finish().unwrap();
        assert!(matches!(message.content[0], ContentBlock::Thinking { .. }));
        assert!(matches!(message.content[1], ContentBlock::Text { .. }));
        assert!(message.content[2].is_tool_use());
    }

    #[test]
    fn empty_turn_has_no_message() {
        assert!(ReconstructionContext::new().finish().is_none());
    }

    #[test]
    fn representative_prefers_last_tool_call() {
        let mut ctx = ReconstructionContext::new();
        ctx.push(StreamChunk::Text("hi".into()));
        ctx.push_fragment(ToolCallFragment::new().id("c1").name("one"));
        ctx.push_fragment(ToolCallFragment::new().id("c2").name("two"));
        let message = ctx.representative().unwrap();
        assert_eq!(calls(&message)[0].1, "two");
        assert_eq!(message.content.len(), 1);
    }

    #[test]
    fn representative_falls_back_in_order() {
        let mut ctx = ReconstructionContext::new();
        ctx.push(StreamChunk::Thinking("t".into()));
        assert_eq!(ctx.representative().unwrap().thinking(), "t");
        ctx.push(StreamChunk::Text("x".into()));
        assert_eq!(ctx.representative().unwrap().text(), "x");
        assert!(ReconstructionContext::new().representative().is_none());
    }

    #[test]
    fn representative_uses_last_chunk_when_buffers_are_empty() {
        let mut ctx = ReconstructionContext::new();
        ctx.push(StreamChunk::Text(String::new()));
        assert_eq!(ctx.representative().unwrap().text(), "");
    }
}
