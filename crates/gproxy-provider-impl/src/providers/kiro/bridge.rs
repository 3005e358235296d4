use bytes::Bytes;
use serde_json::{Value, json};

use super::event_stream::KiroFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    ToolUse,
}

struct ToolUseAccum {
    id: String,
    name: String,
    partial_json: String,
}

/// Converts decoded Kiro event-stream frames into Anthropic Messages SSE
/// events, one upstream frame at a time, and doubles as the accumulator used
/// to synthesize a single non-streaming response when the caller didn't ask
/// for `stream: true`.
pub(super) struct ClaudeBridge {
    message_id: String,
    model: String,
    started: bool,
    block_open: bool,
    block_kind: Option<BlockKind>,
    block_index: u32,
    text: String,
    tool_uses: Vec<ToolUseAccum>,
    open_tool_use_id: Option<String>,
    pub saw_content_block_stop: bool,
    stop_reason: String,
    /// Up-front (input, cache_creation, cache_read) estimate from the request
    /// size, reported in `message_start` and again, unchanged, at `finish`.
    usage_estimate: (u64, u64, u64),
}

impl ClaudeBridge {
    pub fn new(message_id: String, model: String, usage_estimate: (u64, u64, u64)) -> Self {
        Self {
            message_id,
            model,
            started: false,
            block_open: false,
            block_kind: None,
            block_index: 0,
            text: String::new(),
            tool_uses: Vec::new(),
            open_tool_use_id: None,
            saw_content_block_stop: false,
            stop_reason: "end_turn".to_string(),
            usage_estimate,
        }
    }

    fn ensure_started(&mut self, out: &mut Vec<Bytes>) {
        if self.started {
            return;
        }
        self.started = true;
        let (input_tokens, cache_creation, cache_read) = self.usage_estimate;
        out.push(encode_sse(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": Value::Null,
                    "stop_sequence": Value::Null,
                    "usage": {
                        "input_tokens": input_tokens,
                        "cache_creation_input_tokens": cache_creation,
                        "cache_read_input_tokens": cache_read,
                        "output_tokens": 0,
                    },
                }
            }),
        ));
    }

    fn close_block(&mut self, out: &mut Vec<Bytes>) {
        if !self.block_open {
            return;
        }
        self.block_open = false;
        self.saw_content_block_stop = true;
        out.push(encode_sse(
            "content_block_stop",
            &json!({ "type": "content_block_stop", "index": self.block_index }),
        ));
        if let Some(kind) = self.block_kind.take()
            && kind == BlockKind::ToolUse
            && let Some(accum) = self.tool_uses.last_mut()
        {
            accum.partial_json = accum.partial_json.clone();
        }
        self.open_tool_use_id = None;
    }

    pub fn on_frame(&mut self, frame: &KiroFrame, out: &mut Vec<Bytes>) {
        match frame.event_type.as_deref() {
            Some("assistantResponseEvent") => self.on_assistant_event(frame, out),
            Some("toolUseEvent") => self.on_tool_use_event(frame, out),
            _ => {}
        }
    }

    fn on_assistant_event(&mut self, frame: &KiroFrame, out: &mut Vec<Bytes>) {
        let content = frame
            .payload
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if content.is_empty() {
            return;
        }
        self.ensure_started(out);
        if self.block_kind != Some(BlockKind::Text) {
            self.close_block(out);
            self.block_index += if self.started && self.block_kind.is_some() {
                1
            } else {
                0
            };
            self.block_open = true;
            self.block_kind = Some(BlockKind::Text);
            out.push(encode_sse(
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": self.block_index,
                    "content_block": {"type": "text", "text": ""},
                }),
            ));
        }
        self.text.push_str(content);
        out.push(encode_sse(
            "content_block_delta",
            &json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": {"type": "text_delta", "text": content},
            }),
        ));
    }

    fn on_tool_use_event(&mut self, frame: &KiroFrame, out: &mut Vec<Bytes>) {
        self.ensure_started(out);
        let tool_use_id = frame
            .payload
            .get("toolUseId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let name = frame
            .payload
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let input_chunk = frame
            .payload
            .get("input")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let is_stop = frame
            .payload
            .get("stop")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if self.open_tool_use_id.as_deref() != Some(tool_use_id.as_str()) {
            self.close_block(out);
            self.block_index += if self.started { 1 } else { 0 };
            self.block_open = true;
            self.block_kind = Some(BlockKind::ToolUse);
            self.open_tool_use_id = Some(tool_use_id.clone());
            self.tool_uses.push(ToolUseAccum {
                id: tool_use_id.clone(),
                name: name.clone(),
                partial_json: String::new(),
            });
            out.push(encode_sse(
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": self.block_index,
                    "content_block": {"type": "tool_use", "id": tool_use_id, "name": name, "input": {}},
                }),
            ));
        }

        if !input_chunk.is_empty() {
            if let Some(accum) = self.tool_uses.last_mut() {
                accum.partial_json.push_str(input_chunk);
            }
            out.push(encode_sse(
                "content_block_delta",
                &json!({
                    "type": "content_block_delta",
                    "index": self.block_index,
                    "delta": {"type": "input_json_delta", "partial_json": input_chunk},
                }),
            ));
        }

        if is_stop {
            self.stop_reason = "tool_use".to_string();
            self.close_block(out);
        }
    }

    pub fn finish(&mut self, usage: (u64, u64, u64)) -> Vec<Bytes> {
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        self.close_block(&mut out);
        let (input_tokens, cache_creation, cache_read) = usage;
        out.push(encode_sse(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": self.stop_reason, "stop_sequence": Value::Null},
                "usage": {
                    "input_tokens": input_tokens,
                    "cache_creation_input_tokens": cache_creation,
                    "cache_read_input_tokens": cache_read,
                    "output_tokens": estimate_output_tokens(&self.text, &self.tool_uses),
                },
            }),
        ));
        out.push(encode_sse("message_stop", &json!({ "type": "message_stop" })));
        out
    }

    pub fn final_message(&self, usage: (u64, u64, u64)) -> Value {
        let (input_tokens, cache_creation, cache_read) = usage;
        let mut content = Vec::new();
        if !self.text.is_empty() {
            content.push(json!({"type": "text", "text": self.text}));
        }
        for tool_use in &self.tool_uses {
            let input: Value =
                serde_json::from_str(&tool_use.partial_json).unwrap_or_else(|_| json!({}));
            content.push(json!({
                "type": "tool_use",
                "id": tool_use.id,
                "name": tool_use.name,
                "input": input,
            }));
        }
        json!({
            "id": self.message_id,
            "type": "message",
            "role": "assistant",
            "model": self.model,
            "content": content,
            "stop_reason": self.stop_reason,
            "stop_sequence": Value::Null,
            "usage": {
                "input_tokens": input_tokens,
                "cache_creation_input_tokens": cache_creation,
                "cache_read_input_tokens": cache_read,
                "output_tokens": estimate_output_tokens(&self.text, &self.tool_uses),
            },
        })
    }
}

fn estimate_output_tokens(text: &str, tool_uses: &[ToolUseAccum]) -> u64 {
    let chars: usize =
        text.len() + tool_uses.iter().map(|t| t.partial_json.len()).sum::<usize>();
    (chars as u64 / 4).max(1)
}

fn encode_sse(event: &str, data: &Value) -> Bytes {
    let body = serde_json::to_string(data).unwrap_or_default();
    let mut out = String::new();
    out.push_str("event: ");
    out.push_str(event);
    out.push('\n');
    for line in body.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::kiro::event_stream::KiroFrame;

    fn event(event_type: &str, payload: Value) -> KiroFrame {
        KiroFrame {
            message_type: "event".to_string(),
            event_type: Some(event_type.to_string()),
            exception_type: None,
            payload,
        }
    }

    #[test]
    fn text_events_accumulate_and_emit_deltas() {
        let mut bridge = ClaudeBridge::new("msg_1".to_string(), "m".to_string(), (0, 0, 0));
        let mut out = Vec::new();
        bridge.on_frame(&event("assistantResponseEvent", json!({"content": "hel"})), &mut out);
        bridge.on_frame(&event("assistantResponseEvent", json!({"content": "lo"})), &mut out);
        assert!(!out.is_empty());
        let final_msg = bridge.final_message((10, 0, 0));
        assert_eq!(final_msg["content"][0]["text"], "hello");
    }

    #[test]
    fn tool_use_event_closes_on_stop() {
        let mut bridge = ClaudeBridge::new("msg_1".to_string(), "m".to_string(), (0, 0, 0));
        let mut out = Vec::new();
        bridge.on_frame(
            &event(
                "toolUseEvent",
                json!({"toolUseId": "t1", "name": "search", "input": "{\"q\":"}),
            ),
            &mut out,
        );
        bridge.on_frame(
            &event(
                "toolUseEvent",
                json!({"toolUseId": "t1", "name": "search", "input": "\"x\"}", "stop": true}),
            ),
            &mut out,
        );
        assert!(bridge.saw_content_block_stop);
        let final_msg = bridge.final_message((10, 0, 0));
        assert_eq!(final_msg["content"][0]["input"]["q"], "x");
        assert_eq!(final_msg["stop_reason"], "tool_use");
    }
}
