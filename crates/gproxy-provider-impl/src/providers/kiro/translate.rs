use serde_json::{Map, Value};

/// Maps a Claude model id to the upstream Kiro model identifier, e.g.
/// `claude-haiku-4-5-20251001` -> `CLAUDE_HAIKU_4_5_20251001_V1_0`.
pub(super) fn map_model_name(model: &str) -> String {
    let upper = model.to_ascii_uppercase().replace('-', "_").replace('.', "_");
    format!("{upper}_V1_0")
}

/// Strips `$`-prefixed keys (e.g. `$schema`, `$defs`) from every `properties`
/// object in a JSON Schema document, removing the matching names from
/// `required` too, and recurses into the usual schema-composition spots.
pub(super) fn sanitize_tool_schema(schema: &mut Value) {
    let Value::Object(obj) = schema else {
        return;
    };

    if let Some(Value::Object(properties)) = obj.get_mut("properties") {
        let dollar_keys: Vec<String> = properties
            .keys()
            .filter(|k| k.starts_with('$'))
            .cloned()
            .collect();
        for key in &dollar_keys {
            properties.remove(key);
        }
        if !dollar_keys.is_empty()
            && let Some(Value::Array(required)) = obj.get_mut("required")
        {
            required.retain(|v| !matches!(v.as_str(), Some(s) if dollar_keys.iter().any(|k| k == s)));
        }
        let properties_keys: Vec<String> = properties.keys().cloned().collect();
        if let Some(Value::Object(properties)) = obj.get_mut("properties") {
            for key in properties_keys {
                if let Some(value) = properties.get_mut(&key) {
                    sanitize_tool_schema(value);
                }
            }
        }
    }

    if let Some(items) = obj.get_mut("items") {
        sanitize_tool_schema(items);
    }
    if let Some(additional) = obj.get_mut("additionalProperties") {
        sanitize_tool_schema(additional);
    }
    for key in ["anyOf", "allOf", "oneOf"] {
        if let Some(Value::Array(items)) = obj.get_mut(key) {
            for item in items {
                sanitize_tool_schema(item);
            }
        }
    }
}

fn schema_has_required_params(schema: &Value) -> bool {
    schema
        .get("required")
        .and_then(|v| v.as_array())
        .is_some_and(|arr| !arr.is_empty())
}

fn is_empty_object(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.is_empty())
}

/// Drops tool uses with an empty `input` when the tool declares required
/// parameters and the Kiro history carries no matching `toolResult`, i.e. the
/// call never actually completed and replaying it upstream would desync the
/// conversation.
pub(super) fn filter_history(history: &mut Vec<Value>, tool_schemas: &Map<String, Value>) {
    let referenced_tool_use_ids: std::collections::HashSet<String> = history
        .iter()
        .filter_map(|turn| turn.get("userInputMessage"))
        .filter_map(|msg| msg.get("userInputMessageContext"))
        .filter_map(|ctx| ctx.get("toolResults"))
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|result| result.get("toolUseId"))
        .filter_map(|id| id.as_str())
        .map(|s| s.to_string())
        .collect();

    for turn in history.iter_mut() {
        let Some(assistant) = turn.get_mut("assistantResponseMessage") else {
            continue;
        };
        let Some(Value::Array(tool_uses)) = assistant.get_mut("toolUses") else {
            continue;
        };
        tool_uses.retain(|tool_use| {
            let empty_input = tool_use.get("input").is_none_or(is_empty_object);
            if !empty_input {
                return true;
            }
            let name = tool_use.get("name").and_then(|v| v.as_str()).unwrap_or("");
            let requires_params = tool_schemas
                .get(name)
                .is_some_and(schema_has_required_params);
            if !requires_params {
                return true;
            }
            let id = tool_use.get("toolUseId").and_then(|v| v.as_str());
            match id {
                Some(id) => referenced_tool_use_ids.contains(id),
                None => false,
            }
        });
    }
}

/// Builds the Kiro `conversation` request body from a Claude Messages request
/// body (already converted to a generic JSON value). The current turn is the
/// last message; everything before it becomes `history`.
pub(super) fn build_kiro_payload(
    body: &Value,
    conversation_id: &str,
    profile_arn: Option<&str>,
) -> Value {
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let model_id = map_model_name(model);

    let mut tool_schemas: Map<String, Value> = Map::new();
    let tool_specs: Vec<Value> = body
        .get("tools")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .map(|tool| {
            let name = tool
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let mut schema = tool.get("input_schema").cloned().unwrap_or(Value::Null);
            sanitize_tool_schema(&mut schema);
            tool_schemas.insert(name.clone(), schema.clone());
            serde_json::json!({
                "toolSpecification": {
                    "name": name,
                    "description": tool.get("description").cloned().unwrap_or(Value::String(String::new())),
                    "inputSchema": { "json": schema },
                }
            })
        })
        .collect();

    let messages: Vec<Value> = body
        .get("messages")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut history: Vec<Value> = messages
        .iter()
        .map(|message| message_to_kiro_turn(message, &model_id))
        .collect();

    let current = history.pop().unwrap_or_else(|| {
        serde_json::json!({ "userInputMessage": { "content": "", "modelId": model_id } })
    });

    filter_history(&mut history, &tool_schemas);

    serde_json::json!({
        "conversationId": conversation_id,
        "profileArn": profile_arn,
        "currentMessage": current,
        "history": history,
        "toolSpecifications": tool_specs,
    })
}

fn message_to_kiro_turn(message: &Value, model_id: &str) -> Value {
    let role = message.get("role").and_then(|v| v.as_str()).unwrap_or("user");
    let text = extract_text(message.get("content").unwrap_or(&Value::Null));
    let tool_uses = extract_tool_uses(message.get("content").unwrap_or(&Value::Null));
    let tool_results = extract_tool_results(message.get("content").unwrap_or(&Value::Null));

    if role == "assistant" {
        serde_json::json!({
            "assistantResponseMessage": {
                "content": text,
                "toolUses": tool_uses,
            }
        })
    } else {
        let mut user_msg = serde_json::json!({
            "content": text,
            "modelId": model_id,
        });
        if !tool_results.is_empty()
            && let Value::Object(obj) = &mut user_msg
        {
            obj.insert(
                "userInputMessageContext".to_string(),
                serde_json::json!({ "toolResults": tool_results }),
            );
        }
        serde_json::json!({ "userInputMessage": user_msg })
    }
}

fn extract_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn extract_tool_uses(content: &Value) -> Vec<Value> {
    let Value::Array(blocks) = content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter(|b| b.get("type").and_then(|v| v.as_str()) == Some("tool_use"))
        .map(|b| {
            serde_json::json!({
                "toolUseId": b.get("id").cloned().unwrap_or(Value::Null),
                "name": b.get("name").cloned().unwrap_or(Value::Null),
                "input": b.get("input").cloned().unwrap_or_else(|| serde_json::json!({})),
            })
        })
        .collect()
}

fn extract_tool_results(content: &Value) -> Vec<Value> {
    let Value::Array(blocks) = content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter(|b| b.get("type").and_then(|v| v.as_str()) == Some("tool_result"))
        .map(|b| {
            serde_json::json!({
                "toolUseId": b.get("tool_use_id").cloned().unwrap_or(Value::Null),
                "content": b.get("content").cloned().unwrap_or(Value::Null),
                "status": if b.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false) {
                    "error"
                } else {
                    "success"
                },
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_model_name_formats_claude_ids() {
        assert_eq!(
            map_model_name("claude-haiku-4-5-20251001"),
            "CLAUDE_HAIKU_4_5_20251001_V1_0"
        );
    }

    #[test]
    fn sanitize_tool_schema_strips_dollar_keys() {
        let mut schema = serde_json::json!({
            "type": "object",
            "properties": {
                "$schema": {"type": "string"},
                "path": {"type": "string"},
            },
            "required": ["$schema", "path"],
        });
        sanitize_tool_schema(&mut schema);
        assert!(schema["properties"].get("$schema").is_none());
        assert_eq!(schema["required"], serde_json::json!(["path"]));
    }

    #[test]
    fn sanitize_tool_schema_recurses_into_items() {
        let mut schema = serde_json::json!({
            "type": "array",
            "items": {
                "type": "object",
                "properties": { "$id": {"type": "string"} },
            }
        });
        sanitize_tool_schema(&mut schema);
        assert!(schema["items"]["properties"].get("$id").is_none());
    }

    #[test]
    fn filter_history_drops_unresolved_empty_tool_use() {
        let mut tool_schemas = Map::new();
        tool_schemas.insert(
            "search".to_string(),
            serde_json::json!({"required": ["query"]}),
        );
        let mut history = vec![serde_json::json!({
            "assistantResponseMessage": {
                "content": "",
                "toolUses": [
                    {"toolUseId": "t1", "name": "search", "input": {}},
                    {"toolUseId": "t2", "name": "search", "input": {"query": "x"}},
                ]
            }
        })];
        filter_history(&mut history, &tool_schemas);
        let remaining = history[0]["assistantResponseMessage"]["toolUses"]
            .as_array()
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0]["toolUseId"], "t2");
    }

    #[test]
    fn filter_history_keeps_empty_tool_use_with_matching_result() {
        let mut tool_schemas = Map::new();
        tool_schemas.insert(
            "search".to_string(),
            serde_json::json!({"required": ["query"]}),
        );
        let mut history = vec![
            serde_json::json!({
                "assistantResponseMessage": {
                    "content": "",
                    "toolUses": [{"toolUseId": "t1", "name": "search", "input": {}}],
                }
            }),
            serde_json::json!({
                "userInputMessage": {
                    "content": "",
                    "userInputMessageContext": { "toolResults": [{"toolUseId": "t1"}] }
                }
            }),
        ];
        filter_history(&mut history, &tool_schemas);
        let remaining = history[0]["assistantResponseMessage"]["toolUses"]
            .as_array()
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }
}
