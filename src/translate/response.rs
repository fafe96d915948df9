//! OpenAI buffered response → Anthropic response conversion.

use super::{
    map_finish_reason, new_message_id, new_tool_id, AnthropicUsage, ChatMessage, ChatResponse,
    ContentBlock, MessagesResponse,
};
use crate::error::{Error, Result};
use serde_json::Value;

/// Convert a non-streaming OpenAI chat completion body into an Anthropic
/// message. `request_model` is echoed back so clients see the name they
/// asked for.
pub fn convert_response(body: &[u8], request_model: &str) -> Result<MessagesResponse> {
    let resp: ChatResponse = serde_json::from_slice(body)
        .map_err(|e| Error::Upstream(format!("unparseable backend response: {}", e)))?;

    let choice = resp
        .choices
        .first()
        .ok_or_else(|| Error::Upstream("backend response contains no choices".into()))?;

    let id = if resp.id.is_empty() {
        new_message_id()
    } else {
        resp.id.clone()
    };

    Ok(MessagesResponse {
        id,
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: request_model.to_string(),
        content: build_content_blocks(&choice.message),
        stop_reason: Some(
            map_finish_reason(choice.finish_reason.as_deref().unwrap_or("stop")).to_string(),
        ),
        stop_sequence: None,
        usage: AnthropicUsage {
            input_tokens: resp.usage.prompt_tokens,
            output_tokens: resp.usage.completion_tokens,
        },
    })
}

fn build_content_blocks(msg: &ChatMessage) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();

    let text = message_text(msg);
    if !text.is_empty() {
        blocks.push(ContentBlock::Text { text });
    }

    for tc in &msg.tool_calls {
        blocks.push(ContentBlock::ToolUse {
            id: if tc.id.is_empty() {
                new_tool_id()
            } else {
                tc.id.clone()
            },
            name: tc.function.name.clone(),
            input: parse_tool_arguments(&tc.function.arguments),
        });
    }

    // Anthropic requires at least one content block.
    if blocks.is_empty() {
        blocks.push(ContentBlock::Text {
            text: String::new(),
        });
    }

    blocks
}

fn message_text(msg: &ChatMessage) -> String {
    match &msg.content {
        Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

/// Tool arguments arrive as a JSON string; malformed payloads are wrapped
/// as `{raw: <string>}` rather than dropped.
fn parse_tool_arguments(args: &str) -> Value {
    if args.is_empty() {
        return serde_json::json!({});
    }
    match serde_json::from_str::<serde_json::Map<String, Value>>(args) {
        Ok(map) => Value::Object(map),
        Err(_) => serde_json::json!({"raw": args}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_response() {
        let body = json!({
            "id": "chatcmpl-1",
            "choices": [{
                "message": {"role": "assistant", "content": "Hello"},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 2, "completion_tokens": 1, "total_tokens": 3},
        });
        let resp = convert_response(body.to_string().as_bytes(), "m").unwrap();

        assert_eq!(resp.id, "chatcmpl-1");
        assert_eq!(resp.kind, "message");
        assert_eq!(resp.role, "assistant");
        assert_eq!(resp.model, "m");
        assert_eq!(
            resp.content,
            vec![ContentBlock::Text {
                text: "Hello".to_string()
            }]
        );
        assert_eq!(resp.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(resp.usage.input_tokens, 2);
        assert_eq!(resp.usage.output_tokens, 1);
    }

    #[test]
    fn test_text_and_tool_calls_preserve_order() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "thinking",
                    "tool_calls": [
                        {"id": "tc1", "type": "function",
                         "function": {"name": "sum", "arguments": "{\"a\":1}"}},
                        {"id": "", "type": "function",
                         "function": {"name": "mul", "arguments": "not-json"}},
                    ],
                },
                "finish_reason": "tool_calls",
            }],
        });
        let resp = convert_response(body.to_string().as_bytes(), "m").unwrap();

        assert_eq!(resp.content.len(), 3);
        assert!(matches!(&resp.content[0], ContentBlock::Text { text } if text == "thinking"));
        match &resp.content[1] {
            ContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "tc1");
                assert_eq!(name, "sum");
                assert_eq!(input["a"], 1);
            }
            other => panic!("unexpected block: {:?}", other),
        }
        match &resp.content[2] {
            ContentBlock::ToolUse { id, input, .. } => {
                assert!(id.starts_with("toolu_"));
                assert_eq!(input["raw"], "not-json");
            }
            other => panic!("unexpected block: {:?}", other),
        }
        assert_eq!(resp.stop_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn test_empty_message_gets_empty_text_block() {
        let body = json!({
            "choices": [{"message": {"role": "assistant", "content": null}, "finish_reason": "stop"}],
        });
        let resp = convert_response(body.to_string().as_bytes(), "m").unwrap();
        assert_eq!(
            resp.content,
            vec![ContentBlock::Text {
                text: String::new()
            }]
        );
        assert!(resp.id.starts_with("msg_"));
    }

    #[test]
    fn test_length_maps_to_max_tokens() {
        let body = json!({
            "choices": [{"message": {"role": "assistant", "content": "x"}, "finish_reason": "length"}],
        });
        let resp = convert_response(body.to_string().as_bytes(), "m").unwrap();
        assert_eq!(resp.stop_reason.as_deref(), Some("max_tokens"));
    }

    #[test]
    fn test_no_choices_is_upstream_error() {
        let body = json!({"choices": []});
        assert!(matches!(
            convert_response(body.to_string().as_bytes(), "m"),
            Err(Error::Upstream(_))
        ));
    }
}
