//! Anthropic request → OpenAI request conversion.
//!
//! Covers the system prompt (string or text-block array), polymorphic
//! message content, tool definitions and tool_choice, and scalar parameter
//! mapping. Tool results are flattened into plain user text because most
//! OpenAI-compatible backends reject the dedicated tool-result message
//! role.

use super::{
    ChatFunction, ChatMessage, ChatRequest, ChatTool, FunctionCall, MessagesRequest, StreamOptions,
    ToolCall,
};
use crate::error::{Error, Result};
use serde_json::{json, Value};

/// Convert an Anthropic request into the OpenAI request forwarded to the
/// backend. `model_override` replaces the client's model name with the name
/// the backend instance actually loaded.
pub fn convert_request(req: &MessagesRequest, model_override: &str) -> Result<ChatRequest> {
    let model = if model_override.is_empty() {
        req.model.clone()
    } else {
        model_override.to_string()
    };

    let mut messages = Vec::new();
    if let Some(system) = &req.system {
        let text = parse_system_prompt(system)?;
        if !text.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: Value::String(text),
                tool_calls: Vec::new(),
            });
        }
    }
    for msg in &req.messages {
        messages.extend(
            convert_one_message(msg)
                .map_err(|e| Error::Invalid(format!("message role={}: {}", msg.role, e)))?,
        );
    }

    Ok(ChatRequest {
        model,
        messages,
        max_tokens: Some(req.max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        stream: req.stream,
        stop: req.stop_sequences.clone(),
        tools: req.tools.iter().map(convert_tool).collect(),
        tool_choice: req.tool_choice.as_ref().map(convert_tool_choice),
        stream_options: req.stream.then_some(StreamOptions { include_usage: true }),
    })
}

/// The system field is either a string or an array of
/// `{type:"text", text}` blocks joined with blank lines.
fn parse_system_prompt(system: &Value) -> Result<String> {
    match system {
        Value::String(s) => Ok(s.clone()),
        Value::Array(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter(|b| b["type"] == "text")
                .filter_map(|b| b["text"].as_str())
                .filter(|t| !t.is_empty())
                .collect();
            Ok(parts.join("\n\n"))
        }
        _ => Err(Error::Invalid(
            "system must be a string or array of text blocks".into(),
        )),
    }
}

/// A single Anthropic message becomes one OpenAI message (tool results are
/// folded into the same user message rather than split out).
fn convert_one_message(msg: &super::AnthropicMessage) -> Result<Vec<ChatMessage>> {
    match &msg.content {
        Value::String(text) => Ok(vec![ChatMessage {
            role: msg.role.clone(),
            content: Value::String(text.clone()),
            tool_calls: Vec::new(),
        }]),
        Value::Array(blocks) => {
            if msg.role == "user" {
                convert_user_blocks(blocks)
            } else {
                convert_assistant_blocks(blocks)
            }
        }
        _ => Err(Error::Invalid(
            "content must be a string or array of content blocks".into(),
        )),
    }
}

fn convert_user_blocks(blocks: &[Value]) -> Result<Vec<ChatMessage>> {
    if blocks.iter().any(|b| b["type"] == "tool_result") {
        return convert_user_tool_results(blocks);
    }

    let mut parts = Vec::new();
    for block in blocks {
        match block["type"].as_str() {
            Some("text") => {
                parts.push(json!({
                    "type": "text",
                    "text": block["text"].as_str().unwrap_or_default(),
                }));
            }
            Some("image") => {
                if let Some(url) = build_image_url(&block["source"]) {
                    parts.push(json!({
                        "type": "image_url",
                        "image_url": {"url": url},
                    }));
                }
            }
            _ => {}
        }
    }

    // A lone text block collapses to a bare string for maximum backend
    // compatibility.
    let content = if parts.len() == 1 && parts[0]["type"] == "text" {
        parts[0]["text"].clone()
    } else {
        Value::Array(parts)
    };

    Ok(vec![ChatMessage {
        role: "user".to_string(),
        content,
        tool_calls: Vec::new(),
    }])
}

/// Flatten tool_result blocks, interleaved with any text blocks, into one
/// plain-text user message.
fn convert_user_tool_results(blocks: &[Value]) -> Result<Vec<ChatMessage>> {
    let mut out = String::new();
    for block in blocks {
        match block["type"].as_str() {
            Some("text") => {
                out.push_str(block["text"].as_str().unwrap_or_default());
                out.push('\n');
            }
            Some("tool_result") => {
                out.push_str("Tool result for ");
                out.push_str(block["tool_use_id"].as_str().unwrap_or_default());
                out.push_str(":\n");
                out.push_str(&extract_tool_result_content(&block["content"]));
                out.push('\n');
            }
            _ => {}
        }
    }

    let text = out.trim().to_string();
    let text = if text.is_empty() { "...".to_string() } else { text };
    Ok(vec![ChatMessage {
        role: "user".to_string(),
        content: Value::String(text),
        tool_calls: Vec::new(),
    }])
}

fn convert_assistant_blocks(blocks: &[Value]) -> Result<Vec<ChatMessage>> {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls = Vec::new();

    for block in blocks {
        match block["type"].as_str() {
            Some("text") => {
                if let Some(text) = block["text"].as_str() {
                    if !text.is_empty() {
                        text_parts.push(text);
                    }
                }
            }
            Some("tool_use") => {
                tool_calls.push(ToolCall {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        arguments: serde_json::to_string(&block["input"])
                            .unwrap_or_else(|_| "{}".to_string()),
                    },
                    index: None,
                });
            }
            _ => {}
        }
    }

    let text = text_parts.join("\n");
    Ok(vec![ChatMessage {
        role: "assistant".to_string(),
        content: if text.is_empty() {
            Value::Null
        } else {
            Value::String(text)
        },
        tool_calls,
    }])
}

/// Normalize the polymorphic tool_result content into plain text.
fn extract_tool_result_content(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b["type"] == "text")
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// Build an `image_url` value from an Anthropic image source: base64
/// sources become data URIs, url sources pass through.
fn build_image_url(source: &Value) -> Option<String> {
    match source["type"].as_str()? {
        "base64" => {
            let media_type = source["media_type"].as_str()?;
            let data = source["data"].as_str()?;
            if media_type.is_empty() || data.is_empty() {
                return None;
            }
            Some(format!("data:{};base64,{}", media_type, data))
        }
        "url" => source["url"].as_str().map(|s| s.to_string()),
        _ => None,
    }
}

fn convert_tool(tool: &super::AnthropicTool) -> ChatTool {
    ChatTool {
        kind: "function".to_string(),
        function: ChatFunction {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: Some(tool.input_schema.clone()),
        },
    }
}

/// Map Anthropic tool_choice onto OpenAI:
///
///   {"type": "auto"}                → "auto"
///   {"type": "any"}                 → "required"
///   {"type": "tool", "name": "f"}   → {"type":"function","function":{"name":"f"}}
///   anything else                   → "auto"
fn convert_tool_choice(tc: &Value) -> Value {
    match tc["type"].as_str() {
        Some("any") => json!("required"),
        Some("tool") => match tc["name"].as_str() {
            Some(name) if !name.is_empty() => json!({
                "type": "function",
                "function": {"name": name},
            }),
            _ => json!("auto"),
        },
        _ => json!("auto"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::{AnthropicMessage, AnthropicTool};

    fn request(messages: Vec<AnthropicMessage>) -> MessagesRequest {
        MessagesRequest {
            model: "claude-x".to_string(),
            max_tokens: 16,
            messages,
            system: None,
            stop_sequences: Vec::new(),
            stream: false,
            temperature: None,
            top_p: None,
            top_k: None,
            tools: Vec::new(),
            tool_choice: None,
        }
    }

    fn user(content: Value) -> AnthropicMessage {
        AnthropicMessage {
            role: "user".to_string(),
            content,
        }
    }

    #[test]
    fn test_simple_chat() {
        let req = request(vec![user(json!("Hi"))]);
        let out = convert_request(&req, "m").unwrap();

        assert_eq!(out.model, "m");
        assert_eq!(out.max_tokens, Some(16));
        assert!(!out.stream);
        assert!(out.stream_options.is_none());
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].content, json!("Hi"));
    }

    #[test]
    fn test_system_string_and_blocks() {
        let mut req = request(vec![user(json!("Hi"))]);
        req.system = Some(json!("be brief"));
        let out = convert_request(&req, "").unwrap();
        assert_eq!(out.messages[0].role, "system");
        assert_eq!(out.messages[0].content, json!("be brief"));

        req.system = Some(json!([
            {"type": "text", "text": "one"},
            {"type": "text", "text": "two"},
        ]));
        let out = convert_request(&req, "").unwrap();
        assert_eq!(out.messages[0].content, json!("one\n\ntwo"));
    }

    #[test]
    fn test_streaming_sets_stream_options() {
        let mut req = request(vec![user(json!("Hi"))]);
        req.stream = true;
        let out = convert_request(&req, "").unwrap();
        assert!(out.stream);
        assert!(out.stream_options.unwrap().include_usage);
    }

    #[test]
    fn test_tool_results_flatten_to_text() {
        let req = request(vec![user(json!([
            {"type": "text", "text": "Here you go:"},
            {"type": "tool_result", "tool_use_id": "tc1", "content": "42"},
        ]))]);
        let out = convert_request(&req, "").unwrap();

        assert_eq!(out.messages.len(), 1);
        let text = out.messages[0].content.as_str().unwrap();
        assert!(text.contains("Here you go:"));
        assert!(text.contains("Tool result for tc1:\n42"));
    }

    #[test]
    fn test_tool_result_block_content() {
        let req = request(vec![user(json!([
            {"type": "tool_result", "tool_use_id": "tc1",
             "content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]},
        ]))]);
        let out = convert_request(&req, "").unwrap();
        let text = out.messages[0].content.as_str().unwrap();
        assert!(text.contains("a\nb"));
    }

    #[test]
    fn test_single_text_block_collapses_to_string() {
        let req = request(vec![user(json!([{"type": "text", "text": "only"}]))]);
        let out = convert_request(&req, "").unwrap();
        assert_eq!(out.messages[0].content, json!("only"));
    }

    #[test]
    fn test_image_blocks_become_parts() {
        let req = request(vec![user(json!([
            {"type": "text", "text": "look"},
            {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAA"}},
            {"type": "image", "source": {"type": "url", "url": "https://x/y.png"}},
        ]))]);
        let out = convert_request(&req, "").unwrap();

        let parts = out.messages[0].content.as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(
            parts[1]["image_url"]["url"],
            json!("data:image/png;base64,AAA")
        );
        assert_eq!(parts[2]["image_url"]["url"], json!("https://x/y.png"));
    }

    #[test]
    fn test_assistant_tool_use() {
        let req = request(vec![AnthropicMessage {
            role: "assistant".to_string(),
            content: json!([
                {"type": "text", "text": "calling"},
                {"type": "tool_use", "id": "tc1", "name": "sum", "input": {"a": 1}},
            ]),
        }]);
        let out = convert_request(&req, "").unwrap();

        let msg = &out.messages[0];
        assert_eq!(msg.role, "assistant");
        assert_eq!(msg.content, json!("calling"));
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].id, "tc1");
        assert_eq!(msg.tool_calls[0].function.name, "sum");
        let args: Value = serde_json::from_str(&msg.tool_calls[0].function.arguments).unwrap();
        assert_eq!(args, json!({"a": 1}));
    }

    #[test]
    fn test_tools_and_tool_choice() {
        let mut req = request(vec![user(json!("Hi"))]);
        req.tools = vec![AnthropicTool {
            name: "sum".to_string(),
            description: "adds".to_string(),
            input_schema: json!({"type": "object"}),
        }];

        req.tool_choice = Some(json!({"type": "auto"}));
        let out = convert_request(&req, "").unwrap();
        assert_eq!(out.tools[0].function.name, "sum");
        assert_eq!(out.tool_choice, Some(json!("auto")));

        req.tool_choice = Some(json!({"type": "any"}));
        let out = convert_request(&req, "").unwrap();
        assert_eq!(out.tool_choice, Some(json!("required")));

        req.tool_choice = Some(json!({"type": "tool", "name": "sum"}));
        let out = convert_request(&req, "").unwrap();
        assert_eq!(
            out.tool_choice,
            Some(json!({"type": "function", "function": {"name": "sum"}}))
        );

        req.tool_choice = Some(json!({"type": "mystery"}));
        let out = convert_request(&req, "").unwrap();
        assert_eq!(out.tool_choice, Some(json!("auto")));
    }
}
