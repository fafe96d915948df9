//! OpenAI SSE → Anthropic SSE stream adaptation.
//!
//! A small state machine: the upstream stream is consumed line by line,
//! and each decoded chunk advances the Anthropic event sequence
//! (`message_start` → `content_block_start` → deltas → stops →
//! `message_delta` → `message_stop` → `data: [DONE]`). Every event is sent
//! downstream as soon as it is produced. The whole adapter state is the
//! struct fields; there is no hidden control flow.

use super::{map_finish_reason, new_message_id, new_tool_id, ChatChunk, ToolCall};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

pub struct StreamAdapter {
    request_model: String,

    message_id: String,
    text_block_open: bool,
    text_block_done: bool,
    /// OpenAI-side index of the tool call currently being streamed.
    current_tool_index: Option<i64>,
    /// Highest Anthropic-side block index allocated so far.
    last_block_index: usize,
    input_tokens: u64,
    output_tokens: u64,
    finished: bool,
}

impl StreamAdapter {
    pub fn new(request_model: &str) -> Self {
        Self {
            request_model: request_model.to_string(),
            message_id: new_message_id(),
            text_block_open: false,
            text_block_done: false,
            current_tool_index: None,
            last_block_index: 0,
            input_tokens: 0,
            output_tokens: 0,
            finished: false,
        }
    }

    /// Consume the upstream OpenAI SSE body, sending Anthropic SSE events
    /// through `tx`. A closed receiver (client gone) stops the adapter; an
    /// upstream error or EOF without a finish_reason closes the stream
    /// cleanly with a synthesized `stop`.
    pub async fn transform<B>(mut self, mut upstream: B, tx: mpsc::Sender<Bytes>)
    where
        B: http_body::Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Display,
    {
        self.emit(
            &tx,
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.request_model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {
                        "input_tokens": 0,
                        "output_tokens": 0,
                        "cache_creation_input_tokens": 0,
                        "cache_read_input_tokens": 0,
                    },
                },
            }),
        )
        .await;
        self.emit(
            &tx,
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": {"type": "text", "text": ""},
            }),
        )
        .await;
        self.text_block_open = true;
        self.emit(&tx, "ping", json!({"type": "ping"})).await;

        // Upstream lines can carry very large tool arguments; the buffer
        // grows as needed.
        let mut buf: Vec<u8> = Vec::with_capacity(64 * 1024);
        'read: loop {
            // Client gone: stop pulling from the backend.
            if tx.is_closed() {
                return;
            }
            let frame = match upstream.frame().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!(error = %e, "Upstream stream error, finalizing");
                    break 'read;
                }
                None => break 'read,
            };
            let Some(data) = frame.data_ref() else {
                continue;
            };
            buf.extend_from_slice(data);

            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim_end_matches(['\n', '\r']);

                let Some(payload) = line.strip_prefix("data: ") else {
                    continue;
                };
                if payload == "[DONE]" {
                    break 'read;
                }
                let chunk: ChatChunk = match serde_json::from_str(payload) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!(error = %e, "Skipping malformed upstream chunk");
                        continue;
                    }
                };
                self.process_chunk(chunk, &tx).await;
                if self.finished {
                    break 'read;
                }
            }
        }

        // EOF without a finish_reason: close everything as a normal stop.
        if !self.finished {
            self.handle_finish("stop", &tx).await;
        }
    }

    async fn process_chunk(&mut self, chunk: ChatChunk, tx: &mpsc::Sender<Bytes>) {
        // Usage usually arrives in the final chunk.
        if let Some(usage) = &chunk.usage {
            self.input_tokens = usage.prompt_tokens;
            self.output_tokens = usage.completion_tokens;
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        if let Some(content) = &choice.delta.content {
            if !content.is_empty() && self.text_block_open && !self.text_block_done {
                self.emit(
                    tx,
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": 0,
                        "delta": {"type": "text_delta", "text": content},
                    }),
                )
                .await;
            }
        }

        if !choice.delta.tool_calls.is_empty() {
            self.process_tool_calls(choice.delta.tool_calls, tx).await;
        }

        if let Some(reason) = &choice.finish_reason {
            let reason = reason.clone();
            self.handle_finish(&reason, tx).await;
        }
    }

    /// Each distinct OpenAI tool index opens a new Anthropic tool_use
    /// block; argument fragments stream as input_json_delta on the current
    /// block.
    async fn process_tool_calls(&mut self, tool_calls: Vec<ToolCall>, tx: &mpsc::Sender<Bytes>) {
        if self.current_tool_index.is_none() && !self.text_block_done {
            self.emit(
                tx,
                "content_block_stop",
                json!({"type": "content_block_stop", "index": 0}),
            )
            .await;
            self.text_block_done = true;
        }

        for tc in tool_calls {
            let idx = tc.index.unwrap_or(0);
            if self.current_tool_index != Some(idx) {
                self.current_tool_index = Some(idx);
                self.last_block_index += 1;

                let tool_id = if tc.id.is_empty() {
                    new_tool_id()
                } else {
                    tc.id.clone()
                };
                self.emit(
                    tx,
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": self.last_block_index,
                        "content_block": {
                            "type": "tool_use",
                            "id": tool_id,
                            "name": tc.function.name,
                            "input": {},
                        },
                    }),
                )
                .await;
            }

            if !tc.function.arguments.is_empty() {
                self.emit(
                    tx,
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": self.last_block_index,
                        "delta": {
                            "type": "input_json_delta",
                            "partial_json": tc.function.arguments,
                        },
                    }),
                )
                .await;
            }
        }
    }

    async fn handle_finish(&mut self, reason: &str, tx: &mpsc::Sender<Bytes>) {
        if self.finished {
            return;
        }
        self.finished = true;

        for index in 1..=self.last_block_index {
            self.emit(
                tx,
                "content_block_stop",
                json!({"type": "content_block_stop", "index": index}),
            )
            .await;
        }
        if !self.text_block_done {
            self.emit(
                tx,
                "content_block_stop",
                json!({"type": "content_block_stop", "index": 0}),
            )
            .await;
            self.text_block_done = true;
        }

        self.emit(
            tx,
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {
                    "stop_reason": map_finish_reason(reason),
                    "stop_sequence": null,
                },
                "usage": {"output_tokens": self.output_tokens},
            }),
        )
        .await;
        self.emit(tx, "message_stop", json!({"type": "message_stop"}))
            .await;
        let _ = tx.send(Bytes::from_static(b"data: [DONE]\n\n")).await;
        debug!(
            input_tokens = self.input_tokens,
            output_tokens = self.output_tokens,
            "Stream closed"
        );
    }

    async fn emit(&self, tx: &mpsc::Sender<Bytes>, event: &str, data: serde_json::Value) {
        let payload = format!("event: {}\ndata: {}\n\n", event, data);
        let _ = tx.send(Bytes::from(payload)).await;
    }
}
