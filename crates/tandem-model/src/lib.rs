//! Streaming model transport over an OpenAI-compatible chat endpoint.
//!
//! Maps SSE deltas to typed stream events: `content` to text,
//! `reasoning_content` to reasoning, and `tool_calls` fragments to tool-use
//! deltas whose raw argument text downstream code buffers until the block
//! completes. The transport performs no retry of its own; retry policy is
//! owned by the task loop.

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::io::BufRead;
use tandem_core::{
    ApiBlock, ModelRequest, ModelSettings, ModelTransport, Role, StreamEvent,
    StreamEventCallback, StreamUsage, ToolUseName,
};

pub struct HttpModelClient {
    cfg: ModelSettings,
    client: reqwest::blocking::Client,
}

impl HttpModelClient {
    pub fn new(cfg: ModelSettings) -> Result<Self> {
        Ok(Self {
            cfg,
            client: reqwest::blocking::Client::builder().build()?,
        })
    }

    fn api_key(&self) -> Result<String> {
        std::env::var(&self.cfg.api_key_env)
            .map_err(|_| anyhow!("api key not set: export {}", self.cfg.api_key_env))
    }
}

impl ModelTransport for HttpModelClient {
    fn stream(&self, request: &ModelRequest, cb: StreamEventCallback) -> Result<StreamUsage> {
        let payload = build_payload(&self.cfg.model, request);
        let response = self
            .client
            .post(&self.cfg.endpoint)
            .bearer_auth(self.api_key()?)
            .json(&payload)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(anyhow!("model request failed ({status}): {body}"));
        }

        consume_sse(std::io::BufReader::new(response), cb)
    }
}

/// Build the chat-completions payload: system prompt first, then the
/// role-tagged history, the closed tool set, and streaming options.
pub fn build_payload(model: &str, request: &ModelRequest) -> Value {
    let mut messages = vec![json!({"role": "system", "content": request.system_prompt})];
    for message in &request.messages {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        messages.push(json!({"role": role, "content": render_blocks(&message.content)}));
    }
    json!({
        "model": model,
        "messages": messages,
        "tools": tool_definitions(),
        "max_tokens": request.max_tokens,
        "stream": true,
        "stream_options": {"include_usage": true},
    })
}

fn render_blocks(blocks: &[ApiBlock]) -> Value {
    // Text-only content collapses to a plain string; mixed content uses the
    // structured parts form.
    let all_text = blocks.iter().all(|b| matches!(b, ApiBlock::Text { .. }));
    if all_text {
        let text: Vec<&str> = blocks
            .iter()
            .map(|b| match b {
                ApiBlock::Text { text } => text.as_str(),
                ApiBlock::Image { .. } => unreachable!(),
            })
            .collect();
        return Value::String(text.join("\n\n"));
    }
    Value::Array(
        blocks
            .iter()
            .map(|block| match block {
                ApiBlock::Text { text } => json!({"type": "text", "text": text}),
                ApiBlock::Image { media_type, data } => json!({
                    "type": "image_url",
                    "image_url": {"url": format!("data:{media_type};base64,{data}")},
                }),
            })
            .collect(),
    )
}

/// Function-calling definitions for the closed tool set.
pub fn tool_definitions() -> Vec<Value> {
    ToolUseName::ALL
        .iter()
        .map(|name| {
            let mut properties = serde_json::Map::new();
            for param in name.required_params() {
                properties.insert((*param).to_string(), json!({"type": "string"}));
            }
            if *name == ToolUseName::ExecuteCommand {
                properties.insert(
                    "requires_approval".to_string(),
                    json!({"type": "boolean"}),
                );
            }
            json!({
                "type": "function",
                "function": {
                    "name": name.as_api_name(),
                    "description": format!("The {} tool.", name.as_api_name()),
                    "parameters": {
                        "type": "object",
                        "properties": properties,
                        "required": name.required_params(),
                    },
                },
            })
        })
        .collect()
}

/// Consume an SSE body, emitting typed events. Exposed at crate level so
/// the parse path is testable without a live endpoint.
pub fn consume_sse<R: BufRead>(reader: R, cb: StreamEventCallback) -> Result<StreamUsage> {
    let mut usage = StreamUsage::default();
    // Fragments of tool calls arrive indexed; the name arrives on the first
    // fragment of each call and is carried for the rest.
    let mut tool_names: BTreeMap<u64, String> = BTreeMap::new();

    for line in reader.lines() {
        let line = line.map_err(|e| anyhow!("stream read error: {e}"))?;
        let trimmed = line.trim();
        if !trimmed.starts_with("data:") {
            continue;
        }
        let chunk = trimmed.trim_start_matches("data:").trim();
        if chunk == "[DONE]" {
            break;
        }
        let value: Value = match serde_json::from_str(chunk) {
            Ok(v) => v,
            Err(_) => continue,
        };

        if let Some(u) = value.get("usage")
            && !u.is_null()
        {
            usage.tokens_in = u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
            usage.tokens_out = u
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            usage.cache_reads = u
                .get("prompt_cache_hit_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            usage.cache_writes = u
                .get("prompt_cache_miss_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
        }

        let Some(delta) = value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("delta"))
        else {
            continue;
        };

        if let Some(content) = delta.get("content").and_then(Value::as_str)
            && !content.is_empty()
        {
            cb(StreamEvent::Text(content.to_string()));
        }
        if let Some(reasoning) = delta.get("reasoning_content").and_then(Value::as_str)
            && !reasoning.is_empty()
        {
            cb(StreamEvent::Reasoning(reasoning.to_string()));
        }
        if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for fragment in tool_calls {
                let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(name) = fragment
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(Value::as_str)
                {
                    tool_names.insert(index, name.to_string());
                }
                let Some(name) = tool_names.get(&index) else {
                    continue;
                };
                let args = fragment
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                cb(StreamEvent::ToolUse {
                    name: name.clone(),
                    args_fragment: args.to_string(),
                });
            }
        }
    }

    Ok(usage)
}
