//! Chat-completion wire formats
//!
//! Adapters know where user-visible text lives in each provider's request
//! and response bodies, and nothing else. Extraction walks the body in a
//! fixed order; rebuilding walks the same order and swaps the text slots
//! in, leaving every other field byte-for-byte untouched.

use anyhow::{bail, Result};
use serde_json::{json, Value};
use std::str::FromStr;

/// Joins extracted segments for one detection pass. Record separator
/// characters never occur in chat text.
pub const TEXT_DELIMITER: &str = "\u{1e}\u{1e}\u{1e}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    OpenAiChat,
    AnthropicMessages,
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "openai" | "openai-chat" => Ok(Protocol::OpenAiChat),
            "anthropic" | "anthropic-messages" => Ok(Protocol::AnthropicMessages),
            other => bail!("unknown protocol '{}'", other),
        }
    }
}

pub fn adapter_for(protocol: Protocol) -> Box<dyn ProtocolAdapter> {
    match protocol {
        Protocol::OpenAiChat => Box::new(OpenAiChatAdapter),
        Protocol::AnthropicMessages => Box::new(AnthropicMessagesAdapter),
    }
}

pub trait ProtocolAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pull every user-visible text slot out of a request body, in a fixed
    /// walk order.
    fn extract_request_text(&self, body: &Value) -> Result<Vec<String>>;

    /// Write replacement texts back into the slots `extract_request_text`
    /// found, in the same order.
    fn rebuild_request(&self, body: &Value, texts: &[String]) -> Result<Value>;

    fn extract_response_text(&self, body: &Value) -> Result<Vec<String>>;

    fn rebuild_response(&self, body: &Value, texts: &[String]) -> Result<Value>;

    /// Text delta carried by one SSE line, if it is a delta line.
    fn parse_delta(&self, line: &str) -> Option<String>;

    /// Re-emit an SSE delta line with its text replaced.
    fn rewrite_delta(&self, line: &str, new_text: &str) -> Result<String>;

    fn is_stream_end(&self, line: &str) -> bool;

    /// Frames after which no further delta can continue the current text,
    /// so any held-back characters must be released first.
    fn is_flush_point(&self, _line: &str) -> bool {
        false
    }

    /// Body and status for a refused request.
    fn block_response(&self, reason: &str) -> (u16, Value);
}

fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))
}

// --- OpenAI-style chat completions ---

pub struct OpenAiChatAdapter;

impl OpenAiChatAdapter {
    /// Visit each text slot in `messages`: string contents and text parts
    /// of array contents.
    fn walk_messages<F>(body: &Value, mut visit: F) -> Result<()>
    where
        F: FnMut(&Value),
    {
        let Some(messages) = body.get("messages").and_then(Value::as_array) else {
            bail!("request has no messages array");
        };
        for message in messages {
            match message.get("content") {
                Some(Value::String(s)) => visit(&Value::String(s.clone())),
                Some(Value::Array(parts)) => {
                    for part in parts {
                        if part.get("type").and_then(Value::as_str) == Some("text") {
                            if let Some(text) = part.get("text") {
                                visit(text);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn rewrite_messages(body: &Value, texts: &[String]) -> Result<Value> {
        let mut rebuilt = body.clone();
        let mut cursor = 0;

        let Some(messages) = rebuilt.get_mut("messages").and_then(Value::as_array_mut) else {
            bail!("request has no messages array");
        };
        for message in messages {
            let Some(content) = message.get_mut("content") else {
                continue;
            };
            match content {
                Value::String(_) => {
                    let Some(text) = texts.get(cursor) else {
                        bail!("segment count mismatch during rebuild");
                    };
                    *content = Value::String(text.clone());
                    cursor += 1;
                }
                Value::Array(parts) => {
                    for part in parts {
                        if part.get("type").and_then(Value::as_str) == Some("text")
                            && part.get("text").is_some()
                        {
                            let Some(text) = texts.get(cursor) else {
                                bail!("segment count mismatch during rebuild");
                            };
                            part["text"] = Value::String(text.clone());
                            cursor += 1;
                        }
                    }
                }
                _ => {}
            }
        }

        if cursor != texts.len() {
            bail!("segment count mismatch during rebuild");
        }
        Ok(rebuilt)
    }
}

impl ProtocolAdapter for OpenAiChatAdapter {
    fn name(&self) -> &'static str {
        "openai-chat"
    }

    fn extract_request_text(&self, body: &Value) -> Result<Vec<String>> {
        let mut texts = Vec::new();
        Self::walk_messages(body, |v| {
            if let Some(s) = v.as_str() {
                texts.push(s.to_string());
            }
        })?;
        Ok(texts)
    }

    fn rebuild_request(&self, body: &Value, texts: &[String]) -> Result<Value> {
        Self::rewrite_messages(body, texts)
    }

    fn extract_response_text(&self, body: &Value) -> Result<Vec<String>> {
        let Some(choices) = body.get("choices").and_then(Value::as_array) else {
            bail!("response has no choices array");
        };
        Ok(choices
            .iter()
            .filter_map(|c| c.pointer("/message/content").and_then(Value::as_str))
            .map(String::from)
            .collect())
    }

    fn rebuild_response(&self, body: &Value, texts: &[String]) -> Result<Value> {
        let mut rebuilt = body.clone();
        let mut cursor = 0;

        let Some(choices) = rebuilt.get_mut("choices").and_then(Value::as_array_mut) else {
            bail!("response has no choices array");
        };
        for choice in choices {
            if let Some(content) = choice.pointer_mut("/message/content") {
                if content.is_string() {
                    let Some(text) = texts.get(cursor) else {
                        bail!("segment count mismatch during rebuild");
                    };
                    *content = Value::String(text.clone());
                    cursor += 1;
                }
            }
        }

        if cursor != texts.len() {
            bail!("segment count mismatch during rebuild");
        }
        Ok(rebuilt)
    }

    fn parse_delta(&self, line: &str) -> Option<String> {
        let data = sse_data(line)?;
        if data.trim() == "[DONE]" {
            return None;
        }
        let value: Value = serde_json::from_str(data).ok()?;
        value
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .map(String::from)
    }

    fn rewrite_delta(&self, line: &str, new_text: &str) -> Result<String> {
        let Some(data) = sse_data(line) else {
            bail!("not an SSE data line");
        };
        let mut value: Value = serde_json::from_str(data)?;
        let Some(slot) = value.pointer_mut("/choices/0/delta/content") else {
            bail!("delta line has no content field");
        };
        *slot = Value::String(new_text.to_string());
        Ok(format!("data: {}", serde_json::to_string(&value)?))
    }

    fn is_stream_end(&self, line: &str) -> bool {
        sse_data(line).map(str::trim) == Some("[DONE]")
    }

    fn block_response(&self, reason: &str) -> (u16, Value) {
        (
            403,
            json!({
                "error": {
                    "message": reason,
                    "type": "invalid_request_error",
                    "code": "policy_violation"
                }
            }),
        )
    }
}

// --- Anthropic-style messages ---

pub struct AnthropicMessagesAdapter;

impl ProtocolAdapter for AnthropicMessagesAdapter {
    fn name(&self) -> &'static str {
        "anthropic-messages"
    }

    fn extract_request_text(&self, body: &Value) -> Result<Vec<String>> {
        let mut texts = Vec::new();

        if let Some(system) = body.get("system").and_then(Value::as_str) {
            texts.push(system.to_string());
        }

        let Some(messages) = body.get("messages").and_then(Value::as_array) else {
            bail!("request has no messages array");
        };
        for message in messages {
            match message.get("content") {
                Some(Value::String(s)) => texts.push(s.clone()),
                Some(Value::Array(parts)) => {
                    for part in parts {
                        if part.get("type").and_then(Value::as_str) == Some("text") {
                            if let Some(text) = part.get("text").and_then(Value::as_str) {
                                texts.push(text.to_string());
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(texts)
    }

    fn rebuild_request(&self, body: &Value, texts: &[String]) -> Result<Value> {
        let mut rebuilt = body.clone();
        let mut cursor = 0;

        if rebuilt.get("system").map(Value::is_string) == Some(true) {
            let Some(text) = texts.get(cursor) else {
                bail!("segment count mismatch during rebuild");
            };
            rebuilt["system"] = Value::String(text.clone());
            cursor += 1;
        }

        let Some(messages) = rebuilt.get_mut("messages").and_then(Value::as_array_mut) else {
            bail!("request has no messages array");
        };
        for message in messages {
            let Some(content) = message.get_mut("content") else {
                continue;
            };
            match content {
                Value::String(_) => {
                    let Some(text) = texts.get(cursor) else {
                        bail!("segment count mismatch during rebuild");
                    };
                    *content = Value::String(text.clone());
                    cursor += 1;
                }
                Value::Array(parts) => {
                    for part in parts {
                        if part.get("type").and_then(Value::as_str) == Some("text")
                            && part.get("text").is_some()
                        {
                            let Some(text) = texts.get(cursor) else {
                                bail!("segment count mismatch during rebuild");
                            };
                            part["text"] = Value::String(text.clone());
                            cursor += 1;
                        }
                    }
                }
                _ => {}
            }
        }

        if cursor != texts.len() {
            bail!("segment count mismatch during rebuild");
        }
        Ok(rebuilt)
    }

    fn extract_response_text(&self, body: &Value) -> Result<Vec<String>> {
        let Some(content) = body.get("content").and_then(Value::as_array) else {
            bail!("response has no content array");
        };
        Ok(content
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .map(String::from)
            .collect())
    }

    fn rebuild_response(&self, body: &Value, texts: &[String]) -> Result<Value> {
        let mut rebuilt = body.clone();
        let mut cursor = 0;

        let Some(content) = rebuilt.get_mut("content").and_then(Value::as_array_mut) else {
            bail!("response has no content array");
        };
        for block in content {
            if block.get("type").and_then(Value::as_str) == Some("text")
                && block.get("text").is_some()
            {
                let Some(text) = texts.get(cursor) else {
                    bail!("segment count mismatch during rebuild");
                };
                block["text"] = Value::String(text.clone());
                cursor += 1;
            }
        }

        if cursor != texts.len() {
            bail!("segment count mismatch during rebuild");
        }
        Ok(rebuilt)
    }

    fn parse_delta(&self, line: &str) -> Option<String> {
        let data = sse_data(line)?;
        let value: Value = serde_json::from_str(data).ok()?;
        if value.get("type").and_then(Value::as_str) != Some("content_block_delta") {
            return None;
        }
        value
            .pointer("/delta/text")
            .and_then(Value::as_str)
            .map(String::from)
    }

    fn rewrite_delta(&self, line: &str, new_text: &str) -> Result<String> {
        let Some(data) = sse_data(line) else {
            bail!("not an SSE data line");
        };
        let mut value: Value = serde_json::from_str(data)?;
        let Some(slot) = value.pointer_mut("/delta/text") else {
            bail!("delta line has no text field");
        };
        *slot = Value::String(new_text.to_string());
        Ok(format!("data: {}", serde_json::to_string(&value)?))
    }

    fn is_stream_end(&self, line: &str) -> bool {
        sse_data(line)
            .and_then(|data| serde_json::from_str::<Value>(data).ok())
            .and_then(|v| v.get("type").and_then(Value::as_str).map(String::from))
            .as_deref()
            == Some("message_stop")
    }

    fn is_flush_point(&self, line: &str) -> bool {
        sse_data(line)
            .and_then(|data| serde_json::from_str::<Value>(data).ok())
            .and_then(|v| v.get("type").and_then(Value::as_str).map(String::from))
            .as_deref()
            == Some("content_block_stop")
    }

    fn block_response(&self, reason: &str) -> (u16, Value) {
        (
            403,
            json!({
                "type": "error",
                "error": {
                    "type": "permission_error",
                    "message": reason
                }
            }),
        )
    }
}
