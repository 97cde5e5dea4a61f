//! Streaming chat-completion client.
//!
//! Talks to any OpenAI-compatible endpoint over SSE. Content deltas and
//! tool calls are delivered as a single event stream; tool-call fragments
//! are accumulated per index and emitted complete, either when the stream
//! reports `finish_reason == "tool_calls"` or at end of stream.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::{http_client, UpstreamError};
use crate::upstream::registry::LlmModelConfig;

/// Largest native-audio payload accepted, pre-WAV-framing (roughly five
/// minutes of 16 kHz mono).
pub const MAX_NATIVE_AUDIO_SIZE: usize = 10 * 1024 * 1024;

/// A chat message in OpenAI wire format. Content is kept as a raw JSON
/// value because multimodal messages carry an array of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Value,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Value::String(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Value::String(content.into()),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Value::String(content.into()),
        }
    }
}

/// A completed tool call extracted from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallEvent {
    pub id: String,
    pub name: String,
    /// JSON string of arguments, as accumulated from the deltas.
    pub arguments: String,
}

/// One output item from the LLM stream.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmEvent {
    /// A text token.
    Content(String),
    /// A complete tool call.
    ToolCall(ToolCallEvent),
    /// Terminal failure; the stream ends after this.
    Error(String),
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental SSE payload parser. Pure state over `data:` line payloads so
/// the wire handling is testable without a server.
#[derive(Debug, Default)]
pub struct SseParser {
    pending: BTreeMap<u64, PendingToolCall>,
    done: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a `[DONE]` sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Handle the payload of one `data:` line, returning any events it
    /// completes. Malformed JSON is logged and skipped.
    pub fn handle_data(&mut self, data: &str) -> Vec<LlmEvent> {
        if data == "[DONE]" {
            self.done = true;
            return Vec::new();
        }

        let chunk: Value = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(
                    "skipping malformed SSE chunk {}: {e}",
                    crate::truncate_safe(data, 100)
                );
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        let choice = chunk
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first());
        let Some(choice) = choice else {
            return events;
        };

        let delta = choice.get("delta");

        if let Some(content) = delta
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
        {
            if !content.is_empty() {
                events.push(LlmEvent::Content(content.to_string()));
            }
        }

        // Tool calls arrive spread across chunks, keyed by index.
        if let Some(tool_calls) = delta
            .and_then(|d| d.get("tool_calls"))
            .and_then(|tc| tc.as_array())
        {
            for tc in tool_calls {
                let idx = tc.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                let entry = self.pending.entry(idx).or_default();

                if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                    if !id.is_empty() {
                        entry.id = id.to_string();
                    }
                }
                if let Some(function) = tc.get("function") {
                    if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                        if !name.is_empty() {
                            entry.name = name.to_string();
                        }
                    }
                    if let Some(args) = function.get("arguments").and_then(|v| v.as_str()) {
                        entry.arguments.push_str(args);
                    }
                }
            }
        }

        if choice.get("finish_reason").and_then(|f| f.as_str()) == Some("tool_calls") {
            events.extend(self.drain_pending());
        }

        events
    }

    /// Flush tool calls that never saw a `finish_reason`. Call at end of
    /// stream.
    pub fn finish(&mut self) -> Vec<LlmEvent> {
        self.drain_pending()
    }

    fn drain_pending(&mut self) -> Vec<LlmEvent> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_values()
            .filter(|tc| !tc.id.is_empty() && !tc.name.is_empty())
            .map(|tc| {
                info!(name = %tc.name, "tool call completed");
                LlmEvent::ToolCall(ToolCallEvent {
                    id: tc.id,
                    name: tc.name,
                    arguments: tc.arguments,
                })
            })
            .collect()
    }
}

/// Append `/no_think` to the last user message unless a thinking-control
/// token is already present. Models in the Qwen3 family honor this to skip
/// chain-of-thought, which voice latency depends on.
pub fn inject_no_think(messages: &mut [ChatMessage]) {
    for message in messages.iter_mut().rev() {
        if message.role != "user" {
            continue;
        }
        match &mut message.content {
            Value::String(text) => {
                if !text.contains("/think") && !text.contains("/no_think") {
                    text.push_str(" /no_think");
                }
            }
            Value::Array(parts) => {
                let has_control = parts.iter().any(|part| {
                    part.get("type").and_then(|t| t.as_str()) == Some("text")
                        && part
                            .get("text")
                            .and_then(|t| t.as_str())
                            .map(|t| t.contains("/think") || t.contains("/no_think"))
                            .unwrap_or(false)
                });
                if !has_control {
                    parts.push(json!({ "type": "text", "text": "/no_think" }));
                }
            }
            _ => {}
        }
        break;
    }
}

/// Build the multimodal user message for a native-audio turn. The model is
/// asked to echo what it heard inside `<input>` tags, which the pipeline
/// strips and logs for diagnostics.
pub fn native_audio_message(wav_base64: &str) -> ChatMessage {
    ChatMessage {
        role: "user".to_string(),
        content: json!([
            {
                "type": "input_audio",
                "input_audio": { "data": wav_base64, "format": "wav" },
            },
            {
                "type": "text",
                "text": "Respond to my audio message. At the very end of your response, \
                         add <input>what you heard me say</input> (this will be stripped \
                         for logging).",
            },
        ]),
    }
}

/// Encode WAV bytes for a native-audio payload, enforcing the size cap.
pub fn encode_native_audio(wav: &[u8]) -> Result<String, UpstreamError> {
    if wav.len() > MAX_NATIVE_AUDIO_SIZE {
        return Err(UpstreamError::AudioTooLarge {
            size: wav.len(),
            limit: MAX_NATIVE_AUDIO_SIZE,
        });
    }
    Ok(BASE64.encode(wav))
}

/// Streaming LLM client bound to one resolved model configuration.
#[derive(Debug, Clone)]
pub struct LlmClient {
    base_url: String,
    model: String,
    api_parameters: Option<serde_json::Map<String, Value>>,
}

impl LlmClient {
    /// `default_base_url` is used when the model config does not pin one.
    pub fn new(config: &LlmModelConfig, default_base_url: &str) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url.to_string());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_parameters: config.api_parameters.clone(),
        }
    }

    /// Start a streaming completion. Events arrive on the returned channel;
    /// the stream ends after an `Error` event or when the channel closes.
    pub fn stream_chat(&self, messages: Vec<ChatMessage>) -> mpsc::Receiver<LlmEvent> {
        let (tx, rx) = mpsc::channel(64);

        let url = format!("{}/chat/completions", self.base_url);
        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            // Voice tuning: modest temperature, bounded length
            "temperature": 0.7,
            "max_tokens": 500,
        });
        if let Some(overrides) = &self.api_parameters {
            if let Some(object) = payload.as_object_mut() {
                for (key, value) in overrides {
                    object.insert(key.clone(), value.clone());
                }
            }
        }

        tokio::spawn(async move {
            run_stream(url, payload, tx).await;
        });

        rx
    }
}

async fn run_stream(url: String, payload: Value, tx: mpsc::Sender<LlmEvent>) {
    let response = match http_client().post(&url).json(&payload).send().await {
        Ok(response) => response,
        Err(e) => {
            error!("LLM request failed: {e}");
            let _ = tx.send(LlmEvent::Error("request failed".to_string())).await;
            return;
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        error!("LLM returned status {status}");
        let _ = tx
            .send(LlmEvent::Error(format!("upstream status {status}")))
            .await;
        return;
    }

    let mut parser = SseParser::new();
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut token_count = 0usize;

    'read: while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                error!("LLM stream read error: {e}");
                let _ = tx.send(LlmEvent::Error("stream read error".to_string())).await;
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        // SSE events are separated by blank lines.
        while let Some(pos) = buffer.find("\n\n") {
            let event: String = buffer.drain(..pos + 2).collect();
            for line in event.lines() {
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                for item in parser.handle_data(data) {
                    if matches!(item, LlmEvent::Content(_)) {
                        token_count += 1;
                    }
                    if tx.send(item).await.is_err() {
                        // Consumer gone (interrupt); stop reading.
                        debug!("LLM event consumer dropped");
                        return;
                    }
                }
            }
            if parser.is_done() {
                break 'read;
            }
        }
    }

    for item in parser.finish() {
        if tx.send(item).await.is_err() {
            return;
        }
    }

    debug!(token_count, "LLM stream complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_delta() {
        let mut parser = SseParser::new();
        let events =
            parser.handle_data(r#"{"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#);
        assert_eq!(events, vec![LlmEvent::Content("Hello".to_string())]);
    }

    #[test]
    fn test_done_sentinel() {
        let mut parser = SseParser::new();
        assert!(parser.handle_data("[DONE]").is_empty());
        assert!(parser.is_done());
    }

    #[test]
    fn test_malformed_chunk_skipped() {
        let mut parser = SseParser::new();
        assert!(parser.handle_data("{not json").is_empty());
        // Parser still works afterwards
        let events =
            parser.handle_data(r#"{"choices":[{"delta":{"content":"ok"},"finish_reason":null}]}"#);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_tool_call_accumulated_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser
            .handle_data(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"lookup","arguments":"{\"q\":"}}]},"finish_reason":null}]}"#
            )
            .is_empty());
        assert!(parser
            .handle_data(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"x\"}"}}]},"finish_reason":null}]}"#
            )
            .is_empty());

        let events = parser
            .handle_data(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);
        assert_eq!(events.len(), 1);
        match &events[0] {
            LlmEvent::ToolCall(tc) => {
                assert_eq!(tc.id, "call_1");
                assert_eq!(tc.name, "lookup");
                assert_eq!(tc.arguments, r#"{"q":"x"}"#);
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn test_pending_tool_call_flushed_at_end() {
        let mut parser = SseParser::new();
        parser.handle_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_9","function":{"name":"ping","arguments":"{}"}}]},"finish_reason":null}]}"#,
        );
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], LlmEvent::ToolCall(tc) if tc.name == "ping"));
    }

    #[test]
    fn test_tool_call_without_id_dropped() {
        let mut parser = SseParser::new();
        parser.handle_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"x","arguments":""}}]},"finish_reason":null}]}"#,
        );
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn test_multiple_tool_calls_ordered_by_index() {
        let mut parser = SseParser::new();
        parser.handle_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"b","function":{"name":"second","arguments":""}},{"index":0,"id":"a","function":{"name":"first","arguments":""}}]},"finish_reason":null}]}"#,
        );
        let events = parser.finish();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], LlmEvent::ToolCall(tc) if tc.name == "first"));
        assert!(matches!(&events[1], LlmEvent::ToolCall(tc) if tc.name == "second"));
    }

    #[test]
    fn test_inject_no_think_string_content() {
        let mut messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hello there"),
        ];
        inject_no_think(&mut messages);
        assert_eq!(messages[1].content, json!("hello there /no_think"));
        // System message untouched
        assert_eq!(messages[0].content, json!("be brief"));
    }

    #[test]
    fn test_inject_no_think_idempotent() {
        let mut messages = vec![ChatMessage::user("hi /no_think")];
        inject_no_think(&mut messages);
        assert_eq!(messages[0].content, json!("hi /no_think"));
    }

    #[test]
    fn test_inject_no_think_multimodal() {
        let mut messages = vec![native_audio_message("AAAA")];
        inject_no_think(&mut messages);
        let parts = messages[0].content.as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2]["text"], "/no_think");
    }

    #[test]
    fn test_native_audio_size_cap() {
        let too_big = vec![0u8; MAX_NATIVE_AUDIO_SIZE + 1];
        assert!(matches!(
            encode_native_audio(&too_big),
            Err(UpstreamError::AudioTooLarge { .. })
        ));
        assert!(encode_native_audio(&[0u8; 16]).is_ok());
    }

    #[test]
    fn test_native_audio_message_shape() {
        let message = native_audio_message("QUJD");
        assert_eq!(message.role, "user");
        let parts = message.content.as_array().unwrap();
        assert_eq!(parts[0]["type"], "input_audio");
        assert_eq!(parts[0]["input_audio"]["format"], "wav");
        assert_eq!(parts[0]["input_audio"]["data"], "QUJD");
        assert_eq!(parts[1]["type"], "text");
    }
}
