//! Voicegate - real-time full-duplex voice assistant gateway.
//!
//! Clients open a WebSocket, stream microphone audio in, and receive
//! synthesized speech interleaved with structured events (transcription,
//! assistant text, tool calls, state transitions). The gateway orchestrates
//! three upstreams - STT, a streaming chat LLM, and TTS - into one
//! low-latency conversational loop with barge-in, smart end-of-turn
//! detection, and phrase-level streaming synthesis.

pub mod audio;
pub mod config;
pub mod server;
pub mod upstream;
pub mod voice;

/// Truncate a string on a char boundary, appending an ellipsis marker.
pub fn truncate_safe(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}...")
}

/// Render user content for logs without leaking it: length plus a short
/// prefix.
pub fn sanitize_for_log(text: &str, max_chars: usize) -> String {
    if text.is_empty() {
        return "[empty]".to_string();
    }
    let char_count = text.chars().count();
    if char_count > max_chars {
        let prefix: String = text.chars().take(max_chars).collect();
        format!("[{char_count} chars: {prefix}...]")
    } else {
        format!("[{char_count} chars]")
    }
}
