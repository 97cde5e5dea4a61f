//! WebSocket frame types for the client-facing voice protocol.

use serde::{Deserialize, Serialize};

use crate::voice::session::{SessionConfigUpdate, VoiceState};

/// JSON text frames from the client. Binary frames carry audio and are
/// handled separately.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Barge-in: stop the current response.
    #[serde(rename = "interrupt")]
    Interrupt,
    /// Force processing of the buffered audio now.
    #[serde(rename = "end")]
    End,
    /// Update session settings mid-connection.
    #[serde(rename = "config")]
    Config(SessionConfigUpdate),
}

/// JSON text frames to the client. Binary frames carry 24 kHz s16le TTS
/// audio.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session_info")]
    SessionInfo { session_id: String },
    #[serde(rename = "status")]
    Status { state: VoiceState },
    #[serde(rename = "transcription")]
    Transcription { text: String, is_final: bool },
    #[serde(rename = "llm_text")]
    LlmText { text: String, is_final: bool },
    #[serde(rename = "tool_call")]
    ToolCall {
        tool_call_id: String,
        function_name: String,
        arguments: String,
    },
    #[serde(rename = "tts_start")]
    TtsStart { phrase_index: u32 },
    #[serde(rename = "tts_done")]
    TtsDone { phrase_index: u32, duration: f64 },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "closed")]
    Closed,
}

/// Message queued to the single outbound writer task.
#[derive(Debug)]
pub enum Outbound {
    Json(ServerMessage),
    Binary(Vec<u8>),
    /// Close the connection after draining; the writer task stops here.
    Close { code: u16, reason: String },
}
