//! Clients for the external services the gateway orchestrates: STT and TTS
//! on the inference runtime, and any OpenAI-compatible chat-completion
//! endpoint for the LLM.

pub mod llm;
pub mod registry;
pub mod stt;
pub mod tts;

use std::time::Duration;

use once_cell::sync::Lazy;
use thiserror::Error;

/// Failures talking to an upstream service. Messages shown to clients are
/// sanitized elsewhere; these carry enough detail for server logs.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} returned status {status}")]
    Status { service: &'static str, status: u16 },

    #[error("TTS connection failed: {0}")]
    TtsConnect(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("audio payload of {size} bytes exceeds the {limit} byte limit")]
    AudioTooLarge { size: usize, limit: usize },

    #[error("malformed upstream response: {0}")]
    InvalidResponse(String),
}

// One keep-alive pool for every LLM/STT/registry request in the process.
// Connect fast, read patiently: SSE responses stay open for the whole
// generation.
static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .read_timeout(Duration::from_secs(300))
        .pool_idle_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(10)
        .build()
        .expect("failed to build shared HTTP client")
});

/// The process-wide pooled HTTP client.
pub fn http_client() -> &'static reqwest::Client {
    &HTTP_CLIENT
}
