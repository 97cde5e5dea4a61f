//! Speech-to-text client for the inference runtime.
//!
//! Two paths: a one-shot multipart upload, and a streaming variant that
//! yields transcript segments over a WebSocket so the orchestrator can start
//! the LLM before transcription finishes.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};
use url::Url;

use super::{http_client, UpstreamError};

#[derive(Debug, Clone)]
pub struct SttClient {
    runtime_url: String,
    runtime_ws_url: String,
}

impl SttClient {
    pub fn new(runtime_url: impl Into<String>, runtime_ws_url: impl Into<String>) -> Self {
        Self {
            runtime_url: runtime_url.into(),
            runtime_ws_url: runtime_ws_url.into(),
        }
    }

    /// One-shot transcription. The audio is uploaded as-is; the runtime
    /// detects the container from content.
    pub async fn transcribe(
        &self,
        audio: &[u8],
        model: &str,
        language: &str,
    ) -> Result<String, UpstreamError> {
        let part = reqwest::multipart::Part::bytes(audio.to_vec()).file_name("audio.pcm");
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", model.to_string())
            .text("language", language.to_string());

        let response = http_client()
            .post(format!("{}/v1/audio/transcriptions", self.runtime_url))
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(UpstreamError::Status {
                service: "stt",
                status: response.status().as_u16(),
            });
        }

        let body: serde_json::Value = response.json().await?;
        Ok(body
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string())
    }

    /// Stream transcription segments in temporal order.
    ///
    /// Segments arrive on the returned channel as they are produced.
    /// Dropping the receiver tears the stream down; the resulting send
    /// failure inside the task is the expected early-exit path when the
    /// orchestrator has collected enough text to start the LLM.
    pub fn transcribe_stream(
        &self,
        audio: Vec<u8>,
        model: &str,
        language: &str,
    ) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(16);

        let endpoint = format!("{}/v1/audio/transcriptions/stream", self.runtime_ws_url);
        let model = model.to_string();
        let language = language.to_string();

        tokio::spawn(async move {
            if let Err(e) = run_stream(&endpoint, &model, &language, audio, tx).await {
                debug!("streaming STT ended: {e}");
            }
        });

        rx
    }
}

async fn run_stream(
    endpoint: &str,
    model: &str,
    language: &str,
    audio: Vec<u8>,
    tx: mpsc::Sender<String>,
) -> Result<(), UpstreamError> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| UpstreamError::InvalidResponse(format!("bad STT stream URL: {e}")))?;
    url.query_pairs_mut()
        .append_pair("model", model)
        .append_pair("language", language);

    let (mut ws, _) = connect_async(url.as_str()).await?;

    ws.send(WsMessage::Binary(audio.into())).await?;
    ws.send(WsMessage::Text(json!({ "final": true }).to_string().into()))
        .await?;

    while let Some(frame) = ws.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("STT stream read error: {e}");
                break;
            }
        };

        match frame {
            WsMessage::Text(text) => {
                let Ok(payload) = serde_json::from_str::<serde_json::Value>(&text) else {
                    debug!("STT stream: skipping malformed frame");
                    continue;
                };

                if payload.get("type").and_then(|t| t.as_str()) == Some("done") {
                    break;
                }

                if let Some(segment) = payload.get("text").and_then(|t| t.as_str()) {
                    let segment = segment.trim();
                    if !segment.is_empty() && tx.send(segment.to_string()).await.is_err() {
                        // Receiver dropped: the caller broke away early.
                        debug!("STT stream consumer gone; closing");
                        break;
                    }
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    let _ = ws.close(None).await;
    Ok(())
}
