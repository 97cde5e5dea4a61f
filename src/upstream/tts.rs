//! Streaming text-to-speech client.
//!
//! One persistent WebSocket per session, opened lazily and reused across
//! phrases to avoid a handshake per phrase. The server interleaves binary
//! PCM (s16le mono 24 kHz) with JSON control frames; `done` leaves the
//! connection open for the next phrase, while `error`/`closed` drop it so
//! the next phrase reconnects cleanly. The stream must also be closed on
//! interrupt: in-flight chunks of a cancelled phrase would otherwise bleed
//! into the next one.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use super::UpstreamError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One frame received from the TTS stream.
#[derive(Debug)]
pub enum TtsFrame {
    /// PCM audio chunk to relay to the client.
    Audio(Vec<u8>),
    /// Current phrase finished; the connection stays open.
    Done,
    /// Synthesis failed; the connection has been dropped.
    Error(String),
    /// Server closed the stream; the connection has been dropped.
    Closed,
}

/// Lazily-connected, reusable TTS stream.
pub struct TtsStream {
    runtime_ws_url: String,
    model: String,
    voice: String,
    ws: Option<WsConnection>,
}

impl TtsStream {
    pub fn new(
        runtime_ws_url: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> Self {
        Self {
            runtime_ws_url: runtime_ws_url.into(),
            model: model.into(),
            voice: voice.into(),
            ws: None,
        }
    }

    /// Point at a different model/voice. Drops any open connection so the
    /// next phrase reconnects with the new parameters.
    pub fn set_voice(&mut self, model: &str, voice: &str) {
        if self.model != model || self.voice != voice {
            self.model = model.to_string();
            self.voice = voice.to_string();
            self.ws = None;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.ws.is_some()
    }

    /// Ensure the WebSocket is open, connecting if necessary.
    pub async fn ensure_connected(&mut self) -> Result<(), UpstreamError> {
        if self.ws.is_some() {
            return Ok(());
        }

        let mut url = Url::parse(&format!(
            "{}/v1/audio/speech/stream",
            self.runtime_ws_url
        ))
        .map_err(|e| UpstreamError::TtsConnect(format!("bad TTS URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("model", &self.model)
            .append_pair("voice", &self.voice)
            .append_pair("response_format", "pcm");

        let connected = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| UpstreamError::TtsConnect("connect timed out".to_string()))?
            .map_err(|e| UpstreamError::TtsConnect(e.to_string()))?;

        info!(model = %self.model, voice = %self.voice, "TTS stream connected");
        self.ws = Some(connected.0);
        Ok(())
    }

    /// Send one phrase for synthesis. `final: false` keeps the connection
    /// open for the phrases that follow.
    pub async fn send_phrase(&mut self, text: &str, speed: f32) -> Result<(), UpstreamError> {
        self.ensure_connected().await?;
        let frame = json!({ "text": text, "speed": speed, "final": false }).to_string();
        if let Some(ws) = self.ws.as_mut() {
            if let Err(e) = ws.send(WsMessage::Text(frame.into())).await {
                self.ws = None;
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Receive the next frame for the current phrase.
    pub async fn next_frame(&mut self) -> TtsFrame {
        loop {
            let Some(ws) = self.ws.as_mut() else {
                return TtsFrame::Closed;
            };

            match ws.next().await {
                Some(Ok(WsMessage::Binary(audio))) => return TtsFrame::Audio(audio.to_vec()),
                Some(Ok(WsMessage::Text(text))) => {
                    let payload: serde_json::Value = match serde_json::from_str(&text) {
                        Ok(payload) => payload,
                        Err(_) => {
                            debug!("TTS stream: ignoring malformed control frame");
                            continue;
                        }
                    };
                    match payload.get("type").and_then(|t| t.as_str()) {
                        Some("done") => return TtsFrame::Done,
                        Some("error") => {
                            let message = payload
                                .get("message")
                                .and_then(|m| m.as_str())
                                .unwrap_or("synthesis failed")
                                .to_string();
                            warn!("TTS error frame: {message}");
                            self.ws = None;
                            return TtsFrame::Error(message);
                        }
                        Some("closed") => {
                            self.ws = None;
                            return TtsFrame::Closed;
                        }
                        _ => continue,
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    self.ws = None;
                    return TtsFrame::Closed;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("TTS stream read error: {e}");
                    self.ws = None;
                    return TtsFrame::Error(e.to_string());
                }
            }
        }
    }

    /// Close the stream gracefully, bounded by [`CLOSE_TIMEOUT`].
    pub async fn close(&mut self) {
        if let Some(mut ws) = self.ws.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, ws.close(None))
                .await
                .is_err()
            {
                debug!("TTS close timed out; dropping connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_disconnected() {
        let stream = TtsStream::new("ws://127.0.0.1:9", "kokoro", "af_heart");
        assert!(!stream.is_connected());
    }

    #[test]
    fn test_set_voice_drops_connection_marker() {
        let mut stream = TtsStream::new("ws://127.0.0.1:9", "kokoro", "af_heart");
        stream.set_voice("kokoro", "af_heart");
        assert!(!stream.is_connected());
        stream.set_voice("pocket-tts", "alba");
        assert_eq!(stream.model, "pocket-tts");
        assert_eq!(stream.voice, "alba");
    }

    #[tokio::test]
    async fn test_next_frame_on_disconnected_stream() {
        let mut stream = TtsStream::new("ws://127.0.0.1:9", "kokoro", "af_heart");
        assert!(matches!(stream.next_frame().await, TtsFrame::Closed));
    }
}
