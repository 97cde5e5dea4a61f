//! Incremental decode of encoded containers (WebM/Opus, Ogg/Opus) to PCM.
//!
//! ffmpeg is invoked per decode step over the full accumulated buffer:
//! container streams need their header context on every decode, and feeding
//! the whole buffer keeps each invocation stateless. The decoder tracks how
//! much PCM it has already handed out and returns only the new tail.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, warn};

/// Formats ffmpeg may be asked to decode. The `-f` argument is built from
/// this whitelist only, never from client input.
const ALLOWED_INPUT_FORMATS: &[&str] = &[
    "webm", "ogg", "mp3", "flac", "aiff", "wav", "m4a", "mp4", "opus",
];

/// Encoded bytes to accumulate before the first decode attempt (container
/// header plus some payload).
const MIN_DECODE_BYTES: usize = 2048;

/// New encoded bytes between decode attempts. Opus at voice bitrates is
/// roughly 2 KB/s, so 4 KB is about two seconds of input.
const DECODE_INTERVAL: usize = 4096;

/// Hard cap on the encoded buffer. Crossing it decodes what exists and
/// resets all state, trading stream continuity for bounded memory.
const MAX_ENCODED_BUFFER: usize = 10 * 1024 * 1024;

/// Per-invocation ffmpeg deadline.
const DECODE_TIMEOUT: Duration = Duration::from_secs(5);

/// Streaming decoder for one encoded audio stream.
///
/// Decode failures are deliberately soft: they log and yield empty PCM so a
/// glitched chunk never tears down the session.
#[derive(Debug)]
pub struct StreamingDecoder {
    input_format: &'static str,
    encoded: Vec<u8>,
    last_decode_size: usize,
    total_pcm_decoded: usize,
}

impl StreamingDecoder {
    /// Create a decoder for `input_format` (e.g. "webm", "ogg").
    pub fn new(input_format: &str) -> Result<Self> {
        let Some(format) = ALLOWED_INPUT_FORMATS
            .iter()
            .find(|f| **f == input_format)
        else {
            bail!(
                "unsupported audio format {input_format:?}; allowed: {}",
                ALLOWED_INPUT_FORMATS.join(", ")
            );
        };
        Ok(Self {
            input_format: format,
            encoded: Vec::new(),
            last_decode_size: 0,
            total_pcm_decoded: 0,
        })
    }

    /// Run ffmpeg over the accumulated buffer, producing s16le 16kHz mono.
    async fn decode_buffer(&self) -> Vec<u8> {
        if self.encoded.len() < MIN_DECODE_BYTES {
            return Vec::new();
        }

        let spawned = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-f",
                self.input_format,
                "-i",
                "pipe:0",
                "-ar",
                "16000",
                "-ac",
                "1",
                "-f",
                "s16le",
                "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!("failed to spawn ffmpeg: {e}");
                return Vec::new();
            }
        };

        // Write stdin from a separate task so a full stdout pipe can't
        // deadlock the write.
        if let Some(mut stdin) = child.stdin.take() {
            let input = self.encoded.clone();
            tokio::spawn(async move {
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            });
        }

        let output = match tokio::time::timeout(DECODE_TIMEOUT, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!("ffmpeg decode error: {e}");
                return Vec::new();
            }
            Err(_) => {
                warn!("ffmpeg decode timed out after {DECODE_TIMEOUT:?}");
                return Vec::new();
            }
        };

        if !output.stderr.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Truncated-stream chatter is expected on partial buffers;
            // only surface lines that mention an actual error.
            if stderr.to_lowercase().contains("error") {
                warn!("ffmpeg decode: {}", stderr.trim());
            }
        }

        output.stdout
    }

    /// Feed encoded bytes; returns newly decoded PCM (possibly empty).
    pub async fn feed(&mut self, data: &[u8]) -> Vec<u8> {
        self.encoded.extend_from_slice(data);

        if self.encoded.len() > MAX_ENCODED_BUFFER {
            let over = self.encoded.len() - MAX_ENCODED_BUFFER;
            warn!(
                "encoded buffer exceeded {MAX_ENCODED_BUFFER} bytes (+{over}); \
                 decoding and resetting stream state"
            );
            let all_pcm = self.decode_buffer().await;
            let new_pcm = if all_pcm.len() > self.total_pcm_decoded {
                all_pcm[self.total_pcm_decoded..].to_vec()
            } else {
                Vec::new()
            };
            self.encoded.clear();
            self.last_decode_size = 0;
            self.total_pcm_decoded = 0;
            return new_pcm;
        }

        let since_last = self.encoded.len() - self.last_decode_size;
        if since_last < DECODE_INTERVAL {
            return Vec::new();
        }

        let all_pcm = self.decode_buffer().await;
        self.last_decode_size = self.encoded.len();

        if all_pcm.len() > self.total_pcm_decoded {
            let new_pcm = all_pcm[self.total_pcm_decoded..].to_vec();
            self.total_pcm_decoded = all_pcm.len();
            debug!(
                new_bytes = new_pcm.len(),
                total = self.total_pcm_decoded,
                "decoded new PCM"
            );
            return new_pcm;
        }

        Vec::new()
    }

    /// Decode whatever remains and return the final tail of new PCM.
    pub async fn flush(&mut self) -> Vec<u8> {
        if self.encoded.is_empty() {
            return Vec::new();
        }
        let all_pcm = self.decode_buffer().await;
        if all_pcm.len() > self.total_pcm_decoded {
            let new_pcm = all_pcm[self.total_pcm_decoded..].to_vec();
            self.total_pcm_decoded = all_pcm.len();
            return new_pcm;
        }
        Vec::new()
    }

    /// Clear all state for a fresh stream.
    pub fn reset(&mut self) {
        self.encoded.clear();
        self.last_decode_size = 0;
        self.total_pcm_decoded = 0;
    }

    /// Current encoded-buffer occupancy, for diagnostics.
    pub fn buffered_bytes(&self) -> usize {
        self.encoded.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_format_outside_whitelist() {
        assert!(StreamingDecoder::new("webm").is_ok());
        assert!(StreamingDecoder::new("ogg").is_ok());
        assert!(StreamingDecoder::new("webm; rm -rf /").is_err());
        assert!(StreamingDecoder::new("avi").is_err());
        assert!(StreamingDecoder::new("").is_err());
    }

    #[tokio::test]
    async fn test_no_decode_below_minimum() {
        let mut decoder = StreamingDecoder::new("webm").unwrap();
        // Under MIN_DECODE_BYTES, feed never invokes ffmpeg
        let pcm = decoder.feed(&[0u8; 512]).await;
        assert!(pcm.is_empty());
        assert_eq!(decoder.buffered_bytes(), 512);
    }

    #[tokio::test]
    async fn test_reset_clears_buffer() {
        let mut decoder = StreamingDecoder::new("ogg").unwrap();
        let _ = decoder.feed(&[0u8; 1024]).await;
        decoder.reset();
        assert_eq!(decoder.buffered_bytes(), 0);
    }

    #[tokio::test]
    async fn test_buffer_stays_bounded() {
        let mut decoder = StreamingDecoder::new("webm").unwrap();
        // Garbage input: ffmpeg yields nothing, but the buffer must reset
        // once the cap is crossed.
        let chunk = vec![0u8; 1024 * 1024];
        for _ in 0..11 {
            let _ = decoder.feed(&chunk).await;
            assert!(decoder.buffered_bytes() <= MAX_ENCODED_BUFFER);
        }
        assert_eq!(decoder.buffered_bytes(), 0);
    }
}
