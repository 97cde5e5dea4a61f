//! WAV framing for raw PCM.
//!
//! Native-audio LLM endpoints accept `wav` or `mp3` payloads but not bare
//! PCM, so raw samples are wrapped in a standard 44-byte RIFF header before
//! upload.

use std::io::Cursor;

use anyhow::{Context, Result};

/// Wrap s16le mono PCM in a WAV container.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).context("failed to start WAV writer")?;
        // A trailing half-sample is dropped rather than misread.
        for pair in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .context("failed to write WAV sample")?;
        }
        writer.finalize().context("failed to finalize WAV data")?;
    }

    Ok(cursor.into_inner())
}
