//! Audio container detection from magic bytes.

use tracing::warn;

/// Detected audio format of an incoming stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    /// Raw PCM 16-bit (WAV payloads are treated as PCM too).
    Pcm,
    /// WebM container, typically Opus.
    Webm,
    /// Ogg container, typically Opus.
    Ogg,
    /// Recognized but unsupported container. Callers must reject this.
    Unknown,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Pcm => "pcm",
            AudioFormat::Webm => "webm",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Unknown => "unknown",
        }
    }
}

/// Classify the first bytes of an audio stream.
///
/// Unsupported containers (MP3, MP4/M4A, FLAC, AIFF) return
/// [`AudioFormat::Unknown`] explicitly rather than falling through to PCM,
/// so they never reach the raw-sample path.
pub fn detect(data: &[u8]) -> AudioFormat {
    if data.len() < 4 {
        return AudioFormat::Unknown;
    }

    // WebM starts with the EBML header 0x1A 0x45 0xDF 0xA3
    if data[..4] == [0x1a, 0x45, 0xdf, 0xa3] {
        return AudioFormat::Webm;
    }

    if &data[..4] == b"OggS" {
        return AudioFormat::Ogg;
    }

    // MP3: ID3 tag or frame sync
    if &data[..3] == b"ID3" || (data[0] == 0xff && (data[1] & 0xe0) == 0xe0) {
        warn!("MP3 input detected; not supported for streaming ingest");
        return AudioFormat::Unknown;
    }

    // MP4/M4A: ftyp box at offset 4
    if data.len() >= 8 && &data[4..8] == b"ftyp" {
        warn!("MP4/M4A input detected; not supported for streaming ingest");
        return AudioFormat::Unknown;
    }

    if &data[..4] == b"fLaC" {
        warn!("FLAC input detected; not supported for streaming ingest");
        return AudioFormat::Unknown;
    }

    if &data[..4] == b"FORM" {
        warn!("AIFF input detected; not supported for streaming ingest");
        return AudioFormat::Unknown;
    }

    // WAV carries PCM; the 44-byte header is noise the VAD shrugs off.
    if &data[..4] == b"RIFF" && data.len() >= 12 && &data[8..12] == b"WAVE" {
        return AudioFormat::Pcm;
    }

    // No magic number matched: assume headerless raw PCM.
    AudioFormat::Pcm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_webm() {
        assert_eq!(detect(&[0x1a, 0x45, 0xdf, 0xa3, 0x00, 0x00]), AudioFormat::Webm);
    }

    #[test]
    fn test_detect_ogg() {
        assert_eq!(detect(b"OggS\x00\x02"), AudioFormat::Ogg);
    }

    #[test]
    fn test_detect_wav_as_pcm() {
        let mut header = Vec::new();
        header.extend_from_slice(b"RIFF");
        header.extend_from_slice(&36u32.to_le_bytes());
        header.extend_from_slice(b"WAVE");
        assert_eq!(detect(&header), AudioFormat::Pcm);
    }

    #[test]
    fn test_reject_mp3_id3() {
        assert_eq!(detect(b"ID3\x04\x00\x00"), AudioFormat::Unknown);
    }

    #[test]
    fn test_reject_mp3_frame_sync() {
        assert_eq!(detect(&[0xff, 0xfb, 0x90, 0x00]), AudioFormat::Unknown);
    }

    #[test]
    fn test_reject_mp4() {
        assert_eq!(detect(b"\x00\x00\x00\x20ftypisom"), AudioFormat::Unknown);
    }

    #[test]
    fn test_reject_flac_and_aiff() {
        assert_eq!(detect(b"fLaC\x00\x00"), AudioFormat::Unknown);
        assert_eq!(detect(b"FORMAIFF"), AudioFormat::Unknown);
    }

    #[test]
    fn test_raw_samples_default_to_pcm() {
        // Typical small-amplitude s16le samples
        assert_eq!(detect(&[0x12, 0x00, 0xf3, 0xff, 0x08, 0x00]), AudioFormat::Pcm);
    }

    #[test]
    fn test_too_short_is_unknown() {
        assert_eq!(detect(&[0x1a, 0x45]), AudioFormat::Unknown);
    }
}
