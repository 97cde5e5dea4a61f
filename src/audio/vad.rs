//! Energy-based voice activity detection.
//!
//! Classifies incoming PCM as speech or silence and signals end-of-speech
//! after sustained silence. All timing is derived from sample counts rather
//! than wall-clock time, so the detector behaves identically when a client
//! sends audio faster than real-time.

use std::collections::VecDeque;

/// Voice activity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// No speech detected yet.
    Idle,
    /// Active speech.
    Speaking,
    /// Silence after speech, waiting for the threshold.
    Silence,
}

/// Configuration for voice activity detection.
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    /// RMS energy threshold for speech, normalized to 0.0-1.0.
    pub speech_threshold: f32,
    /// Silence that must follow speech before end-of-speech fires (seconds).
    pub silence_duration: f32,
    /// Minimum speech before an utterance counts as valid (seconds).
    pub min_speech_duration: f32,
    /// Sample rate of incoming audio (Hz).
    pub sample_rate: u32,
    /// Bytes per sample (s16le = 2).
    pub sample_width: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            speech_threshold: 0.015,
            silence_duration: 0.4,
            min_speech_duration: 0.25,
            sample_rate: 16_000,
            sample_width: 2,
        }
    }
}

const MAX_ENERGY_HISTORY: usize = 50;

/// Detects voice activity in streaming PCM.
///
/// `process_chunk` returns true exactly once per utterance; callers reset
/// the detector between utterances.
#[derive(Debug)]
pub struct VoiceActivityDetector {
    pub config: VadConfig,
    state: VadState,
    speech_samples: usize,
    silence_samples: usize,
    energy_history: VecDeque<f32>,
    // Latched once end-of-speech has been reported, so the silence window
    // stays observable for dynamic end-of-turn checks without re-firing.
    end_fired: bool,
}

impl Default for VoiceActivityDetector {
    fn default() -> Self {
        Self::new(VadConfig::default())
    }
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            state: VadState::Idle,
            speech_samples: 0,
            silence_samples: 0,
            energy_history: VecDeque::with_capacity(MAX_ENERGY_HISTORY),
            end_fired: false,
        }
    }

    /// Reset for a new utterance.
    pub fn reset(&mut self) {
        self.state = VadState::Idle;
        self.speech_samples = 0;
        self.silence_samples = 0;
        self.energy_history.clear();
        self.end_fired = false;
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// RMS energy of an s16le chunk, normalized to 0.0-1.0.
    ///
    /// A trailing half-sample is truncated rather than misread.
    pub fn calculate_energy(chunk: &[u8]) -> f32 {
        let usable = chunk.len() - (chunk.len() % 2);
        if usable < 2 {
            return 0.0;
        }
        let mut sum_sq = 0.0f64;
        let count = usable / 2;
        for pair in chunk[..usable].chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]) as f64 / 32768.0;
            sum_sq += sample * sample;
        }
        (sum_sq / count as f64).sqrt() as f32
    }

    fn num_samples(&self, chunk: &[u8]) -> usize {
        chunk.len() / self.config.sample_width
    }

    fn samples_to_seconds(&self, samples: usize) -> f32 {
        samples as f32 / self.config.sample_rate as f32
    }

    /// Process a PCM chunk; returns true when speech has ended and the
    /// utterance should be processed.
    pub fn process_chunk(&mut self, chunk: &[u8]) -> bool {
        let energy = Self::calculate_energy(chunk);
        let num_samples = self.num_samples(chunk);

        self.energy_history.push_back(energy);
        if self.energy_history.len() > MAX_ENERGY_HISTORY {
            self.energy_history.pop_front();
        }

        let is_speech = energy > self.config.speech_threshold;

        match self.state {
            VadState::Idle => {
                if is_speech {
                    self.state = VadState::Speaking;
                    self.speech_samples = num_samples;
                    self.silence_samples = 0;
                    tracing::debug!(energy, "VAD: speech started");
                }
            }
            VadState::Speaking => {
                self.speech_samples += num_samples;
                if !is_speech {
                    self.state = VadState::Silence;
                    self.silence_samples = num_samples;
                    tracing::debug!(
                        speech_secs = self.speech_duration(),
                        "VAD: silence after speech"
                    );
                }
            }
            VadState::Silence => {
                if is_speech {
                    // Short dip, not an end of turn. Fold the silence into the
                    // speech run so the utterance is not fragmented.
                    self.state = VadState::Speaking;
                    self.speech_samples += self.silence_samples + num_samples;
                    self.silence_samples = 0;
                } else {
                    self.silence_samples += num_samples;

                    let silence = self.silence_duration();
                    let speech = self.speech_duration();
                    if !self.end_fired
                        && silence >= self.config.silence_duration
                        && speech >= self.config.min_speech_duration
                    {
                        tracing::debug!(
                            speech_secs = speech,
                            silence_secs = silence,
                            "VAD: end of speech"
                        );
                        self.end_fired = true;
                        return true;
                    }
                }
            }
        }

        false
    }

    /// Whether speech is in progress (speaking or in its trailing silence).
    pub fn is_speech_active(&self) -> bool {
        matches!(self.state, VadState::Speaking | VadState::Silence)
    }

    /// Whether we are in the silence window following speech.
    pub fn is_in_silence_window(&self) -> bool {
        self.state == VadState::Silence
    }

    pub fn speech_duration(&self) -> f32 {
        self.samples_to_seconds(self.speech_samples)
    }

    pub fn silence_duration(&self) -> f32 {
        self.samples_to_seconds(self.silence_samples)
    }

    /// End-of-turn check against a dynamically computed silence threshold
    /// (from the endpointing arbiter) instead of the fixed config value.
    pub fn check_end_of_turn(&self, required_silence: f32) -> bool {
        if self.state != VadState::Silence {
            return false;
        }
        self.silence_duration() >= required_silence
            && self.speech_duration() >= self.config.min_speech_duration
    }

    pub fn average_energy(&self) -> f32 {
        if self.energy_history.is_empty() {
            return 0.0;
        }
        self.energy_history.iter().sum::<f32>() / self.energy_history.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 100ms of constant-amplitude s16le at 16kHz.
    fn chunk(amplitude: i16) -> Vec<u8> {
        let mut out = Vec::with_capacity(1600 * 2);
        for _ in 0..1600 {
            out.extend_from_slice(&amplitude.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_energy_of_silence() {
        assert_eq!(VoiceActivityDetector::calculate_energy(&chunk(0)), 0.0);
    }

    #[test]
    fn test_energy_normalized() {
        // Half-scale amplitude should land near 0.5
        let e = VoiceActivityDetector::calculate_energy(&chunk(16384));
        assert!((e - 0.5).abs() < 0.01, "energy was {e}");
    }

    #[test]
    fn test_energy_truncates_odd_byte() {
        let mut data = chunk(1000);
        data.push(0x7f);
        let even = VoiceActivityDetector::calculate_energy(&chunk(1000));
        let odd = VoiceActivityDetector::calculate_energy(&data);
        assert!((even - odd).abs() < 1e-6);
    }

    #[test]
    fn test_end_of_speech_fires_once() {
        let mut vad = VoiceActivityDetector::default();
        // 1.0s speech
        for _ in 0..10 {
            assert!(!vad.process_chunk(&chunk(2000)));
        }
        assert_eq!(vad.state(), VadState::Speaking);

        // 0.4s silence: fires exactly on the chunk crossing the threshold,
        // then stays silent even as silence keeps accumulating
        let mut fired = 0;
        for _ in 0..10 {
            if vad.process_chunk(&chunk(0)) {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        assert_eq!(vad.state(), VadState::Silence);

        // A reset re-arms the detector
        vad.reset();
        assert_eq!(vad.state(), VadState::Idle);
    }

    #[test]
    fn test_brief_noise_does_not_end_turn() {
        let mut vad = VoiceActivityDetector::default();
        // 100ms burst is under min_speech_duration
        assert!(!vad.process_chunk(&chunk(2000)));
        for _ in 0..10 {
            assert!(!vad.process_chunk(&chunk(0)));
        }
    }

    #[test]
    fn test_silence_folded_back_into_speech() {
        let mut vad = VoiceActivityDetector::default();
        for _ in 0..5 {
            vad.process_chunk(&chunk(2000));
        }
        // 200ms dip, then speech resumes
        vad.process_chunk(&chunk(0));
        vad.process_chunk(&chunk(0));
        assert_eq!(vad.state(), VadState::Silence);
        vad.process_chunk(&chunk(2000));
        assert_eq!(vad.state(), VadState::Speaking);
        // 0.5s speech + 0.2s folded silence + 0.1s resume
        assert!((vad.speech_duration() - 0.8).abs() < 0.01);
        assert_eq!(vad.silence_duration(), 0.0);
    }

    #[test]
    fn test_dynamic_end_of_turn() {
        let mut vad = VoiceActivityDetector::default();
        for _ in 0..10 {
            vad.process_chunk(&chunk(2000));
        }
        for _ in 0..6 {
            vad.process_chunk(&chunk(0));
        }
        // 0.6s of silence: beyond 0.5 but short of 1.2
        assert!(vad.check_end_of_turn(0.5));
        assert!(!vad.check_end_of_turn(1.2));
    }

    #[test]
    fn test_reset_clears_state() {
        let mut vad = VoiceActivityDetector::default();
        for _ in 0..10 {
            vad.process_chunk(&chunk(2000));
        }
        vad.reset();
        assert_eq!(vad.state(), VadState::Idle);
        assert_eq!(vad.speech_duration(), 0.0);
        assert_eq!(vad.average_energy(), 0.0);
    }
}
