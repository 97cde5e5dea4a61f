//! Voice session state and the capacity-bounded session store.
//!
//! A session is owned by exactly one connection at a time. The connection's
//! receive loop is the sole writer of ingest state (audio buffer, VAD,
//! endpointer, decoder, barge-in counter); the per-turn pipeline task is the
//! sole writer of response state (history, phrase counter). The interrupt
//! flag is the only cross-task signal and is a plain atomic.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::decode::StreamingDecoder;
use crate::audio::format::{self, AudioFormat};
use crate::audio::vad::VoiceActivityDetector;
use crate::config::VoiceDefaults;
use crate::upstream::llm::ChatMessage;
use crate::voice::endpointing::{EndOfTurnConfig, EndOfTurnDetector};

/// Pipeline state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceState {
    /// Waiting for input.
    Idle,
    /// Receiving audio.
    Listening,
    /// STT and LLM in progress.
    Processing,
    /// TTS output streaming.
    Speaking,
    /// Barge-in occurred; transitioning back to listening.
    Interrupted,
}

impl VoiceState {
    /// Whether `next` is a declared edge of the state machine. `Idle` is
    /// reachable from anywhere (error recovery and turn completion).
    pub fn can_transition_to(self, next: VoiceState) -> bool {
        use VoiceState::*;
        match (self, next) {
            (Idle, Listening) => true,
            (Listening, Processing) => true,
            (Processing, Speaking) => true,
            (Speaking, Interrupted) | (Processing, Interrupted) => true,
            (Interrupted, Listening) => true,
            (_, Idle) => true,
            _ => false,
        }
    }
}

/// Per-session configuration. Immutable except through an explicit
/// reconfigure (`config` frame) or a session resume.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub stt_model: String,
    pub language: String,
    pub tts_model: String,
    pub tts_voice: String,
    /// TTS speed multiplier, 0.5-2.0.
    pub speed: f32,
    /// Logical LLM model name.
    pub llm_model: String,
    pub enable_thinking: bool,
    pub sentence_boundary_only: bool,
    /// Skip STT and send audio directly to the LLM.
    pub use_native_audio: bool,
    /// Sanitized system prompt from the handshake, if any.
    pub system_prompt: Option<String>,
    pub barge_in_enabled: bool,
    pub barge_in_noise_filter: bool,
    pub barge_in_min_chunks: u32,
    pub speak_tool_placeholder: bool,
    pub turn_detection_enabled: bool,
    pub base_silence_duration: f32,
    pub thinking_silence_duration: f32,
    pub max_silence_duration: f32,
    pub min_speech_for_analysis: f32,
    pub short_utterance_threshold: f32,
    pub short_utterance_silence_multiplier: f32,
}

impl SessionConfig {
    /// Seed a session config from the gateway's voice defaults.
    pub fn from_defaults(defaults: &VoiceDefaults) -> Self {
        Self {
            stt_model: defaults.stt_model.clone(),
            language: defaults.language.clone(),
            tts_model: defaults.tts_model.clone(),
            tts_voice: defaults.tts_voice.clone(),
            speed: defaults.speed,
            llm_model: defaults.llm_model.clone().unwrap_or_default(),
            enable_thinking: defaults.enable_thinking,
            sentence_boundary_only: defaults.sentence_boundary_only,
            use_native_audio: false,
            system_prompt: None,
            barge_in_enabled: defaults.barge_in_enabled,
            barge_in_noise_filter: defaults.barge_in_noise_filter,
            barge_in_min_chunks: defaults.barge_in_min_chunks,
            speak_tool_placeholder: defaults.speak_tool_placeholder,
            turn_detection_enabled: defaults.turn_detection_enabled,
            base_silence_duration: defaults.base_silence_duration,
            thinking_silence_duration: defaults.thinking_silence_duration,
            max_silence_duration: defaults.max_silence_duration,
            min_speech_for_analysis: 0.5,
            short_utterance_threshold: 2.0,
            short_utterance_silence_multiplier: 1.5,
        }
    }

    fn endpoint_config(&self) -> EndOfTurnConfig {
        EndOfTurnConfig {
            base_silence_duration: self.base_silence_duration,
            thinking_silence_duration: self.thinking_silence_duration,
            max_silence_duration: self.max_silence_duration,
            min_speech_for_analysis: self.min_speech_for_analysis,
            short_utterance_threshold: self.short_utterance_threshold,
            short_utterance_silence_multiplier: self.short_utterance_silence_multiplier,
            enable_linguistic_analysis: self.turn_detection_enabled,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_defaults(&VoiceDefaults::default())
    }
}

/// Partial update carried by a `config` frame. Unset fields keep their
/// current values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfigUpdate {
    pub stt_model: Option<String>,
    pub tts_model: Option<String>,
    pub tts_voice: Option<String>,
    pub llm_model: Option<String>,
    pub language: Option<String>,
    pub speed: Option<f32>,
    pub sentence_boundary_only: Option<bool>,
    pub barge_in_enabled: Option<bool>,
    pub barge_in_noise_filter: Option<bool>,
    pub barge_in_min_chunks: Option<u32>,
    pub turn_detection_enabled: Option<bool>,
    pub base_silence_duration: Option<f32>,
    pub thinking_silence_duration: Option<f32>,
    pub max_silence_duration: Option<f32>,
}

/// Ingest-side state, written only by the connection's receive loop.
struct IngestState {
    /// Raw client bytes of the current utterance (encoded or PCM).
    audio_buffer: Vec<u8>,
    /// Bytes accumulated until the format can be detected.
    format_detect: Vec<u8>,
    audio_format: Option<AudioFormat>,
    /// Streaming decoder, created once per connection for encoded formats
    /// and preserved across utterances (continuation chunks carry no
    /// container header).
    decoder: Option<StreamingDecoder>,
    vad: VoiceActivityDetector,
    endpointer: EndOfTurnDetector,
    partial_transcript: String,
    /// Guard so at most one partial-STT probe runs per silence window.
    partial_probe_inflight: bool,
    /// Consecutive above-threshold chunks seen during SPEAKING.
    barge_in_chunks: u32,
}

/// A stateful voice conversation bound to one client connection.
pub struct VoiceSession {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    config: Mutex<SessionConfig>,
    state: Mutex<VoiceState>,
    interrupted: AtomicBool,
    phrase_index: AtomicU32,
    messages: Mutex<Vec<ChatMessage>>,
    ingest: AsyncMutex<IngestState>,
}

impl VoiceSession {
    pub fn new(session_id: String, config: SessionConfig) -> Self {
        let endpointer = EndOfTurnDetector::new(config.endpoint_config());
        Self {
            session_id,
            created_at: Utc::now(),
            config: Mutex::new(config),
            state: Mutex::new(VoiceState::Idle),
            interrupted: AtomicBool::new(false),
            phrase_index: AtomicU32::new(0),
            messages: Mutex::new(Vec::new()),
            ingest: AsyncMutex::new(IngestState {
                audio_buffer: Vec::new(),
                format_detect: Vec::new(),
                audio_format: None,
                decoder: None,
                vad: VoiceActivityDetector::default(),
                endpointer,
                partial_transcript: String::new(),
                partial_probe_inflight: false,
                barge_in_chunks: 0,
            }),
        }
    }

    // ─── Configuration ───────────────────────────────────────

    pub fn config(&self) -> SessionConfig {
        self.config.lock().expect("config lock poisoned").clone()
    }

    /// Apply a partial update from a `config` frame. The endpointer is
    /// rebuilt when any turn-detection field changed.
    pub async fn update_config(&self, update: SessionConfigUpdate) {
        let mut turn_changed = false;
        {
            let mut config = self.config.lock().expect("config lock poisoned");
            if let Some(v) = update.stt_model {
                config.stt_model = v;
            }
            if let Some(v) = update.tts_model {
                config.tts_model = v;
            }
            if let Some(v) = update.tts_voice {
                config.tts_voice = v;
            }
            if let Some(v) = update.llm_model {
                config.llm_model = v;
            }
            if let Some(v) = update.language {
                config.language = v;
            }
            if let Some(v) = update.speed {
                config.speed = v.clamp(0.5, 2.0);
            }
            if let Some(v) = update.sentence_boundary_only {
                config.sentence_boundary_only = v;
            }
            if let Some(v) = update.barge_in_enabled {
                config.barge_in_enabled = v;
            }
            if let Some(v) = update.barge_in_noise_filter {
                config.barge_in_noise_filter = v;
            }
            if let Some(v) = update.barge_in_min_chunks {
                config.barge_in_min_chunks = v;
            }
            if let Some(v) = update.turn_detection_enabled {
                config.turn_detection_enabled = v;
                turn_changed = true;
            }
            if let Some(v) = update.base_silence_duration {
                config.base_silence_duration = v;
                turn_changed = true;
            }
            if let Some(v) = update.thinking_silence_duration {
                config.thinking_silence_duration = v;
                turn_changed = true;
            }
            if let Some(v) = update.max_silence_duration {
                config.max_silence_duration = v;
                turn_changed = true;
            }
        }

        if turn_changed {
            let endpoint_config = self.config().endpoint_config();
            let mut ingest = self.ingest.lock().await;
            ingest.endpointer = EndOfTurnDetector::new(endpoint_config);
            debug!(session_id = %self.session_id, "endpointer rebuilt after config update");
        }
    }

    /// Replace the whole configuration (session resume with fresh handshake
    /// parameters). The existing system prompt is kept; prompts are injected
    /// once per session, not per connection.
    pub async fn apply_config(&self, mut new_config: SessionConfig) {
        {
            let mut config = self.config.lock().expect("config lock poisoned");
            new_config.system_prompt = config.system_prompt.clone();
            *config = new_config;
        }
        let endpoint_config = self.config().endpoint_config();
        let mut ingest = self.ingest.lock().await;
        ingest.endpointer = EndOfTurnDetector::new(endpoint_config);
    }

    // ─── State machine ───────────────────────────────────────

    pub fn state(&self) -> VoiceState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Transition to `new_state`, returning the previous state.
    ///
    /// Only declared edges are taken; an undeclared transition is refused
    /// and leaves the state unchanged. Requesting the current state is a
    /// no-op.
    pub fn set_state(&self, new_state: VoiceState) -> VoiceState {
        let mut state = self.state.lock().expect("state lock poisoned");
        let old = *state;
        if old == new_state {
            return old;
        }
        if !old.can_transition_to(new_state) {
            warn!(
                session_id = %self.session_id,
                ?old,
                ?new_state,
                "refusing undeclared state transition"
            );
            return old;
        }
        *state = new_state;
        old
    }

    // ─── Interrupt signal ────────────────────────────────────

    pub fn request_interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    // ─── Audio ingest ────────────────────────────────────────

    /// Append a client audio chunk and run VAD over the decoded PCM.
    ///
    /// Returns true when the VAD's fixed threshold detected end-of-speech.
    /// Fails on recognized-but-unsupported containers.
    pub async fn append_audio(&self, chunk: &[u8]) -> Result<bool> {
        let mut ingest = self.ingest.lock().await;
        ingest.audio_buffer.extend_from_slice(chunk);

        if ingest.audio_format.is_none() {
            ingest.format_detect.extend_from_slice(chunk);
            if ingest.format_detect.len() < 4 {
                return Ok(false);
            }

            let detected = format::detect(&ingest.format_detect);
            info!(session_id = %self.session_id, format = detected.as_str(), "audio format detected");
            ingest.audio_format = Some(detected);

            return match detected {
                AudioFormat::Unknown => {
                    bail!("unsupported audio format");
                }
                AudioFormat::Webm | AudioFormat::Ogg => {
                    let mut decoder = StreamingDecoder::new(detected.as_str())?;
                    let header_bytes = std::mem::take(&mut ingest.format_detect);
                    let pcm = decoder.feed(&header_bytes).await;
                    ingest.decoder = Some(decoder);
                    if pcm.is_empty() {
                        Ok(false)
                    } else {
                        Ok(ingest.vad.process_chunk(&pcm))
                    }
                }
                AudioFormat::Pcm => {
                    let pending = std::mem::take(&mut ingest.format_detect);
                    Ok(ingest.vad.process_chunk(&pending))
                }
            };
        }

        if let Some(decoder) = ingest.decoder.as_mut() {
            let pcm = decoder.feed(chunk).await;
            if pcm.is_empty() {
                Ok(false)
            } else {
                Ok(ingest.vad.process_chunk(&pcm))
            }
        } else {
            Ok(ingest.vad.process_chunk(chunk))
        }
    }

    /// Flush the streaming decoder and run VAD over the residual PCM.
    /// Used on an explicit `end` frame so the buffered tail is accounted for.
    pub async fn flush_decoder(&self) -> bool {
        let mut ingest = self.ingest.lock().await;
        if let Some(decoder) = ingest.decoder.as_mut() {
            let pcm = decoder.flush().await;
            if !pcm.is_empty() {
                debug!(bytes = pcm.len(), "flushed residual PCM from decoder");
                return ingest.vad.process_chunk(&pcm);
            }
        }
        false
    }

    /// Take the buffered utterance and reset per-utterance state.
    ///
    /// The detected format and decoder are preserved: continuation chunks of
    /// a container stream have no header, so the decoder must keep its
    /// accumulated context across utterances.
    pub async fn take_utterance(&self) -> Vec<u8> {
        let mut ingest = self.ingest.lock().await;
        let audio = std::mem::take(&mut ingest.audio_buffer);
        ingest.vad.reset();
        ingest.endpointer.reset();
        ingest.partial_transcript.clear();
        ingest.partial_probe_inflight = false;
        ingest.format_detect.clear();
        audio
    }

    /// Drop buffered audio without processing it (post-interrupt cleanup).
    pub async fn discard_audio(&self) {
        let mut ingest = self.ingest.lock().await;
        ingest.audio_buffer.clear();
        ingest.format_detect.clear();
        ingest.vad.reset();
        ingest.endpointer.reset();
        ingest.partial_transcript.clear();
        ingest.partial_probe_inflight = false;
    }

    pub async fn has_audio(&self) -> bool {
        !self.ingest.lock().await.audio_buffer.is_empty()
    }

    // ─── Barge-in ────────────────────────────────────────────

    /// Check whether a chunk received during SPEAKING contains speech.
    ///
    /// Encoded chunks go through a temporary decoder: feeding them to the
    /// main decoder would advance its byte counters and desynchronize the
    /// next utterance's decode. A headerless continuation chunk usually
    /// yields no PCM, in which case the chunk counts as not-speech.
    pub async fn detect_barge_in(&self, chunk: &[u8]) -> bool {
        let config = self.config();
        if !config.barge_in_enabled {
            return false;
        }

        let mut ingest = self.ingest.lock().await;

        let pcm: Vec<u8> = match ingest.audio_format {
            Some(fmt @ (AudioFormat::Webm | AudioFormat::Ogg)) => {
                let mut temp = match StreamingDecoder::new(fmt.as_str()) {
                    Ok(temp) => temp,
                    Err(_) => return false,
                };
                let pcm = temp.feed(chunk).await;
                if pcm.is_empty() {
                    debug!(chunk_len = chunk.len(), "barge-in: temp decoder yielded no PCM");
                    return false;
                }
                pcm
            }
            Some(AudioFormat::Pcm) | None => chunk.to_vec(),
            Some(AudioFormat::Unknown) => return false,
        };

        let energy = VoiceActivityDetector::calculate_energy(&pcm);
        let threshold = ingest.vad.config.speech_threshold;
        let is_speech = energy > threshold;

        if !config.barge_in_noise_filter {
            if is_speech {
                info!(energy, "barge-in detected");
            }
            return is_speech;
        }

        if is_speech {
            ingest.barge_in_chunks += 1;
            if ingest.barge_in_chunks >= config.barge_in_min_chunks {
                info!(
                    chunks = ingest.barge_in_chunks,
                    energy, "barge-in triggered after consecutive speech chunks"
                );
                return true;
            }
            debug!(
                chunks = ingest.barge_in_chunks,
                needed = config.barge_in_min_chunks,
                "barge-in pending"
            );
            false
        } else {
            ingest.barge_in_chunks = 0;
            false
        }
    }

    pub async fn reset_barge_in(&self) {
        self.ingest.lock().await.barge_in_chunks = 0;
    }

    // ─── VAD / endpointing accessors ─────────────────────────

    pub async fn is_in_silence_window(&self) -> bool {
        self.ingest.lock().await.vad.is_in_silence_window()
    }

    pub async fn silence_duration(&self) -> f32 {
        self.ingest.lock().await.vad.silence_duration()
    }

    pub async fn speech_duration(&self) -> f32 {
        self.ingest.lock().await.vad.speech_duration()
    }

    pub async fn partial_transcript(&self) -> String {
        self.ingest.lock().await.partial_transcript.clone()
    }

    pub async fn set_partial_transcript(&self, text: String) {
        let mut ingest = self.ingest.lock().await;
        ingest.partial_transcript = text;
        ingest.partial_probe_inflight = false;
    }

    /// If the silence window is open, no partial transcript exists yet, and
    /// no probe is running, claim the probe slot and return the audio to
    /// transcribe. The caller runs STT off the receive loop and reports back
    /// through [`Self::set_partial_transcript`].
    pub async fn begin_partial_probe(&self, min_silence: f32) -> Option<Vec<u8>> {
        let mut ingest = self.ingest.lock().await;
        if !ingest.vad.is_in_silence_window()
            || ingest.vad.silence_duration() < min_silence
            || !ingest.partial_transcript.is_empty()
            || ingest.partial_probe_inflight
            || ingest.audio_buffer.is_empty()
        {
            return None;
        }
        ingest.partial_probe_inflight = true;
        Some(ingest.audio_buffer.clone())
    }

    /// Consult the endpointing arbiter against the current silence window.
    pub async fn check_end_of_turn(&self) -> bool {
        let mut ingest = self.ingest.lock().await;
        if !ingest.vad.is_in_silence_window() {
            return false;
        }
        let silence = ingest.vad.silence_duration();
        let speech = ingest.vad.speech_duration();
        if speech < ingest.vad.config.min_speech_duration {
            return false;
        }
        let partial = ingest.partial_transcript.clone();
        ingest.endpointer.should_end_turn(silence, speech, &partial)
    }

    // ─── Response state ──────────────────────────────────────

    /// Allocate the next phrase index, monotonic within a response.
    pub fn next_phrase_index(&self) -> u32 {
        self.phrase_index.fetch_add(1, Ordering::SeqCst)
    }

    pub fn reset_phrase_counter(&self) {
        self.phrase_index.store(0, Ordering::SeqCst);
    }

    pub fn push_message(&self, message: ChatMessage) {
        self.messages.lock().expect("messages lock poisoned").push(message);
    }

    pub fn messages_snapshot(&self) -> Vec<ChatMessage> {
        self.messages.lock().expect("messages lock poisoned").clone()
    }

    pub fn has_messages(&self) -> bool {
        !self.messages.lock().expect("messages lock poisoned").is_empty()
    }
}

/// Capacity-bounded store of sessions, evicting the oldest insertion when
/// full. Lookups go through `peek`, which never reorders the cache, so a
/// resumed session keeps its original insertion slot; entries are only
/// (re)ordered when a new session is pushed.
pub struct SessionStore {
    sessions: AsyncMutex<LruCache<String, Arc<VoiceSession>>>,
}

impl SessionStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            sessions: AsyncMutex::new(LruCache::new(capacity)),
        }
    }

    /// Return the session for `requested_id`, applying the fresh config, or
    /// create one (generating an id when absent). Atomic under the store
    /// lock; the boolean reports whether the session was created.
    pub async fn get_or_create(
        &self,
        requested_id: Option<&str>,
        config: SessionConfig,
    ) -> (Arc<VoiceSession>, bool) {
        let mut sessions = self.sessions.lock().await;

        if let Some(id) = requested_id {
            // peek, not get: a resume must not promote the entry, or
            // eviction would drift from insertion order.
            if let Some(session) = sessions.peek(id) {
                let session = session.clone();
                session.apply_config(config).await;
                info!(session_id = %id, "resumed existing session");
                return (session, false);
            }
        }

        let session_id = requested_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = Arc::new(VoiceSession::new(session_id.clone(), config));

        if let Some((evicted_id, evicted)) = sessions.push(session_id, session.clone()) {
            if evicted_id != session.session_id {
                let age_secs = (Utc::now() - evicted.created_at).num_seconds();
                info!(session_id = %evicted_id, age_secs, "evicted session at capacity");
            }
        }

        (session, true)
    }

    pub async fn remove(&self, session_id: &str) -> bool {
        self.sessions.lock().await.pop(session_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_chunk(amplitude: i16, samples: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(samples * 2);
        for _ in 0..samples {
            out.extend_from_slice(&amplitude.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_declared_transitions() {
        use VoiceState::*;
        assert!(Idle.can_transition_to(Listening));
        assert!(Listening.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Speaking));
        assert!(Speaking.can_transition_to(Interrupted));
        assert!(Interrupted.can_transition_to(Listening));
        assert!(Speaking.can_transition_to(Idle));
        assert!(Processing.can_transition_to(Idle));

        assert!(!Idle.can_transition_to(Speaking));
        assert!(!Listening.can_transition_to(Speaking));
        assert!(!Interrupted.can_transition_to(Processing));
    }

    #[test]
    fn test_set_state_refuses_undeclared_transition() {
        let session = VoiceSession::new("s1".to_string(), SessionConfig::default());
        assert_eq!(session.state(), VoiceState::Idle);

        // Idle -> Speaking is not a declared edge; the state must not move
        let old = session.set_state(VoiceState::Speaking);
        assert_eq!(old, VoiceState::Idle);
        assert_eq!(session.state(), VoiceState::Idle);

        // Declared edges proceed normally
        assert_eq!(session.set_state(VoiceState::Listening), VoiceState::Idle);
        assert_eq!(session.state(), VoiceState::Listening);
        assert_eq!(
            session.set_state(VoiceState::Processing),
            VoiceState::Listening
        );
        assert_eq!(session.state(), VoiceState::Processing);

        // Processing -> Listening is undeclared; still Processing after
        session.set_state(VoiceState::Listening);
        assert_eq!(session.state(), VoiceState::Processing);

        // Requesting the current state is a no-op, not a refusal
        assert_eq!(
            session.set_state(VoiceState::Processing),
            VoiceState::Processing
        );
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&VoiceState::Listening).unwrap(),
            "\"listening\""
        );
        assert_eq!(
            serde_json::to_string(&VoiceState::Interrupted).unwrap(),
            "\"interrupted\""
        );
    }

    #[tokio::test]
    async fn test_interrupt_flag_roundtrip() {
        let session = VoiceSession::new("s1".to_string(), SessionConfig::default());
        assert!(!session.is_interrupted());
        session.request_interrupt();
        assert!(session.is_interrupted());
        session.clear_interrupt();
        assert!(!session.is_interrupted());
    }

    #[tokio::test]
    async fn test_pcm_ingest_end_of_speech() {
        let session = VoiceSession::new("s1".to_string(), SessionConfig::default());
        // 1.0s of speech-level PCM in 100ms chunks
        for _ in 0..10 {
            assert!(!session.append_audio(&pcm_chunk(2000, 1600)).await.unwrap());
        }
        // 0.4s of silence triggers end-of-speech exactly once
        let mut fired = 0;
        for _ in 0..6 {
            if session.append_audio(&pcm_chunk(0, 1600)).await.unwrap() {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        assert!(session.has_audio().await);
    }

    #[tokio::test]
    async fn test_unknown_format_rejected() {
        let session = VoiceSession::new("s1".to_string(), SessionConfig::default());
        assert!(session.append_audio(b"ID3\x04rest-of-mp3").await.is_err());
    }

    #[tokio::test]
    async fn test_take_utterance_resets_per_utterance_state() {
        let session = VoiceSession::new("s1".to_string(), SessionConfig::default());
        for _ in 0..10 {
            let _ = session.append_audio(&pcm_chunk(2000, 1600)).await.unwrap();
        }
        session.set_partial_transcript("hello".to_string()).await;

        let audio = session.take_utterance().await;
        assert_eq!(audio.len(), 10 * 1600 * 2);
        assert!(!session.has_audio().await);
        assert_eq!(session.partial_transcript().await, "");
        assert_eq!(session.speech_duration().await, 0.0);
    }

    #[tokio::test]
    async fn test_phrase_index_monotonic_and_resettable() {
        let session = VoiceSession::new("s1".to_string(), SessionConfig::default());
        assert_eq!(session.next_phrase_index(), 0);
        assert_eq!(session.next_phrase_index(), 1);
        assert_eq!(session.next_phrase_index(), 2);
        session.reset_phrase_counter();
        assert_eq!(session.next_phrase_index(), 0);
    }

    #[tokio::test]
    async fn test_barge_in_noise_filter_needs_consecutive_chunks() {
        let mut config = SessionConfig::default();
        config.barge_in_min_chunks = 2;
        let session = VoiceSession::new("s1".to_string(), config);
        // Mark format as PCM first
        let _ = session.append_audio(&pcm_chunk(0, 1600)).await.unwrap();

        let speech = pcm_chunk(4000, 1600);
        assert!(!session.detect_barge_in(&speech).await);
        assert!(session.detect_barge_in(&speech).await);

        // Silence resets the counter
        session.reset_barge_in().await;
        assert!(!session.detect_barge_in(&speech).await);
        assert!(!session.detect_barge_in(&pcm_chunk(0, 1600)).await);
        assert!(!session.detect_barge_in(&speech).await);
    }

    #[tokio::test]
    async fn test_barge_in_disabled() {
        let mut config = SessionConfig::default();
        config.barge_in_enabled = false;
        let session = VoiceSession::new("s1".to_string(), config);
        assert!(!session.detect_barge_in(&pcm_chunk(8000, 1600)).await);
    }

    #[tokio::test]
    async fn test_partial_probe_claims_once() {
        let session = VoiceSession::new("s1".to_string(), SessionConfig::default());
        for _ in 0..10 {
            let _ = session.append_audio(&pcm_chunk(2000, 1600)).await.unwrap();
        }
        for _ in 0..5 {
            let _ = session.append_audio(&pcm_chunk(0, 1600)).await.unwrap();
        }
        assert!(session.is_in_silence_window().await);

        let audio = session.begin_partial_probe(0.4).await;
        assert!(audio.is_some());
        // Second claim while in flight is refused
        assert!(session.begin_partial_probe(0.4).await.is_none());
        // Reporting a transcript releases the guard, but a present
        // transcript suppresses further probes
        session.set_partial_transcript("so anyway".to_string()).await;
        assert!(session.begin_partial_probe(0.4).await.is_none());
    }

    #[tokio::test]
    async fn test_end_of_turn_extends_for_incomplete_transcript() {
        let session = VoiceSession::new("s1".to_string(), SessionConfig::default());
        // 3s speech, then 0.6s silence
        for _ in 0..30 {
            let _ = session.append_audio(&pcm_chunk(2000, 1600)).await.unwrap();
        }
        for _ in 0..6 {
            let _ = session.append_audio(&pcm_chunk(0, 1600)).await.unwrap();
        }
        session
            .set_partial_transcript("I need to go to".to_string())
            .await;
        // Incomplete transcript requires 1.2s of silence
        assert!(!session.check_end_of_turn().await);

        for _ in 0..6 {
            let _ = session.append_audio(&pcm_chunk(0, 1600)).await.unwrap();
        }
        assert!(session.check_end_of_turn().await);
    }

    #[tokio::test]
    async fn test_store_get_or_create_idempotent() {
        let store = SessionStore::new(10);
        let (a, created_a) = store
            .get_or_create(Some("fixed-id"), SessionConfig::default())
            .await;
        let (b, created_b) = store
            .get_or_create(Some("fixed-id"), SessionConfig::default())
            .await;
        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_store_evicts_at_capacity() {
        let store = SessionStore::new(2);
        let (first, _) = store.get_or_create(None, SessionConfig::default()).await;
        store.get_or_create(None, SessionConfig::default()).await;
        store.get_or_create(None, SessionConfig::default()).await;
        assert_eq!(store.len().await, 2);
        // The first insertion has been evicted
        let (again, created) = store
            .get_or_create(Some(&first.session_id), SessionConfig::default())
            .await;
        assert!(created);
        assert!(!Arc::ptr_eq(&first, &again));
    }

    #[tokio::test]
    async fn test_store_eviction_ignores_resumes() {
        let store = SessionStore::new(2);
        let (a, _) = store.get_or_create(Some("a"), SessionConfig::default()).await;
        store.get_or_create(Some("b"), SessionConfig::default()).await;

        // Resuming "a" must not disturb insertion order
        let (resumed, created) = store.get_or_create(Some("a"), SessionConfig::default()).await;
        assert!(!created);
        assert!(Arc::ptr_eq(&a, &resumed));

        // "c" evicts the oldest insertion, which is still "a"
        store.get_or_create(Some("c"), SessionConfig::default()).await;
        assert_eq!(store.len().await, 2);
        let (_, b_created) = store.get_or_create(Some("b"), SessionConfig::default()).await;
        assert!(!b_created, "b must survive eviction");
        let (_, a_created) = store.get_or_create(Some("a"), SessionConfig::default()).await;
        assert!(a_created, "a was the oldest insertion and must be gone");
    }

    #[tokio::test]
    async fn test_store_remove() {
        let store = SessionStore::new(4);
        let (session, _) = store.get_or_create(None, SessionConfig::default()).await;
        assert!(store.remove(&session.session_id).await);
        assert!(!store.remove(&session.session_id).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_config_update_rebuilds_endpointer() {
        let session = VoiceSession::new("s1".to_string(), SessionConfig::default());
        session
            .update_config(SessionConfigUpdate {
                base_silence_duration: Some(0.8),
                max_silence_duration: Some(3.0),
                ..SessionConfigUpdate::default()
            })
            .await;
        let config = session.config();
        assert!((config.base_silence_duration - 0.8).abs() < f32::EPSILON);
        assert!((config.max_silence_duration - 3.0).abs() < f32::EPSILON);

        // Speed is clamped to the valid range
        session
            .update_config(SessionConfigUpdate {
                speed: Some(5.0),
                ..SessionConfigUpdate::default()
            })
            .await;
        assert!((session.config().speed - 2.0).abs() < f32::EPSILON);
    }
}
