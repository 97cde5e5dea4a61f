//! The per-turn orchestration pipeline: STT → LLM → phrase chunking → TTS.
//!
//! One pipeline exists per connection. Each turn runs as a background task
//! so the receive loop keeps ingesting audio (and detecting barge-in) while
//! TTS streams. The pipeline cooperatively observes the session's interrupt
//! flag before draining each LLM event and between relayed audio chunks;
//! hard cancellation (task abort plus closing the TTS stream) backs that up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use crate::audio::wav::pcm_to_wav;
use crate::sanitize_for_log;
use crate::server::protocol::{Outbound, ServerMessage};
use crate::upstream::llm::{
    encode_native_audio, inject_no_think, native_audio_message, ChatMessage, LlmClient, LlmEvent,
};
use crate::upstream::stt::SttClient;
use crate::upstream::tts::{TtsFrame, TtsStream};
use crate::voice::filters::{
    normalize_for_speech, strip_thinking_tags, TagFilter, ToolCallJsonFilter, MAX_TTS_TEXT_LENGTH,
};
use crate::voice::phrase::PhraseDetector;
use crate::voice::session::{SessionConfig, VoiceSession, VoiceState};

/// Wall-clock budget for streaming STT before falling back to one-shot.
const STT_STREAM_TIMEOUT: Duration = Duration::from_secs(2);

/// Characters of partial transcript that are enough to start the LLM.
const MIN_CHARS_FOR_LLM: usize = 5;

/// Spoken while a tool call is being dispatched.
const TOOL_CALL_PLACEHOLDER: &str = "One moment.";

const SANITIZED_TURN_ERROR: &str =
    "An error occurred while processing your request. Please try again.";

/// Latency milestones for one turn, logged at completion.
#[derive(Debug)]
struct TurnTiming {
    started: Instant,
    first_stt_segment: Option<Duration>,
    first_llm_token: Option<Duration>,
    first_phrase: Option<Duration>,
    first_audio: Option<Duration>,
}

impl TurnTiming {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            first_stt_segment: None,
            first_llm_token: None,
            first_phrase: None,
            first_audio: None,
        }
    }

    fn mark(slot: &mut Option<Duration>, started: Instant) {
        if slot.is_none() {
            *slot = Some(started.elapsed());
        }
    }

    fn log_summary(&self, native_audio: bool) {
        info!(
            total_ms = self.started.elapsed().as_millis() as u64,
            first_stt_segment_ms = self.first_stt_segment.map(|d| d.as_millis() as u64),
            first_llm_token_ms = self.first_llm_token.map(|d| d.as_millis() as u64),
            first_phrase_ms = self.first_phrase.map(|d| d.as_millis() as u64),
            first_audio_ms = self.first_audio.map(|d| d.as_millis() as u64),
            native_audio,
            "turn timing"
        );
    }
}

/// How a turn's LLM drive ended.
enum DriveOutcome {
    Completed,
    Interrupted,
    Failed,
}

/// Per-connection turn orchestrator.
pub struct VoicePipeline {
    session: Arc<VoiceSession>,
    stt: SttClient,
    llm: LlmClient,
    tts: AsyncMutex<TtsStream>,
    outbound: mpsc::Sender<Outbound>,
}

impl VoicePipeline {
    pub fn new(
        session: Arc<VoiceSession>,
        stt: SttClient,
        llm: LlmClient,
        tts: TtsStream,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            session,
            stt,
            llm,
            tts: AsyncMutex::new(tts),
            outbound,
        }
    }

    pub fn session(&self) -> &Arc<VoiceSession> {
        &self.session
    }

    async fn send_json(&self, message: ServerMessage) -> bool {
        self.outbound.send(Outbound::Json(message)).await.is_ok()
    }

    async fn send_binary(&self, audio: Vec<u8>) -> bool {
        self.outbound.send(Outbound::Binary(audio)).await.is_ok()
    }

    async fn send_status(&self, state: VoiceState) {
        self.session.set_state(state);
        // Report the state actually reached: a refused transition must not
        // leave the client believing otherwise.
        let state = self.session.state();
        self.send_json(ServerMessage::Status { state }).await;
    }

    /// Pre-establish upstream connections so the first turn skips connect
    /// latency. Failures are logged and otherwise ignored.
    pub async fn warm_up(&self) {
        let mut tts = self.tts.lock().await;
        if let Err(e) = tts.ensure_connected().await {
            warn!("TTS pre-warm failed (non-fatal): {e}");
        }
        // The shared HTTP client pool is built on first touch.
        let _ = crate::upstream::http_client();
    }

    /// Release upstream resources at session end. The shared HTTP client is
    /// process-wide and stays open.
    pub async fn cleanup(&self) {
        self.tts.lock().await.close().await;
    }

    /// Barge-in: flag the session, surface INTERRUPTED, drop the TTS stream
    /// (in-flight chunks of the cancelled phrase must not bleed into the
    /// next one), then return to LISTENING. The caller aborts the running
    /// turn task before invoking this.
    pub async fn handle_interrupt(&self) {
        self.session.request_interrupt();
        self.session.reset_barge_in().await;
        self.send_status(VoiceState::Interrupted).await;
        self.tts.lock().await.close().await;
        self.send_status(VoiceState::Listening).await;
    }

    /// Process one turn: transcribe, stream the LLM, synthesize phrase by
    /// phrase.
    pub async fn process_turn(&self, audio: Vec<u8>) {
        let mut timing = TurnTiming::new();
        self.session.clear_interrupt();
        self.session.reset_phrase_counter();
        self.send_status(VoiceState::Processing).await;

        let config = self.session.config();

        // Parallel STT kickoff: drain streaming segments only until there is
        // enough text to prompt the LLM, then break away. Dropping the
        // receiver tears the STT stream down; that early close is expected.
        let mut parts: Vec<String> = Vec::new();
        {
            let mut segments =
                self.stt
                    .transcribe_stream(audio.clone(), &config.stt_model, &config.language);
            let collect = async {
                while let Some(segment) = segments.recv().await {
                    TurnTiming::mark(&mut timing.first_stt_segment, timing.started);
                    parts.push(segment);
                    let current = parts.join(" ");
                    self.send_json(ServerMessage::Transcription {
                        text: current.clone(),
                        is_final: false,
                    })
                    .await;
                    if current.len() >= MIN_CHARS_FOR_LLM {
                        break;
                    }
                }
            };
            if tokio::time::timeout(STT_STREAM_TIMEOUT, collect).await.is_err() {
                debug!("streaming STT timed out; using collected segments");
            }
        }

        // Fallback: one-shot transcription when streaming produced nothing.
        if parts.is_empty() {
            match self.stt.transcribe(&audio, &config.stt_model, &config.language).await {
                Ok(text) => {
                    if !text.trim().is_empty() {
                        parts.push(text);
                    }
                }
                Err(e) => {
                    error!("transcription failed: {e}");
                    self.send_json(ServerMessage::Error {
                        message: SANITIZED_TURN_ERROR.to_string(),
                    })
                    .await;
                    self.send_status(VoiceState::Idle).await;
                    return;
                }
            }
        }

        let transcript = parts.join(" ").trim().to_string();
        if transcript.is_empty() {
            debug!("empty transcription; nothing to do");
            self.send_status(VoiceState::Idle).await;
            return;
        }

        self.send_json(ServerMessage::Transcription {
            text: transcript.clone(),
            is_final: true,
        })
        .await;

        self.session.push_message(ChatMessage::user(transcript));
        let mut messages = self.session.messages_snapshot();
        if !config.enable_thinking {
            inject_no_think(&mut messages);
        }

        self.send_status(VoiceState::Speaking).await;
        let outcome = self.drive_llm(messages, &config, false, &mut timing).await;

        timing.log_summary(false);
        if !matches!(outcome, DriveOutcome::Interrupted) {
            self.send_status(VoiceState::Idle).await;
        }
    }

    /// Process one turn by sending the audio directly to a native-audio LLM.
    /// No STT request is made; the model's `<input>` echo is captured for
    /// diagnostics and never spoken.
    pub async fn process_turn_native_audio(&self, audio: Vec<u8>) {
        let mut timing = TurnTiming::new();
        self.session.clear_interrupt();
        self.session.reset_phrase_counter();
        self.send_status(VoiceState::Processing).await;

        let config = self.session.config();

        let encoded = pcm_to_wav(&audio, 16_000)
            .map_err(|e| e.to_string())
            .and_then(|wav| encode_native_audio(&wav).map_err(|e| e.to_string()));
        let wav_base64 = match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("native audio rejected: {e}");
                self.send_json(ServerMessage::Error {
                    message: "Audio message is too large. Please use shorter clips.".to_string(),
                })
                .await;
                self.send_status(VoiceState::Idle).await;
                return;
            }
        };

        self.send_json(ServerMessage::Transcription {
            text: "[Native audio - asking model what it heard]".to_string(),
            is_final: true,
        })
        .await;

        // History keeps a placeholder; the payload goes only upstream.
        self.session.push_message(ChatMessage::user("[Audio message]"));
        let mut messages = self.session.messages_snapshot();
        messages.pop();
        messages.push(native_audio_message(&wav_base64));
        if !config.enable_thinking {
            inject_no_think(&mut messages);
        }

        self.send_status(VoiceState::Speaking).await;
        let outcome = self.drive_llm(messages, &config, true, &mut timing).await;

        timing.log_summary(true);
        if !matches!(outcome, DriveOutcome::Interrupted) {
            self.send_status(VoiceState::Idle).await;
        }
    }

    /// Drive the LLM stream through the filter chain and phrase detector,
    /// synthesizing each emitted phrase.
    async fn drive_llm(
        &self,
        messages: Vec<ChatMessage>,
        config: &SessionConfig,
        capture_input_echo: bool,
        timing: &mut TurnTiming,
    ) -> DriveOutcome {
        let mut events = self.llm.stream_chat(messages);

        let mut thinking_filter = TagFilter::thinking();
        let mut input_filter = capture_input_echo.then(|| TagFilter::new("input", true));
        let mut tool_filter = ToolCallJsonFilter::new();
        let mut phrases = PhraseDetector::new(config.sentence_boundary_only);

        let mut full_response = String::new();
        let mut placeholder_spoken = false;
        let mut outcome = DriveOutcome::Completed;

        while let Some(event) = events.recv().await {
            if self.session.is_interrupted() {
                info!("turn interrupted");
                outcome = DriveOutcome::Interrupted;
                break;
            }

            match event {
                LlmEvent::Error(e) => {
                    error!("LLM stream failed: {e}");
                    self.send_json(ServerMessage::Error {
                        message: SANITIZED_TURN_ERROR.to_string(),
                    })
                    .await;
                    outcome = DriveOutcome::Failed;
                    break;
                }
                LlmEvent::ToolCall(tc) => {
                    self.send_json(ServerMessage::ToolCall {
                        tool_call_id: tc.id,
                        function_name: tc.name,
                        arguments: tc.arguments,
                    })
                    .await;
                    if config.speak_tool_placeholder && !placeholder_spoken {
                        self.speak_placeholder(config, timing).await;
                        placeholder_spoken = true;
                    }
                }
                LlmEvent::Content(token) => {
                    TurnTiming::mark(&mut timing.first_llm_token, timing.started);
                    full_response.push_str(&token);

                    let mut filtered = thinking_filter.filter_token(&token);
                    if filtered.is_empty() {
                        continue;
                    }
                    if let Some(filter) = input_filter.as_mut() {
                        filtered = filter.filter_token(&filtered);
                        if filtered.is_empty() {
                            continue;
                        }
                    }
                    let filtered = tool_filter.filter_token(&filtered);

                    // Inline tool-call JSON also warrants the placeholder.
                    if config.speak_tool_placeholder
                        && !placeholder_spoken
                        && !tool_filter.detected_tool_calls().is_empty()
                    {
                        self.speak_placeholder(config, timing).await;
                        placeholder_spoken = true;
                    }

                    if filtered.is_empty() {
                        continue;
                    }

                    if let Some(phrase) = phrases.add_token(&filtered) {
                        TurnTiming::mark(&mut timing.first_phrase, timing.started);
                        self.send_json(ServerMessage::LlmText {
                            text: phrase.clone(),
                            is_final: false,
                        })
                        .await;
                        self.speak_phrase(&phrase, config, timing).await;

                        if self.session.is_interrupted() {
                            outcome = DriveOutcome::Interrupted;
                            break;
                        }
                    }
                }
            }
        }

        if matches!(outcome, DriveOutcome::Completed) {
            // Flush the filter chain in order, then the phrase detector.
            let mut remaining = thinking_filter.flush();
            if let Some(filter) = input_filter.as_mut() {
                if !remaining.is_empty() {
                    remaining = filter.filter_token(&remaining);
                }
                // Anything still buffered in the input filter is captured
                // content, retrieved below.
                let _ = filter.flush();
            }
            if !remaining.is_empty() {
                remaining = tool_filter.filter_token(&remaining);
            }
            remaining.push_str(&tool_filter.flush());

            if !remaining.is_empty() {
                if let Some(phrase) = phrases.add_token(&remaining) {
                    self.send_json(ServerMessage::LlmText {
                        text: phrase.clone(),
                        is_final: false,
                    })
                    .await;
                    self.speak_phrase(&phrase, config, timing).await;
                }
            }

            if let Some(last) = phrases.flush() {
                self.send_json(ServerMessage::LlmText {
                    text: last.clone(),
                    is_final: true,
                })
                .await;
                self.speak_phrase(&last, config, timing).await;
            } else {
                // Always signal response completion, even with no trailing
                // phrase.
                self.send_json(ServerMessage::LlmText {
                    text: String::new(),
                    is_final: true,
                })
                .await;
            }
        }

        // History stores the thinking-stripped response.
        let clean = strip_thinking_tags(&full_response).trim().to_string();
        if !clean.is_empty() {
            self.session.push_message(ChatMessage::assistant(clean));
        }

        if let Some(filter) = input_filter {
            let heard = filter.captured();
            if heard.is_empty() {
                debug!("native audio response carried no <input> echo");
            } else {
                info!("model heard: {}", sanitize_for_log(&heard, 50));
                self.send_json(ServerMessage::Transcription {
                    text: format!("[Model heard: {heard}]"),
                    is_final: true,
                })
                .await;
            }
        }

        outcome
    }

    async fn speak_placeholder(&self, config: &SessionConfig, timing: &mut TurnTiming) {
        self.send_json(ServerMessage::LlmText {
            text: TOOL_CALL_PLACEHOLDER.to_string(),
            is_final: false,
        })
        .await;
        self.speak_phrase(TOOL_CALL_PLACEHOLDER, config, timing).await;
    }

    /// Synthesize one phrase and relay its audio, honoring interrupts
    /// between chunks.
    async fn speak_phrase(&self, phrase: &str, config: &SessionConfig, timing: &mut TurnTiming) {
        let mut phrase = phrase.to_string();
        if phrase.chars().count() > MAX_TTS_TEXT_LENGTH {
            warn!(len = phrase.len(), "TTS phrase truncated");
            phrase = phrase.chars().take(MAX_TTS_TEXT_LENGTH).collect();
        }

        // Belt and braces: thinking content must never reach TTS even if a
        // fragment slipped past the streaming filter.
        let phrase = strip_thinking_tags(&phrase);
        let phrase = normalize_for_speech(&phrase);
        if phrase.is_empty() {
            return;
        }

        info!("TTS input: {}", sanitize_for_log(&phrase, 50));

        let phrase_index = self.session.next_phrase_index();
        self.send_json(ServerMessage::TtsStart { phrase_index }).await;

        let mut total_samples = 0usize;
        {
            let mut tts = self.tts.lock().await;
            tts.set_voice(&config.tts_model, &config.tts_voice);

            match tts.send_phrase(&phrase, config.speed).await {
                Err(e) => {
                    // The phrase is skipped; the stream reopens lazily on the
                    // next one.
                    warn!(phrase_index, "TTS send failed: {e}");
                }
                Ok(()) => loop {
                    match tts.next_frame().await {
                        TtsFrame::Audio(chunk) => {
                            if self.session.is_interrupted() {
                                break;
                            }
                            TurnTiming::mark(&mut timing.first_audio, timing.started);
                            total_samples += chunk.len() / 2;
                            if !self.send_binary(chunk).await {
                                break;
                            }
                        }
                        TtsFrame::Done => break,
                        TtsFrame::Error(e) => {
                            warn!(phrase_index, "TTS error mid-phrase: {e}");
                            break;
                        }
                        TtsFrame::Closed => {
                            debug!(phrase_index, "TTS stream closed mid-phrase");
                            break;
                        }
                    }
                },
            }
        }

        // s16le mono at 24 kHz on the TTS side.
        let duration = total_samples as f64 / 24_000.0;
        self.send_json(ServerMessage::TtsDone {
            phrase_index,
            duration,
        })
        .await;
    }
}
