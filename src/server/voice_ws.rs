//! Real-time voice chat WebSocket endpoint.
//!
//! Full-duplex voice assistant: the client streams microphone audio (raw
//! PCM or a WebM/Ogg Opus container) and receives synthesized speech
//! interleaved with structured events. The receive loop owns all ingest
//! state; each turn runs as a background task so audio keeps flowing in
//! during TTS, which is what makes barge-in possible.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::sanitize_for_log;
use crate::server::protocol::{ClientMessage, Outbound, ServerMessage};
use crate::server::ServerState;
use crate::upstream::llm::{ChatMessage, LlmClient};
use crate::upstream::stt::SttClient;
use crate::upstream::tts::TtsStream;
use crate::voice::pipeline::VoicePipeline;
use crate::voice::session::{SessionConfig, VoiceSession, VoiceState};

/// Cap on user-provided system prompts.
const MAX_SYSTEM_PROMPT_LENGTH: usize = 10 * 1024;

/// WebSocket close code for policy violations (invalid parameters,
/// unsupported input).
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Query parameters of the voice chat handshake. Explicit values override
/// the gateway's configured defaults.
#[derive(Debug, Deserialize)]
pub struct VoiceChatParams {
    pub session_id: Option<String>,
    pub stt_model: Option<String>,
    pub tts_model: Option<String>,
    pub tts_voice: Option<String>,
    pub llm_model: Option<String>,
    pub language: Option<String>,
    pub speed: Option<f32>,
    pub system_prompt: Option<String>,
    pub sentence_boundary_only: Option<bool>,
}

/// Strip control characters (keeping newlines and tabs) and cap the length
/// of a user-provided system prompt.
fn sanitize_system_prompt(prompt: Option<&str>) -> Option<String> {
    let prompt = prompt?.trim();
    if prompt.is_empty() {
        return None;
    }

    let mut prompt: String = prompt
        .chars()
        .filter(|&c| c == '\n' || c == '\t' || (c >= ' ' && c != '\u{7f}'))
        .collect();

    if prompt.chars().count() > MAX_SYSTEM_PROMPT_LENGTH {
        warn!(
            len = prompt.len(),
            "system prompt truncated to {MAX_SYSTEM_PROMPT_LENGTH} chars"
        );
        prompt = prompt.chars().take(MAX_SYSTEM_PROMPT_LENGTH).collect();
    }

    let prompt = prompt.trim().to_string();
    if prompt.is_empty() {
        None
    } else {
        Some(prompt)
    }
}

pub async fn voice_chat_handler(
    ws: WebSocketUpgrade,
    Path((namespace, project)): Path<(String, String)>,
    Query(params): Query<VoiceChatParams>,
    State(state): State<ServerState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_voice_chat(socket, state, namespace, project, params))
}

/// Send a sanitized error and close with a policy-violation code. Used for
/// handshake-stage rejections, before the socket is split.
async fn reject(mut socket: WebSocket, message: String, reason: &'static str) {
    let frame = serde_json::to_string(&ServerMessage::Error { message }).unwrap_or_default();
    let _ = socket.send(Message::Text(frame.into())).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_voice_chat(
    socket: WebSocket,
    state: ServerState,
    namespace: String,
    project: String,
    params: VoiceChatParams,
) {
    // Effective configuration: gateway defaults overridden by query params.
    let mut session_config = SessionConfig::from_defaults(&state.config.voice);
    if let Some(v) = params.stt_model {
        session_config.stt_model = v;
    }
    if let Some(v) = params.tts_model {
        session_config.tts_model = v;
    }
    if let Some(v) = params.tts_voice {
        session_config.tts_voice = v;
    }
    if let Some(v) = params.language {
        session_config.language = v;
    }
    if let Some(v) = params.speed {
        session_config.speed = v.clamp(0.5, 2.0);
    }
    if let Some(v) = params.sentence_boundary_only {
        session_config.sentence_boundary_only = v;
    }
    if let Some(v) = params.llm_model {
        session_config.llm_model = v;
    }
    session_config.system_prompt = sanitize_system_prompt(params.system_prompt.as_deref());

    if session_config.llm_model.is_empty() {
        reject(
            socket,
            "llm_model is required (via query param or voice.llm_model in gateway config)"
                .to_string(),
            "Missing llm_model",
        )
        .await;
        return;
    }

    // Resolve the logical model and validate the TTS model against what the
    // runtime actually has loaded; a mismatch here beats a cryptic synthesis
    // failure mid-turn.
    let llm_config = state.registry.resolve_llm(&session_config.llm_model);

    let available_tts = state.registry.available_tts_models().await;
    if !available_tts.is_empty() && !available_tts.contains(&session_config.tts_model) {
        let message = format!(
            "TTS model '{}' is not loaded on the runtime. Available TTS models: {}.",
            session_config.tts_model,
            available_tts.join(", ")
        );
        warn!("{message}");
        reject(socket, message, "TTS model not available").await;
        return;
    }

    session_config.use_native_audio = state
        .registry
        .supports_native_audio(&llm_config.model, llm_config.base_url.as_deref())
        .await;

    let (session, created) = state
        .sessions
        .get_or_create(params.session_id.as_deref(), session_config)
        .await;

    // Prompt injection, first connection only: model-config prompts first,
    // then the sanitized query-parameter system prompt.
    if created && !session.has_messages() {
        for prompt in &llm_config.prompts {
            session.push_message(ChatMessage {
                role: prompt.role.clone(),
                content: serde_json::Value::String(prompt.content.clone()),
            });
        }
        if let Some(system_prompt) = session.config().system_prompt {
            session.push_message(ChatMessage::system(system_prompt));
        }
    }

    info!(
        session_id = %session.session_id,
        namespace = %namespace,
        project = %project,
        llm_model = %llm_config.name,
        llm_model_id = %llm_config.model,
        tts_model = %session.config().tts_model,
        tts_voice = %session.config().tts_voice,
        native_audio = session.config().use_native_audio,
        "voice chat session started"
    );

    // Single-writer outbound path: both the receive loop and the turn task
    // enqueue frames; one task owns the socket sink.
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(64);

    let sender_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let result = match message {
                Outbound::Json(m) => {
                    ws_tx
                        .send(Message::Text(
                            serde_json::to_string(&m).unwrap_or_default().into(),
                        ))
                        .await
                }
                Outbound::Binary(d) => ws_tx.send(Message::Binary(d.into())).await,
                Outbound::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    let _ = tx
        .send(Outbound::Json(ServerMessage::SessionInfo {
            session_id: session.session_id.clone(),
        }))
        .await;
    let _ = tx
        .send(Outbound::Json(ServerMessage::Status {
            state: session.state(),
        }))
        .await;

    let stt = SttClient::new(state.config.runtime.http_url(), state.config.runtime.ws_url());
    let llm = LlmClient::new(&llm_config, &state.config.runtime.llm_base_url());
    let tts = TtsStream::new(
        state.config.runtime.ws_url(),
        &session.config().tts_model,
        &session.config().tts_voice,
    );
    let pipeline = Arc::new(VoicePipeline::new(
        session.clone(),
        stt.clone(),
        llm,
        tts,
        tx.clone(),
    ));

    // Pre-warm upstream connections off the critical path.
    {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.warm_up().await });
    }

    let mut turn_task: Option<JoinHandle<()>> = None;
    let mut rejected = false;

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Binary(data) => {
                handle_audio_frame(
                    &data,
                    &session,
                    &pipeline,
                    &stt,
                    &tx,
                    &mut turn_task,
                    &mut rejected,
                )
                .await;
                if rejected {
                    break;
                }
            }
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Interrupt) => {
                    if let Some(task) = turn_task.take() {
                        task.abort();
                    }
                    pipeline.handle_interrupt().await;
                }
                Ok(ClientMessage::End) => {
                    // Account for any still-buffered encoded tail first.
                    session.flush_decoder().await;
                    if session.has_audio().await {
                        let audio = session.take_utterance().await;
                        turn_task = Some(spawn_turn(pipeline.clone(), audio));
                    }
                }
                Ok(ClientMessage::Config(update)) => {
                    session.update_config(update).await;
                    debug!(session_id = %session.session_id, "session config updated");
                }
                Err(e) => {
                    debug!("invalid client message: {e}");
                    let _ = tx
                        .send(Outbound::Json(ServerMessage::Error {
                            message: "Invalid JSON message".to_string(),
                        }))
                        .await;
                }
            },
            Message::Close(_) => {
                info!(session_id = %session.session_id, "client disconnected");
                break;
            }
            _ => {}
        }
    }

    // Session teardown: cancel in-flight work, close the TTS stream, say
    // goodbye if the socket is still up. The session itself is retained in
    // the store for reconnection.
    if let Some(task) = turn_task.take() {
        task.abort();
    }
    pipeline.cleanup().await;
    let _ = tx.send(Outbound::Json(ServerMessage::Closed)).await;
    drop(tx);
    drop(pipeline);
    let _ = tokio::time::timeout(Duration::from_secs(2), sender_task).await;

    info!(session_id = %session.session_id, "voice chat session ended");
}

/// Handle one binary audio frame according to the session state.
#[allow(clippy::too_many_arguments)]
async fn handle_audio_frame(
    data: &[u8],
    session: &Arc<VoiceSession>,
    pipeline: &Arc<VoicePipeline>,
    stt: &SttClient,
    tx: &mpsc::Sender<Outbound>,
    turn_task: &mut Option<JoinHandle<()>>,
    rejected: &mut bool,
) {
    match session.state() {
        // While the assistant speaks, audio feeds barge-in detection only.
        VoiceState::Speaking => {
            if session.detect_barge_in(data).await {
                info!(session_id = %session.session_id, "barge-in detected; interrupting");
                if let Some(task) = turn_task.take() {
                    task.abort();
                }
                pipeline.handle_interrupt().await;
            }
            return;
        }
        // The orchestrator is the sole consumer of the buffer while a turn
        // is being prepared; late audio is dropped.
        VoiceState::Processing => {
            debug!(bytes = data.len(), "discarding audio during processing");
            return;
        }
        VoiceState::Idle => {
            session.set_state(VoiceState::Listening);
            let _ = tx
                .send(Outbound::Json(ServerMessage::Status {
                    state: VoiceState::Listening,
                }))
                .await;
        }
        VoiceState::Listening | VoiceState::Interrupted => {}
    }

    let vad_ended = match session.append_audio(data).await {
        Ok(vad_ended) => vad_ended,
        Err(e) => {
            warn!(session_id = %session.session_id, "audio rejected: {e}");
            session.discard_audio().await;
            let _ = tx
                .send(Outbound::Json(ServerMessage::Error {
                    message: "Unsupported audio format. Send PCM, WebM/Opus, or Ogg/Opus."
                        .to_string(),
                }))
                .await;
            let _ = tx
                .send(Outbound::Close {
                    code: CLOSE_POLICY_VIOLATION,
                    reason: "Unsupported audio format".to_string(),
                })
                .await;
            *rejected = true;
            return;
        }
    };

    let config = session.config();
    let mut should_process = false;

    if config.turn_detection_enabled && session.is_in_silence_window().await {
        if config.use_native_audio {
            // No transcript to analyze; plain silence threshold.
            should_process = session.silence_duration().await >= config.base_silence_duration;
        } else {
            // Once the silence window is wide enough, run one partial STT
            // probe off the receive loop to feed the endpointing arbiter.
            if let Some(probe_audio) =
                session.begin_partial_probe(config.base_silence_duration).await
            {
                spawn_partial_probe(session.clone(), stt.clone(), probe_audio, config.clone());
            }
            should_process = session.check_end_of_turn().await;
        }
    } else if vad_ended {
        // Turn detection disabled: the VAD's fixed threshold decides.
        should_process = true;
    }

    if should_process && session.has_audio().await {
        let silence_secs = session.silence_duration().await;
        info!(
            session_id = %session.session_id,
            silence_secs = silence_secs,
            "end of turn detected; processing"
        );
        let audio = session.take_utterance().await;
        *turn_task = Some(spawn_turn(pipeline.clone(), audio));
    }
}

/// Run a turn as a background task so the receive loop keeps ingesting.
fn spawn_turn(pipeline: Arc<VoicePipeline>, audio: Vec<u8>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let native = pipeline.session().config().use_native_audio;
        if native {
            pipeline.process_turn_native_audio(audio).await;
        } else {
            pipeline.process_turn(audio).await;
        }
    })
}

/// One-shot transcription of the buffered audio, reporting back into the
/// session's partial transcript for end-of-turn analysis.
fn spawn_partial_probe(
    session: Arc<VoiceSession>,
    stt: SttClient,
    audio: Vec<u8>,
    config: SessionConfig,
) {
    tokio::spawn(async move {
        match stt.transcribe(&audio, &config.stt_model, &config.language).await {
            Ok(text) => {
                debug!(
                    session_id = %session.session_id,
                    "partial transcript for turn detection: {}",
                    sanitize_for_log(&text, 50)
                );
                session.set_partial_transcript(text).await;
            }
            Err(e) => {
                warn!("partial transcription failed: {e}");
                // Release the probe guard so a later chunk can retry.
                session.set_partial_transcript(String::new()).await;
            }
        }
    });
}
