//! Gateway configuration.
//!
//! Loaded from TOML (explicit path, `voicegate.toml` in the working
//! directory, or the user config directory), with serde defaults for every
//! field so an empty file is a valid configuration. The `[models]` table
//! maps logical LLM names to resolved model ids, base URLs, API overrides,
//! and prompts; it is the gateway's stand-in for an external project
//! service.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub voice: VoiceDefaults,
    /// Logical model name → resolved model configuration.
    #[serde(default)]
    pub models: HashMap<String, ModelEntry>,
}

/// Bind address and session limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Session store capacity; the least-recently-used session is evicted
    /// beyond this.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_max_sessions() -> usize {
    100
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// Where the inference runtime (STT/TTS, default LLM endpoint) lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_runtime_host")]
    pub host: String,
    #[serde(default = "default_runtime_port")]
    pub port: u16,
}

fn default_runtime_host() -> String {
    "127.0.0.1".to_string()
}

fn default_runtime_port() -> u16 {
    8000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host: default_runtime_host(),
            port: default_runtime_port(),
        }
    }
}

impl RuntimeConfig {
    pub fn http_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    /// Default LLM endpoint when a model entry pins no base URL.
    pub fn llm_base_url(&self) -> String {
        format!("{}/v1", self.http_url())
    }
}

/// Voice session defaults; query parameters and `config` frames override
/// these per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceDefaults {
    #[serde(default = "default_stt_model")]
    pub stt_model: String,
    #[serde(default = "default_tts_model")]
    pub tts_model: String,
    #[serde(default = "default_tts_voice")]
    pub tts_voice: String,
    /// Logical LLM model; required at session start when no query parameter
    /// supplies one.
    #[serde(default)]
    pub llm_model: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_speed")]
    pub speed: f32,
    #[serde(default)]
    pub enable_thinking: bool,
    #[serde(default = "default_true")]
    pub sentence_boundary_only: bool,
    #[serde(default = "default_true")]
    pub turn_detection_enabled: bool,
    #[serde(default = "default_base_silence")]
    pub base_silence_duration: f32,
    #[serde(default = "default_thinking_silence")]
    pub thinking_silence_duration: f32,
    #[serde(default = "default_max_silence")]
    pub max_silence_duration: f32,
    #[serde(default = "default_true")]
    pub barge_in_enabled: bool,
    #[serde(default = "default_true")]
    pub barge_in_noise_filter: bool,
    #[serde(default = "default_barge_in_min_chunks")]
    pub barge_in_min_chunks: u32,
    /// Speak a brief placeholder ("One moment.") the first time a turn
    /// produces a tool call.
    #[serde(default = "default_true")]
    pub speak_tool_placeholder: bool,
}

fn default_stt_model() -> String {
    "base".to_string()
}

fn default_tts_model() -> String {
    "kokoro".to_string()
}

fn default_tts_voice() -> String {
    "af_heart".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

// Slightly slower than unity for more natural speech.
fn default_speed() -> f32 {
    0.95
}

fn default_true() -> bool {
    true
}

fn default_base_silence() -> f32 {
    0.4
}

fn default_thinking_silence() -> f32 {
    1.2
}

fn default_max_silence() -> f32 {
    2.5
}

fn default_barge_in_min_chunks() -> u32 {
    2
}

impl Default for VoiceDefaults {
    fn default() -> Self {
        Self {
            stt_model: default_stt_model(),
            tts_model: default_tts_model(),
            tts_voice: default_tts_voice(),
            llm_model: None,
            language: default_language(),
            speed: default_speed(),
            enable_thinking: false,
            sentence_boundary_only: true,
            turn_detection_enabled: true,
            base_silence_duration: default_base_silence(),
            thinking_silence_duration: default_thinking_silence(),
            max_silence_duration: default_max_silence(),
            barge_in_enabled: true,
            barge_in_noise_filter: true,
            barge_in_min_chunks: default_barge_in_min_chunks(),
            speak_tool_placeholder: true,
        }
    }
}

/// One entry in the `[models]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Concrete model id sent upstream.
    pub model: String,
    /// Override chat-completions base URL (e.g. `http://host:8080/v1`).
    #[serde(default)]
    pub base_url: Option<String>,
    /// Request overrides merged into every completion payload.
    #[serde(default)]
    pub api_parameters: Option<serde_json::Map<String, Value>>,
    /// Prompts prepended on a session's first connection.
    #[serde(default)]
    pub prompts: Vec<PromptEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptEntry {
    pub role: String,
    pub content: String,
}

impl Config {
    /// Load configuration from an explicit path, or search the default
    /// locations. When no file exists, the built-in defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let candidate = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_paths().into_iter().find(|p| p.exists()),
        };

        let Some(path) = candidate else {
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("voicegate.toml")];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("voicegate").join("config.toml"));
        }
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8765);
        assert_eq!(config.server.max_sessions, 100);
        assert_eq!(config.voice.tts_model, "kokoro");
        assert!(config.voice.sentence_boundary_only);
        assert!(!config.voice.enable_thinking);
        assert_eq!(config.runtime.llm_base_url(), "http://127.0.0.1:8000/v1");
    }

    #[test]
    fn test_parse_model_table() {
        let raw = r#"
            [server]
            port = 9000

            [voice]
            llm_model = "conversational"
            speed = 1.2

            [models.conversational]
            model = "unsloth/Qwen3-4B-GGUF:Q4_K_M"
            base_url = "http://10.0.0.2:8080/v1"

            [[models.conversational.prompts]]
            role = "system"
            content = "You are a concise voice assistant."
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.voice.llm_model.as_deref(), Some("conversational"));
        let entry = &config.models["conversational"];
        assert_eq!(entry.model, "unsloth/Qwen3-4B-GGUF:Q4_K_M");
        assert_eq!(entry.prompts.len(), 1);
        // Untouched fields keep their defaults
        assert_eq!(config.voice.tts_voice, "af_heart");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[runtime]\nhost = \"10.1.1.1\"\nport = 9100").unwrap();
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.runtime.http_url(), "http://10.1.1.1:9100");
        assert_eq!(config.runtime.ws_url(), "ws://10.1.1.1:9100");
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/voicegate.toml"))).is_err());
    }
}
