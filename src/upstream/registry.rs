//! Model resolution and runtime capability probing.
//!
//! Logical LLM names (what clients and project configs use) are resolved to
//! concrete model ids, base URLs, and API overrides from the gateway's model
//! table. The registry also answers two questions about the runtime, both
//! cached: which TTS models are actually loaded, and whether a given LLM
//! accepts audio natively.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::http_client;
use crate::config::ModelEntry;

/// How long the TTS model list stays fresh.
const TTS_CACHE_TTL_SECS: i64 = 60;

/// A prompt message injected for a model on session start.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

/// Resolved LLM configuration for one session.
#[derive(Debug, Clone)]
pub struct LlmModelConfig {
    /// Logical name the client asked for.
    pub name: String,
    /// Concrete model id sent upstream.
    pub model: String,
    /// Override base URL; the runtime default applies when absent.
    pub base_url: Option<String>,
    /// Model-specific request overrides merged into the payload.
    pub api_parameters: Option<serde_json::Map<String, Value>>,
    /// Prompts to prepend on first connection.
    pub prompts: Vec<PromptMessage>,
}

#[derive(Debug, Default)]
struct TtsModelCache {
    models: Vec<String>,
    fetched_at: Option<DateTime<Utc>>,
}

/// Registry over the configured model table and the runtime's metadata
/// endpoints.
pub struct ModelRegistry {
    runtime_url: String,
    models: HashMap<String, ModelEntry>,
    tts_cache: Mutex<TtsModelCache>,
    capability_cache: Mutex<HashMap<String, bool>>,
}

impl ModelRegistry {
    pub fn new(runtime_url: impl Into<String>, models: HashMap<String, ModelEntry>) -> Self {
        Self {
            runtime_url: runtime_url.into(),
            models,
            tts_cache: Mutex::new(TtsModelCache::default()),
            capability_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a logical LLM name. Names missing from the table pass through
    /// as literal model ids against the runtime default endpoint, so ad-hoc
    /// models work without a config entry.
    pub fn resolve_llm(&self, name: &str) -> LlmModelConfig {
        if let Some(entry) = self.models.get(name) {
            debug!(name, model = %entry.model, "resolved LLM model from table");
            return LlmModelConfig {
                name: name.to_string(),
                model: entry.model.clone(),
                base_url: entry.base_url.clone(),
                api_parameters: entry.api_parameters.clone(),
                prompts: entry
                    .prompts
                    .iter()
                    .map(|p| PromptMessage {
                        role: p.role.clone(),
                        content: p.content.clone(),
                    })
                    .collect(),
            };
        }

        debug!(name, "LLM model not in table; using name as model id");
        LlmModelConfig {
            name: name.to_string(),
            model: name.to_string(),
            base_url: None,
            api_parameters: None,
            prompts: Vec::new(),
        }
    }

    /// TTS models loaded on the runtime, from `GET /v1/models` filtered to
    /// `type == "tts"` with ids shaped `tts:<model>:<voice>`. Cached for
    /// [`TTS_CACHE_TTL_SECS`]; a stale list is returned when the query fails.
    pub async fn available_tts_models(&self) -> Vec<String> {
        let mut cache = self.tts_cache.lock().await;

        if let Some(fetched_at) = cache.fetched_at {
            if Utc::now() - fetched_at < ChronoDuration::seconds(TTS_CACHE_TTL_SECS)
                && !cache.models.is_empty()
            {
                return cache.models.clone();
            }
        }

        let url = format!("{}/v1/models", self.runtime_url);
        let response = match http_client().get(&url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(status = %response.status(), "TTS model query failed; using stale cache");
                return cache.models.clone();
            }
            Err(e) => {
                debug!("TTS model query failed: {e}; using stale cache");
                return cache.models.clone();
            }
        };

        let Ok(body) = response.json::<Value>().await else {
            return cache.models.clone();
        };

        let mut models: Vec<String> = body
            .get("data")
            .and_then(|d| d.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter(|m| m.get("type").and_then(|t| t.as_str()) == Some("tts"))
                    .filter_map(|m| m.get("id").and_then(|id| id.as_str()))
                    .filter_map(parse_tts_model_id)
                    .collect()
            })
            .unwrap_or_default();
        models.sort();
        models.dedup();

        debug!(?models, "available TTS models refreshed");
        cache.models = models.clone();
        cache.fetched_at = Some(Utc::now());
        models
    }

    /// Whether a model accepts audio input directly. The runtime's
    /// capabilities endpoint is authoritative; when it is unreachable the
    /// model name is consulted as a heuristic. Results are cached for the
    /// process lifetime.
    pub async fn supports_native_audio(&self, model_id: &str, base_url: Option<&str>) -> bool {
        {
            let cache = self.capability_cache.lock().await;
            if let Some(native) = cache.get(model_id) {
                return *native;
            }
        }

        let runtime = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| self.runtime_url.clone());
        let url = format!("{runtime}/v1/models/{model_id}/capabilities");

        let probed = match http_client().get(&url).send().await {
            Ok(response) if response.status().is_success() => response
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| {
                    body.get("capabilities")
                        .and_then(|c| c.get("native_audio"))
                        .and_then(|n| n.as_bool())
                }),
            Ok(response) => {
                debug!(status = %response.status(), "capabilities query failed");
                None
            }
            Err(e) => {
                debug!("capabilities query failed: {e}");
                None
            }
        };

        let native = match probed {
            Some(native) => {
                self.capability_cache
                    .lock()
                    .await
                    .insert(model_id.to_string(), native);
                native
            }
            // Heuristic fallback: omni-family models take audio directly.
            None => model_id.to_lowercase().contains("omni"),
        };

        if native {
            info!(model_id, "model supports native audio input");
        }
        native
    }
}

/// Extract the model name from a `tts:<model>:<voice>` id.
fn parse_tts_model_id(id: &str) -> Option<String> {
    let mut parts = id.split(':');
    if parts.next() != Some("tts") {
        return None;
    }
    parts.next().map(|m| m.to_string())
}
