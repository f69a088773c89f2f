use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;

/**
 * \brief Backend family a provider speaks. Resolved from the provider name.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderFamily {
    #[serde(rename = "openai-compatible")]
    OpenAiCompatible,
    Gemini,
    Ollama,
    Anthropic,
}

impl ProviderFamily {
    /**
     * \brief Family lookup keyed on the provider name; unknown names are OpenAI-compatible.
     */
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => ProviderFamily::Anthropic,
            "gemini" | "google" => ProviderFamily::Gemini,
            "ollama" => ProviderFamily::Ollama,
            _ => ProviderFamily::OpenAiCompatible,
        }
    }

    /** \brief Cloud families refuse to dispatch without an API key. */
    pub fn requires_api_key(self) -> bool {
        !matches!(self, ProviderFamily::Ollama)
    }
}

impl fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderFamily::OpenAiCompatible => "openai-compatible",
            ProviderFamily::Gemini => "gemini",
            ProviderFamily::Ollama => "ollama",
            ProviderFamily::Anthropic => "anthropic",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "healthy" => HealthStatus::Healthy,
            "unhealthy" => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCapabilities {
    pub supports_streaming: bool,
    pub supports_vision: bool,
    pub supports_function_calling: bool,
    pub supports_json_mode: bool,
    pub supports_system_message: bool,
}

/**
 * \brief Provider-level generation defaults. Descriptive only, never injected into requests.
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationDefaults {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
}

/**
 * \brief Timeout and retry/rate-limit declarations. Only `timeout_ms` is consulted by dispatch.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPolicy {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub rate_limit_rpm: Option<u32>,
    pub rate_limit_tpm: Option<u32>,
    pub concurrency_limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_check: Option<OffsetDateTime>,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub average_latency_ms: Option<f64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageCounters {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub total_errors: u64,
}

/**
 * \brief A configured LLM backend.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub id: i64,
    /** \brief Unique registry name; also selects the adapter family. */
    pub name: String,
    pub display_name: String,
    pub family: ProviderFamily,
    pub is_enabled: bool,
    pub is_default: bool,
    pub priority: i64,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub organization_id: Option<String>,
    pub project_id: Option<String>,
    pub custom_headers: BTreeMap<String, String>,
    pub defaults: GenerationDefaults,
    pub policy: RequestPolicy,
    pub capabilities: ProviderCapabilities,
    pub health: ProviderHealth,
    pub usage: UsageCounters,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Provider {
    /** \brief Stored API key, treating an empty string as absent. */
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }
}

/**
 * \brief A completion model registered under a provider.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: i64,
    pub provider_id: i64,
    /** \brief Identifier sent on the wire, e.g. `gpt-4o`. */
    pub model_id: String,
    pub name: String,
    pub description: Option<String>,
    pub is_enabled: bool,
    pub is_default: bool,
    pub context_length: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub default_temperature: Option<f64>,
    pub default_max_tokens: Option<u32>,
    pub default_top_p: Option<f64>,
    pub default_top_k: Option<u32>,
    pub stop_sequences: Vec<String>,
    pub supports_vision: Option<bool>,
    pub supports_function_calling: Option<bool>,
    pub supports_json_mode: Option<bool>,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/**
 * \brief Deserializes a present field (including `null`) as `Some`, so that
 * `Option<Option<T>>` can tell "absent" from "clear".
 */
pub fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/**
 * \brief Provider creation input. Unset fields fall back to the family defaults table.
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInput {
    pub name: String,
    pub display_name: Option<String>,
    pub is_enabled: Option<bool>,
    pub is_default: Option<bool>,
    pub priority: Option<i64>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub organization_id: Option<String>,
    pub project_id: Option<String>,
    pub custom_headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub defaults: GenerationDefaults,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub rate_limit_rpm: Option<u32>,
    pub rate_limit_tpm: Option<u32>,
    pub concurrency_limit: Option<u32>,
    pub supports_streaming: Option<bool>,
    pub supports_vision: Option<bool>,
    pub supports_function_calling: Option<bool>,
    pub supports_json_mode: Option<bool>,
    pub supports_system_message: Option<bool>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ProviderInput {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/**
 * \brief Partial provider update. Outer `None` leaves a field untouched; for
 * nullable fields `Some(None)` clears it.
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPatch {
    pub display_name: Option<String>,
    pub is_enabled: Option<bool>,
    pub is_default: Option<bool>,
    pub priority: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub base_url: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub api_key: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub organization_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub project_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub custom_headers: Option<Option<BTreeMap<String, String>>>,
    #[serde(default)]
    pub defaults: GenerationDefaultsPatch,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub rate_limit_rpm: Option<Option<u32>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub rate_limit_tpm: Option<Option<u32>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub concurrency_limit: Option<Option<u32>>,
    pub supports_streaming: Option<bool>,
    pub supports_vision: Option<bool>,
    pub supports_function_calling: Option<bool>,
    pub supports_json_mode: Option<bool>,
    pub supports_system_message: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub metadata: Option<Option<serde_json::Map<String, serde_json::Value>>>,
}

/**
 * \brief Partial update of [`GenerationDefaults`], nested under `defaults` like
 * the creation input. `null` clears a value.
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationDefaultsPatch {
    #[serde(default, deserialize_with = "deserialize_some")]
    pub temperature: Option<Option<f64>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub max_tokens: Option<Option<u32>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub top_p: Option<Option<f64>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub top_k: Option<Option<u32>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub frequency_penalty: Option<Option<f64>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub presence_penalty: Option<Option<f64>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInput {
    #[serde(default)]
    pub provider_id: i64,
    pub model_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_enabled: Option<bool>,
    pub is_default: Option<bool>,
    pub context_length: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub default_temperature: Option<f64>,
    pub default_max_tokens: Option<u32>,
    pub default_top_p: Option<f64>,
    pub default_top_k: Option<u32>,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    pub supports_vision: Option<bool>,
    pub supports_function_calling: Option<bool>,
    pub supports_json_mode: Option<bool>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPatch {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub description: Option<Option<String>>,
    pub is_enabled: Option<bool>,
    pub is_default: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub context_length: Option<Option<u32>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub max_output_tokens: Option<Option<u32>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub default_temperature: Option<Option<f64>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub default_max_tokens: Option<Option<u32>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub default_top_p: Option<Option<f64>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub default_top_k: Option<Option<u32>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub stop_sequences: Option<Option<Vec<String>>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub supports_vision: Option<Option<bool>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub supports_function_calling: Option<Option<bool>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub supports_json_mode: Option<Option<bool>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub metadata: Option<Option<serde_json::Map<String, serde_json::Value>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/**
 * \brief Chat message, aligned with the OpenAI chat message shape.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/**
 * \brief Inbound completion request. Every generation parameter is optional and
 * only forwarded when set.
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /** \brief Provider name or id; the default provider when absent. */
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub repeat_penalty: Option<f64>,
    pub stop: Option<Vec<String>>,
    pub stream: Option<bool>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: Option<String>,
}

/**
 * \brief Normalized completion, identical in shape for every backend family.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub id: String,
    pub object: String,
    /** \brief Unix seconds. */
    pub created: i64,
    pub model: String,
    pub provider: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
    pub response_time_ms: u64,
}

impl ChatResponse {
    /** \brief Text of the first choice, empty when the backend returned none. */
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("")
    }
}

/**
 * \brief Outcome of a provider probe.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub success: bool,
    pub message: String,
    pub latency_ms: Option<u64>,
}

impl HealthCheckResult {
    pub fn ok(message: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            success: true,
            message: message.into(),
            latency_ms: Some(latency_ms),
        }
    }

    pub fn failed(message: impl Into<String>, latency_ms: Option<u64>) -> Self {
        Self {
            success: false,
            message: message.into(),
            latency_ms,
        }
    }
}
