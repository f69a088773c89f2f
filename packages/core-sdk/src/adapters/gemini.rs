use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};

use super::{
    base_headers, base_url, completion_probe, elapsed_ms, join_text_parts, now_unix, synthetic_id,
    ProviderAdapter, WireRequest,
};
use crate::error::{GatewayError, Result};
use crate::models::{ChatResponse, Choice, Message, Provider, ProviderFamily, Role, Usage};
use crate::validator::ValidatedParams;

const DEFAULT_BASE: &str = "https://generativelanguage.googleapis.com";

/**
 * \brief Google Gemini `generateContent`. The key travels as the `key` query parameter.
 */
pub struct GeminiAdapter;

fn normalize_gemini_base(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    if trimmed.ends_with("/v1")
        || trimmed.ends_with("/v1beta")
        || trimmed.contains("/v1/")
        || trimmed.contains("/v1beta/")
    {
        trimmed.to_string()
    } else {
        format!("{}/v1beta", trimmed)
    }
}

/**
 * \brief Folds the conversation into one prompt: system text first, then the
 * transcript. A lone user turn is sent as-is.
 */
pub(crate) fn synthesize_prompt(messages: &[Message]) -> String {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let turns: Vec<&Message> = messages.iter().filter(|m| m.role != Role::System).collect();

    let transcript = match turns.as_slice() {
        [only] if only.role == Role::User => only.content.clone(),
        _ => turns
            .iter()
            .map(|m| match m.role {
                Role::Assistant => format!("Assistant: {}", m.content),
                _ => format!("User: {}", m.content),
            })
            .collect::<Vec<_>>()
            .join("\n"),
    };
    if system.is_empty() {
        transcript
    } else {
        format!("{}\n\n{}", system.join("\n\n"), transcript)
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Gemini
    }

    fn build_request(
        &self,
        provider: &Provider,
        model: &str,
        messages: &[Message],
        params: &ValidatedParams,
    ) -> Result<WireRequest> {
        let base = normalize_gemini_base(base_url(provider, DEFAULT_BASE));
        let url = format!("{}/models/{}:generateContent", base, model);

        let mut config = Map::new();
        if let Some(v) = params.temperature {
            config.insert("temperature".into(), json!(v));
        }
        if let Some(v) = params.max_tokens {
            config.insert("maxOutputTokens".into(), json!(v));
        }
        if let Some(v) = params.top_p {
            config.insert("topP".into(), json!(v));
        }
        if let Some(v) = params.top_k {
            config.insert("topK".into(), json!(v));
        }
        if let Some(v) = &params.stop {
            config.insert("stopSequences".into(), json!(v));
        }

        let mut body = json!({
            "contents": [{
                "role": "user",
                "parts": [{"text": synthesize_prompt(messages)}]
            }]
        });
        if !config.is_empty() {
            body["generationConfig"] = Value::Object(config);
        }

        let mut wire = WireRequest::post(url, base_headers(provider)?, body);
        if let Some(key) = provider.api_key() {
            wire.query.push(("key".to_string(), key.to_string()));
        }
        Ok(wire)
    }

    /**
     * \brief Usage is reported as zero; token counts are not read from Gemini.
     */
    fn normalize_response(
        &self,
        provider: &Provider,
        model: &str,
        body: Value,
        elapsed: Duration,
    ) -> Result<ChatResponse> {
        let candidates = body
            .get("candidates")
            .and_then(|c| c.as_array())
            .ok_or_else(|| {
                GatewayError::backend(&provider.name, None, "response has no candidates")
            })?;
        let choices = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| Choice {
                index: i as u32,
                message: Message::assistant(join_text_parts(c.pointer("/content/parts"))),
                finish_reason: c
                    .get("finishReason")
                    .and_then(|f| f.as_str())
                    .map(|f| f.to_ascii_lowercase()),
            })
            .collect();
        Ok(ChatResponse {
            id: synthetic_id("gemini"),
            object: "chat.completion".to_string(),
            created: now_unix(),
            model: body
                .get("modelVersion")
                .and_then(|m| m.as_str())
                .unwrap_or(model)
                .to_string(),
            provider: provider.name.clone(),
            choices,
            usage: Usage::default(),
            response_time_ms: elapsed_ms(elapsed),
        })
    }

    async fn probe(
        &self,
        client: &Client,
        provider: &Provider,
        model: Option<&str>,
    ) -> Result<String> {
        completion_probe(self, client, provider, model).await
    }
}
