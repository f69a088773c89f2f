use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde_json::{json, Map, Value};

use super::{
    base_headers, base_url, elapsed_ms, header_value, now_unix, put_opt, send, synthetic_id,
    u64_at, ProviderAdapter, WireRequest,
};
use crate::error::{GatewayError, Result};
use crate::models::{ChatResponse, Choice, Message, Provider, ProviderFamily, Usage};
use crate::validator::ValidatedParams;

const DEFAULT_BASE: &str = "http://localhost:11434";

/**
 * \brief Local Ollama daemon, `/api/chat`.
 */
pub struct OllamaAdapter;

fn headers(provider: &Provider) -> Result<reqwest::header::HeaderMap> {
    let mut headers = base_headers(provider)?;
    // only set when the daemon sits behind an authenticating proxy
    if let Some(key) = provider.api_key() {
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", key))?);
    }
    Ok(headers)
}

fn options(params: &ValidatedParams) -> Map<String, Value> {
    let mut options = Value::Object(Map::new());
    put_opt(&mut options, "temperature", &params.temperature);
    put_opt(&mut options, "num_predict", &params.max_tokens);
    put_opt(&mut options, "top_p", &params.top_p);
    put_opt(&mut options, "top_k", &params.top_k);
    put_opt(&mut options, "frequency_penalty", &params.frequency_penalty);
    put_opt(&mut options, "presence_penalty", &params.presence_penalty);
    put_opt(&mut options, "repeat_penalty", &params.repeat_penalty);
    put_opt(&mut options, "stop", &params.stop);
    match options {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Ollama
    }

    fn build_request(
        &self,
        provider: &Provider,
        model: &str,
        messages: &[Message],
        params: &ValidatedParams,
    ) -> Result<WireRequest> {
        let url = format!("{}/api/chat", base_url(provider, DEFAULT_BASE));
        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": params.stream.unwrap_or(false),
        });
        let options = options(params);
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }
        Ok(WireRequest::post(url, headers(provider)?, body))
    }

    fn normalize_response(
        &self,
        provider: &Provider,
        model: &str,
        body: Value,
        elapsed: Duration,
    ) -> Result<ChatResponse> {
        let content = body
            .pointer("/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| GatewayError::backend(&provider.name, None, "response has no message"))?;
        let usage = Usage::new(
            u64_at(&body, "/prompt_eval_count"),
            u64_at(&body, "/eval_count"),
        );
        let finish_reason = body
            .get("done_reason")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .or_else(|| {
                body.get("done")
                    .and_then(|d| d.as_bool())
                    .filter(|d| *d)
                    .map(|_| "stop".to_string())
            });
        Ok(ChatResponse {
            id: synthetic_id("ollama"),
            object: "chat.completion".to_string(),
            created: body
                .get("created_at")
                .and_then(|c| c.as_str())
                .and_then(|c| {
                    time::OffsetDateTime::parse(c, &time::format_description::well_known::Rfc3339)
                        .ok()
                })
                .map(|t| t.unix_timestamp())
                .unwrap_or_else(now_unix),
            model: body
                .get("model")
                .and_then(|m| m.as_str())
                .unwrap_or(model)
                .to_string(),
            provider: provider.name.clone(),
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(content),
                finish_reason,
            }],
            usage,
            response_time_ms: elapsed_ms(elapsed),
        })
    }

    /**
     * \brief Lists local models via `/api/tags`; needs no model.
     */
    async fn probe(
        &self,
        client: &Client,
        provider: &Provider,
        _model: Option<&str>,
    ) -> Result<String> {
        let url = format!("{}/api/tags", base_url(provider, DEFAULT_BASE));
        let tags = send(client, provider, WireRequest::get(url, headers(provider)?)).await?;
        let count = tags
            .get("models")
            .and_then(|m| m.as_array())
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(format!("{} local models available", count))
    }
}
