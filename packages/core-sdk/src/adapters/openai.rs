use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde_json::{json, Value};

use super::{
    base_headers, base_url, completion_probe, elapsed_ms, header_value, now_unix, put_opt, send,
    synthetic_id, u64_at, ProviderAdapter, WireRequest,
};
use crate::error::{GatewayError, Result};
use crate::models::{
    ChatResponse, Choice, Message, Provider, ProviderFamily, Role, Usage,
};
use crate::validator::{is_reasoning_model, ValidatedParams};

const DEFAULT_BASE: &str = "https://api.openai.com/v1";

/**
 * \brief OpenAI chat-completions protocol, shared by every OpenAI-compatible backend.
 */
pub struct OpenAiAdapter;

fn auth_headers(provider: &Provider) -> Result<reqwest::header::HeaderMap> {
    let mut headers = base_headers(provider)?;
    if let Some(key) = provider.api_key() {
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", key))?);
    }
    if let Some(org) = provider.organization_id.as_deref() {
        headers.insert("openai-organization", header_value(org)?);
    }
    if let Some(project) = provider.project_id.as_deref() {
        headers.insert("openai-project", header_value(project)?);
    }
    Ok(headers)
}

fn parse_role(v: Option<&str>) -> Role {
    match v {
        Some("system") => Role::System,
        Some("user") => Role::User,
        _ => Role::Assistant,
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::OpenAiCompatible
    }

    fn build_request(
        &self,
        provider: &Provider,
        model: &str,
        messages: &[Message],
        params: &ValidatedParams,
    ) -> Result<WireRequest> {
        let url = format!("{}/chat/completions", base_url(provider, DEFAULT_BASE));
        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if is_reasoning_model(model) {
            // reasoning endpoints only take a completion budget
            put_opt(&mut body, "max_completion_tokens", &params.max_tokens);
        } else {
            put_opt(&mut body, "temperature", &params.temperature);
            put_opt(&mut body, "max_tokens", &params.max_tokens);
            put_opt(&mut body, "top_p", &params.top_p);
            put_opt(&mut body, "frequency_penalty", &params.frequency_penalty);
            put_opt(&mut body, "presence_penalty", &params.presence_penalty);
            put_opt(&mut body, "stop", &params.stop);
        }
        put_opt(&mut body, "stream", &params.stream);
        Ok(WireRequest::post(url, auth_headers(provider)?, body))
    }

    fn normalize_response(
        &self,
        provider: &Provider,
        model: &str,
        body: Value,
        elapsed: Duration,
    ) -> Result<ChatResponse> {
        let raw_choices = body
            .get("choices")
            .and_then(|c| c.as_array())
            .ok_or_else(|| {
                GatewayError::backend(&provider.name, None, "response has no choices")
            })?;
        let choices = raw_choices
            .iter()
            .enumerate()
            .map(|(i, c)| Choice {
                index: c
                    .get("index")
                    .and_then(|x| x.as_u64())
                    .and_then(|x| u32::try_from(x).ok())
                    .unwrap_or(i as u32),
                message: Message {
                    role: parse_role(c.pointer("/message/role").and_then(|r| r.as_str())),
                    content: c
                        .pointer("/message/content")
                        .and_then(|t| t.as_str())
                        .unwrap_or("")
                        .to_string(),
                },
                finish_reason: c
                    .get("finish_reason")
                    .and_then(|f| f.as_str())
                    .map(str::to_string),
            })
            .collect();
        let prompt = u64_at(&body, "/usage/prompt_tokens");
        let completion = u64_at(&body, "/usage/completion_tokens");
        let mut usage = Usage::new(prompt, completion);
        if let Some(total) = body.pointer("/usage/total_tokens").and_then(|t| t.as_u64()) {
            usage.total_tokens = total;
        }
        Ok(ChatResponse {
            id: body
                .get("id")
                .and_then(|x| x.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| synthetic_id("chatcmpl")),
            object: "chat.completion".to_string(),
            created: body
                .get("created")
                .and_then(|x| x.as_i64())
                .unwrap_or_else(now_unix),
            model: body
                .get("model")
                .and_then(|x| x.as_str())
                .unwrap_or(model)
                .to_string(),
            provider: provider.name.clone(),
            choices,
            usage,
            response_time_ms: elapsed_ms(elapsed),
        })
    }

    /**
     * \brief Lists models; falls back to a tiny completion when listing is refused.
     */
    async fn probe(
        &self,
        client: &Client,
        provider: &Provider,
        model: Option<&str>,
    ) -> Result<String> {
        let url = format!("{}/models", base_url(provider, DEFAULT_BASE));
        let listing = send(client, provider, WireRequest::get(url, auth_headers(provider)?)).await;
        match listing {
            Ok(v) => {
                let count = v
                    .get("data")
                    .and_then(|d| d.as_array())
                    .map(|d| d.len())
                    .unwrap_or(0);
                Ok(format!("{} models available", count))
            }
            Err(list_err) if model.is_some() => {
                tracing::debug!(provider = %provider.name, "model listing failed: {}", list_err);
                completion_probe(self, client, provider, model).await
            }
            Err(list_err) => Err(list_err),
        }
    }
}
