use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{
    base_headers, base_url, completion_probe, elapsed_ms, header_value, join_text_parts, now_unix,
    put_opt, synthetic_id, u64_at, ProviderAdapter, WireRequest,
};
use crate::error::{GatewayError, Result};
use crate::models::{ChatResponse, Choice, Message, Provider, ProviderFamily, Role, Usage};
use crate::validator::ValidatedParams;

const DEFAULT_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/** \brief The messages API requires `max_tokens`; used when the caller sets none. */
pub const FALLBACK_MAX_TOKENS: u32 = 4096;

/**
 * \brief Anthropic messages API.
 */
pub struct AnthropicAdapter;

fn messages_url(provider: &Provider) -> String {
    let base = base_url(provider, DEFAULT_BASE);
    if base.ends_with("/v1") {
        format!("{}/messages", base)
    } else {
        format!("{}/v1/messages", base)
    }
}

fn anthropic_payload(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut items = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(msg.content.clone()),
            Role::Assistant => items.push(json!({
                "role": "assistant",
                "content": [{"type": "text", "text": msg.content}]
            })),
            Role::User => items.push(json!({
                "role": "user",
                "content": [{"type": "text", "text": msg.content}]
            })),
        }
    }
    let system_prompt = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system_prompt, items)
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Anthropic
    }

    fn build_request(
        &self,
        provider: &Provider,
        model: &str,
        messages: &[Message],
        params: &ValidatedParams,
    ) -> Result<WireRequest> {
        let (system_prompt, payload_messages) = anthropic_payload(messages);
        let mut body = json!({
            "model": model,
            "max_tokens": params.max_tokens.unwrap_or(FALLBACK_MAX_TOKENS),
            "messages": payload_messages,
        });
        put_opt(&mut body, "system", &system_prompt);
        put_opt(&mut body, "temperature", &params.temperature);
        put_opt(&mut body, "top_p", &params.top_p);
        put_opt(&mut body, "stop_sequences", &params.stop);
        put_opt(&mut body, "stream", &params.stream);

        let mut headers = base_headers(provider)?;
        if let Some(key) = provider.api_key() {
            headers.insert("x-api-key", header_value(key)?);
        }
        headers.insert("anthropic-version", header_value(ANTHROPIC_VERSION)?);
        Ok(WireRequest::post(messages_url(provider), headers, body))
    }

    fn normalize_response(
        &self,
        provider: &Provider,
        model: &str,
        body: Value,
        elapsed: Duration,
    ) -> Result<ChatResponse> {
        if body.get("content").and_then(|c| c.as_array()).is_none() {
            return Err(GatewayError::backend(
                &provider.name,
                None,
                "response has no content blocks",
            ));
        }
        let text = join_text_parts(body.get("content"));
        Ok(ChatResponse {
            id: body
                .get("id")
                .and_then(|x| x.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| synthetic_id("msg")),
            object: "chat.completion".to_string(),
            created: now_unix(),
            model: body
                .get("model")
                .and_then(|m| m.as_str())
                .unwrap_or(model)
                .to_string(),
            provider: provider.name.clone(),
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(text),
                finish_reason: body
                    .get("stop_reason")
                    .and_then(|r| r.as_str())
                    .map(str::to_string),
            }],
            usage: Usage::new(
                u64_at(&body, "/usage/input_tokens"),
                u64_at(&body, "/usage/output_tokens"),
            ),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::tests::provider;
    use pretty_assertions::assert_eq;

    #[test]
    fn system_is_lifted_and_max_tokens_defaulted() {
        let p = provider("anthropic", "Anthropic");
        let wire = AnthropicAdapter
            .build_request(
                &p,
                "claude-3-5-haiku-20241022",
                &[Message::system("Tutor mode."), Message::user("Hi")],
                &ValidatedParams::default(),
            )
            .unwrap();
        assert_eq!(wire.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(wire.headers.get("x-api-key").unwrap(), "sk-test");
        assert_eq!(wire.headers.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);
        assert_eq!(
            wire.body.unwrap(),
            json!({
                "model": "claude-3-5-haiku-20241022",
                "max_tokens": 4096,
                "system": "Tutor mode.",
                "messages": [{"role": "user", "content": [{"type": "text", "text": "Hi"}]}]
            })
        );
    }

    #[test]
    fn stop_maps_to_stop_sequences() {
        let mut p = provider("anthropic", "Anthropic");
        p.base_url = Some("https://gateway.local/v1".into());
        let params = ValidatedParams {
            max_tokens: Some(100),
            stop: Some(vec!["\n\nHuman:".into()]),
            ..Default::default()
        };
        let wire = AnthropicAdapter
            .build_request(&p, "claude-3-opus-20240229", &[Message::user("Hi")], &params)
            .unwrap();
        assert_eq!(wire.url, "https://gateway.local/v1/messages");
        let body = wire.body.unwrap();
        assert_eq!(body["max_tokens"], json!(100));
        assert_eq!(body["stop_sequences"], json!(["\n\nHuman:"]));
        assert!(body.get("system").is_none());
    }

    #[test]
    fn normalizes_message() {
        let p = provider("anthropic", "Anthropic");
        let body = json!({
            "id": "msg_01",
            "type": "message",
            "model": "claude-3-5-haiku-20241022",
            "content": [{"type": "text", "text": "Hello"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 2}
        });
        let resp = AnthropicAdapter
            .normalize_response(&p, "claude-3-5-haiku-20241022", body, Duration::from_millis(5))
            .unwrap();
        assert_eq!(resp.id, "msg_01");
        assert_eq!(resp.content(), "Hello");
        assert_eq!(resp.usage, Usage::new(10, 2));
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("end_turn"));
    }
}
