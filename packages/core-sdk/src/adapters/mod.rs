//! Backend adapters. Each one translates between the normalized request and
//! response shapes and one vendor family's wire protocol.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde_json::{json, Value};

use crate::error::{GatewayError, Result};
use crate::models::{ChatResponse, Message, Provider, ProviderFamily};
use crate::validator::ValidatedParams;

mod anthropic;
mod gemini;
mod ollama;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;

/** \brief Token budget used by completion probes. */
pub const PROBE_MAX_TOKENS: u32 = 5;
const PROBE_PROMPT: &str = "ping";

/**
 * \brief A fully built outbound HTTP call.
 */
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl WireRequest {
    pub fn post(url: String, headers: HeaderMap, body: Value) -> Self {
        Self {
            method: Method::POST,
            url,
            headers,
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn get(url: String, headers: HeaderMap) -> Self {
        Self {
            method: Method::GET,
            url,
            headers,
            query: Vec::new(),
            body: None,
        }
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn family(&self) -> ProviderFamily;

    fn build_request(
        &self,
        provider: &Provider,
        model: &str,
        messages: &[Message],
        params: &ValidatedParams,
    ) -> Result<WireRequest>;

    fn normalize_response(
        &self,
        provider: &Provider,
        model: &str,
        body: Value,
        elapsed: Duration,
    ) -> Result<ChatResponse>;

    /**
     * \brief Cheapest call proving the backend is reachable and the credentials work.
     * \return a short description of what succeeded.
     */
    async fn probe(&self, client: &Client, provider: &Provider, model: Option<&str>)
        -> Result<String>;
}

/**
 * \brief One adapter per family.
 */
pub struct AdapterSet {
    adapters: HashMap<ProviderFamily, Box<dyn ProviderAdapter>>,
}

impl Default for AdapterSet {
    fn default() -> Self {
        let all: Vec<Box<dyn ProviderAdapter>> = vec![
            Box::new(OpenAiAdapter),
            Box::new(GeminiAdapter),
            Box::new(OllamaAdapter),
            Box::new(AnthropicAdapter),
        ];
        Self {
            adapters: all.into_iter().map(|a| (a.family(), a)).collect(),
        }
    }
}

impl AdapterSet {
    pub fn get(&self, family: ProviderFamily) -> Result<&dyn ProviderAdapter> {
        self.adapters
            .get(&family)
            .map(|a| a.as_ref())
            .ok_or_else(|| GatewayError::Internal(format!("no adapter for family {}", family)))
    }
}

/**
 * \brief Base URL of the provider, or the family fallback.
 */
pub(crate) fn base_url<'a>(provider: &'a Provider, fallback: &'a str) -> &'a str {
    provider
        .base_url
        .as_deref()
        .filter(|b| !b.trim().is_empty())
        .unwrap_or(fallback)
        .trim_end_matches('/')
}

/**
 * \brief JSON content type plus the provider's custom headers.
 */
pub(crate) fn base_headers(provider: &Provider) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for (name, value) in &provider.custom_headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            GatewayError::InvalidRequest(format!("invalid header name {}: {}", name, e))
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            GatewayError::InvalidRequest(format!("invalid header value for {}: {}", name, e))
        })?;
        headers.insert(name, value);
    }
    Ok(headers)
}

pub(crate) fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid header value: {}", e)))
}

/**
 * \brief Inserts `key: value` into a JSON object only when the value is set.
 */
pub(crate) fn put_opt<T: serde::Serialize>(body: &mut Value, key: &str, value: &Option<T>) {
    if let (Some(v), Some(obj)) = (value, body.as_object_mut()) {
        obj.insert(key.to_string(), json!(v));
    }
}

pub(crate) fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/** \brief Synthetic id for backends whose responses carry none. */
pub(crate) fn synthetic_id(prefix: &str) -> String {
    format!(
        "{}-{}",
        prefix,
        time::OffsetDateTime::now_utc().unix_timestamp_nanos()
    )
}

pub(crate) fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/**
 * \brief Sends `wire` with the provider timeout and decodes a JSON body.
 * \details Transport failures, non-2xx statuses and undecodable bodies all
 * become `GatewayError::Backend`. Error text never includes the request url.
 */
pub async fn send(client: &Client, provider: &Provider, wire: WireRequest) -> Result<Value> {
    let timeout = Duration::from_millis(provider.policy.timeout_ms.max(1));
    let mut req = client
        .request(wire.method, &wire.url)
        .headers(wire.headers)
        .timeout(timeout);
    if !wire.query.is_empty() {
        req = req.query(&wire.query);
    }
    if let Some(body) = &wire.body {
        req = req.json(body);
    }
    tracing::debug!(provider = %provider.name, url = %wire.url, "dispatching");

    let resp = req.send().await.map_err(|e| {
        let message = if e.is_timeout() {
            format!("timed out after {} ms", timeout.as_millis())
        } else {
            // the url may carry a key in its query
            e.without_url().to_string()
        };
        GatewayError::backend(&provider.name, None, message)
    })?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(GatewayError::backend(
            &provider.name,
            Some(status.as_u16()),
            format!("{} -> {}", status, text),
        ));
    }
    resp.json::<Value>().await.map_err(|e| {
        GatewayError::backend(
            &provider.name,
            Some(status.as_u16()),
            format!("malformed response body: {}", e.without_url()),
        )
    })
}

/**
 * \brief Probe by a minimal completion against `model`.
 */
pub(crate) async fn completion_probe(
    adapter: &dyn ProviderAdapter,
    client: &Client,
    provider: &Provider,
    model: Option<&str>,
) -> Result<String> {
    let model = model.ok_or_else(|| GatewayError::NoModelResolved {
        provider: provider.name.clone(),
    })?;
    let params = ValidatedParams {
        max_tokens: Some(PROBE_MAX_TOKENS),
        ..Default::default()
    };
    let messages = [Message::user(PROBE_PROMPT)];
    let wire = adapter.build_request(provider, model, &messages, &params)?;
    let started = std::time::Instant::now();
    let body = send(client, provider, wire).await?;
    adapter.normalize_response(provider, model, body, started.elapsed())?;
    Ok(format!("completion with {} succeeded", model))
}

/** \brief Concatenated `text` fields of a JSON array of parts. */
pub(crate) fn join_text_parts(parts: Option<&Value>) -> String {
    parts
        .and_then(|arr| arr.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

pub(crate) fn u64_at(v: &Value, pointer: &str) -> u64 {
    v.pointer(pointer).and_then(|x| x.as_u64()).unwrap_or(0)
}
