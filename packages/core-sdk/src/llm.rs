use std::time::Instant;

use reqwest::Client;

use crate::adapters::{self, AdapterSet};
use crate::error::{GatewayError, Result};
use crate::models::{ChatRequest, ChatResponse, Model, Provider};
use crate::registry::Registry;
use crate::telemetry;
use crate::validator;

/**
 * \brief Completion gateway: resolves provider and model, validates parameters,
 * dispatches through the family adapter and keeps the usage counters.
 */
pub struct Gateway {
    registry: Registry,
    pub(crate) client: Client,
    pub(crate) adapters: AdapterSet,
}

/** \brief Where a request is going. `model` is set when the model id is registered. */
pub(crate) struct Route {
    pub provider: Provider,
    pub model_id: String,
    pub model: Option<Model>,
}

impl Gateway {
    pub fn new(registry: Registry) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| GatewayError::Internal(format!("http client: {}", e)))?;
        Ok(Self::with_client(registry, client))
    }

    pub fn with_client(registry: Registry, client: Client) -> Self {
        Self {
            registry,
            client,
            adapters: AdapterSet::default(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /**
     * \brief Sends one completion and returns the normalized response.
     * \details Validation failures never reach the network and leave counters
     * untouched. Backend failures count one request and one error.
     */
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        if request.messages.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "messages must not be empty".to_string(),
            ));
        }
        let route = self.resolve(&request)?;
        let params = validator::validate(&route.provider, &route.model_id, &request)?;
        let provider = &route.provider;
        if provider.family.requires_api_key() && provider.api_key().is_none() {
            return Err(GatewayError::MissingApiKey(provider.name.clone()));
        }

        let adapter = self.adapters.get(provider.family)?;
        let wire = adapter.build_request(provider, &route.model_id, &request.messages, &params)?;
        let started = Instant::now();
        let outcome = match adapters::send(&self.client, provider, wire).await {
            Ok(body) => {
                adapter.normalize_response(provider, &route.model_id, body, started.elapsed())
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(response) => {
                let model_row = route.model.as_ref().map(|m| m.id);
                if let Err(err) =
                    self.registry
                        .record_success(provider.id, model_row, response.usage.total_tokens)
                {
                    telemetry::log_error("gateway.usage", &err.to_string());
                }
                telemetry::log_event(
                    "gateway.chat",
                    &format!(
                        "provider={} model={} tokens={} elapsed_ms={}",
                        provider.name,
                        route.model_id,
                        response.usage.total_tokens,
                        response.response_time_ms
                    ),
                );
                Ok(response)
            }
            Err(err) => {
                if err.is_backend() {
                    if let Err(count_err) = self.registry.record_failure(provider.id) {
                        telemetry::log_error("gateway.usage", &count_err.to_string());
                    }
                }
                telemetry::log_error(
                    "gateway.chat",
                    &format!("provider={} model={} {}", provider.name, route.model_id, err),
                );
                Err(err)
            }
        }
    }

    /**
     * \brief Provider: the named one, else the default. Model: the requested id
     * (registered or not), else the provider default, else its first enabled model.
     */
    pub(crate) fn resolve(&self, request: &ChatRequest) -> Result<Route> {
        let provider = match request.provider.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => {
                let provider = self
                    .registry
                    .get_provider(key)?
                    .ok_or_else(|| GatewayError::ProviderNotFound(key.to_string()))?;
                if !provider.is_enabled {
                    return Err(GatewayError::ProviderDisabled(provider.name));
                }
                provider
            }
            _ => self
                .registry
                .get_default_provider()?
                .ok_or(GatewayError::NoProviderAvailable)?,
        };

        match request.model.as_deref().map(str::trim) {
            Some(model_id) if !model_id.is_empty() => {
                let model = self.registry.find_model(provider.id, model_id)?;
                if let Some(m) = &model {
                    if !m.is_enabled {
                        return Err(GatewayError::ModelDisabled {
                            provider: provider.name,
                            model: m.model_id.clone(),
                        });
                    }
                }
                Ok(Route {
                    model_id: model_id.to_string(),
                    provider,
                    model,
                })
            }
            _ => {
                let model = self.registry.default_model(provider.id)?.ok_or_else(|| {
                    GatewayError::NoModelResolved {
                        provider: provider.name.clone(),
                    }
                })?;
                Ok(Route {
                    model_id: model.model_id.clone(),
                    provider,
                    model: Some(model),
                })
            }
        }
    }
}
