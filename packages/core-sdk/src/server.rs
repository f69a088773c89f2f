use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::error::GatewayError;
use crate::llm::Gateway;
use crate::models::{
    ChatRequest, ChatResponse, HealthCheckResult, Model, ModelInput, ModelPatch, Provider,
    ProviderInput, ProviderPatch,
};
use crate::telemetry;

type ApiError = (StatusCode, String);
type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Clone)]
pub struct AppState {
    gateway: Arc<Gateway>,
}

/**
 * \brief Admin and completion routes over a shared gateway.
 */
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/seed", post(seed))
        .route("/api/providers", get(list_providers).post(create_provider))
        .route("/api/providers/default", get(default_provider))
        .route("/api/providers/test", post(test_all_providers))
        .route(
            "/api/providers/{key}",
            get(get_provider).patch(update_provider).delete(delete_provider),
        )
        .route("/api/providers/{key}/test", post(test_provider))
        .route("/api/providers/{key}/reset-usage", post(reset_usage))
        .route(
            "/api/providers/{key}/models",
            get(list_models).post(create_model),
        )
        .route("/api/providers/{key}/models/seed", post(seed_models))
        .route("/api/models/{id}", patch(update_model).delete(delete_model))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { gateway })
}

/**
 * \brief Starts the admin HTTP server.
 * \param addr listen address, e.g. "127.0.0.1:5173"
 */
pub async fn run(addr: &str, gateway: Arc<Gateway>) -> Result<()> {
    let app = router(gateway);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    telemetry::log_event("server", &format!("listening on http://{}", addr));
    axum::serve(listener, app).await.context("serve")?;
    Ok(())
}

fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::UnsupportedParameters { .. } | GatewayError::InvalidRequest(_) => {
            StatusCode::BAD_REQUEST
        }
        GatewayError::ProviderNotFound(_) | GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::Conflict(_) => StatusCode::CONFLICT,
        GatewayError::ProviderDisabled(_)
        | GatewayError::ModelDisabled { .. }
        | GatewayError::MissingApiKey(_)
        | GatewayError::NoProviderAvailable
        | GatewayError::NoModelResolved { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        GatewayError::Backend { .. } => StatusCode::BAD_GATEWAY,
        GatewayError::Database(_) | GatewayError::Serialization(_) | GatewayError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn api_err(err: GatewayError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        telemetry::log_error("server", &err.to_string());
    }
    (status, err.to_string())
}

/**
 * \brief Hides all but the last four characters of a stored key.
 */
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}

fn masked(mut provider: Provider) -> Provider {
    provider.api_key = provider.api_key.as_deref().map(mask_key);
    provider
}

fn provider_by_key(state: &AppState, key: &str) -> std::result::Result<Provider, ApiError> {
    state
        .gateway
        .registry()
        .get_provider(key)
        .map_err(api_err)?
        .ok_or_else(|| api_err(GatewayError::ProviderNotFound(key.to_string())))
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    #[serde(default)]
    include_disabled: bool,
}

#[derive(Serialize, Debug)]
struct NamedResult {
    name: String,
    #[serde(flatten)]
    result: HealthCheckResult,
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<ChatResponse> {
    state.gateway.chat(request).await.map(Json).map_err(api_err)
}

async fn seed(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let created = state
        .gateway
        .registry()
        .seed_default_providers()
        .map_err(api_err)?;
    let created: Vec<Provider> = created.into_iter().map(masked).collect();
    Ok(Json(serde_json::json!({"created": created})))
}

async fn list_providers(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Vec<Provider>> {
    let list = state
        .gateway
        .registry()
        .get_providers(q.include_disabled)
        .map_err(api_err)?;
    Ok(Json(list.into_iter().map(masked).collect()))
}

async fn create_provider(
    State(state): State<AppState>,
    Json(input): Json<ProviderInput>,
) -> std::result::Result<(StatusCode, Json<Provider>), ApiError> {
    let created = state
        .gateway
        .registry()
        .create_provider(input)
        .map_err(api_err)?;
    Ok((StatusCode::CREATED, Json(masked(created))))
}

async fn default_provider(State(state): State<AppState>) -> ApiResult<Provider> {
    state
        .gateway
        .registry()
        .get_default_provider()
        .map_err(api_err)?
        .map(|p| Json(masked(p)))
        .ok_or_else(|| api_err(GatewayError::NoProviderAvailable))
}

async fn get_provider(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Provider> {
    provider_by_key(&state, &key).map(|p| Json(masked(p)))
}

async fn update_provider(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(patch): Json<ProviderPatch>,
) -> ApiResult<Provider> {
    let provider = provider_by_key(&state, &key)?;
    let updated = state
        .gateway
        .registry()
        .update_provider(provider.id, patch)
        .map_err(api_err)?;
    Ok(Json(masked(updated)))
}

async fn delete_provider(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    let provider = provider_by_key(&state, &key)?;
    state
        .gateway
        .registry()
        .delete_provider(provider.id)
        .map_err(api_err)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn test_provider(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Json<HealthCheckResult> {
    Json(state.gateway.test_provider(&key).await)
}

async fn test_all_providers(State(state): State<AppState>) -> Json<Vec<NamedResult>> {
    let results = state.gateway.test_all_providers().await;
    Json(
        results
            .into_iter()
            .map(|(name, result)| NamedResult { name, result })
            .collect(),
    )
}

async fn reset_usage(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Provider> {
    let provider = provider_by_key(&state, &key)?;
    let reset = state
        .gateway
        .registry()
        .reset_usage(provider.id)
        .map_err(api_err)?;
    Ok(Json(masked(reset)))
}

async fn list_models(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Vec<Model>> {
    let provider = provider_by_key(&state, &key)?;
    state
        .gateway
        .registry()
        .list_models(provider.id, q.include_disabled)
        .map(Json)
        .map_err(api_err)
}

async fn create_model(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(mut input): Json<ModelInput>,
) -> std::result::Result<(StatusCode, Json<Model>), ApiError> {
    let provider = provider_by_key(&state, &key)?;
    input.provider_id = provider.id;
    let model = state
        .gateway
        .registry()
        .create_model(input)
        .map_err(api_err)?;
    Ok((StatusCode::CREATED, Json(model)))
}

async fn seed_models(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<serde_json::Value> {
    let provider = provider_by_key(&state, &key)?;
    let inserted = state
        .gateway
        .registry()
        .seed_common_models(provider.id, &provider.name)
        .map_err(api_err)?;
    Ok(Json(serde_json::json!({"inserted": inserted})))
}

async fn update_model(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<ModelPatch>,
) -> ApiResult<Model> {
    state
        .gateway
        .registry()
        .update_model(id, patch)
        .map(Json)
        .map_err(api_err)
}

async fn delete_model(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> std::result::Result<StatusCode, ApiError> {
    state
        .gateway
        .registry()
        .delete_model(id)
        .map_err(api_err)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_masked() {
        assert_eq!(mask_key("sk-abcdefghijkl"), "****ijkl");
        assert_eq!(mask_key("short"), "****");
    }

    #[test]
    fn status_mapping() {
        let cases = [
            (GatewayError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (
                GatewayError::UnsupportedParameters {
                    target: "Google Gemini".into(),
                    fields: vec!["presencePenalty".into()],
                },
                StatusCode::BAD_REQUEST,
            ),
            (GatewayError::ProviderNotFound("x".into()), StatusCode::NOT_FOUND),
            (GatewayError::Conflict("x".into()), StatusCode::CONFLICT),
            (GatewayError::MissingApiKey("openai".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (GatewayError::backend("openai", Some(500), "boom"), StatusCode::BAD_GATEWAY),
            (GatewayError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(status_for(&err), status, "{err}");
        }
    }
}
