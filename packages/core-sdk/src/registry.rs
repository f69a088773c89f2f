use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use time::OffsetDateTime;

use crate::cache::ProviderCache;
use crate::config::{self, GatewayConfig};
use crate::db::{self, ModelRecord, ProviderRecord};
use crate::error::{GatewayError, Result};
use crate::models::{
    HealthStatus, Model, ModelInput, ModelPatch, Provider,
    ProviderCapabilities, ProviderFamily, ProviderHealth, ProviderInput, ProviderPatch,
    RequestPolicy, UsageCounters,
};
use crate::telemetry;

/**
 * \brief Defaults merged under caller input when a provider is created.
 */
#[derive(Debug, Clone, Copy)]
pub struct FamilyDefaults {
    pub base_url: &'static str,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub capabilities: ProviderCapabilities,
}

/**
 * \brief Per-family defaults table. Well-known OpenAI-compatible names get their own base URL.
 */
pub fn family_defaults(name: &str) -> FamilyDefaults {
    let family = ProviderFamily::from_name(name);
    match family {
        ProviderFamily::OpenAiCompatible => FamilyDefaults {
            base_url: match name {
                "deepseek" => "https://api.deepseek.com/v1",
                _ => "https://api.openai.com/v1",
            },
            timeout_ms: 60_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            capabilities: ProviderCapabilities {
                supports_streaming: true,
                supports_vision: name == "openai",
                supports_function_calling: true,
                supports_json_mode: true,
                supports_system_message: true,
            },
        },
        ProviderFamily::Anthropic => FamilyDefaults {
            base_url: "https://api.anthropic.com",
            timeout_ms: 60_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            capabilities: ProviderCapabilities {
                supports_streaming: true,
                supports_vision: true,
                supports_function_calling: true,
                supports_json_mode: false,
                supports_system_message: true,
            },
        },
        ProviderFamily::Gemini => FamilyDefaults {
            base_url: "https://generativelanguage.googleapis.com",
            timeout_ms: 60_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            capabilities: ProviderCapabilities {
                supports_streaming: true,
                supports_vision: true,
                supports_function_calling: true,
                supports_json_mode: true,
                supports_system_message: false,
            },
        },
        ProviderFamily::Ollama => FamilyDefaults {
            base_url: "http://localhost:11434",
            timeout_ms: 120_000,
            max_retries: 1,
            retry_delay_ms: 500,
            capabilities: ProviderCapabilities {
                supports_streaming: true,
                supports_vision: false,
                supports_function_calling: false,
                supports_json_mode: true,
                supports_system_message: true,
            },
        },
    }
}

fn default_display_name(name: &str) -> String {
    match name {
        "openai" => "OpenAI".to_string(),
        "anthropic" => "Anthropic".to_string(),
        "gemini" => "Google Gemini".to_string(),
        "ollama" => "Ollama".to_string(),
        "deepseek" => "DeepSeek".to_string(),
        other => other.to_string(),
    }
}

/**
 * \brief Well-known model entry used by seeding.
 */
#[derive(Debug, Clone, Copy)]
pub struct SeedModel {
    pub model_id: &'static str,
    pub name: &'static str,
    pub context_length: u32,
}

const OPENAI_MODELS: &[SeedModel] = &[
    SeedModel { model_id: "gpt-4o", name: "GPT-4o", context_length: 128_000 },
    SeedModel { model_id: "gpt-4o-mini", name: "GPT-4o mini", context_length: 128_000 },
    SeedModel { model_id: "gpt-4-turbo", name: "GPT-4 Turbo", context_length: 128_000 },
    SeedModel { model_id: "o1-mini", name: "o1 mini", context_length: 128_000 },
    SeedModel { model_id: "o3-mini", name: "o3 mini", context_length: 200_000 },
];

const ANTHROPIC_MODELS: &[SeedModel] = &[
    SeedModel { model_id: "claude-3-5-sonnet-20241022", name: "Claude 3.5 Sonnet", context_length: 200_000 },
    SeedModel { model_id: "claude-3-5-haiku-20241022", name: "Claude 3.5 Haiku", context_length: 200_000 },
    SeedModel { model_id: "claude-3-opus-20240229", name: "Claude 3 Opus", context_length: 200_000 },
];

const GEMINI_MODELS: &[SeedModel] = &[
    SeedModel { model_id: "gemini-1.5-flash", name: "Gemini 1.5 Flash", context_length: 1_048_576 },
    SeedModel { model_id: "gemini-1.5-pro", name: "Gemini 1.5 Pro", context_length: 2_097_152 },
    SeedModel { model_id: "gemini-2.0-flash", name: "Gemini 2.0 Flash", context_length: 1_048_576 },
];

const OLLAMA_MODELS: &[SeedModel] = &[
    SeedModel { model_id: "llama3.1", name: "Llama 3.1", context_length: 131_072 },
    SeedModel { model_id: "qwen2.5", name: "Qwen 2.5", context_length: 32_768 },
    SeedModel { model_id: "mistral", name: "Mistral", context_length: 32_768 },
];

const DEEPSEEK_MODELS: &[SeedModel] = &[
    SeedModel { model_id: "deepseek-chat", name: "DeepSeek Chat", context_length: 64_000 },
    SeedModel { model_id: "deepseek-reasoner", name: "DeepSeek Reasoner", context_length: 64_000 },
];

/**
 * \brief Static model list for a provider name; other OpenAI-compatible names have none.
 */
pub fn common_models(provider_name: &str) -> &'static [SeedModel] {
    match provider_name {
        "openai" => OPENAI_MODELS,
        "deepseek" => DEEPSEEK_MODELS,
        name => match ProviderFamily::from_name(name) {
            ProviderFamily::Anthropic => ANTHROPIC_MODELS,
            ProviderFamily::Gemini => GEMINI_MODELS,
            ProviderFamily::Ollama => OLLAMA_MODELS,
            ProviderFamily::OpenAiCompatible => &[],
        },
    }
}

/** \brief Providers created by `seed_default_providers`, with their priority. */
pub const WELL_KNOWN_PROVIDERS: &[(&str, i64)] = &[
    ("openai", 100),
    ("anthropic", 90),
    ("gemini", 80),
    ("deepseek", 70),
    ("ollama", 50),
];

fn clean_text(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn apply_nullable_text(target: &mut Option<String>, patch: Option<Option<String>>) {
    if let Some(value) = patch {
        *target = clean_text(value);
    }
}

fn apply_nullable<T>(target: &mut Option<T>, patch: Option<Option<T>>) {
    if let Some(value) = patch {
        *target = value;
    }
}

fn apply<T>(target: &mut T, patch: Option<T>) {
    if let Some(value) = patch {
        *target = value;
    }
}

fn merge_provider_patch(provider: &mut Provider, patch: ProviderPatch) {
    if let Some(display_name) = clean_text(patch.display_name) {
        provider.display_name = display_name;
    }
    apply(&mut provider.is_enabled, patch.is_enabled);
    apply(&mut provider.is_default, patch.is_default);
    apply(&mut provider.priority, patch.priority);
    apply_nullable_text(&mut provider.base_url, patch.base_url);
    apply_nullable_text(&mut provider.api_key, patch.api_key);
    apply_nullable_text(&mut provider.organization_id, patch.organization_id);
    apply_nullable_text(&mut provider.project_id, patch.project_id);
    if let Some(headers) = patch.custom_headers {
        provider.custom_headers = headers.unwrap_or_default();
    }
    let defaults = &mut provider.defaults;
    apply_nullable(&mut defaults.temperature, patch.defaults.temperature);
    apply_nullable(&mut defaults.max_tokens, patch.defaults.max_tokens);
    apply_nullable(&mut defaults.top_p, patch.defaults.top_p);
    apply_nullable(&mut defaults.top_k, patch.defaults.top_k);
    apply_nullable(&mut defaults.frequency_penalty, patch.defaults.frequency_penalty);
    apply_nullable(&mut defaults.presence_penalty, patch.defaults.presence_penalty);
    let policy = &mut provider.policy;
    apply(&mut policy.timeout_ms, patch.timeout_ms);
    apply(&mut policy.max_retries, patch.max_retries);
    apply(&mut policy.retry_delay_ms, patch.retry_delay_ms);
    apply_nullable(&mut policy.rate_limit_rpm, patch.rate_limit_rpm);
    apply_nullable(&mut policy.rate_limit_tpm, patch.rate_limit_tpm);
    apply_nullable(&mut policy.concurrency_limit, patch.concurrency_limit);
    let caps = &mut provider.capabilities;
    apply(&mut caps.supports_streaming, patch.supports_streaming);
    apply(&mut caps.supports_vision, patch.supports_vision);
    apply(&mut caps.supports_function_calling, patch.supports_function_calling);
    apply(&mut caps.supports_json_mode, patch.supports_json_mode);
    apply(&mut caps.supports_system_message, patch.supports_system_message);
    if let Some(metadata) = patch.metadata {
        provider.metadata = metadata.unwrap_or_default();
    }
}

fn merge_model_patch(model: &mut Model, patch: ModelPatch) {
    if let Some(name) = clean_text(patch.name) {
        model.name = name;
    }
    apply_nullable_text(&mut model.description, patch.description);
    apply(&mut model.is_enabled, patch.is_enabled);
    apply(&mut model.is_default, patch.is_default);
    apply_nullable(&mut model.context_length, patch.context_length);
    apply_nullable(&mut model.max_output_tokens, patch.max_output_tokens);
    apply_nullable(&mut model.default_temperature, patch.default_temperature);
    apply_nullable(&mut model.default_max_tokens, patch.default_max_tokens);
    apply_nullable(&mut model.default_top_p, patch.default_top_p);
    apply_nullable(&mut model.default_top_k, patch.default_top_k);
    if let Some(stop) = patch.stop_sequences {
        model.stop_sequences = stop.unwrap_or_default();
    }
    apply_nullable(&mut model.supports_vision, patch.supports_vision);
    apply_nullable(&mut model.supports_function_calling, patch.supports_function_calling);
    apply_nullable(&mut model.supports_json_mode, patch.supports_json_mode);
    if let Some(metadata) = patch.metadata {
        model.metadata = metadata.unwrap_or_default();
    }
}

/**
 * \brief Provider and model registry over SQLite, with a TTL cache for provider reads.
 */
#[derive(Clone)]
pub struct Registry {
    conn: Arc<Mutex<Connection>>,
    cache: Arc<ProviderCache>,
}

impl Registry {
    /**
     * \brief Opens (and migrates) the database named by the configuration.
     */
    pub fn open(config: &GatewayConfig) -> Result<Self> {
        let conn = db::open_db(&config.db_path)?;
        db::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            cache: Arc::new(ProviderCache::new(config.cache_ttl)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(&GatewayConfig::in_memory())
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| GatewayError::Internal("registry connection poisoned".to_string()))?;
        f(&guard)
    }

    /**
     * \brief Runs `f` inside a transaction and invalidates the cache before the
     * connection lock is released.
     */
    fn write<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.with_conn(|conn| {
            let result = conn
                .unchecked_transaction()
                .map_err(GatewayError::from)
                .and_then(|tx| {
                    let value = f(&tx)?;
                    tx.commit()?;
                    Ok(value)
                });
            self.cache.invalidate();
            result
        })
    }

    /**
     * \brief Providers ordered by priority desc, then name.
     */
    pub fn get_providers(&self, include_disabled: bool) -> Result<Vec<Provider>> {
        let records = self.with_conn(|conn| db::list_providers(conn, include_disabled))?;
        records.into_iter().map(Provider::try_from).collect()
    }

    /**
     * \brief Looks a provider up by id (numeric keys) or by name.
     */
    pub fn get_provider(&self, name_or_id: &str) -> Result<Option<Provider>> {
        if let Some(hit) = self.cache.get(name_or_id) {
            return Ok(Some(hit));
        }
        // filled under the connection lock so a concurrent write cannot slip
        // between the read and the put
        self.with_conn(|conn| {
            let mut record = None;
            if let Ok(id) = name_or_id.parse::<i64>() {
                record = db::get_provider_by_id(conn, id)?;
            }
            if record.is_none() {
                record = db::get_provider_by_name(conn, name_or_id)?;
            }
            let provider = record.map(Provider::try_from).transpose()?;
            if let Some(p) = &provider {
                self.cache.put(p);
            }
            Ok(provider)
        })
    }

    pub fn get_provider_by_id(&self, id: i64) -> Result<Option<Provider>> {
        self.get_provider(&id.to_string())
    }

    /**
     * \brief The enabled provider flagged default, else the highest-priority enabled provider.
     */
    pub fn get_default_provider(&self) -> Result<Option<Provider>> {
        let record = self.with_conn(|conn| match db::get_flagged_default_provider(conn)? {
            Some(rec) => Ok(Some(rec)),
            None => db::get_top_enabled_provider(conn),
        })?;
        record.map(Provider::try_from).transpose()
    }

    /**
     * \brief Creates a provider, merging input over the family defaults.
     */
    pub fn create_provider(&self, input: ProviderInput) -> Result<Provider> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "provider name must not be empty".to_string(),
            ));
        }
        let defaults = family_defaults(&name);
        let now = OffsetDateTime::now_utc();
        let is_default = input.is_default.unwrap_or(false);
        let provider = Provider {
            id: 0,
            family: ProviderFamily::from_name(&name),
            display_name: clean_text(input.display_name)
                .unwrap_or_else(|| default_display_name(&name)),
            name: name.clone(),
            is_enabled: input.is_enabled.unwrap_or(true),
            is_default,
            priority: input.priority.unwrap_or(0),
            base_url: clean_text(input.base_url).or_else(|| Some(defaults.base_url.to_string())),
            api_key: clean_text(input.api_key),
            organization_id: clean_text(input.organization_id),
            project_id: clean_text(input.project_id),
            custom_headers: input.custom_headers.unwrap_or_default(),
            defaults: input.defaults,
            policy: RequestPolicy {
                timeout_ms: input.timeout_ms.unwrap_or(defaults.timeout_ms),
                max_retries: input.max_retries.unwrap_or(defaults.max_retries),
                retry_delay_ms: input.retry_delay_ms.unwrap_or(defaults.retry_delay_ms),
                rate_limit_rpm: input.rate_limit_rpm,
                rate_limit_tpm: input.rate_limit_tpm,
                concurrency_limit: input.concurrency_limit,
            },
            capabilities: ProviderCapabilities {
                supports_streaming: input
                    .supports_streaming
                    .unwrap_or(defaults.capabilities.supports_streaming),
                supports_vision: input
                    .supports_vision
                    .unwrap_or(defaults.capabilities.supports_vision),
                supports_function_calling: input
                    .supports_function_calling
                    .unwrap_or(defaults.capabilities.supports_function_calling),
                supports_json_mode: input
                    .supports_json_mode
                    .unwrap_or(defaults.capabilities.supports_json_mode),
                supports_system_message: input
                    .supports_system_message
                    .unwrap_or(defaults.capabilities.supports_system_message),
            },
            health: ProviderHealth {
                status: HealthStatus::Unknown,
                ..Default::default()
            },
            usage: UsageCounters::default(),
            metadata: input.metadata.unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };
        let record = ProviderRecord::from_provider(&provider)?;

        let id = self.write(|conn| {
            if db::get_provider_by_name(conn, &name)?.is_some() {
                return Err(GatewayError::Conflict(format!(
                    "provider {} already exists",
                    name
                )));
            }
            if is_default {
                db::clear_default_providers(conn, None)?;
            }
            db::insert_provider(conn, &record)
        })?;
        telemetry::log_event(
            "registry.provider",
            &format!("create id={} name={} default={}", id, name, is_default),
        );
        self.require_provider(id)
    }

    /**
     * \brief Partial update; only fields present in the patch are written.
     * \details The row is read, merged and written back in one transaction, so
     * concurrent patches touching different fields do not overwrite each other.
     */
    pub fn update_provider(&self, id: i64, patch: ProviderPatch) -> Result<Provider> {
        let set_default = patch.is_default == Some(true);
        let provider = self.write(|conn| {
            let record = db::get_provider_by_id(conn, id)?
                .ok_or_else(|| GatewayError::NotFound(format!("provider id {}", id)))?;
            let mut provider = Provider::try_from(record)?;
            merge_provider_patch(&mut provider, patch);
            provider.updated_at = OffsetDateTime::now_utc();
            if set_default {
                db::clear_default_providers(conn, Some(id))?;
            }
            db::update_provider_config(conn, &ProviderRecord::from_provider(&provider)?)?;
            Ok(provider)
        })?;
        telemetry::log_event(
            "registry.provider",
            &format!("update id={} name={}", id, provider.name),
        );
        Ok(provider)
    }

    /**
     * \brief Hard delete; the provider's models are removed with it.
     */
    pub fn delete_provider(&self, id: i64) -> Result<()> {
        let deleted = self.write(|conn| db::delete_provider(conn, id))?;
        if !deleted {
            return Err(GatewayError::NotFound(format!("provider id {}", id)));
        }
        telemetry::log_event("registry.provider", &format!("delete id={}", id));
        Ok(())
    }

    fn require_provider(&self, id: i64) -> Result<Provider> {
        let record = self
            .with_conn(|conn| db::get_provider_by_id(conn, id))?
            .ok_or_else(|| GatewayError::NotFound(format!("provider id {}", id)))?;
        Provider::try_from(record)
    }

    /**
     * \brief Creates the well-known providers that are missing and seeds their models.
     * \details Keys come from the conventional environment variables; cloud providers
     * without a key are created disabled. Returns the providers created by this call.
     */
    pub fn seed_default_providers(&self) -> Result<Vec<Provider>> {
        let mut created = Vec::new();
        for (name, priority) in WELL_KNOWN_PROVIDERS {
            let provider = match self.find_by_name(name)? {
                Some(existing) => existing,
                None => {
                    let api_key = config::seed_api_key(name);
                    let family = ProviderFamily::from_name(name);
                    let base_url = if family == ProviderFamily::Ollama {
                        config::ollama_base_url()
                    } else {
                        None
                    };
                    let input = ProviderInput {
                        is_enabled: Some(!family.requires_api_key() || api_key.is_some()),
                        priority: Some(*priority),
                        api_key,
                        base_url,
                        ..ProviderInput::named(*name)
                    };
                    let provider = self.create_provider(input)?;
                    created.push(provider.clone());
                    provider
                }
            };
            self.seed_common_models(provider.id, &provider.name)?;
        }
        telemetry::log_event(
            "registry.seed",
            &format!("seeded providers created={}", created.len()),
        );
        Ok(created)
    }

    fn find_by_name(&self, name: &str) -> Result<Option<Provider>> {
        self.with_conn(|conn| db::get_provider_by_name(conn, name))?
            .map(Provider::try_from)
            .transpose()
    }

    /**
     * \brief Idempotent upsert of the known models for a provider family.
     * \return number of models inserted by this call.
     */
    pub fn seed_common_models(&self, provider_id: i64, provider_name: &str) -> Result<usize> {
        let models = common_models(provider_name);
        if self.get_provider_by_id(provider_id)?.is_none() {
            return Err(GatewayError::NotFound(format!("provider id {}", provider_id)));
        }
        let inserted = self.write(|conn| {
            let has_default = db::has_default_model(conn, provider_id)?;
            let mut inserted = 0;
            for (index, model) in models.iter().enumerate() {
                let is_default = index == 0 && !has_default;
                if db::upsert_seed_model(
                    conn,
                    provider_id,
                    model.model_id,
                    model.name,
                    Some(model.context_length),
                    is_default,
                )? {
                    inserted += 1;
                }
            }
            Ok(inserted)
        })?;
        telemetry::log_event(
            "registry.model",
            &format!(
                "seed provider={} known={} inserted={}",
                provider_name,
                models.len(),
                inserted
            ),
        );
        Ok(inserted)
    }

    pub fn list_models(&self, provider_id: i64, include_disabled: bool) -> Result<Vec<Model>> {
        let records = self.with_conn(|conn| db::list_models(conn, provider_id, include_disabled))?;
        records.into_iter().map(Model::try_from).collect()
    }

    pub fn get_model(&self, id: i64) -> Result<Option<Model>> {
        self.with_conn(|conn| db::get_model_by_id(conn, id))?
            .map(Model::try_from)
            .transpose()
    }

    pub fn find_model(&self, provider_id: i64, model_id: &str) -> Result<Option<Model>> {
        self.with_conn(|conn| db::get_model_by_model_id(conn, provider_id, model_id))?
            .map(Model::try_from)
            .transpose()
    }

    /**
     * \brief The provider's default enabled model, else its first enabled model.
     */
    pub fn default_model(&self, provider_id: i64) -> Result<Option<Model>> {
        let models = self.list_models(provider_id, false)?;
        let default = models.iter().position(|m| m.is_default).unwrap_or(0);
        Ok(models.into_iter().nth(default))
    }

    pub fn create_model(&self, input: ModelInput) -> Result<Model> {
        let model_id = input.model_id.trim().to_string();
        if model_id.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "model id must not be empty".to_string(),
            ));
        }
        let provider = self
            .get_provider_by_id(input.provider_id)?
            .ok_or_else(|| GatewayError::NotFound(format!("provider id {}", input.provider_id)))?;
        let now = OffsetDateTime::now_utc();
        let is_default = input.is_default.unwrap_or(false);
        let model = Model {
            id: 0,
            provider_id: provider.id,
            name: clean_text(input.name).unwrap_or_else(|| model_id.clone()),
            model_id: model_id.clone(),
            description: clean_text(input.description),
            is_enabled: input.is_enabled.unwrap_or(true),
            is_default,
            context_length: input.context_length,
            max_output_tokens: input.max_output_tokens,
            default_temperature: input.default_temperature,
            default_max_tokens: input.default_max_tokens,
            default_top_p: input.default_top_p,
            default_top_k: input.default_top_k,
            stop_sequences: input.stop_sequences,
            supports_vision: input.supports_vision,
            supports_function_calling: input.supports_function_calling,
            supports_json_mode: input.supports_json_mode,
            total_requests: 0,
            total_tokens: 0,
            metadata: input.metadata.unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };
        let record = ModelRecord::from_model(&model)?;
        let id = self.write(|conn| {
            if db::get_model_by_model_id(conn, provider.id, &model_id)?.is_some() {
                return Err(GatewayError::Conflict(format!(
                    "model {} already exists on provider {}",
                    model_id, provider.name
                )));
            }
            if is_default {
                db::clear_default_models(conn, provider.id, None)?;
            }
            db::insert_model(conn, &record)
        })?;
        telemetry::log_event(
            "registry.model",
            &format!("create id={} provider={} model={}", id, provider.name, model_id),
        );
        self.require_model(id)
    }

    pub fn update_model(&self, id: i64, patch: ModelPatch) -> Result<Model> {
        let set_default = patch.is_default == Some(true);
        let model = self.write(|conn| {
            let record = db::get_model_by_id(conn, id)?
                .ok_or_else(|| GatewayError::NotFound(format!("model id {}", id)))?;
            let mut model = Model::try_from(record)?;
            merge_model_patch(&mut model, patch);
            model.updated_at = OffsetDateTime::now_utc();
            if set_default {
                db::clear_default_models(conn, model.provider_id, Some(id))?;
            }
            db::update_model_config(conn, &ModelRecord::from_model(&model)?)?;
            Ok(model)
        })?;
        telemetry::log_event("registry.model", &format!("update id={}", id));
        Ok(model)
    }

    pub fn delete_model(&self, id: i64) -> Result<()> {
        let deleted = self.write(|conn| db::delete_model(conn, id))?;
        if !deleted {
            return Err(GatewayError::NotFound(format!("model id {}", id)));
        }
        telemetry::log_event("registry.model", &format!("delete id={}", id));
        Ok(())
    }

    fn require_model(&self, id: i64) -> Result<Model> {
        self.get_model(id)?
            .ok_or_else(|| GatewayError::NotFound(format!("model id {}", id)))
    }

    /**
     * \brief Counts a completed call against the provider and, when registered, the model.
     */
    pub fn record_success(&self, provider_id: i64, model_id: Option<i64>, tokens: u64) -> Result<()> {
        self.write(|conn| {
            db::increment_provider_usage(conn, provider_id, 1, tokens, 0)?;
            if let Some(model_id) = model_id {
                db::increment_model_usage(conn, model_id, 1, tokens)?;
            }
            Ok(())
        })
    }

    /**
     * \brief Counts a backend failure: one request and one error.
     */
    pub fn record_failure(&self, provider_id: i64) -> Result<()> {
        self.write(|conn| db::increment_provider_usage(conn, provider_id, 1, 0, 1))
    }

    /**
     * \brief Persists a probe outcome; `Err` carries the failure message.
     */
    pub fn record_probe(
        &self,
        provider_id: i64,
        outcome: std::result::Result<u64, &str>,
    ) -> Result<()> {
        let checked_at = db::now_timestamp();
        self.write(|conn| match outcome {
            Ok(latency_ms) => db::record_health_success(conn, provider_id, latency_ms, &checked_at),
            Err(message) => db::record_health_failure(conn, provider_id, message, &checked_at),
        })
    }

    /**
     * \brief Manual counter reset for a provider and its models.
     */
    pub fn reset_usage(&self, provider_id: i64) -> Result<Provider> {
        self.require_provider(provider_id)?;
        self.write(|conn| db::reset_usage(conn, provider_id))?;
        telemetry::log_event("registry.provider", &format!("reset-usage id={}", provider_id));
        self.require_provider(provider_id)
    }

    pub fn telemetry_enabled(&self) -> Result<bool> {
        self.with_conn(db::get_telemetry_enabled)
    }

    pub fn set_telemetry_enabled(&self, enabled: bool) -> Result<()> {
        self.with_conn(|conn| db::set_telemetry_enabled(conn, enabled))?;
        telemetry::set_enabled(enabled);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry() -> Registry {
        Registry::in_memory().expect("in-memory registry")
    }

    fn defaults_of(registry: &Registry) -> Vec<String> {
        registry
            .get_providers(true)
            .expect("list")
            .into_iter()
            .filter(|p| p.is_default)
            .map(|p| p.name)
            .collect()
    }

    #[test]
    fn creating_a_second_default_unsets_the_first() {
        let reg = registry();
        reg.create_provider(ProviderInput {
            is_default: Some(true),
            api_key: Some("sk-1".into()),
            ..ProviderInput::named("openai")
        })
        .expect("create openai");
        reg.create_provider(ProviderInput {
            is_default: Some(true),
            ..ProviderInput::named("anthropic")
        })
        .expect("create anthropic");

        let openai = reg.get_provider("openai").unwrap().unwrap();
        let anthropic = reg.get_provider("anthropic").unwrap().unwrap();
        assert!(!openai.is_default);
        assert!(anthropic.is_default);
        assert_eq!(defaults_of(&reg), vec!["anthropic".to_string()]);
    }

    #[test]
    fn update_to_default_keeps_exclusivity() {
        let reg = registry();
        let a = reg
            .create_provider(ProviderInput {
                is_default: Some(true),
                ..ProviderInput::named("openai")
            })
            .unwrap();
        let b = reg.create_provider(ProviderInput::named("ollama")).unwrap();
        reg.update_provider(
            b.id,
            ProviderPatch {
                is_default: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(defaults_of(&reg), vec!["ollama".to_string()]);
        reg.update_provider(
            a.id,
            ProviderPatch {
                priority: Some(5),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(defaults_of(&reg), vec!["ollama".to_string()]);
    }

    #[test]
    fn default_provider_falls_back_to_highest_priority_enabled() {
        let reg = registry();
        assert!(reg.get_default_provider().unwrap().is_none());

        let flagged = reg
            .create_provider(ProviderInput {
                is_default: Some(true),
                priority: Some(1),
                ..ProviderInput::named("openai")
            })
            .unwrap();
        reg.create_provider(ProviderInput {
            priority: Some(10),
            ..ProviderInput::named("anthropic")
        })
        .unwrap();
        reg.create_provider(ProviderInput {
            priority: Some(50),
            is_enabled: Some(false),
            ..ProviderInput::named("gemini")
        })
        .unwrap();
        assert_eq!(reg.get_default_provider().unwrap().unwrap().name, "openai");

        reg.update_provider(
            flagged.id,
            ProviderPatch {
                is_enabled: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(reg.get_default_provider().unwrap().unwrap().name, "anthropic");

        let anthropic = reg.get_provider("anthropic").unwrap().unwrap();
        reg.update_provider(
            anthropic.id,
            ProviderPatch {
                is_enabled: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(reg.get_default_provider().unwrap().is_none());
    }

    #[test]
    fn duplicate_name_is_a_conflict() {
        let reg = registry();
        reg.create_provider(ProviderInput::named("openai")).unwrap();
        let err = reg.create_provider(ProviderInput::named("openai")).unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }

    #[test]
    fn create_merges_family_defaults() {
        let reg = registry();
        let ollama = reg.create_provider(ProviderInput::named("ollama")).unwrap();
        assert_eq!(ollama.family, ProviderFamily::Ollama);
        assert_eq!(ollama.display_name, "Ollama");
        assert_eq!(ollama.base_url.as_deref(), Some("http://localhost:11434"));
        assert_eq!(ollama.policy.timeout_ms, 120_000);
        assert!(!ollama.capabilities.supports_function_calling);

        let custom = reg
            .create_provider(ProviderInput {
                timeout_ms: Some(5_000),
                supports_vision: Some(true),
                base_url: Some("https://llm.internal/v1".into()),
                ..ProviderInput::named("campus-llm")
            })
            .unwrap();
        assert_eq!(custom.family, ProviderFamily::OpenAiCompatible);
        assert_eq!(custom.policy.timeout_ms, 5_000);
        assert_eq!(custom.policy.max_retries, 3);
        assert!(custom.capabilities.supports_vision);
        assert_eq!(custom.base_url.as_deref(), Some("https://llm.internal/v1"));
    }

    #[test]
    fn patch_leaves_absent_fields_and_clears_null_ones() {
        let reg = registry();
        let p = reg
            .create_provider(ProviderInput {
                api_key: Some("sk-secret".into()),
                organization_id: Some("org-1".into()),
                rate_limit_rpm: Some(60),
                ..ProviderInput::named("openai")
            })
            .unwrap();
        let patch: ProviderPatch =
            serde_json::from_str(r#"{"organizationId": null, "apiKey": "", "rateLimitRpm": null}"#)
                .unwrap();
        let updated = reg.update_provider(p.id, patch).unwrap();
        assert_eq!(updated.organization_id, None);
        assert_eq!(updated.api_key, None);
        assert_eq!(updated.policy.rate_limit_rpm, None);
        assert_eq!(updated.base_url, p.base_url);
        assert_eq!(updated.display_name, "OpenAI");

        let updated = reg
            .update_provider(
                p.id,
                serde_json::from_str(r#"{"displayName": "Campus OpenAI"}"#).unwrap(),
            )
            .unwrap();
        assert_eq!(updated.display_name, "Campus OpenAI");
        assert_eq!(updated.policy.timeout_ms, p.policy.timeout_ms);
    }

    #[test]
    fn concurrent_patches_keep_both_fields() {
        let reg = registry();
        let p = reg.create_provider(ProviderInput::named("openai")).unwrap();
        let priorities = {
            let reg = reg.clone();
            std::thread::spawn(move || {
                for i in 1..=20 {
                    let patch = ProviderPatch {
                        priority: Some(i),
                        ..Default::default()
                    };
                    reg.update_provider(p.id, patch).unwrap();
                }
            })
        };
        let names = {
            let reg = reg.clone();
            std::thread::spawn(move || {
                for i in 1..=20 {
                    let patch = ProviderPatch {
                        display_name: Some(format!("B{i}")),
                        ..Default::default()
                    };
                    reg.update_provider(p.id, patch).unwrap();
                }
            })
        };
        priorities.join().unwrap();
        names.join().unwrap();

        let after = reg.get_provider_by_id(p.id).unwrap().unwrap();
        assert_eq!(after.priority, 20);
        assert_eq!(after.display_name, "B20");
    }

    #[test]
    fn concurrent_model_patches_keep_both_fields() {
        let reg = registry();
        let p = reg.create_provider(ProviderInput::named("ollama")).unwrap();
        let m = reg
            .create_model(ModelInput {
                provider_id: p.id,
                model_id: "phi3".into(),
                ..Default::default()
            })
            .unwrap();
        let lengths = {
            let reg = reg.clone();
            std::thread::spawn(move || {
                for i in 1..=20u32 {
                    let patch = ModelPatch {
                        context_length: Some(Some(i * 1024)),
                        ..Default::default()
                    };
                    reg.update_model(m.id, patch).unwrap();
                }
            })
        };
        let names = {
            let reg = reg.clone();
            std::thread::spawn(move || {
                for i in 1..=20 {
                    let patch = ModelPatch {
                        name: Some(format!("Phi {i}")),
                        ..Default::default()
                    };
                    reg.update_model(m.id, patch).unwrap();
                }
            })
        };
        lengths.join().unwrap();
        names.join().unwrap();

        let after = reg.get_model(m.id).unwrap().unwrap();
        assert_eq!(after.context_length, Some(20 * 1024));
        assert_eq!(after.name, "Phi 20");
    }

    #[test]
    fn cached_reads_converge_after_concurrent_writes() {
        let reg = registry();
        let p = reg.create_provider(ProviderInput::named("ollama")).unwrap();
        let reader = {
            let reg = reg.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    reg.get_provider("ollama").unwrap();
                }
            })
        };
        for i in 1..=50 {
            let patch = ProviderPatch {
                priority: Some(i),
                ..Default::default()
            };
            reg.update_provider(p.id, patch).unwrap();
        }
        reader.join().unwrap();
        assert_eq!(reg.get_provider("ollama").unwrap().unwrap().priority, 50);
        assert_eq!(
            reg.get_provider(&p.id.to_string()).unwrap().unwrap().priority,
            50
        );
    }

    #[test]
    fn generation_defaults_patch_is_nested_like_creation() {
        let reg = registry();
        let input: ProviderInput = serde_json::from_str(
            r#"{"name": "openai", "defaults": {"temperature": 0.4, "maxTokens": 512}}"#,
        )
        .unwrap();
        let p = reg.create_provider(input).unwrap();
        assert_eq!(p.defaults.temperature, Some(0.4));

        let patch: ProviderPatch = serde_json::from_str(
            r#"{"defaults": {"temperature": null, "topP": 0.9}}"#,
        )
        .unwrap();
        let updated = reg.update_provider(p.id, patch).unwrap();
        assert_eq!(updated.defaults.temperature, None);
        assert_eq!(updated.defaults.top_p, Some(0.9));
        assert_eq!(updated.defaults.max_tokens, Some(512));
    }

    #[test]
    fn patching_a_missing_provider_is_not_found() {
        let reg = registry();
        assert!(matches!(
            reg.update_provider(404, ProviderPatch::default()),
            Err(GatewayError::NotFound(_))
        ));
        assert!(matches!(
            reg.update_model(404, ModelPatch::default()),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[test]
    fn cache_sees_writes() {
        let reg = registry();
        let p = reg.create_provider(ProviderInput::named("ollama")).unwrap();
        assert_eq!(reg.get_provider("ollama").unwrap().unwrap().priority, 0);
        reg.update_provider(
            p.id,
            ProviderPatch {
                priority: Some(42),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(reg.get_provider("ollama").unwrap().unwrap().priority, 42);
        assert_eq!(
            reg.get_provider(&p.id.to_string()).unwrap().unwrap().priority,
            42
        );
    }

    #[test]
    fn delete_cascades_and_reports_missing() {
        let reg = registry();
        let p = reg.create_provider(ProviderInput::named("openai")).unwrap();
        reg.seed_common_models(p.id, "openai").unwrap();
        reg.delete_provider(p.id).unwrap();
        assert!(reg.get_provider("openai").unwrap().is_none());
        assert!(reg.list_models(p.id, true).unwrap().is_empty());
        assert!(matches!(
            reg.delete_provider(p.id),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[test]
    fn seed_common_models_is_idempotent() {
        let reg = registry();
        let p = reg.create_provider(ProviderInput::named("anthropic")).unwrap();
        assert_eq!(reg.seed_common_models(p.id, "anthropic").unwrap(), 3);

        let first = reg.default_model(p.id).unwrap().unwrap();
        assert_eq!(first.model_id, "claude-3-5-sonnet-20241022");
        let renamed = reg
            .update_model(
                first.id,
                ModelPatch {
                    name: Some("Old name".into()),
                    context_length: Some(Some(1)),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(renamed.name, "Old name");

        assert_eq!(reg.seed_common_models(p.id, "anthropic").unwrap(), 0);
        let models = reg.list_models(p.id, true).unwrap();
        assert_eq!(models.len(), 3);
        assert_eq!(models.iter().filter(|m| m.is_default).count(), 1);
        let refreshed = reg.get_model(first.id).unwrap().unwrap();
        assert_eq!(refreshed.name, "Claude 3.5 Sonnet");
        assert_eq!(refreshed.context_length, Some(200_000));
    }

    #[test]
    fn model_default_is_exclusive_per_provider() {
        let reg = registry();
        let p = reg.create_provider(ProviderInput::named("ollama")).unwrap();
        reg.seed_common_models(p.id, "ollama").unwrap();
        let custom = reg
            .create_model(ModelInput {
                provider_id: p.id,
                model_id: "phi3".into(),
                is_default: Some(true),
                stop_sequences: vec!["###".into()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(custom.name, "phi3");
        assert_eq!(custom.stop_sequences, vec!["###".to_string()]);
        let defaults: Vec<String> = reg
            .list_models(p.id, true)
            .unwrap()
            .into_iter()
            .filter(|m| m.is_default)
            .map(|m| m.model_id)
            .collect();
        assert_eq!(defaults, vec!["phi3".to_string()]);

        let dup = reg.create_model(ModelInput {
            provider_id: p.id,
            model_id: "phi3".into(),
            ..Default::default()
        });
        assert!(matches!(dup, Err(GatewayError::Conflict(_))));
        let orphan = reg.create_model(ModelInput {
            provider_id: 999,
            model_id: "x".into(),
            ..Default::default()
        });
        assert!(matches!(orphan, Err(GatewayError::NotFound(_))));
    }

    #[test]
    fn seed_default_providers_only_creates_missing() {
        let reg = registry();
        reg.create_provider(ProviderInput {
            priority: Some(1),
            ..ProviderInput::named("ollama")
        })
        .unwrap();
        let created = reg.seed_default_providers().unwrap();
        let names: Vec<&str> = created.iter().map(|p| p.name.as_str()).collect();
        assert!(!names.contains(&"ollama"));
        assert_eq!(created.len(), WELL_KNOWN_PROVIDERS.len() - 1);
        assert_eq!(reg.get_provider("ollama").unwrap().unwrap().priority, 1);
        assert!(reg.seed_default_providers().unwrap().is_empty());
        assert_eq!(reg.get_providers(true).unwrap().len(), WELL_KNOWN_PROVIDERS.len());
        let gemini = reg.get_provider("gemini").unwrap().unwrap();
        assert_eq!(reg.list_models(gemini.id, true).unwrap().len(), 3);
    }

    #[test]
    fn counters_only_grow_until_reset() {
        let reg = registry();
        let p = reg.create_provider(ProviderInput::named("ollama")).unwrap();
        reg.seed_common_models(p.id, "ollama").unwrap();
        let model = reg.default_model(p.id).unwrap().unwrap();
        reg.record_success(p.id, Some(model.id), 30).unwrap();
        reg.record_failure(p.id).unwrap();
        let p2 = reg.get_provider("ollama").unwrap().unwrap();
        assert_eq!(p2.usage.total_requests, 2);
        assert_eq!(p2.usage.total_tokens, 30);
        assert_eq!(p2.usage.total_errors, 1);
        assert_eq!(reg.get_model(model.id).unwrap().unwrap().total_tokens, 30);

        let reset = reg.reset_usage(p.id).unwrap();
        assert_eq!(reset.usage, UsageCounters::default());
        assert_eq!(reg.get_model(model.id).unwrap().unwrap().total_requests, 0);
    }

    #[test]
    fn probe_outcomes_drive_health_state() {
        let reg = registry();
        let p = reg.create_provider(ProviderInput::named("ollama")).unwrap();
        assert_eq!(p.health.status, HealthStatus::Unknown);
        reg.record_probe(p.id, Err("connection refused")).unwrap();
        let p2 = reg.get_provider_by_id(p.id).unwrap().unwrap();
        assert_eq!(p2.health.status, HealthStatus::Unhealthy);
        assert_eq!(p2.health.consecutive_failures, 1);
        reg.record_probe(p.id, Ok(12)).unwrap();
        let p3 = reg.get_provider_by_id(p.id).unwrap().unwrap();
        assert_eq!(p3.health.status, HealthStatus::Healthy);
        assert_eq!(p3.health.consecutive_failures, 0);
        assert!(p3.is_enabled);
    }
}
