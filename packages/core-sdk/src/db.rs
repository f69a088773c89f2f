use rusqlite::{named_params, params, Connection, ErrorCode, OptionalExtension, Row};
use std::{collections::BTreeMap, thread, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::config::IN_MEMORY_DB;
use crate::error::{GatewayError, Result};
use crate::models::{
    GenerationDefaults, HealthStatus, Model, Provider, ProviderCapabilities, ProviderFamily,
    ProviderHealth, RequestPolicy, UsageCounters,
};

/**
 * \brief Row of the `providers` table as stored. JSON columns stay encoded here
 * and are parsed when converting into [`Provider`].
 */
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub is_enabled: bool,
    pub is_default: bool,
    pub priority: i64,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub organization_id: Option<String>,
    pub project_id: Option<String>,
    pub custom_headers: String,
    pub default_temperature: Option<f64>,
    pub default_max_tokens: Option<i64>,
    pub default_top_p: Option<f64>,
    pub default_top_k: Option<i64>,
    pub default_frequency_penalty: Option<f64>,
    pub default_presence_penalty: Option<f64>,
    pub timeout_ms: i64,
    pub max_retries: i64,
    pub retry_delay_ms: i64,
    pub rate_limit_rpm: Option<i64>,
    pub rate_limit_tpm: Option<i64>,
    pub concurrency_limit: Option<i64>,
    pub supports_streaming: bool,
    pub supports_vision: bool,
    pub supports_function_calling: bool,
    pub supports_json_mode: bool,
    pub supports_system_message: bool,
    pub last_health_check: Option<String>,
    pub health_status: String,
    pub consecutive_failures: i64,
    pub average_latency_ms: Option<f64>,
    pub last_error: Option<String>,
    pub total_requests: i64,
    pub total_tokens: i64,
    pub total_errors: i64,
    pub metadata: String,
    pub created_at: String,
    pub updated_at: String,
}

/**
 * \brief Row of the `models` table as stored.
 */
#[derive(Debug, Clone)]
pub struct ModelRecord {
    pub id: i64,
    pub provider_id: i64,
    pub model_id: String,
    pub name: String,
    pub description: Option<String>,
    pub is_enabled: bool,
    pub is_default: bool,
    pub context_length: Option<i64>,
    pub max_output_tokens: Option<i64>,
    pub default_temperature: Option<f64>,
    pub default_max_tokens: Option<i64>,
    pub default_top_p: Option<f64>,
    pub default_top_k: Option<i64>,
    pub stop_sequences: String,
    pub supports_vision: Option<bool>,
    pub supports_function_calling: Option<bool>,
    pub supports_json_mode: Option<bool>,
    pub total_requests: i64,
    pub total_tokens: i64,
    pub metadata: String,
    pub created_at: String,
    pub updated_at: String,
}

const PROVIDER_COLUMNS: &str = "id, name, display_name, is_enabled, is_default, priority, \
    base_url, api_key, organization_id, project_id, custom_headers, default_temperature, \
    default_max_tokens, default_top_p, default_top_k, default_frequency_penalty, \
    default_presence_penalty, timeout_ms, max_retries, retry_delay_ms, rate_limit_rpm, \
    rate_limit_tpm, concurrency_limit, supports_streaming, supports_vision, \
    supports_function_calling, supports_json_mode, supports_system_message, \
    last_health_check, health_status, consecutive_failures, average_latency_ms, last_error, \
    total_requests, total_tokens, total_errors, metadata, created_at, updated_at";

const MODEL_COLUMNS: &str = "id, provider_id, model_id, name, description, is_enabled, \
    is_default, context_length, max_output_tokens, default_temperature, default_max_tokens, \
    default_top_p, default_top_k, stop_sequences, supports_vision, supports_function_calling, \
    supports_json_mode, total_requests, total_tokens, metadata, created_at, updated_at";

/**
 * \brief Opens the database at `path`; `:memory:` opens a private in-memory database.
 */
pub fn open_db(path: &str) -> Result<Connection> {
    let conn = if path == IN_MEMORY_DB {
        Connection::open_in_memory()?
    } else {
        Connection::open(path)?
    };
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/**
 * \brief Runs migrations, creating the provider, model and config tables.
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS providers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            is_enabled INTEGER NOT NULL DEFAULT 1,
            is_default INTEGER NOT NULL DEFAULT 0,
            priority INTEGER NOT NULL DEFAULT 0,
            base_url TEXT,
            api_key TEXT,
            organization_id TEXT,
            project_id TEXT,
            custom_headers TEXT NOT NULL DEFAULT '{}',
            default_temperature REAL,
            default_max_tokens INTEGER,
            default_top_p REAL,
            default_top_k INTEGER,
            default_frequency_penalty REAL,
            default_presence_penalty REAL,
            timeout_ms INTEGER NOT NULL DEFAULT 60000,
            max_retries INTEGER NOT NULL DEFAULT 3,
            retry_delay_ms INTEGER NOT NULL DEFAULT 1000,
            rate_limit_rpm INTEGER,
            rate_limit_tpm INTEGER,
            concurrency_limit INTEGER,
            supports_streaming INTEGER NOT NULL DEFAULT 0,
            supports_vision INTEGER NOT NULL DEFAULT 0,
            supports_function_calling INTEGER NOT NULL DEFAULT 0,
            supports_json_mode INTEGER NOT NULL DEFAULT 0,
            supports_system_message INTEGER NOT NULL DEFAULT 1,
            last_health_check TEXT,
            health_status TEXT NOT NULL DEFAULT 'unknown',
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            average_latency_ms REAL,
            last_error TEXT,
            total_requests INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            total_errors INTEGER NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS models (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            provider_id INTEGER NOT NULL REFERENCES providers(id) ON DELETE CASCADE,
            model_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            is_enabled INTEGER NOT NULL DEFAULT 1,
            is_default INTEGER NOT NULL DEFAULT 0,
            context_length INTEGER,
            max_output_tokens INTEGER,
            default_temperature REAL,
            default_max_tokens INTEGER,
            default_top_p REAL,
            default_top_k INTEGER,
            stop_sequences TEXT NOT NULL DEFAULT '[]',
            supports_vision INTEGER,
            supports_function_calling INTEGER,
            supports_json_mode INTEGER,
            total_requests INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (provider_id, model_id)
        );

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

pub fn now_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

fn parse_timestamp(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|e| GatewayError::Internal(format!("invalid timestamp {value}: {e}")))
}

fn to_u32(value: Option<i64>) -> Option<u32> {
    value.and_then(|v| u32::try_from(v).ok())
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn parse_object(value: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    if value.trim().is_empty() {
        return Ok(serde_json::Map::new());
    }
    Ok(serde_json::from_str(value)?)
}

impl TryFrom<ProviderRecord> for Provider {
    type Error = GatewayError;

    fn try_from(rec: ProviderRecord) -> Result<Self> {
        let custom_headers: BTreeMap<String, String> = if rec.custom_headers.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&rec.custom_headers)?
        };
        let last_check = rec
            .last_health_check
            .as_deref()
            .map(parse_timestamp)
            .transpose()?;
        Ok(Provider {
            id: rec.id,
            family: ProviderFamily::from_name(&rec.name),
            name: rec.name,
            display_name: rec.display_name,
            is_enabled: rec.is_enabled,
            is_default: rec.is_default,
            priority: rec.priority,
            base_url: rec.base_url,
            api_key: rec.api_key,
            organization_id: rec.organization_id,
            project_id: rec.project_id,
            custom_headers,
            defaults: GenerationDefaults {
                temperature: rec.default_temperature,
                max_tokens: to_u32(rec.default_max_tokens),
                top_p: rec.default_top_p,
                top_k: to_u32(rec.default_top_k),
                frequency_penalty: rec.default_frequency_penalty,
                presence_penalty: rec.default_presence_penalty,
            },
            policy: RequestPolicy {
                timeout_ms: to_u64(rec.timeout_ms),
                max_retries: to_u32(Some(rec.max_retries)).unwrap_or(0),
                retry_delay_ms: to_u64(rec.retry_delay_ms),
                rate_limit_rpm: to_u32(rec.rate_limit_rpm),
                rate_limit_tpm: to_u32(rec.rate_limit_tpm),
                concurrency_limit: to_u32(rec.concurrency_limit),
            },
            capabilities: ProviderCapabilities {
                supports_streaming: rec.supports_streaming,
                supports_vision: rec.supports_vision,
                supports_function_calling: rec.supports_function_calling,
                supports_json_mode: rec.supports_json_mode,
                supports_system_message: rec.supports_system_message,
            },
            health: ProviderHealth {
                last_check,
                status: HealthStatus::parse(&rec.health_status),
                consecutive_failures: to_u32(Some(rec.consecutive_failures)).unwrap_or(0),
                average_latency_ms: rec.average_latency_ms,
                last_error: rec.last_error,
            },
            usage: UsageCounters {
                total_requests: to_u64(rec.total_requests),
                total_tokens: to_u64(rec.total_tokens),
                total_errors: to_u64(rec.total_errors),
            },
            metadata: parse_object(&rec.metadata)?,
            created_at: parse_timestamp(&rec.created_at)?,
            updated_at: parse_timestamp(&rec.updated_at)?,
        })
    }
}

impl ProviderRecord {
    /**
     * \brief Encodes a domain provider for writing; JSON fields are serialized here.
     */
    pub fn from_provider(p: &Provider) -> Result<Self> {
        let format_ts = |ts: &OffsetDateTime| {
            ts.format(&Rfc3339)
                .map_err(|e| GatewayError::Internal(format!("format timestamp: {e}")))
        };
        Ok(Self {
            id: p.id,
            name: p.name.clone(),
            display_name: p.display_name.clone(),
            is_enabled: p.is_enabled,
            is_default: p.is_default,
            priority: p.priority,
            base_url: p.base_url.clone(),
            api_key: p.api_key.clone(),
            organization_id: p.organization_id.clone(),
            project_id: p.project_id.clone(),
            custom_headers: serde_json::to_string(&p.custom_headers)?,
            default_temperature: p.defaults.temperature,
            default_max_tokens: p.defaults.max_tokens.map(i64::from),
            default_top_p: p.defaults.top_p,
            default_top_k: p.defaults.top_k.map(i64::from),
            default_frequency_penalty: p.defaults.frequency_penalty,
            default_presence_penalty: p.defaults.presence_penalty,
            timeout_ms: i64::try_from(p.policy.timeout_ms).unwrap_or(i64::MAX),
            max_retries: i64::from(p.policy.max_retries),
            retry_delay_ms: i64::try_from(p.policy.retry_delay_ms).unwrap_or(i64::MAX),
            rate_limit_rpm: p.policy.rate_limit_rpm.map(i64::from),
            rate_limit_tpm: p.policy.rate_limit_tpm.map(i64::from),
            concurrency_limit: p.policy.concurrency_limit.map(i64::from),
            supports_streaming: p.capabilities.supports_streaming,
            supports_vision: p.capabilities.supports_vision,
            supports_function_calling: p.capabilities.supports_function_calling,
            supports_json_mode: p.capabilities.supports_json_mode,
            supports_system_message: p.capabilities.supports_system_message,
            last_health_check: p.health.last_check.as_ref().map(format_ts).transpose()?,
            health_status: p.health.status.as_str().to_string(),
            consecutive_failures: i64::from(p.health.consecutive_failures),
            average_latency_ms: p.health.average_latency_ms,
            last_error: p.health.last_error.clone(),
            total_requests: i64::try_from(p.usage.total_requests).unwrap_or(i64::MAX),
            total_tokens: i64::try_from(p.usage.total_tokens).unwrap_or(i64::MAX),
            total_errors: i64::try_from(p.usage.total_errors).unwrap_or(i64::MAX),
            metadata: serde_json::to_string(&p.metadata)?,
            created_at: format_ts(&p.created_at)?,
            updated_at: format_ts(&p.updated_at)?,
        })
    }
}

impl TryFrom<ModelRecord> for Model {
    type Error = GatewayError;

    fn try_from(rec: ModelRecord) -> Result<Self> {
        let stop_sequences: Vec<String> = if rec.stop_sequences.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&rec.stop_sequences)?
        };
        Ok(Model {
            id: rec.id,
            provider_id: rec.provider_id,
            model_id: rec.model_id,
            name: rec.name,
            description: rec.description,
            is_enabled: rec.is_enabled,
            is_default: rec.is_default,
            context_length: to_u32(rec.context_length),
            max_output_tokens: to_u32(rec.max_output_tokens),
            default_temperature: rec.default_temperature,
            default_max_tokens: to_u32(rec.default_max_tokens),
            default_top_p: rec.default_top_p,
            default_top_k: to_u32(rec.default_top_k),
            stop_sequences,
            supports_vision: rec.supports_vision,
            supports_function_calling: rec.supports_function_calling,
            supports_json_mode: rec.supports_json_mode,
            total_requests: to_u64(rec.total_requests),
            total_tokens: to_u64(rec.total_tokens),
            metadata: parse_object(&rec.metadata)?,
            created_at: parse_timestamp(&rec.created_at)?,
            updated_at: parse_timestamp(&rec.updated_at)?,
        })
    }
}

impl ModelRecord {
    pub fn from_model(m: &Model) -> Result<Self> {
        let format_ts = |ts: &OffsetDateTime| {
            ts.format(&Rfc3339)
                .map_err(|e| GatewayError::Internal(format!("format timestamp: {e}")))
        };
        Ok(Self {
            id: m.id,
            provider_id: m.provider_id,
            model_id: m.model_id.clone(),
            name: m.name.clone(),
            description: m.description.clone(),
            is_enabled: m.is_enabled,
            is_default: m.is_default,
            context_length: m.context_length.map(i64::from),
            max_output_tokens: m.max_output_tokens.map(i64::from),
            default_temperature: m.default_temperature,
            default_max_tokens: m.default_max_tokens.map(i64::from),
            default_top_p: m.default_top_p,
            default_top_k: m.default_top_k.map(i64::from),
            stop_sequences: serde_json::to_string(&m.stop_sequences)?,
            supports_vision: m.supports_vision,
            supports_function_calling: m.supports_function_calling,
            supports_json_mode: m.supports_json_mode,
            total_requests: i64::try_from(m.total_requests).unwrap_or(i64::MAX),
            total_tokens: i64::try_from(m.total_tokens).unwrap_or(i64::MAX),
            metadata: serde_json::to_string(&m.metadata)?,
            created_at: format_ts(&m.created_at)?,
            updated_at: format_ts(&m.updated_at)?,
        })
    }
}

fn map_provider_row(row: &Row<'_>) -> rusqlite::Result<ProviderRecord> {
    Ok(ProviderRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        display_name: row.get("display_name")?,
        is_enabled: row.get("is_enabled")?,
        is_default: row.get("is_default")?,
        priority: row.get("priority")?,
        base_url: row.get("base_url")?,
        api_key: row.get("api_key")?,
        organization_id: row.get("organization_id")?,
        project_id: row.get("project_id")?,
        custom_headers: row.get("custom_headers")?,
        default_temperature: row.get("default_temperature")?,
        default_max_tokens: row.get("default_max_tokens")?,
        default_top_p: row.get("default_top_p")?,
        default_top_k: row.get("default_top_k")?,
        default_frequency_penalty: row.get("default_frequency_penalty")?,
        default_presence_penalty: row.get("default_presence_penalty")?,
        timeout_ms: row.get("timeout_ms")?,
        max_retries: row.get("max_retries")?,
        retry_delay_ms: row.get("retry_delay_ms")?,
        rate_limit_rpm: row.get("rate_limit_rpm")?,
        rate_limit_tpm: row.get("rate_limit_tpm")?,
        concurrency_limit: row.get("concurrency_limit")?,
        supports_streaming: row.get("supports_streaming")?,
        supports_vision: row.get("supports_vision")?,
        supports_function_calling: row.get("supports_function_calling")?,
        supports_json_mode: row.get("supports_json_mode")?,
        supports_system_message: row.get("supports_system_message")?,
        last_health_check: row.get("last_health_check")?,
        health_status: row.get("health_status")?,
        consecutive_failures: row.get("consecutive_failures")?,
        average_latency_ms: row.get("average_latency_ms")?,
        last_error: row.get("last_error")?,
        total_requests: row.get("total_requests")?,
        total_tokens: row.get("total_tokens")?,
        total_errors: row.get("total_errors")?,
        metadata: row.get("metadata")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn map_model_row(row: &Row<'_>) -> rusqlite::Result<ModelRecord> {
    Ok(ModelRecord {
        id: row.get("id")?,
        provider_id: row.get("provider_id")?,
        model_id: row.get("model_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        is_enabled: row.get("is_enabled")?,
        is_default: row.get("is_default")?,
        context_length: row.get("context_length")?,
        max_output_tokens: row.get("max_output_tokens")?,
        default_temperature: row.get("default_temperature")?,
        default_max_tokens: row.get("default_max_tokens")?,
        default_top_p: row.get("default_top_p")?,
        default_top_k: row.get("default_top_k")?,
        stop_sequences: row.get("stop_sequences")?,
        supports_vision: row.get("supports_vision")?,
        supports_function_calling: row.get("supports_function_calling")?,
        supports_json_mode: row.get("supports_json_mode")?,
        total_requests: row.get("total_requests")?,
        total_tokens: row.get("total_tokens")?,
        metadata: row.get("metadata")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/**
 * \brief Inserts a provider row and returns its id. `id` on the record is ignored.
 */
pub fn insert_provider(conn: &Connection, rec: &ProviderRecord) -> Result<i64> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO providers (name, display_name, is_enabled, is_default, priority,
                base_url, api_key, organization_id, project_id, custom_headers,
                default_temperature, default_max_tokens, default_top_p, default_top_k,
                default_frequency_penalty, default_presence_penalty, timeout_ms, max_retries,
                retry_delay_ms, rate_limit_rpm, rate_limit_tpm, concurrency_limit,
                supports_streaming, supports_vision, supports_function_calling,
                supports_json_mode, supports_system_message, metadata, created_at, updated_at)
             VALUES (:name, :display_name, :is_enabled, :is_default, :priority,
                :base_url, :api_key, :organization_id, :project_id, :custom_headers,
                :default_temperature, :default_max_tokens, :default_top_p, :default_top_k,
                :default_frequency_penalty, :default_presence_penalty, :timeout_ms, :max_retries,
                :retry_delay_ms, :rate_limit_rpm, :rate_limit_tpm, :concurrency_limit,
                :supports_streaming, :supports_vision, :supports_function_calling,
                :supports_json_mode, :supports_system_message, :metadata, :created_at, :updated_at)",
            named_params! {
                ":name": rec.name,
                ":display_name": rec.display_name,
                ":is_enabled": rec.is_enabled,
                ":is_default": rec.is_default,
                ":priority": rec.priority,
                ":base_url": rec.base_url,
                ":api_key": rec.api_key,
                ":organization_id": rec.organization_id,
                ":project_id": rec.project_id,
                ":custom_headers": rec.custom_headers,
                ":default_temperature": rec.default_temperature,
                ":default_max_tokens": rec.default_max_tokens,
                ":default_top_p": rec.default_top_p,
                ":default_top_k": rec.default_top_k,
                ":default_frequency_penalty": rec.default_frequency_penalty,
                ":default_presence_penalty": rec.default_presence_penalty,
                ":timeout_ms": rec.timeout_ms,
                ":max_retries": rec.max_retries,
                ":retry_delay_ms": rec.retry_delay_ms,
                ":rate_limit_rpm": rec.rate_limit_rpm,
                ":rate_limit_tpm": rec.rate_limit_tpm,
                ":concurrency_limit": rec.concurrency_limit,
                ":supports_streaming": rec.supports_streaming,
                ":supports_vision": rec.supports_vision,
                ":supports_function_calling": rec.supports_function_calling,
                ":supports_json_mode": rec.supports_json_mode,
                ":supports_system_message": rec.supports_system_message,
                ":metadata": rec.metadata,
                ":created_at": rec.created_at,
                ":updated_at": rec.updated_at,
            },
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief Writes the configuration columns of a provider. Health and usage
 * columns are owned by the counter functions and are left alone.
 */
pub fn update_provider_config(conn: &Connection, rec: &ProviderRecord) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE providers SET display_name=:display_name, is_enabled=:is_enabled,
                is_default=:is_default, priority=:priority, base_url=:base_url,
                api_key=:api_key, organization_id=:organization_id, project_id=:project_id,
                custom_headers=:custom_headers, default_temperature=:default_temperature,
                default_max_tokens=:default_max_tokens, default_top_p=:default_top_p,
                default_top_k=:default_top_k,
                default_frequency_penalty=:default_frequency_penalty,
                default_presence_penalty=:default_presence_penalty, timeout_ms=:timeout_ms,
                max_retries=:max_retries, retry_delay_ms=:retry_delay_ms,
                rate_limit_rpm=:rate_limit_rpm, rate_limit_tpm=:rate_limit_tpm,
                concurrency_limit=:concurrency_limit, supports_streaming=:supports_streaming,
                supports_vision=:supports_vision,
                supports_function_calling=:supports_function_calling,
                supports_json_mode=:supports_json_mode,
                supports_system_message=:supports_system_message, metadata=:metadata,
                updated_at=:updated_at
             WHERE id=:id",
            named_params! {
                ":id": rec.id,
                ":display_name": rec.display_name,
                ":is_enabled": rec.is_enabled,
                ":is_default": rec.is_default,
                ":priority": rec.priority,
                ":base_url": rec.base_url,
                ":api_key": rec.api_key,
                ":organization_id": rec.organization_id,
                ":project_id": rec.project_id,
                ":custom_headers": rec.custom_headers,
                ":default_temperature": rec.default_temperature,
                ":default_max_tokens": rec.default_max_tokens,
                ":default_top_p": rec.default_top_p,
                ":default_top_k": rec.default_top_k,
                ":default_frequency_penalty": rec.default_frequency_penalty,
                ":default_presence_penalty": rec.default_presence_penalty,
                ":timeout_ms": rec.timeout_ms,
                ":max_retries": rec.max_retries,
                ":retry_delay_ms": rec.retry_delay_ms,
                ":rate_limit_rpm": rec.rate_limit_rpm,
                ":rate_limit_tpm": rec.rate_limit_tpm,
                ":concurrency_limit": rec.concurrency_limit,
                ":supports_streaming": rec.supports_streaming,
                ":supports_vision": rec.supports_vision,
                ":supports_function_calling": rec.supports_function_calling,
                ":supports_json_mode": rec.supports_json_mode,
                ":supports_system_message": rec.supports_system_message,
                ":metadata": rec.metadata,
                ":updated_at": rec.updated_at,
            },
        )
    })?;
    if rows == 0 {
        return Err(GatewayError::NotFound(format!("provider id {}", rec.id)));
    }
    Ok(())
}

/**
 * \brief Deletes a provider; its models go with it through the foreign key cascade.
 */
pub fn delete_provider(conn: &Connection, id: i64) -> Result<bool> {
    let rows = retry_on_locked(|| conn.execute("DELETE FROM providers WHERE id=?1", params![id]))?;
    Ok(rows > 0)
}

/**
 * \brief Lists providers ordered by priority (desc) then name.
 */
pub fn list_providers(conn: &Connection, include_disabled: bool) -> Result<Vec<ProviderRecord>> {
    let sql = if include_disabled {
        format!("SELECT {PROVIDER_COLUMNS} FROM providers ORDER BY priority DESC, name ASC")
    } else {
        format!(
            "SELECT {PROVIDER_COLUMNS} FROM providers WHERE is_enabled=1 \
             ORDER BY priority DESC, name ASC"
        )
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], map_provider_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_provider_by_id(conn: &Connection, id: i64) -> Result<Option<ProviderRecord>> {
    conn.query_row(
        &format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE id=?1"),
        params![id],
        map_provider_row,
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_provider_by_name(conn: &Connection, name: &str) -> Result<Option<ProviderRecord>> {
    conn.query_row(
        &format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE name=?1"),
        params![name],
        map_provider_row,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief The provider flagged default and enabled, if any.
 */
pub fn get_flagged_default_provider(conn: &Connection) -> Result<Option<ProviderRecord>> {
    conn.query_row(
        &format!(
            "SELECT {PROVIDER_COLUMNS} FROM providers WHERE is_default=1 AND is_enabled=1 \
             ORDER BY priority DESC, name ASC LIMIT 1"
        ),
        [],
        map_provider_row,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief Highest-priority enabled provider regardless of its default flag.
 */
pub fn get_top_enabled_provider(conn: &Connection) -> Result<Option<ProviderRecord>> {
    conn.query_row(
        &format!(
            "SELECT {PROVIDER_COLUMNS} FROM providers WHERE is_enabled=1 \
             ORDER BY priority DESC, name ASC LIMIT 1"
        ),
        [],
        map_provider_row,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief Clears the default flag on every provider except `keep`.
 */
pub fn clear_default_providers(conn: &Connection, keep: Option<i64>) -> Result<usize> {
    let rows = retry_on_locked(|| match keep {
        Some(id) => conn.execute(
            "UPDATE providers SET is_default=0 WHERE is_default=1 AND id<>?1",
            params![id],
        ),
        None => conn.execute("UPDATE providers SET is_default=0 WHERE is_default=1", []),
    })?;
    Ok(rows)
}

/**
 * \brief Adds to the usage counters of a provider. Counters only grow here.
 */
pub fn increment_provider_usage(
    conn: &Connection,
    id: i64,
    requests: u64,
    tokens: u64,
    errors: u64,
) -> Result<()> {
    let as_i64 = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
    retry_on_locked(|| {
        conn.execute(
            "UPDATE providers SET total_requests = total_requests + ?1,
                total_tokens = total_tokens + ?2, total_errors = total_errors + ?3
             WHERE id=?4",
            params![as_i64(requests), as_i64(tokens), as_i64(errors), id],
        )
    })?;
    Ok(())
}

pub fn increment_model_usage(conn: &Connection, id: i64, requests: u64, tokens: u64) -> Result<()> {
    let as_i64 = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
    retry_on_locked(|| {
        conn.execute(
            "UPDATE models SET total_requests = total_requests + ?1,
                total_tokens = total_tokens + ?2
             WHERE id=?3",
            params![as_i64(requests), as_i64(tokens), id],
        )
    })?;
    Ok(())
}

/**
 * \brief Zeroes the usage counters of a provider and of its models.
 */
pub fn reset_usage(conn: &Connection, provider_id: i64) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "UPDATE providers SET total_requests=0, total_tokens=0, total_errors=0 WHERE id=?1",
            params![provider_id],
        )
    })?;
    retry_on_locked(|| {
        conn.execute(
            "UPDATE models SET total_requests=0, total_tokens=0 WHERE provider_id=?1",
            params![provider_id],
        )
    })?;
    Ok(())
}

/**
 * \brief Records a successful probe: healthy, streak reset, latency folded into the average.
 */
pub fn record_health_success(conn: &Connection, id: i64, latency_ms: u64, checked_at: &str) -> Result<()> {
    let latency = latency_ms as f64;
    retry_on_locked(|| {
        conn.execute(
            "UPDATE providers SET health_status='healthy', consecutive_failures=0,
                last_error=NULL, last_health_check=?1,
                average_latency_ms = CASE WHEN average_latency_ms IS NULL THEN ?2
                                          ELSE (average_latency_ms + ?2) / 2.0 END
             WHERE id=?3",
            params![checked_at, latency, id],
        )
    })?;
    Ok(())
}

/**
 * \brief Records a failed probe: unhealthy, streak incremented, error kept for operators.
 */
pub fn record_health_failure(conn: &Connection, id: i64, error: &str, checked_at: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "UPDATE providers SET health_status='unhealthy',
                consecutive_failures = consecutive_failures + 1,
                last_error=?1, last_health_check=?2
             WHERE id=?3",
            params![error, checked_at, id],
        )
    })?;
    Ok(())
}

pub fn insert_model(conn: &Connection, rec: &ModelRecord) -> Result<i64> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO models (provider_id, model_id, name, description, is_enabled,
                is_default, context_length, max_output_tokens, default_temperature,
                default_max_tokens, default_top_p, default_top_k, stop_sequences,
                supports_vision, supports_function_calling, supports_json_mode, metadata,
                created_at, updated_at)
             VALUES (:provider_id, :model_id, :name, :description, :is_enabled,
                :is_default, :context_length, :max_output_tokens, :default_temperature,
                :default_max_tokens, :default_top_p, :default_top_k, :stop_sequences,
                :supports_vision, :supports_function_calling, :supports_json_mode, :metadata,
                :created_at, :updated_at)",
            named_params! {
                ":provider_id": rec.provider_id,
                ":model_id": rec.model_id,
                ":name": rec.name,
                ":description": rec.description,
                ":is_enabled": rec.is_enabled,
                ":is_default": rec.is_default,
                ":context_length": rec.context_length,
                ":max_output_tokens": rec.max_output_tokens,
                ":default_temperature": rec.default_temperature,
                ":default_max_tokens": rec.default_max_tokens,
                ":default_top_p": rec.default_top_p,
                ":default_top_k": rec.default_top_k,
                ":stop_sequences": rec.stop_sequences,
                ":supports_vision": rec.supports_vision,
                ":supports_function_calling": rec.supports_function_calling,
                ":supports_json_mode": rec.supports_json_mode,
                ":metadata": rec.metadata,
                ":created_at": rec.created_at,
                ":updated_at": rec.updated_at,
            },
        )
    })?;
    Ok(conn.last_insert_rowid())
}

pub fn update_model_config(conn: &Connection, rec: &ModelRecord) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE models SET name=:name, description=:description, is_enabled=:is_enabled,
                is_default=:is_default, context_length=:context_length,
                max_output_tokens=:max_output_tokens, default_temperature=:default_temperature,
                default_max_tokens=:default_max_tokens, default_top_p=:default_top_p,
                default_top_k=:default_top_k, stop_sequences=:stop_sequences,
                supports_vision=:supports_vision,
                supports_function_calling=:supports_function_calling,
                supports_json_mode=:supports_json_mode, metadata=:metadata,
                updated_at=:updated_at
             WHERE id=:id",
            named_params! {
                ":id": rec.id,
                ":name": rec.name,
                ":description": rec.description,
                ":is_enabled": rec.is_enabled,
                ":is_default": rec.is_default,
                ":context_length": rec.context_length,
                ":max_output_tokens": rec.max_output_tokens,
                ":default_temperature": rec.default_temperature,
                ":default_max_tokens": rec.default_max_tokens,
                ":default_top_p": rec.default_top_p,
                ":default_top_k": rec.default_top_k,
                ":stop_sequences": rec.stop_sequences,
                ":supports_vision": rec.supports_vision,
                ":supports_function_calling": rec.supports_function_calling,
                ":supports_json_mode": rec.supports_json_mode,
                ":metadata": rec.metadata,
                ":updated_at": rec.updated_at,
            },
        )
    })?;
    if rows == 0 {
        return Err(GatewayError::NotFound(format!("model id {}", rec.id)));
    }
    Ok(())
}

/**
 * \brief Seeding upsert: inserts the model or refreshes its name and context length.
 * Returns true when a row was inserted.
 */
pub fn upsert_seed_model(
    conn: &Connection,
    provider_id: i64,
    model_id: &str,
    name: &str,
    context_length: Option<u32>,
    is_default: bool,
) -> Result<bool> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM models WHERE provider_id=?1 AND model_id=?2",
            params![provider_id, model_id],
            |row| row.get(0),
        )
        .optional()?;
    let now = now_timestamp();
    let context_length = context_length.map(i64::from);
    match existing {
        Some(id) => {
            retry_on_locked(|| {
                conn.execute(
                    "UPDATE models SET name=?1, context_length=?2, updated_at=?3 WHERE id=?4",
                    params![name, context_length, now, id],
                )
            })?;
            Ok(false)
        }
        None => {
            retry_on_locked(|| {
                conn.execute(
                    "INSERT INTO models (provider_id, model_id, name, is_enabled, is_default,
                        context_length, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?6)",
                    params![provider_id, model_id, name, is_default, context_length, now],
                )
            })?;
            Ok(true)
        }
    }
}

pub fn delete_model(conn: &Connection, id: i64) -> Result<bool> {
    let rows = retry_on_locked(|| conn.execute("DELETE FROM models WHERE id=?1", params![id]))?;
    Ok(rows > 0)
}

/**
 * \brief Models of a provider, default first, then by model id.
 */
pub fn list_models(conn: &Connection, provider_id: i64, include_disabled: bool) -> Result<Vec<ModelRecord>> {
    let sql = if include_disabled {
        format!(
            "SELECT {MODEL_COLUMNS} FROM models WHERE provider_id=?1 \
             ORDER BY is_default DESC, model_id ASC"
        )
    } else {
        format!(
            "SELECT {MODEL_COLUMNS} FROM models WHERE provider_id=?1 AND is_enabled=1 \
             ORDER BY is_default DESC, model_id ASC"
        )
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![provider_id], map_model_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_model_by_id(conn: &Connection, id: i64) -> Result<Option<ModelRecord>> {
    conn.query_row(
        &format!("SELECT {MODEL_COLUMNS} FROM models WHERE id=?1"),
        params![id],
        map_model_row,
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_model_by_model_id(
    conn: &Connection,
    provider_id: i64,
    model_id: &str,
) -> Result<Option<ModelRecord>> {
    conn.query_row(
        &format!("SELECT {MODEL_COLUMNS} FROM models WHERE provider_id=?1 AND model_id=?2"),
        params![provider_id, model_id],
        map_model_row,
    )
    .optional()
    .map_err(Into::into)
}

pub fn has_default_model(conn: &Connection, provider_id: i64) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM models WHERE provider_id=?1 AND is_default=1",
        params![provider_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/**
 * \brief Clears the default flag on the provider's models except `keep`.
 */
pub fn clear_default_models(conn: &Connection, provider_id: i64, keep: Option<i64>) -> Result<usize> {
    let rows = retry_on_locked(|| match keep {
        Some(id) => conn.execute(
            "UPDATE models SET is_default=0 WHERE provider_id=?1 AND is_default=1 AND id<>?2",
            params![provider_id, id],
        ),
        None => conn.execute(
            "UPDATE models SET is_default=0 WHERE provider_id=?1 AND is_default=1",
            params![provider_id],
        ),
    })?;
    Ok(rows)
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, if value { "1" } else { "0" }],
        )
    })?;
    Ok(())
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val.map(|s| s == "1").unwrap_or(default))
}

/**
 * \brief Reads the event-log switch.
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, "telemetry_enabled", false)
}

/**
 * \brief Updates the event-log switch.
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, "telemetry_enabled", enabled)
}

/**
 * \brief Retry helper for SQLite lock contention.
 * \details Catches `database is locked`/`database table is locked` and backs off, at most 6 attempts.
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
