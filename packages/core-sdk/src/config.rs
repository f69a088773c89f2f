use std::{path::PathBuf, time::Duration};

/** \brief Path understood by the registry as an in-memory database. */
pub const IN_MEMORY_DB: &str = ":memory:";

/**
 * \brief Runtime configuration, read from `TUTORGATE_*` environment variables.
 */
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /** \brief SQLite file holding providers and models. */
    pub db_path: String,
    /** \brief Listen address for `serve`. */
    pub listen_addr: String,
    /** \brief Directory for the telemetry event log. */
    pub log_dir: PathBuf,
    /** \brief Filter directive for the tracing subscriber. */
    pub log_filter: String,
    pub cache_ttl: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            db_path: "tutorgate.db".to_string(),
            listen_addr: "127.0.0.1:5173".to_string(),
            log_dir: PathBuf::from("logs"),
            log_filter: "info".to_string(),
            cache_ttl: Duration::from_secs(60),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let cache_ttl = std::env::var("TUTORGATE_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.cache_ttl);
        Self {
            db_path: std::env::var("TUTORGATE_DB").unwrap_or(defaults.db_path),
            listen_addr: std::env::var("TUTORGATE_ADDR").unwrap_or(defaults.listen_addr),
            log_dir: std::env::var("TUTORGATE_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            log_filter: std::env::var("RUST_LOG").unwrap_or(defaults.log_filter),
            cache_ttl,
        }
    }

    /**
     * \brief In-memory configuration for tests.
     */
    pub fn in_memory() -> Self {
        Self {
            db_path: IN_MEMORY_DB.to_string(),
            ..Self::default()
        }
    }
}

/**
 * \brief Environment variable carrying the API key used when seeding a well-known provider.
 */
pub fn seed_api_key_var(provider_name: &str) -> Option<&'static str> {
    match provider_name {
        "openai" => Some("OPENAI_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "gemini" => Some("GEMINI_API_KEY"),
        "deepseek" => Some("DEEPSEEK_API_KEY"),
        _ => None,
    }
}

pub fn seed_api_key(provider_name: &str) -> Option<String> {
    seed_api_key_var(provider_name)
        .and_then(|var| std::env::var(var).ok())
        .filter(|v| !v.trim().is_empty())
}

pub fn ollama_base_url() -> Option<String> {
    std::env::var("OLLAMA_BASE_URL")
        .ok()
        .filter(|v| !v.trim().is_empty())
}
