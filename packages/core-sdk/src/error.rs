use thiserror::Error;

/**
 * \brief Errors surfaced by the registry and the completion gateway.
 */
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("provider {0} is disabled")]
    ProviderDisabled(String),

    #[error("no enabled provider is configured")]
    NoProviderAvailable,

    #[error("no model could be resolved for provider {provider}")]
    NoModelResolved { provider: String },

    #[error("model {model} is disabled on provider {provider}")]
    ModelDisabled { provider: String, model: String },

    #[error("provider {0} requires an API key")]
    MissingApiKey(String),

    #[error("Unsupported parameters for {target}: {}", fields.join(", "))]
    UnsupportedParameters { target: String, fields: Vec<String> },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{provider} request failed: {message}")]
    Backend {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn backend(provider: &str, status: Option<u16>, message: impl Into<String>) -> Self {
        GatewayError::Backend {
            provider: provider.to_string(),
            status,
            message: message.into(),
        }
    }

    /** \brief Whether the call reached the backend; such failures count against the provider. */
    pub fn is_backend(&self) -> bool {
        matches!(self, GatewayError::Backend { .. })
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
