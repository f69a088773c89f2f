pub mod adapters;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod llm;
pub mod models;
pub mod registry;
pub mod server;
pub mod telemetry;
pub mod validator;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use llm::Gateway;
pub use registry::Registry;

/**
 * \brief Commonly used items for callers of the SDK.
 */
pub mod prelude {
    pub use crate::config::GatewayConfig;
    pub use crate::error::{GatewayError, Result};
    pub use crate::llm::Gateway;
    pub use crate::models::{
        ChatRequest, ChatResponse, HealthCheckResult, Message, Model, ModelInput, ModelPatch,
        Provider, ProviderFamily, ProviderInput, ProviderPatch, Role,
    };
    pub use crate::registry::Registry;
    pub use crate::{server, telemetry};
}
