use std::time::Instant;

use futures_util::future::join_all;

use crate::adapters::elapsed_ms;
use crate::llm::Gateway;
use crate::models::{HealthCheckResult, Provider};
use crate::registry::common_models;
use crate::telemetry;

impl Gateway {
    /**
     * \brief Probes one provider and persists the outcome. Never fails; every
     * problem is reported inside the result.
     */
    pub async fn test_provider(&self, name_or_id: &str) -> HealthCheckResult {
        let provider = match self.registry().get_provider(name_or_id) {
            Ok(Some(p)) => p,
            Ok(None) => {
                return HealthCheckResult::failed(
                    format!("provider not found: {}", name_or_id),
                    None,
                )
            }
            Err(err) => return HealthCheckResult::failed(err.to_string(), None),
        };
        self.probe_provider(&provider).await
    }

    /**
     * \brief Probes every enabled provider concurrently, in registry order.
     */
    pub async fn test_all_providers(&self) -> Vec<(String, HealthCheckResult)> {
        let providers = match self.registry().get_providers(false) {
            Ok(list) => list,
            Err(err) => {
                telemetry::log_error("health.probe", &err.to_string());
                return Vec::new();
            }
        };
        let probes = providers.iter().map(|p| async move {
            (p.name.clone(), self.probe_provider(p).await)
        });
        join_all(probes).await
    }

    async fn probe_provider(&self, provider: &Provider) -> HealthCheckResult {
        let result = if provider.family.requires_api_key() && provider.api_key().is_none() {
            HealthCheckResult::failed(format!("provider {} has no API key", provider.name), None)
        } else {
            let model = self.probe_model(provider);
            let started = Instant::now();
            let outcome = match self.adapters.get(provider.family) {
                Ok(adapter) => adapter.probe(&self.client, provider, model.as_deref()).await,
                Err(err) => Err(err),
            };
            let latency = elapsed_ms(started.elapsed());
            match outcome {
                Ok(message) => HealthCheckResult::ok(message, latency),
                Err(err) => HealthCheckResult::failed(err.to_string(), Some(latency)),
            }
        };

        let persisted = match (result.success, result.latency_ms) {
            (true, Some(latency)) => self.registry().record_probe(provider.id, Ok(latency)),
            _ => self.registry().record_probe(provider.id, Err(result.message.as_str())),
        };
        if let Err(err) = persisted {
            telemetry::log_error("health.probe", &format!("persist {}: {}", provider.name, err));
        }
        telemetry::log_event(
            "health.probe",
            &format!(
                "provider={} success={} latency_ms={:?} {}",
                provider.name, result.success, result.latency_ms, result.message
            ),
        );
        result
    }

    /**
     * \brief Model used by completion probes: the provider default, else the first seed entry.
     */
    fn probe_model(&self, provider: &Provider) -> Option<String> {
        match self.registry().default_model(provider.id) {
            Ok(Some(model)) => Some(model.model_id),
            _ => common_models(&provider.name)
                .first()
                .map(|m| m.model_id.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::llm::Gateway;
    use crate::models::{HealthStatus, ProviderInput};
    use crate::registry::Registry;

    #[tokio::test]
    async fn unknown_provider_is_a_failed_result() {
        let gw = Gateway::new(Registry::in_memory().unwrap()).unwrap();
        let result = gw.test_provider("missing").await;
        assert!(!result.success);
        assert!(result.message.contains("missing"));
    }

    #[tokio::test]
    async fn keyless_cloud_provider_fails_without_network() {
        let gw = Gateway::new(Registry::in_memory().unwrap()).unwrap();
        gw.registry()
            .create_provider(ProviderInput::named("anthropic"))
            .unwrap();
        let result = gw.test_provider("anthropic").await;
        assert!(!result.success);
        assert_eq!(result.latency_ms, None);
        let p = gw.registry().get_provider("anthropic").unwrap().unwrap();
        assert_eq!(p.health.status, HealthStatus::Unhealthy);
        assert_eq!(p.health.consecutive_failures, 1);
    }
}
