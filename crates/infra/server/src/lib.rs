//! # CityForge Webhook Server
//!
//! Standalone process that owns the webhook system: it loads startup
//! configuration, registers the configured endpoints and runs the retry
//! scheduler until interrupted.

mod config;

pub use config::{
    AppConfig, ConfigError, ServerConfig, apply_env_overrides, config_or_default, load_config, log_level, parse_config,
};

use cityforge_webhooks::{InMemoryLedger, NewEndpoint, WebhookResult, WebhookSystem};
use std::sync::Arc;

/// The webhook delivery service.
pub struct WebhookServer {
    /// Server configuration.
    pub config: ServerConfig,
    system: WebhookSystem,
    seed: Vec<NewEndpoint>,
}

impl WebhookServer {
    /// Creates a server over an in-memory ledger.
    pub fn new(config: AppConfig) -> WebhookResult<Self> {
        let system = WebhookSystem::with_ledger(config.webhooks, Arc::new(InMemoryLedger::new()))?;
        Ok(Self {
            config: config.server,
            system,
            seed: config.endpoints,
        })
    }

    /// Gets the webhook system.
    pub fn system(&self) -> &WebhookSystem {
        &self.system
    }

    /// Registers the configured endpoints. Returns how many were accepted.
    ///
    /// Invalid endpoints are logged and skipped.
    pub async fn seed_endpoints(&mut self) -> usize {
        let mut registered = 0;
        for endpoint in std::mem::take(&mut self.seed) {
            let name = endpoint.name.clone();
            match self.system.add_endpoint(endpoint).await {
                Ok(_) => registered += 1,
                Err(e) => tracing::error!(endpoint = %name, error = %e, "skipping invalid endpoint"),
            }
        }
        registered
    }

    /// Runs until Ctrl-C.
    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error>> {
        let registered = self.seed_endpoints().await;
        tracing::info!(
            endpoints = registered,
            enabled = self.system.config().enabled,
            environment = %self.system.config().environment,
            "Starting CityForge webhook server"
        );

        self.system.start().await;
        tokio::signal::ctrl_c().await?;

        tracing::info!("Shutting down");
        self.system.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cityforge_events::EventType;

    #[tokio::test]
    async fn test_seed_skips_invalid_endpoints() {
        let config = AppConfig {
            endpoints: vec![
                NewEndpoint::new("crm", "https://crm.example.com").events([EventType::UserRegistered]),
                NewEndpoint::new("broken", "ftp://files.example.com"),
                NewEndpoint::new("forged", "https://x.example.com").header("X-Signature", "sha256=00"),
            ],
            ..Default::default()
        };

        let mut server = WebhookServer::new(config).unwrap();
        assert_eq!(server.seed_endpoints().await, 1);
        assert_eq!(server.system().get_endpoints().await.unwrap().len(), 1);
    }
}
