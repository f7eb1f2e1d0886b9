//! Upstream carbon-intensity data providers.
//!
//! A provider only fetches and parses; storing readings is the ingestor's job.

mod electricitymaps;
mod energycharts;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::debug;

use crate::config::AppConfig;
use crate::error::ProviderError;
use crate::store::Measurement;

pub use electricitymaps::ElectricityMaps;
pub use energycharts::EnergyCharts;

/// Timeout applied to every upstream request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A source of measured grid intensity.
#[async_trait]
pub trait CarbonProvider: Send + Sync {
    /// Lower-case provider name, as used in configuration.
    fn name(&self) -> &'static str;

    /// Readings for `region` between `start` and `end`, inclusive, oldest first.
    ///
    /// Returned rows carry the storage key built by [`crate::store::source_key`].
    async fn fetch_history(
        &self,
        region: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Measurement>, ProviderError>;
}

/// Enabled providers, keyed by name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<&'static str, Arc<dyn CarbonProvider>>,
}

impl ProviderRegistry {
    /// Builds every provider enabled in `config`.
    ///
    /// # Errors
    ///
    /// Returns a `ProviderError` if the HTTP client cannot be built.
    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| ProviderError::Http {
                provider: "client",
                source,
            })?;

        let mut registry = Self::default();
        if let Some(cfg) = config.enabled_provider(ElectricityMaps::NAME) {
            registry.register(Arc::new(ElectricityMaps::new(client.clone(), cfg)));
        }
        if let Some(cfg) = config.enabled_provider(EnergyCharts::NAME) {
            registry.register(Arc::new(EnergyCharts::new(client, cfg)));
        }
        debug!(providers = ?registry.names(), "providers initialized");
        Ok(registry)
    }

    /// Adds or replaces a provider.
    pub fn register(&mut self, provider: Arc<dyn CarbonProvider>) {
        self.providers.insert(provider.name(), provider);
    }

    /// Provider registered under `name` (case-insensitive).
    pub fn get(&self, name: &str) -> Option<Arc<dyn CarbonProvider>> {
        self.providers.get(name.to_lowercase().as_str()).cloned()
    }

    /// Registered provider names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        self.providers.keys().copied().collect()
    }

    /// `true` when no provider is enabled.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
