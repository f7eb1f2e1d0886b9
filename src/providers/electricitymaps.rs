//! ElectricityMaps v3 API.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error};

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::store::{Measurement, source_key};

use super::CarbonProvider;

const DEFAULT_BASE_URL: &str = "https://api.electricitymaps.com";

#[derive(Debug, Deserialize)]
struct PastRange {
    #[serde(default)]
    data: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Entry {
    datetime: DateTime<Utc>,
    carbon_intensity: Option<f64>,
    #[serde(default)]
    is_estimated: bool,
}

/// Client for `api.electricitymaps.com`.
pub struct ElectricityMaps {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ElectricityMaps {
    /// Configuration name.
    pub const NAME: &'static str = "electricitymaps";

    /// Creates a client sharing `client`'s connection pool.
    pub fn new(client: Client, config: &ProviderConfig) -> Self {
        Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            token: config.api_token.clone(),
        }
    }

    fn http_error(source: reqwest::Error) -> ProviderError {
        error!(error = %source, "ElectricityMaps request failed");
        ProviderError::Http {
            provider: Self::NAME,
            source,
        }
    }
}

#[async_trait]
impl CarbonProvider for ElectricityMaps {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn fetch_history(
        &self,
        region: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Measurement>, ProviderError> {
        let url = format!("{}/v3/carbon-intensity/past-range", self.base_url);
        let mut request = self.client.get(&url).query(&[
            ("zone", region.to_string()),
            ("start", start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("end", end.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("temporalGranularity", "5_minutes".to_string()),
        ]);
        if let Some(token) = &self.token {
            request = request.header("auth-token", token);
        }

        let body = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(Self::http_error)?
            .text()
            .await
            .map_err(Self::http_error)?;

        let rows = parse_past_range(&body, region)?;
        debug!(region, rows = rows.len(), "ElectricityMaps history fetched");
        Ok(rows)
    }
}

/// Parses a `past-range` response body into readings for `region`.
///
/// Entries without an intensity are skipped.
fn parse_past_range(body: &str, region: &str) -> Result<Vec<Measurement>, ProviderError> {
    let parsed: PastRange = serde_json::from_str(body).map_err(|e| ProviderError::Payload {
        provider: ElectricityMaps::NAME,
        message: e.to_string(),
    })?;

    let region = region.to_uppercase();
    let provider = source_key(ElectricityMaps::NAME, &region);
    let mut rows: Vec<Measurement> = parsed
        .data
        .into_iter()
        .filter_map(|entry| {
            Some(Measurement {
                time: entry.datetime,
                region: region.clone(),
                provider: provider.clone(),
                carbon_intensity: entry.carbon_intensity?,
                estimation: entry.is_estimated,
            })
        })
        .collect();
    rows.sort_by_key(|m| m.time);
    Ok(rows)
}
