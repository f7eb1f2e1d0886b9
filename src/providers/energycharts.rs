//! Energy-Charts public API (Fraunhofer ISE).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error};

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::store::{Measurement, source_key};

use super::CarbonProvider;

const DEFAULT_BASE_URL: &str = "https://api.energy-charts.info";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Co2Response {
    unix_seconds: Vec<i64>,
    co2eq: Vec<Option<f64>>,
    co2eq_forecast: Vec<Option<f64>>,
}

/// Client for `api.energy-charts.info`.
pub struct EnergyCharts {
    client: Client,
    base_url: String,
}

impl EnergyCharts {
    /// Configuration name.
    pub const NAME: &'static str = "energycharts";

    /// Creates a client sharing `client`'s connection pool.
    pub fn new(client: Client, config: &ProviderConfig) -> Self {
        Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn http_error(source: reqwest::Error) -> ProviderError {
        error!(error = %source, "Energy-Charts request failed");
        ProviderError::Http {
            provider: Self::NAME,
            source,
        }
    }
}

#[async_trait]
impl CarbonProvider for EnergyCharts {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn fetch_history(
        &self,
        region: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Measurement>, ProviderError> {
        let url = format!("{}/co2eq", self.base_url);
        let body = self
            .client
            .get(&url)
            .query(&[("country", region.to_lowercase())])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(Self::http_error)?
            .text()
            .await
            .map_err(Self::http_error)?;

        let rows: Vec<Measurement> = parse_co2eq(&body, region)?
            .into_iter()
            .filter(|m| start <= m.time && m.time <= end)
            .collect();
        debug!(region, rows = rows.len(), "Energy-Charts history fetched");
        Ok(rows)
    }
}

/// Merges measured and forecast series into one timeline.
///
/// The measured value wins when both exist; forecast-only points are flagged
/// as estimations and points with neither are dropped.
fn parse_co2eq(body: &str, region: &str) -> Result<Vec<Measurement>, ProviderError> {
    let parsed: Co2Response = serde_json::from_str(body).map_err(|e| ProviderError::Payload {
        provider: EnergyCharts::NAME,
        message: e.to_string(),
    })?;

    let region = region.to_uppercase();
    let provider = source_key(EnergyCharts::NAME, &region);
    let mut rows = Vec::with_capacity(parsed.unix_seconds.len());

    for (idx, &ts) in parsed.unix_seconds.iter().enumerate() {
        let measured = parsed.co2eq.get(idx).copied().flatten();
        let forecast = parsed.co2eq_forecast.get(idx).copied().flatten();
        let (value, estimation) = match (measured, forecast) {
            (Some(v), _) => (v, false),
            (None, Some(v)) => (v, true),
            (None, None) => continue,
        };
        let Some(time) = DateTime::from_timestamp(ts, 0) else {
            return Err(ProviderError::Payload {
                provider: EnergyCharts::NAME,
                message: format!("timestamp {ts} out of range"),
            });
        };
        rows.push(Measurement {
            time,
            region: region.clone(),
            provider: provider.clone(),
            carbon_intensity: value,
            estimation,
        });
    }

    Ok(rows)
}
