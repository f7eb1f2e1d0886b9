//! API request, response, and error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{SimulationError, StoreError};
use crate::sim::types::CallRecord;
use crate::store::Measurement;

/// `emissionFactorType` reported on ElectricityMaps-compatible routes.
pub const EMISSION_FACTOR_TYPE: &str = "lifecycle";

/// `temporalGranularity` reported on ElectricityMaps-compatible routes.
pub const TEMPORAL_GRANULARITY: &str = "notimplemented";

/// `?id=` selector of the simulation routes.
#[derive(Debug, Deserialize)]
pub struct RunQuery {
    /// Run id; missing ids are rejected by the handler.
    #[serde(default, alias = "simulationId")]
    pub id: Option<String>,
}

/// Body of `POST /simulation` in its object form.
#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    /// Values to replay.
    pub carbon_values: serde_json::Value,
}

/// Response of `POST /simulation`.
#[derive(Debug, Serialize)]
pub struct CreateResponse {
    /// New run id.
    pub run_id: String,
}

/// Response of the simulation read and advance routes.
#[derive(Debug, Serialize)]
pub struct ValueResponse {
    /// Run id.
    pub run_id: String,
    /// Value served.
    pub carbon_intensity: f64,
}

/// One call record in measurement-row shape, as served by `/simulation/stats`.
#[derive(Debug, Serialize)]
pub struct StatsEntry {
    /// Run id, in the column measured rows use for the provider key.
    pub provider: String,
    /// When the position became current.
    pub time: DateTime<Utc>,
    /// Value at that position.
    pub carbon_intensity: f64,
    /// Always `true`: simulated values are never measurements.
    pub estimation: bool,
}

impl From<CallRecord> for StatsEntry {
    fn from(c: CallRecord) -> Self {
        Self {
            provider: c.run_id.to_string(),
            time: c.observed_at,
            carbon_intensity: c.value,
            estimation: true,
        }
    }
}

/// Query of `/carbon-intensity/current` and `/carbon-intensity/current/primary`.
#[derive(Debug, Default, Deserialize)]
pub struct CurrentQuery {
    /// Region code.
    pub region: Option<String>,
    /// Serve this simulation run instead of measured data.
    #[serde(default, alias = "simulationId")]
    pub simulation_id: Option<String>,
    /// `true` to ingest the region first, or a provider name to ingest only it.
    pub update: Option<String>,
}

/// Query of `/carbon-intensity/history`.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    /// Region code.
    pub region: Option<String>,
    /// ISO-8601 start of the window.
    #[serde(alias = "startTime")]
    pub start_time: Option<String>,
    /// ISO-8601 end of the window.
    #[serde(alias = "endTime")]
    pub end_time: Option<String>,
    /// Provider storage key, e.g. `energycharts_de`.
    pub provider: Option<String>,
    /// Include the nearest readings outside the window.
    #[serde(default)]
    pub interpolate: bool,
    /// `true` to ingest the region first, or a provider name to ingest only it.
    pub update: Option<String>,
    /// Serve this simulation's call history instead of measured data.
    #[serde(default, alias = "simulationId")]
    pub simulation_id: Option<String>,
    /// `csv` for a `text/csv` body instead of JSON.
    pub format: Option<String>,
}

/// Query of the `/v3/...` routes.
#[derive(Debug, Deserialize)]
pub struct ZoneQuery {
    /// Region code.
    pub zone: Option<String>,
}

/// ElectricityMaps-style current reading.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmCurrent {
    pub zone: String,
    pub carbon_intensity: f64,
    pub datetime: String,
    pub updated_at: String,
    pub emission_factor_type: &'static str,
    pub is_estimated: bool,
    pub estimation_method: Option<String>,
    pub temporal_granularity: &'static str,
}

impl EmCurrent {
    /// Formats one reading for `zone`.
    pub fn new(zone: String, carbon_intensity: f64, at: DateTime<Utc>, is_estimated: bool) -> Self {
        let ts = em_time(at);
        Self {
            zone,
            carbon_intensity,
            datetime: ts.clone(),
            updated_at: ts,
            emission_factor_type: EMISSION_FACTOR_TYPE,
            is_estimated,
            estimation_method: None,
            temporal_granularity: TEMPORAL_GRANULARITY,
        }
    }
}

/// ElectricityMaps-style history entry.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmHistoryEntry {
    pub carbon_intensity: f64,
    pub datetime: String,
    pub updated_at: String,
    pub created_at: String,
    pub emission_factor_type: &'static str,
    pub is_estimated: bool,
    pub estimation_method: Option<String>,
}

impl EmHistoryEntry {
    /// Formats one reading.
    pub fn new(carbon_intensity: f64, at: DateTime<Utc>, is_estimated: bool) -> Self {
        let ts = em_time(at);
        Self {
            carbon_intensity,
            datetime: ts.clone(),
            updated_at: ts.clone(),
            created_at: ts,
            emission_factor_type: EMISSION_FACTOR_TYPE,
            is_estimated,
            estimation_method: None,
        }
    }
}

impl From<&Measurement> for EmHistoryEntry {
    fn from(m: &Measurement) -> Self {
        Self::new(m.carbon_intensity, m.time, m.estimation)
    }
}

/// ElectricityMaps-style history response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmHistory {
    pub zone: String,
    pub history: Vec<EmHistoryEntry>,
    pub temporal_granularity: &'static str,
}

/// Response of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `"healthy"` or `"error"`.
    pub status: &'static str,
    /// Enabled provider names.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<&'static str>>,
    /// Stored measurement count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_records: Option<u64>,
    /// Regions with stored data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regions: Option<Vec<String>>,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub error: String,
}

/// An error that renders as a JSON `ErrorResponse` with a status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        error!(error = %message, "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message,
        }
    }
}

impl From<SimulationError> for ApiError {
    fn from(err: SimulationError) -> Self {
        let message = err.to_string();
        match err {
            SimulationError::InvalidInput(_) => Self::bad_request(message),
            SimulationError::NotFound(_) => Self::not_found(message),
            SimulationError::Store(_) => Self::internal(message),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

fn em_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
