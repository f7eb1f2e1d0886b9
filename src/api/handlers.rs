//! Request handlers for the API endpoints.
//!
//! Engine and store calls block on SQLite, so they run on tokio's blocking
//! pool via [`blocking`].

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::is_region_code;
use crate::ingest::SourceFilter;
use crate::io::export::write_measurements_csv;
use crate::sim::types::{RunId, SimulationValue};
use crate::store::source_key;
use crate::timeseries;

use super::AppState;
use super::types::{
    ApiError, CreateRequest, CreateResponse, CurrentQuery, EmCurrent, EmHistory, EmHistoryEntry,
    HealthResponse, HistoryQuery, RunQuery, StatsEntry, TEMPORAL_GRANULARITY, ValueResponse,
    ZoneQuery,
};

/// Header carrying a simulation id on the `/v3/...` routes.
const AUTH_TOKEN_HEADER: &str = "auth-token";

/// How far outside a history window bracketing readings are looked for.
const INTERPOLATION_MARGIN_HOURS: i64 = 24;

type ApiResult<T> = Result<T, ApiError>;

async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(format!("blocking task failed: {e}")))?
}

fn require_id(query: RunQuery) -> ApiResult<RunId> {
    query
        .id
        .filter(|id| !id.is_empty())
        .map(RunId::from)
        .ok_or_else(|| ApiError::bad_request("id parameter is required"))
}

fn normalize_region(region: Option<&str>) -> ApiResult<String> {
    let region = region
        .filter(|r| !r.is_empty())
        .ok_or_else(|| ApiError::bad_request("region parameter is required"))?;
    if !is_region_code(region) {
        return Err(ApiError::bad_request(
            "region must be a valid ISO 3166-1 alpha-2 country code (e.g., 'DE', 'US')",
        ));
    }
    Ok(region.to_uppercase())
}

fn parse_time(name: &str, raw: Option<&str>) -> ApiResult<DateTime<Utc>> {
    let raw = raw
        .filter(|r| !r.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("{name} parameter is required")))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").map(|t| t.and_utc()))
        .map_err(|e| {
            ApiError::bad_request(format!(
                "invalid {name}: use ISO 8601 (e.g., '2025-09-22T10:00:00Z'): {e}"
            ))
        })
}

/// Runs an ingestion pass for `region` when `update` asks for one.
///
/// `update` is `true`/`false`, or a provider name to refresh only that provider.
async fn handle_update(state: &AppState, update: Option<&str>, region: &str) {
    let Some(update) = update.map(str::trim).filter(|u| !u.is_empty()) else {
        return;
    };
    let filter = match update.to_lowercase().as_str() {
        "false" | "0" => return,
        "true" | "1" => SourceFilter::region(region),
        provider => SourceFilter {
            region: Some(region.to_string()),
            provider: Some(provider.to_string()),
        },
    };
    info!(region, provider = ?filter.provider, "updating carbon intensity data on request");
    let report = state.ingestor.run_once(&filter).await;
    if report.failed > 0 {
        warn!(region, failed = report.failed, "on-demand update incomplete");
    }
}

async fn simulation_value(state: &AppState, id: RunId) -> ApiResult<ValueResponse> {
    let engine = state.engine.clone();
    blocking(move || {
        let value = engine.current_value(&id)?;
        Ok(ValueResponse {
            run_id: id.to_string(),
            carbon_intensity: value,
        })
    })
    .await
}

async fn simulation_stats(state: &AppState, id: RunId) -> ApiResult<Vec<StatsEntry>> {
    let engine = state.engine.clone();
    blocking(move || {
        let calls = engine.stats(&id)?;
        Ok(calls.into_iter().map(StatsEntry::from).collect())
    })
    .await
}

/// Creates a simulation run.
///
/// `POST /simulation` with a JSON list (or `{"carbon_values": [...]}`)
/// → 200 + `{run_id}`, 400 on invalid input.
pub async fn create_simulation(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<CreateResponse>> {
    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))?;
    let payload = match payload {
        Value::Object(_) => serde_json::from_value::<CreateRequest>(payload)
            .map_err(|e| ApiError::bad_request(e.to_string()))?
            .carbon_values,
        other => other,
    };
    let entries = SimulationValue::list_from_json(&payload)?;

    let engine = state.engine.clone();
    let id = blocking(move || Ok(engine.create(&entries)?)).await?;
    Ok(Json(CreateResponse {
        run_id: id.to_string(),
    }))
}

/// Returns the current simulated value, counting the read.
///
/// `GET /simulation/get-carbon?id=` → 200 + `{run_id, carbon_intensity}`, 404 if unknown.
pub async fn get_simulation_carbon(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunQuery>,
) -> ApiResult<Json<ValueResponse>> {
    let id = require_id(query)?;
    simulation_value(&state, id).await.map(Json)
}

/// Advances a simulation to its next value.
///
/// `POST /simulation/next?id=` → 200 + `{run_id, carbon_intensity}`, 404 if unknown.
pub async fn advance_simulation(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunQuery>,
) -> ApiResult<Json<ValueResponse>> {
    let id = require_id(query)?;
    let engine = state.engine.clone();
    let response = blocking(move || {
        let value = engine.advance(&id)?;
        Ok(ValueResponse {
            run_id: id.to_string(),
            carbon_intensity: value,
        })
    })
    .await?;
    Ok(Json(response))
}

/// Returns a simulation's call history.
///
/// `GET /simulation/stats?id=` → 200 + list of measurement-shaped rows, 404 if unknown.
pub async fn get_simulation_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunQuery>,
) -> ApiResult<Json<Vec<StatsEntry>>> {
    let id = require_id(query)?;
    simulation_stats(&state, id).await.map(Json)
}

/// Latest reading of every provider for a region.
///
/// `GET /carbon-intensity/current?region=` → 200 + list, 404 when nothing is stored.
/// With `simulation_id` the simulation's current value is served instead.
pub async fn get_current(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CurrentQuery>,
) -> ApiResult<Response> {
    if let Some(id) = query.simulation_id.filter(|id| !id.is_empty()) {
        return Ok(Json(simulation_value(&state, RunId::from(id)).await?).into_response());
    }

    let region = normalize_region(query.region.as_deref())?;
    handle_update(&state, query.update.as_deref(), &region).await;

    let store = state.store.clone();
    let rows = blocking(move || Ok(store.fetch_latest(&region)?)).await?;
    if rows.is_empty() {
        return Err(ApiError::not_found(
            "no carbon intensity data available for this region, please check back later",
        ));
    }
    Ok(Json(rows).into_response())
}

/// Latest reading of the region's primary provider.
///
/// `GET /carbon-intensity/current/primary?region=` → 200 + one-element list,
/// 400 when no primary provider is configured, 404 when it has no data.
pub async fn get_current_primary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CurrentQuery>,
) -> ApiResult<Response> {
    if let Some(id) = query.simulation_id.filter(|id| !id.is_empty()) {
        return Ok(Json(simulation_value(&state, RunId::from(id)).await?).into_response());
    }

    let region = normalize_region(query.region.as_deref())?;
    let key = primary_key(&state, &region)?;
    handle_update(&state, query.update.as_deref(), &region).await;

    let store = state.store.clone();
    let rows = blocking(move || Ok(store.fetch_latest(&region)?)).await?;
    let matched: Vec<_> = rows.into_iter().filter(|m| m.provider == key).collect();
    if matched.is_empty() {
        return Err(ApiError::not_found(format!(
            "no carbon intensity data available for primary provider '{key}' in this region"
        )));
    }
    Ok(Json(matched).into_response())
}

fn primary_key(state: &AppState, region: &str) -> ApiResult<String> {
    state
        .config
        .primary_provider(region)
        .map(|provider| source_key(provider, region))
        .ok_or_else(|| {
            ApiError::bad_request(format!("no primary provider configured for region '{region}'"))
        })
}

/// Readings for a region within a time window.
///
/// `GET /carbon-intensity/history?region=&start_time=&end_time=` → 200 + list
/// ordered by time, 400 on missing or inverted bounds. `interpolate=true`
/// adds the nearest reading on each side of the window; `format=csv` returns
/// the rows as CSV. With `simulation_id` the run's full call history is
/// served and the bounds are ignored.
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Response> {
    if let Some(id) = query.simulation_id.filter(|id| !id.is_empty()) {
        return Ok(Json(simulation_stats(&state, RunId::from(id)).await?).into_response());
    }

    let start = parse_time("start_time", query.start_time.as_deref())?;
    let end = parse_time("end_time", query.end_time.as_deref())?;
    let region = normalize_region(query.region.as_deref())?;
    if start >= end {
        return Err(ApiError::bad_request("start_time must be before end_time"));
    }
    handle_update(&state, query.update.as_deref(), &region).await;

    let as_csv = match query.format.as_deref().map(str::to_lowercase).as_deref() {
        None | Some("json") => false,
        Some("csv") => true,
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "unsupported format '{other}' (expected 'json' or 'csv')"
            )));
        }
    };

    let store = state.store.clone();
    let provider = query.provider;
    let interpolate = query.interpolate;
    let rows = blocking(move || {
        if !interpolate {
            return Ok(store.fetch_between(&region, start, end, provider.as_deref())?);
        }
        let margin = Duration::hours(INTERPOLATION_MARGIN_HOURS);
        let wide = store.fetch_between(&region, start - margin, end + margin, provider.as_deref())?;
        Ok(timeseries::filter_with_interpolation(&wide, start, end))
    })
    .await?;

    if as_csv {
        let mut body = Vec::new();
        write_measurements_csv(&rows, &mut body)
            .map_err(|e| ApiError::internal(format!("csv encoding failed: {e}")))?;
        return Ok(([(header::CONTENT_TYPE, "text/csv")], body).into_response());
    }
    Ok(Json(rows).into_response())
}

fn auth_token(headers: &HeaderMap) -> Option<RunId> {
    headers
        .get(AUTH_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(RunId::from)
}

/// ElectricityMaps-compatible current reading.
///
/// `GET /v3/carbon-intensity/current?zone=` serves the primary provider's
/// latest reading, or the simulation named by the `auth-token` header.
pub async fn get_v3_current(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ZoneQuery>,
) -> ApiResult<Json<EmCurrent>> {
    let zone = normalize_region(query.zone.as_deref())?;

    if let Some(id) = auth_token(&headers) {
        let sim = simulation_value(&state, id).await?;
        return Ok(Json(EmCurrent::new(zone, sim.carbon_intensity, Utc::now(), false)));
    }

    let key = primary_key(&state, &zone)?;
    let store = state.store.clone();
    let lookup = zone.clone();
    let rows = blocking(move || Ok(store.fetch_latest(&lookup)?)).await?;
    let latest = rows
        .into_iter()
        .find(|m| m.provider == key)
        .ok_or_else(|| ApiError::not_found(format!("no data for primary provider '{key}'")))?;

    Ok(Json(EmCurrent::new(
        zone,
        latest.carbon_intensity,
        latest.time,
        latest.estimation,
    )))
}

/// ElectricityMaps-compatible 24 h history.
///
/// `GET /v3/carbon-intensity/history?zone=`; with an `auth-token` header the
/// simulation's current value is served as a single entry.
pub async fn get_v3_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ZoneQuery>,
) -> ApiResult<Json<EmHistory>> {
    let zone = normalize_region(query.zone.as_deref())?;

    let history = if let Some(id) = auth_token(&headers) {
        let sim = simulation_value(&state, id).await?;
        vec![EmHistoryEntry::new(sim.carbon_intensity, Utc::now(), false)]
    } else {
        let end = Utc::now();
        let start = end - Duration::hours(24);
        let store = state.store.clone();
        let lookup = zone.clone();
        let rows = blocking(move || Ok(store.fetch_between(&lookup, start, end, None)?)).await?;
        rows.iter().map(EmHistoryEntry::from).collect()
    };

    Ok(Json(EmHistory {
        zone,
        history,
        temporal_granularity: TEMPORAL_GRANULARITY,
    }))
}

/// Regions with stored readings.
///
/// `GET /regions` → 200 + sorted list of region codes.
pub async fn list_regions(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<String>>> {
    let store = state.store.clone();
    blocking(move || Ok(store.fetch_regions()?)).await.map(Json)
}

/// Configured sources as `[provider, REGION, storage_key]` triples.
///
/// `GET /providers` → 200.
pub async fn list_providers(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<(String, String, String)>> {
    let sources = state
        .config
        .cron
        .sources
        .iter()
        .map(|s| {
            (
                s.provider.to_lowercase(),
                s.region.to_uppercase(),
                source_key(&s.provider, &s.region),
            )
        })
        .collect();
    Json(sources)
}

/// Service health.
///
/// `GET /health` → 200 + `{status, providers, db_records, regions}`; `status`
/// is `"error"` when the database cannot be queried.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let providers = state.ingestor.providers().names();
    let store = state.store.clone();
    let counts = blocking(move || Ok((store.count_measurements()?, store.fetch_regions()?))).await;

    match counts {
        Ok((db_records, regions)) => Json(HealthResponse {
            status: "healthy",
            providers: Some(providers),
            db_records: Some(db_records),
            regions: Some(regions),
            details: None,
        }),
        Err(e) => {
            warn!(error = %e.message, "health check database query failed");
            Json(HealthResponse {
                status: "error",
                providers: None,
                db_records: None,
                regions: None,
                details: Some("database query failed".to_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::*;

    #[test]
    fn regions_are_validated_and_uppercased() {
        assert_eq!(normalize_region(Some("de")).unwrap(), "DE");
        assert_eq!(
            normalize_region(None).unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
        assert!(normalize_region(Some("DEU")).is_err());
        assert!(normalize_region(Some("1A")).is_err());
    }

    #[test]
    fn times_accept_offsets_and_naive_utc() {
        let z = parse_time("start_time", Some("2025-09-22T10:00:00Z")).unwrap();
        let offset = parse_time("start_time", Some("2025-09-22T12:00:00+02:00")).unwrap();
        let naive = parse_time("start_time", Some("2025-09-22T10:00:00")).unwrap();
        assert_eq!(z, offset);
        assert_eq!(z, naive);
        assert!(parse_time("start_time", Some("yesterday")).is_err());
        assert!(parse_time("start_time", None).is_err());
    }

    #[test]
    fn auth_token_header_selects_run() {
        let mut headers = HeaderMap::new();
        assert!(auth_token(&headers).is_none());
        headers.insert(AUTH_TOKEN_HEADER, "sim-99".parse().unwrap());
        assert_eq!(auth_token(&headers), Some(RunId::from("sim-99")));
    }
}
