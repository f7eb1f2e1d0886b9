//! SQLite-backed store for simulation runs and measured intensity.
//!
//! Every call opens its own connection and releases it on return, so the
//! store can be shared freely across threads and processes. Mutating
//! simulation steps run inside `BEGIN IMMEDIATE` transactions: SQLite's
//! writer lock gives the step exclusive access to the run for the whole
//! read-modify-write, and dropping an uncommitted transaction rolls it back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::sim::types::{CallRecord, RunId, SimulationRun, Threshold};

use super::{Measurement, RunStep, SimulationStore};

/// Ordered schema migrations: `(version, name, sql)`.
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "baseline_tables",
        "CREATE TABLE IF NOT EXISTS carbon (
            time              TEXT    NOT NULL,
            region            TEXT    NOT NULL,
            provider          TEXT    NOT NULL,
            carbon_intensity  REAL    NOT NULL,
            estimation        INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (time, region, provider)
        );

        CREATE INDEX IF NOT EXISTS idx_carbon_region_time
            ON carbon(region, time);

        CREATE TABLE IF NOT EXISTS simulation_runs (
            id           TEXT    PRIMARY KEY,
            grid_values  TEXT    NOT NULL,
            thresholds   TEXT    NOT NULL,
            cursor       INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS simulation_calls (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id            TEXT    NOT NULL REFERENCES simulation_runs(id) ON DELETE CASCADE,
            observed_at       TEXT    NOT NULL,
            carbon_intensity  REAL    NOT NULL,
            idx               INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_simulation_calls_run
            ON simulation_calls(run_id, observed_at);",
    ),
    (
        2,
        "last_ingest_run",
        "CREATE TABLE IF NOT EXISTS last_ingest_run (
            source    TEXT PRIMARY KEY,
            last_run  TEXT NOT NULL
        );",
    ),
];

/// Durable store backed by a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and applies pending migrations.
    ///
    /// # Arguments
    ///
    /// * `path` - Database file; parent directories are created
    /// * `busy_timeout` - How long a call waits for another writer before failing
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the directory, the file, or a migration fails.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self { path, busy_timeout };
        let mut conn = store.connect()?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0))?;
        migrate(&mut conn)?;
        info!(path = %store.path.display(), "database ready");
        Ok(store)
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    /// Inserts readings that are not stored yet; existing `(time, region, provider)` rows are kept.
    ///
    /// Returns the number of new rows.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the transaction fails; nothing is inserted then.
    pub fn insert_measurements(&self, rows: &[Measurement]) -> Result<usize, StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO carbon (time, region, provider, carbon_intensity, estimation)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in rows {
                inserted += stmt.execute(params![
                    encode_time(row.time),
                    row.region,
                    row.provider,
                    row.carbon_intensity,
                    row.estimation,
                ])?;
            }
        }
        tx.commit()?;
        debug!(inserted, offered = rows.len(), "stored measurements");
        Ok(inserted)
    }

    /// Most recent reading of every provider for `region`, ordered by provider.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` on query or decode failure.
    pub fn fetch_latest(&self, region: &str) -> Result<Vec<Measurement>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT c.time, c.region, c.provider, c.carbon_intensity, c.estimation
             FROM carbon c
             JOIN (
                SELECT provider, MAX(time) AS time
                FROM carbon
                WHERE region = ?1
                GROUP BY provider
             ) latest ON latest.provider = c.provider AND latest.time = c.time
             WHERE c.region = ?1
             ORDER BY c.provider",
        )?;
        let rows = stmt
            .query_map(params![region], measurement_columns)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode_measurement).collect()
    }

    /// Readings for `region` with `start <= time <= end`, ordered by time.
    ///
    /// `provider` filters on the storage key and is compared in lower case.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` on query or decode failure.
    pub fn fetch_between(
        &self,
        region: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        provider: Option<&str>,
    ) -> Result<Vec<Measurement>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT time, region, provider, carbon_intensity, estimation
             FROM carbon
             WHERE region = ?1
               AND time >= ?2
               AND time <= ?3
               AND (?4 IS NULL OR provider = ?4)
             ORDER BY time, provider",
        )?;
        let rows = stmt
            .query_map(
                params![
                    region,
                    encode_time(start),
                    encode_time(end),
                    provider.map(str::to_lowercase),
                ],
                measurement_columns,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode_measurement).collect()
    }

    /// Distinct regions with stored readings, sorted.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` on query failure.
    pub fn fetch_regions(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT DISTINCT region FROM carbon ORDER BY region")?;
        let regions = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(regions)
    }

    /// Total number of stored readings.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` on query failure.
    pub fn count_measurements(&self) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM carbon", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Remembers when `source` was last ingested.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` on write failure.
    pub fn record_ingest_run(&self, source: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO last_ingest_run (source, last_run) VALUES (?1, ?2)
             ON CONFLICT(source) DO UPDATE SET last_run = excluded.last_run",
            params![source, encode_time(at)],
        )?;
        Ok(())
    }

    /// Last ingest time of every source, ordered by source key.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` on query or decode failure.
    pub fn last_ingest_runs(&self) -> Result<Vec<(String, DateTime<Utc>)>, StoreError> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT source, last_run FROM last_ingest_run ORDER BY source")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(source, at)| Ok((source, decode_time(&at)?)))
            .collect()
    }
}

impl SimulationStore for SqliteStore {
    fn insert_run(&self, run: &SimulationRun, first_call: &CallRecord) -> Result<(), StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO simulation_runs (id, grid_values, thresholds, cursor, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run.id.as_str(),
                serde_json::to_string(&run.values)?,
                encode_thresholds(&run.thresholds)?,
                i64::try_from(run.cursor).map_err(|e| StoreError::Corrupt(e.to_string()))?,
                encode_time(run.created_at),
            ],
        )?;
        insert_call(&tx, first_call)?;
        tx.commit()?;
        Ok(())
    }

    fn load_run(&self, id: &RunId) -> Result<Option<SimulationRun>, StoreError> {
        let conn = self.connect()?;
        select_run(&conn, id)
    }

    fn update_run(&self, id: &RunId, step: &mut RunStep<'_>) -> Result<bool, StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(mut run) = select_run(&tx, id)? else {
            return Ok(false);
        };
        let before = run.clone();
        let call = step(&mut run);

        if run != before {
            tx.execute(
                "UPDATE simulation_runs SET cursor = ?1, thresholds = ?2 WHERE id = ?3",
                params![
                    i64::try_from(run.cursor).map_err(|e| StoreError::Corrupt(e.to_string()))?,
                    encode_thresholds(&run.thresholds)?,
                    id.as_str(),
                ],
            )?;
        }
        if let Some(call) = &call {
            insert_call(&tx, call)?;
        }

        tx.commit()?;
        Ok(true)
    }

    fn list_calls(&self, id: &RunId) -> Result<Vec<CallRecord>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT observed_at, carbon_intensity, idx
             FROM simulation_calls
             WHERE run_id = ?1
             ORDER BY observed_at, id",
        )?;
        let rows = stmt
            .query_map(params![id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(observed_at, value, index)| {
                Ok(CallRecord {
                    run_id: id.clone(),
                    observed_at: decode_time(&observed_at)?,
                    value,
                    index: usize::try_from(index)
                        .map_err(|_| StoreError::Corrupt(format!("negative call index {index}")))?,
                })
            })
            .collect()
    }

    fn reset(&self) -> Result<(), StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch("DELETE FROM simulation_calls; DELETE FROM simulation_runs;")?;
        tx.commit()?;
        Ok(())
    }
}

fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            name        TEXT NOT NULL,
            applied_at  TEXT NOT NULL
        );",
    )?;
    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    for &(version, name, sql) in MIGRATIONS.iter().filter(|(v, _, _)| *v > current) {
        info!(version, name, "applying migration");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![version, name, encode_time(Utc::now())],
        )?;
        tx.commit()?;
    }
    Ok(())
}

fn select_run(conn: &Connection, id: &RunId) -> Result<Option<SimulationRun>, StoreError> {
    let row = conn
        .query_row(
            "SELECT grid_values, thresholds, cursor, created_at
             FROM simulation_runs
             WHERE id = ?1",
            params![id.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    let Some((values, thresholds, cursor, created_at)) = row else {
        return Ok(None);
    };

    let values: Vec<f64> = serde_json::from_str(&values)?;
    let thresholds = serde_json::from_str::<Vec<Option<i64>>>(&thresholds)?
        .into_iter()
        .map(Threshold::from_column)
        .collect::<Result<Vec<_>, _>>()
        .map_err(StoreError::Corrupt)?;
    let cursor = usize::try_from(cursor)
        .map_err(|_| StoreError::Corrupt(format!("negative cursor {cursor}")))?;

    if values.is_empty() || values.len() != thresholds.len() || cursor >= values.len() {
        return Err(StoreError::Corrupt(format!(
            "run {id}: {} values, {} thresholds, cursor {cursor}",
            values.len(),
            thresholds.len()
        )));
    }

    Ok(Some(SimulationRun {
        id: id.clone(),
        values,
        thresholds,
        cursor,
        created_at: decode_time(&created_at)?,
    }))
}

fn insert_call(conn: &Connection, call: &CallRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO simulation_calls (run_id, observed_at, carbon_intensity, idx)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            call.run_id.as_str(),
            encode_time(call.observed_at),
            call.value,
            i64::try_from(call.index).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        ],
    )?;
    Ok(())
}

fn encode_thresholds(thresholds: &[Threshold]) -> Result<String, StoreError> {
    let columns: Vec<Option<i64>> = thresholds.iter().map(|t| t.to_column()).collect();
    Ok(serde_json::to_string(&columns)?)
}

type MeasurementColumns = (String, String, String, f64, bool);

fn measurement_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<MeasurementColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn decode_measurement(
    (time, region, provider, carbon_intensity, estimation): MeasurementColumns,
) -> Result<Measurement, StoreError> {
    Ok(Measurement {
        time: decode_time(&time)?,
        region,
        provider,
        carbon_intensity,
        estimation,
    })
}

/// Fixed-width UTC text so lexical order equals time order.
fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;

    fn open_store() -> (TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("db/elephant.db"), Duration::from_secs(5))
            .unwrap();
        (dir, store)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn measurement(minutes: i64, provider: &str, value: f64) -> Measurement {
        Measurement {
            time: t0() + chrono::Duration::minutes(minutes),
            region: "DE".to_string(),
            provider: provider.to_string(),
            carbon_intensity: value,
            estimation: false,
        }
    }

    fn sample_run() -> (SimulationRun, CallRecord) {
        let run = SimulationRun {
            id: RunId::from("run-1"),
            values: vec![5.0, 10.0],
            thresholds: vec![Threshold::Remaining(2), Threshold::Unset],
            cursor: 0,
            created_at: t0(),
        };
        let call = CallRecord {
            run_id: run.id.clone(),
            observed_at: t0(),
            value: 5.0,
            index: 0,
        };
        (run, call)
    }

    #[test]
    fn reopening_keeps_schema_and_data() {
        let (dir, store) = open_store();
        let (run, call) = sample_run();
        store.insert_run(&run, &call).unwrap();

        let reopened = SqliteStore::open(store.path(), Duration::from_secs(5)).unwrap();
        assert_eq!(reopened.load_run(&run.id).unwrap(), Some(run));
        drop(dir);
    }

    #[test]
    fn run_round_trips_threshold_states() {
        let (_dir, store) = open_store();
        let (run, call) = sample_run();
        store.insert_run(&run, &call).unwrap();

        store
            .update_run(&run.id, &mut |r| {
                r.thresholds = vec![Threshold::Exhausted, Threshold::Remaining(0)];
                None
            })
            .unwrap();

        let stored = store.load_run(&run.id).unwrap().unwrap();
        assert_eq!(
            stored.thresholds,
            vec![Threshold::Exhausted, Threshold::Remaining(0)]
        );
    }

    #[test]
    fn failed_step_rolls_back_run_update() {
        let (_dir, store) = open_store();
        let (run, call) = sample_run();
        store.insert_run(&run, &call).unwrap();

        // A call record for an unknown run violates the foreign key after the
        // run row was already updated inside the same transaction.
        let result = store.update_run(&run.id, &mut |r| {
            r.cursor = 1;
            Some(CallRecord {
                run_id: RunId::from("ghost"),
                observed_at: t0(),
                value: 10.0,
                index: 1,
            })
        });
        assert!(result.is_err());

        let stored = store.load_run(&run.id).unwrap().unwrap();
        assert_eq!(stored.cursor, 0);
        assert_eq!(store.list_calls(&run.id).unwrap().len(), 1);
    }

    #[test]
    fn update_unknown_run_reports_missing() {
        let (_dir, store) = open_store();
        let found = store
            .update_run(&RunId::from("missing"), &mut |_| None)
            .unwrap();
        assert!(!found);
    }

    #[test]
    fn reset_removes_runs_and_calls() {
        let (_dir, store) = open_store();
        let (run, call) = sample_run();
        store.insert_run(&run, &call).unwrap();
        store.reset().unwrap();
        assert!(store.load_run(&run.id).unwrap().is_none());
        assert!(store.list_calls(&run.id).unwrap().is_empty());
    }

    #[test]
    fn measurements_insert_is_idempotent() {
        let (_dir, store) = open_store();
        let rows = vec![
            measurement(0, "energycharts_de", 300.0),
            measurement(15, "energycharts_de", 310.0),
        ];
        assert_eq!(store.insert_measurements(&rows).unwrap(), 2);
        assert_eq!(store.insert_measurements(&rows).unwrap(), 0);
        assert_eq!(store.count_measurements().unwrap(), 2);
    }

    #[test]
    fn latest_returns_one_row_per_provider() {
        let (_dir, store) = open_store();
        store
            .insert_measurements(&[
                measurement(0, "energycharts_de", 300.0),
                measurement(15, "energycharts_de", 310.0),
                measurement(5, "electricitymaps_de", 280.0),
            ])
            .unwrap();

        let latest = store.fetch_latest("DE").unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].provider, "electricitymaps_de");
        assert_eq!(latest[1].carbon_intensity, 310.0);
        assert!(store.fetch_latest("FR").unwrap().is_empty());
    }

    #[test]
    fn between_filters_by_window_and_provider() {
        let (_dir, store) = open_store();
        store
            .insert_measurements(&[
                measurement(0, "energycharts_de", 300.0),
                measurement(15, "energycharts_de", 310.0),
                measurement(30, "energycharts_de", 320.0),
                measurement(15, "electricitymaps_de", 280.0),
            ])
            .unwrap();

        let window = store
            .fetch_between("DE", t0() + chrono::Duration::minutes(10), t0() + chrono::Duration::minutes(30), None)
            .unwrap();
        assert_eq!(window.len(), 3);
        assert!(window.windows(2).all(|w| w[0].time <= w[1].time));

        let only_ec = store
            .fetch_between("DE", t0(), t0() + chrono::Duration::hours(1), Some("EnergyCharts_DE"))
            .unwrap();
        assert_eq!(only_ec.len(), 3);
    }

    #[test]
    fn regions_and_ingest_runs() {
        let (_dir, store) = open_store();
        let mut fr = measurement(0, "energycharts_fr", 50.0);
        fr.region = "FR".to_string();
        store
            .insert_measurements(&[measurement(0, "energycharts_de", 300.0), fr])
            .unwrap();
        assert_eq!(store.fetch_regions().unwrap(), vec!["DE", "FR"]);

        store.record_ingest_run("energycharts_de", t0()).unwrap();
        store
            .record_ingest_run("energycharts_de", t0() + chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(
            store.last_ingest_runs().unwrap(),
            vec![("energycharts_de".to_string(), t0() + chrono::Duration::hours(1))]
        );
    }
}
