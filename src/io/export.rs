//! CSV export for simulation call histories and measured readings.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use chrono::SecondsFormat;

use crate::sim::types::CallRecord;
use crate::store::Measurement;

const CALLS_HEADER: &[&str] = &["run_id", "time", "index", "carbon_intensity"];

const MEASUREMENTS_HEADER: &[&str] = &[
    "time",
    "region",
    "provider",
    "carbon_intensity",
    "estimation",
];

/// Exports a run's call history to a CSV file at the given path.
///
/// # Arguments
///
/// * `calls` - Call records, in the order they should appear
/// * `path` - Output file path
///
/// # Errors
///
/// Returns an `io::Error` if file creation or writing fails.
pub fn export_calls_csv(calls: &[CallRecord], path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    write_calls_csv(calls, io::BufWriter::new(file))
}

/// Writes call records as CSV to any writer.
///
/// # Errors
///
/// Returns an `io::Error` if writing fails.
pub fn write_calls_csv(calls: &[CallRecord], writer: impl Write) -> io::Result<()> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);
    wtr.write_record(CALLS_HEADER)?;
    for c in calls {
        wtr.write_record(&[
            c.run_id.to_string(),
            c.observed_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            c.index.to_string(),
            c.value.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes measured readings as CSV to any writer.
///
/// # Errors
///
/// Returns an `io::Error` if writing fails.
pub fn write_measurements_csv(rows: &[Measurement], writer: impl Write) -> io::Result<()> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);
    wtr.write_record(MEASUREMENTS_HEADER)?;
    for m in rows {
        wtr.write_record(&[
            m.time.to_rfc3339_opts(SecondsFormat::Secs, true),
            m.region.clone(),
            m.provider.clone(),
            m.carbon_intensity.to_string(),
            m.estimation.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::sim::types::RunId;

    fn calls(n: usize) -> Vec<CallRecord> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| CallRecord {
                run_id: RunId::from("run-7"),
                observed_at: start + Duration::seconds(i as i64),
                value: 100.0 + i as f64,
                index: i,
            })
            .collect()
    }

    #[test]
    fn calls_header_and_rows() {
        let mut buf = Vec::new();
        write_calls_csv(&calls(3), &mut buf).unwrap();
        let output = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "run_id,time,index,carbon_intensity");
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "run-7,2024-01-01T00:00:00.000000Z,0,100");
    }

    #[test]
    fn calls_are_parseable() {
        let mut buf = Vec::new();
        write_calls_csv(&calls(5), &mut buf).unwrap();

        let mut rdr = csv::ReaderBuilder::new().from_reader(buf.as_slice());
        let values: Vec<f64> = rdr
            .records()
            .map(|r| r.unwrap()[3].parse().unwrap())
            .collect();
        assert_eq!(values, vec![100.0, 101.0, 102.0, 103.0, 104.0]);
    }

    #[test]
    fn export_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calls.csv");
        export_calls_csv(&calls(2), &path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn measurements_csv() {
        let rows = vec![Measurement {
            time: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            region: "DE".into(),
            provider: "energycharts_de".into(),
            carbon_intensity: 312.5,
            estimation: true,
        }];
        let mut buf = Vec::new();
        write_measurements_csv(&rows, &mut buf).unwrap();
        let output = String::from_utf8(buf).unwrap();
        assert_eq!(
            output.lines().nth(1),
            Some("2024-01-01T12:00:00Z,DE,energycharts_de,312.5,true")
        );
    }
}
