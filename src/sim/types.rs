//! Core simulation types: run identity, threshold states, creation input, and call records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SimulationError;

/// Persisted column value for [`Threshold::Exhausted`].
pub const EXHAUSTED_SENTINEL: i64 = -1;

/// Opaque external handle of a simulation run.
///
/// Fresh ids are UUID v4 strings. Ids coming from requests are accepted
/// verbatim; an id that was never issued simply resolves to no run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generates a new unique run id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RunId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RunId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Auto-advance state of one value slot.
///
/// # Examples
///
/// ```
/// use elephant::sim::types::Threshold;
///
/// assert_eq!(Threshold::from_column(None), Ok(Threshold::Unset));
/// assert_eq!(Threshold::from_column(Some(-1)), Ok(Threshold::Exhausted));
/// assert_eq!(Threshold::Remaining(3).to_column(), Some(3));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    /// No threshold configured; the slot never auto-advances.
    Unset,
    /// Reads left before the slot auto-advances.
    Remaining(u32),
    /// Counted down to zero; can never trigger again.
    Exhausted,
}

impl Threshold {
    /// Counts one read against the slot.
    ///
    /// Returns the new state and whether the countdown reached zero on this
    /// read. A slot that is `Unset` or already `Exhausted` is left untouched.
    pub fn count_read(self) -> (Self, bool) {
        match self {
            Self::Remaining(n) => {
                let left = n.saturating_sub(1);
                if left == 0 {
                    (Self::Exhausted, true)
                } else {
                    (Self::Remaining(left), false)
                }
            }
            other => (other, false),
        }
    }

    /// Encodes the state as a nullable integer column.
    pub fn to_column(self) -> Option<i64> {
        match self {
            Self::Unset => None,
            Self::Remaining(n) => Some(i64::from(n)),
            Self::Exhausted => Some(EXHAUSTED_SENTINEL),
        }
    }

    /// Decodes a nullable integer column.
    ///
    /// # Errors
    ///
    /// Returns a message for negative values other than the exhausted sentinel
    /// and for values that do not fit in `u32`.
    pub fn from_column(raw: Option<i64>) -> Result<Self, String> {
        match raw {
            None => Ok(Self::Unset),
            Some(EXHAUSTED_SENTINEL) => Ok(Self::Exhausted),
            Some(n) => u32::try_from(n)
                .map(Self::Remaining)
                .map_err(|_| format!("threshold {n} out of range")),
        }
    }
}

/// One element of a creation payload.
///
/// A payload is either all scalars or all pairs; see [`normalize`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimulationValue {
    /// A bare intensity reading with no auto-advance.
    Scalar(f64),
    /// A reading plus an optional number of reads before auto-advancing.
    WithThreshold(f64, Option<u32>),
}

impl SimulationValue {
    fn is_pair(&self) -> bool {
        matches!(self, Self::WithThreshold(..))
    }

    /// Parses one JSON element: a number, or a `[number, threshold|null]` array.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError::InvalidInput`] for arrays whose length is not
    /// two, non-numeric values, and thresholds that are not non-negative integers.
    pub fn from_json(entry: &Value) -> Result<Self, SimulationError> {
        match entry {
            Value::Number(_) => parse_reading(entry).map(Self::Scalar),
            Value::Array(items) => {
                let [value, threshold] = items.as_slice() else {
                    return Err(SimulationError::InvalidInput(format!(
                        "each (value, threshold) pair must have exactly 2 items, got {}",
                        items.len()
                    )));
                };
                Ok(Self::WithThreshold(
                    parse_reading(value)?,
                    parse_threshold(threshold)?,
                ))
            }
            other => Err(SimulationError::InvalidInput(format!(
                "expected a number or a (value, threshold) pair, got {other}"
            ))),
        }
    }

    /// Parses a JSON list of creation elements.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError::InvalidInput`] if `payload` is not an array
    /// or any element fails [`SimulationValue::from_json`].
    pub fn list_from_json(payload: &Value) -> Result<Vec<Self>, SimulationError> {
        let Value::Array(entries) = payload else {
            return Err(SimulationError::InvalidInput(
                "expected a list of carbon intensity values".to_string(),
            ));
        };
        entries.iter().map(Self::from_json).collect()
    }
}

fn parse_reading(value: &Value) -> Result<f64, SimulationError> {
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| SimulationError::InvalidInput(format!("{value} is not a finite number")))
}

fn parse_threshold(value: &Value) -> Result<Option<u32>, SimulationError> {
    if value.is_null() {
        return Ok(None);
    }
    let whole = value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= f64::from(u32::MAX))
            .map(|f| f as u64)
    });
    whole
        .and_then(|n| u32::try_from(n).ok())
        .map(Some)
        .ok_or_else(|| {
            SimulationError::InvalidInput(format!(
                "threshold must be a non-negative integer or null, got {value}"
            ))
        })
}

/// Splits a creation payload into parallel value and threshold sequences.
///
/// # Errors
///
/// Returns [`SimulationError::InvalidInput`] if `entries` is empty, mixes
/// scalars with pairs, or contains a non-finite reading.
pub fn normalize(entries: &[SimulationValue]) -> Result<(Vec<f64>, Vec<Threshold>), SimulationError> {
    let Some(first) = entries.first() else {
        return Err(SimulationError::InvalidInput(
            "at least one carbon intensity value is required".to_string(),
        ));
    };

    let pairs = first.is_pair();
    if entries.iter().any(|e| e.is_pair() != pairs) {
        return Err(SimulationError::InvalidInput(
            "values must be all numbers or all (value, threshold) pairs".to_string(),
        ));
    }

    let mut values = Vec::with_capacity(entries.len());
    let mut thresholds = Vec::with_capacity(entries.len());
    for entry in entries {
        let (value, threshold) = match *entry {
            SimulationValue::Scalar(v) => (v, Threshold::Unset),
            SimulationValue::WithThreshold(v, None) => (v, Threshold::Unset),
            SimulationValue::WithThreshold(v, Some(n)) => (v, Threshold::Remaining(n)),
        };
        if !value.is_finite() {
            return Err(SimulationError::InvalidInput(format!(
                "{value} is not a finite number"
            )));
        }
        values.push(value);
        thresholds.push(threshold);
    }

    Ok((values, thresholds))
}

/// Persisted state of one replay session.
///
/// `values` and `thresholds` always have the same, non-zero length and
/// `cursor` never exceeds the last index.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationRun {
    /// External handle.
    pub id: RunId,
    /// Intensity readings to replay, immutable after creation.
    pub values: Vec<f64>,
    /// Per-slot auto-advance state.
    pub thresholds: Vec<Threshold>,
    /// Currently active index.
    pub cursor: usize,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl SimulationRun {
    /// Index of the last value.
    pub fn last_index(&self) -> usize {
        self.values.len().saturating_sub(1)
    }

    /// `true` once the cursor sits on the last value.
    pub fn is_terminal(&self) -> bool {
        self.cursor >= self.last_index()
    }

    /// Value at the cursor.
    pub fn current(&self) -> f64 {
        self.values[self.cursor]
    }
}

/// Audit entry for one cursor position becoming current.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRecord {
    /// Run the record belongs to.
    pub run_id: RunId,
    /// When the position became current.
    pub observed_at: DateTime<Utc>,
    /// Value at that position.
    pub value: f64,
    /// Cursor position.
    pub index: usize,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn threshold_counts_down_to_exhausted() {
        assert_eq!(
            Threshold::Remaining(2).count_read(),
            (Threshold::Remaining(1), false)
        );
        assert_eq!(
            Threshold::Remaining(1).count_read(),
            (Threshold::Exhausted, true)
        );
        assert_eq!(
            Threshold::Remaining(0).count_read(),
            (Threshold::Exhausted, true)
        );
    }

    #[test]
    fn unset_and_exhausted_never_trigger() {
        assert_eq!(Threshold::Unset.count_read(), (Threshold::Unset, false));
        assert_eq!(
            Threshold::Exhausted.count_read(),
            (Threshold::Exhausted, false)
        );
    }

    #[test]
    fn threshold_column_encoding_is_lossless() {
        for t in [
            Threshold::Unset,
            Threshold::Remaining(0),
            Threshold::Remaining(7),
            Threshold::Exhausted,
        ] {
            assert_eq!(Threshold::from_column(t.to_column()), Ok(t));
        }
        assert!(Threshold::from_column(Some(-5)).is_err());
    }

    #[test]
    fn normalize_scalars() {
        let (values, thresholds) =
            normalize(&[SimulationValue::Scalar(1.0), SimulationValue::Scalar(2.0)]).unwrap();
        assert_eq!(values, vec![1.0, 2.0]);
        assert_eq!(thresholds, vec![Threshold::Unset, Threshold::Unset]);
    }

    #[test]
    fn normalize_pairs_with_optional_thresholds() {
        let (values, thresholds) = normalize(&[
            SimulationValue::WithThreshold(5.0, Some(2)),
            SimulationValue::WithThreshold(10.0, None),
        ])
        .unwrap();
        assert_eq!(values, vec![5.0, 10.0]);
        assert_eq!(thresholds, vec![Threshold::Remaining(2), Threshold::Unset]);
    }

    #[test]
    fn normalize_rejects_empty_and_mixed() {
        assert!(matches!(
            normalize(&[]),
            Err(SimulationError::InvalidInput(_))
        ));
        assert!(matches!(
            normalize(&[
                SimulationValue::Scalar(1.0),
                SimulationValue::WithThreshold(2.0, Some(3)),
            ]),
            Err(SimulationError::InvalidInput(_))
        ));
    }

    #[test]
    fn json_parsing_accepts_numbers_and_pairs() {
        let parsed = SimulationValue::list_from_json(&json!([[5, 2], [10.5, null]])).unwrap();
        assert_eq!(
            parsed,
            vec![
                SimulationValue::WithThreshold(5.0, Some(2)),
                SimulationValue::WithThreshold(10.5, None),
            ]
        );

        let parsed = SimulationValue::list_from_json(&json!([1, 2.5])).unwrap();
        assert_eq!(
            parsed,
            vec![SimulationValue::Scalar(1.0), SimulationValue::Scalar(2.5)]
        );
    }

    #[test]
    fn whole_number_float_thresholds_are_accepted() {
        let parsed = SimulationValue::list_from_json(&json!([[1, 2.0], [3, 0.0]])).unwrap();
        assert_eq!(
            parsed,
            vec![
                SimulationValue::WithThreshold(1.0, Some(2)),
                SimulationValue::WithThreshold(3.0, Some(0)),
            ]
        );
    }

    #[test]
    fn json_parsing_rejects_bad_shapes() {
        for payload in [
            json!([[1, 2, 3]]),
            json!([[1]]),
            json!(["high"]),
            json!([[1, -2]]),
            json!([[1, 1.5]]),
            json!([[1, -2.0]]),
            json!([[1, 1e12]]),
            json!({"values": [1]}),
        ] {
            assert!(
                matches!(
                    SimulationValue::list_from_json(&payload),
                    Err(SimulationError::InvalidInput(_))
                ),
                "payload {payload} should be rejected"
            );
        }
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(RunId::generate(), RunId::generate());
    }
}
