//! Compact time-series encoding: `start,step_seconds,v1,v2,...`.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use thiserror::Error;

const HEADER_FIELDS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeriesError {
    #[error("invalid series format: {0}")]
    InvalidFormat(String),
}

/// Uniformly spaced series. Missing values are stored as NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    pub name: String,
    pub start: NaiveDateTime,
    pub step_seconds: i64,
    pub values: Vec<f64>,
}

impl TimeSeries {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn timestamp_at(&self, index: usize) -> Option<NaiveDateTime> {
        if index >= self.values.len() {
            return None;
        }
        let offset = i64::try_from(index).ok()?.checked_mul(self.step_seconds)?;
        self.start.checked_add_signed(Duration::try_seconds(offset)?)
    }

    pub fn timestamps(&self) -> impl Iterator<Item = NaiveDateTime> + '_ {
        (0..self.values.len()).filter_map(|index| self.timestamp_at(index))
    }

    pub fn missing_count(&self) -> usize {
        self.values.iter().filter(|value| value.is_nan()).count()
    }

    pub fn end(&self) -> Option<NaiveDateTime> {
        self.values
            .len()
            .checked_sub(1)
            .and_then(|last| self.timestamp_at(last))
    }
}

/// Expands a compact series line.
///
/// A header with fewer than three fields, an unreadable start timestamp or a
/// non-positive step is rejected. Individual values that fail to parse become
/// NaN.
pub fn parse_compact_series(name: &str, data: &str) -> Result<TimeSeries, SeriesError> {
    let fields: Vec<&str> = data.trim().split(',').collect();
    if fields.len() < HEADER_FIELDS + 1 {
        return Err(SeriesError::InvalidFormat(format!(
            "expected start timestamp, step and at least one value, got {} field(s)",
            fields.len()
        )));
    }
    let start = parse_start_timestamp(fields[0].trim())?;
    let step_raw = fields[1].trim();
    let step_seconds = step_raw.parse::<i64>().map_err(|_| {
        SeriesError::InvalidFormat(format!("step '{step_raw}' is not a whole number of seconds"))
    })?;
    if step_seconds <= 0 {
        return Err(SeriesError::InvalidFormat(format!(
            "step must be positive, got {step_seconds}"
        )));
    }
    let values = fields[HEADER_FIELDS..]
        .iter()
        .map(|raw| raw.trim().parse::<f64>().unwrap_or(f64::NAN))
        .collect();
    Ok(TimeSeries {
        name: name.to_string(),
        start,
        step_seconds,
        values,
    })
}

pub fn encode_compact_series(series: &TimeSeries) -> String {
    let mut encoded = format!(
        "{},{}",
        series.start.format("%Y-%m-%dT%H:%M:%S+00:00"),
        series.step_seconds
    );
    for value in &series.values {
        encoded.push(',');
        if value.is_nan() {
            encoded.push_str("NaN");
        } else {
            encoded.push_str(value.to_string().as_str());
        }
    }
    encoded
}

fn parse_start_timestamp(raw: &str) -> Result<NaiveDateTime, SeriesError> {
    // Offset timestamps keep their wall-clock time, matching the engine's output.
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.naive_local());
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(parsed);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .ok_or_else(|| SeriesError::InvalidFormat(format!("unreadable start timestamp '{raw}'")))
}
