use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// Why a single inbound message could not become a [`SensorReading`]
#[derive(Debug, Error)]
pub enum MalformedRecordError {
    #[error("message has no payload")]
    EmptyPayload,

    #[error("payload is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("sensor_id must be a non-empty string or a number")]
    InvalidSensorId,

    #[error("timestamp {0:?} is not ISO-8601")]
    InvalidTimestamp(String),

    #[error("value {0} is not numeric")]
    InvalidValue(String),
}

/// One validated telemetry measurement.
///
/// Wire format:
/// ```json
/// {"sensor_id": "sensor_001", "timestamp": "2026-01-04T10:00:00", "value": 22.5}
/// ```
///
/// `(sensor_id, timestamp)` is the natural storage key, so writing the same
/// reading twice overwrites it with identical content.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    sensor_id: String,
    timestamp: DateTime<Utc>,
    value: f64,
}

impl SensorReading {
    pub fn new(sensor_id: impl Into<String>, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            timestamp,
            value,
        }
    }

    /// Parse one raw bus payload.
    pub fn parse(payload: &[u8]) -> Result<Self, MalformedRecordError> {
        if payload.is_empty() {
            return Err(MalformedRecordError::EmptyPayload);
        }
        let value: Value = serde_json::from_slice(payload)?;
        Self::from_value(&value)
    }

    /// Parse an already-decoded JSON document.
    pub fn from_value(value: &Value) -> Result<Self, MalformedRecordError> {
        let object = value.as_object().ok_or(MalformedRecordError::NotAnObject)?;

        Ok(Self {
            sensor_id: sensor_id_field(object)?,
            timestamp: timestamp_field(object)?,
            value: value_field(object)?,
        })
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

fn required<'a>(
    object: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a Value, MalformedRecordError> {
    match object.get(field) {
        None | Some(Value::Null) => Err(MalformedRecordError::MissingField(field)),
        Some(v) => Ok(v),
    }
}

fn sensor_id_field(object: &Map<String, Value>) -> Result<String, MalformedRecordError> {
    match required(object, "sensor_id")? {
        Value::String(s) if !s.trim().is_empty() => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(MalformedRecordError::InvalidSensorId),
    }
}

fn timestamp_field(object: &Map<String, Value>) -> Result<DateTime<Utc>, MalformedRecordError> {
    match required(object, "timestamp")? {
        Value::String(s) => parse_iso8601(s),
        other => Err(MalformedRecordError::InvalidTimestamp(other.to_string())),
    }
}

fn value_field(object: &Map<String, Value>) -> Result<f64, MalformedRecordError> {
    match required(object, "value")? {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| MalformedRecordError::InvalidValue(n.to_string())),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| MalformedRecordError::InvalidValue(format!("{:?}", s))),
        other => Err(MalformedRecordError::InvalidValue(other.to_string())),
    }
}

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y%m%dT%H%M%S%.f",
    "%Y%m%dT%H%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y%m%d"];

/// ISO-8601 text to a UTC instant.
///
/// Extended (`2026-01-04T10:00:00`) and basic (`20260104T100000`) forms, `T` or
/// space separator, hour, minute or second precision with optional fraction,
/// and an optional `Z` / `±HH[:MM[:SS]]` offset. Text without an offset is
/// taken as UTC, a bare date as midnight UTC.
pub fn parse_iso8601(raw: &str) -> Result<DateTime<Utc>, MalformedRecordError> {
    let s = raw.trim();
    let invalid = || MalformedRecordError::InvalidTimestamp(raw.to_string());

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    let Some((date, time)) = split_date_time(s) else {
        return DATE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|midnight| Utc.from_utc_datetime(&midnight))
            .ok_or_else(invalid);
    };

    let (clock, offset) = split_offset(time).ok_or_else(invalid)?;
    let extended = date.contains('-');
    let mut normalized = format!("{}T{}", date, clock);
    // Hour-only precision
    if clock.len() == 2 {
        normalized.push_str(if extended { ":00" } else { "00" });
    }

    let naive = DATE_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&normalized, fmt).ok())
        .ok_or_else(invalid)?;

    match offset {
        None => Ok(Utc.from_utc_datetime(&naive)),
        Some(offset) => offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(invalid),
    }
}

fn split_date_time(s: &str) -> Option<(&str, &str)> {
    let i = s.find(['T', 't', ' '])?;
    Some((&s[..i], &s[i + 1..]))
}

/// Clock text and its offset, `None` offset when the text carries none
fn split_offset(time: &str) -> Option<(&str, Option<FixedOffset>)> {
    if let Some(clock) = time.strip_suffix(['Z', 'z']) {
        return Some((clock, FixedOffset::east_opt(0)));
    }
    match time.find(['+', '-']) {
        None => Some((time, None)),
        Some(i) => Some((&time[..i], Some(parse_offset(&time[i..])?))),
    }
}

/// `±HH`, `±HHMM`, `±HH:MM` or `±HH:MM:SS`
fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let sign = match raw.as_bytes().first()? {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let digits: String = raw[1..].chars().filter(|c| *c != ':').collect();
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let field = |range: std::ops::Range<usize>| digits.get(range).and_then(|d| d.parse::<i32>().ok());
    let (hours, minutes, seconds) = match digits.len() {
        2 => (field(0..2)?, 0, 0),
        4 => (field(0..2)?, field(2..4)?, 0),
        6 => (field(0..2)?, field(2..4)?, field(4..6)?),
        _ => return None,
    };
    if hours > 23 || minutes > 59 || seconds > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60 + seconds))
}
