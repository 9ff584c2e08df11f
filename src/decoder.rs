//! Decoder for raw trip change records.
//!
//! A raw record is one change-data-capture entry from the trip table stream.
//! Decoding either yields a [`TripEvent`] ready to fold into a daily rollup,
//! a [`Decoded::Skip`] for changes that are not trip completions, or a
//! [`DecodeError`] for records whose data is present but invalid.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Source-assigned position of a record within its partition.
///
/// Stream sequence numbers can be far wider than any machine integer, so the
/// digits are kept as text and compared numerically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub struct SequenceNumber(String);

impl SequenceNumber {
    pub fn new(digits: &str) -> Result<Self, String> {
        let digits = digits.trim();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("invalid sequence number '{digits}'"));
        }
        let trimmed = digits.trim_start_matches('0');
        Ok(Self(if trimmed.is_empty() { "0" } else { trimmed }.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for SequenceNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n.into()),
            Repr::Text(s) => Self::new(&s).map_err(serde::de::Error::custom),
        }
    }
}

impl From<SequenceNumber> for String {
    fn from(seq: SequenceNumber) -> Self {
        seq.0
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One change record as delivered by the event source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub partition: String,
    pub sequence_number: SequenceNumber,
    /// `INSERT`, `MODIFY` or `REMOVE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_image: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_image: Option<Value>,
}

impl RawRecord {
    /// Builds an insert record carrying `image` as its new state.
    pub fn insert(partition: &str, sequence: impl Into<SequenceNumber>, image: Value) -> Self {
        Self {
            partition: partition.to_string(),
            sequence_number: sequence.into(),
            event_name: Some("INSERT".to_string()),
            new_image: Some(image),
            old_image: None,
        }
    }
}

/// A completed trip, validated and keyed by pickup date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripEvent {
    pub trip_id: String,
    pub partition: String,
    pub sequence: SequenceNumber,
    pub pickup_date: NaiveDate,
    pub fare_amount: Decimal,
    pub estimated_fare_amount: Decimal,
}

/// Why a record was filtered out of aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Removal,
    NoImage,
    MissingField(&'static str),
    AlreadyCompleted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Removal => f.write_str("removal"),
            SkipReason::NoImage => f.write_str("no new image"),
            SkipReason::MissingField(name) => write!(f, "missing {name}"),
            SkipReason::AlreadyCompleted => f.write_str("trip already completed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(TripEvent),
    Skip(SkipReason),
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("record payload is not a valid trip image: {0}")]
    InvalidPayload(String),
    #[error("field {field} is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("field {field} is negative: {value}")]
    NegativeAmount { field: &'static str, value: Decimal },
    #[error("record has no trip id")]
    MissingTripId,
}

const FARE_AMOUNT: &str = "fare_amount";
const ESTIMATED_FARE_AMOUNT: &str = "estimated_fare_amount";
const PICKUP_DATETIME: &str = "pickup_datetime";

/// Decodes one raw change record.
///
/// # Errors
///
/// Returns a [`DecodeError`] when a required field is present but malformed,
/// or when a fare is negative. Absent fields produce [`Decoded::Skip`].
pub fn decode(raw: &RawRecord) -> Result<Decoded, DecodeError> {
    if raw
        .event_name
        .as_deref()
        .is_some_and(|name| name.eq_ignore_ascii_case("REMOVE"))
    {
        return Ok(Decoded::Skip(SkipReason::Removal));
    }

    let Some(image) = &raw.new_image else {
        return Ok(Decoded::Skip(SkipReason::NoImage));
    };
    let image = image
        .as_object()
        .ok_or_else(|| DecodeError::InvalidPayload("image is not an object".into()))?;

    let (Some(fare), Some(estimated), Some(pickup)) = (
        field(image, FARE_AMOUNT),
        field(image, ESTIMATED_FARE_AMOUNT),
        field(image, PICKUP_DATETIME),
    ) else {
        let missing = [FARE_AMOUNT, ESTIMATED_FARE_AMOUNT, PICKUP_DATETIME]
            .into_iter()
            .find(|name| field(image, name).is_none())
            .unwrap_or(FARE_AMOUNT);
        return Ok(Decoded::Skip(SkipReason::MissingField(missing)));
    };

    if let Some(old) = raw.old_image.as_ref().and_then(Value::as_object) {
        if field(old, FARE_AMOUNT).is_some() && field(old, ESTIMATED_FARE_AMOUNT).is_some() {
            return Ok(Decoded::Skip(SkipReason::AlreadyCompleted));
        }
    }

    let trip_id = field(image, "trip_id")
        .or_else(|| field(image, "id"))
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or(DecodeError::MissingTripId)?;

    Ok(Decoded::Event(TripEvent {
        trip_id,
        partition: raw.partition.clone(),
        sequence: raw.sequence_number.clone(),
        pickup_date: parse_pickup_date(pickup)?,
        fare_amount: parse_amount(FARE_AMOUNT, fare)?,
        estimated_fare_amount: parse_amount(ESTIMATED_FARE_AMOUNT, estimated)?,
    }))
}

/// Looks up `name`, unwrapping typed attribute values such as `{"N": "1.5"}`.
/// Nulls, `{"NULL": true}` and blank strings count as absent.
fn field<'a>(image: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    let mut value = image.get(name)?;
    if let Value::Object(typed) = value {
        if typed.len() == 1 {
            if typed.contains_key("NULL") {
                return None;
            }
            if let Some(inner) = typed.get("N").or_else(|| typed.get("S")) {
                value = inner;
            }
        }
    }
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        v => Some(v),
    }
}

fn parse_amount(name: &'static str, value: &Value) -> Result<Decimal, DecodeError> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        other => {
            return Err(DecodeError::InvalidField {
                field: name,
                reason: format!("expected a number, got {other}"),
            });
        }
    };
    let amount = Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| DecodeError::InvalidField {
            field: name,
            reason: format!("'{text}': {e}"),
        })?;
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(DecodeError::NegativeAmount {
            field: name,
            value: amount,
        });
    }
    Ok(amount.normalize())
}

/// Derives the UTC calendar date of a pickup timestamp.
///
/// Timestamps with an offset are converted to UTC; naive timestamps are
/// taken to already be UTC.
fn parse_pickup_date(value: &Value) -> Result<NaiveDate, DecodeError> {
    let Value::String(text) = value else {
        return Err(DecodeError::InvalidField {
            field: PICKUP_DATETIME,
            reason: format!("expected a timestamp string, got {value}"),
        });
    };
    let text = text.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc).date_naive());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(ts.date());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|e| DecodeError::InvalidField {
        field: PICKUP_DATETIME,
        reason: format!("'{text}': {e}"),
    })
}
