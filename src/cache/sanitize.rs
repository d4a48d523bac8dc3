//! Bridge between the backend's opaque timestamp values and JSON-safe records.
//!
//! Entities arrive from the backend with timestamps in the backend's own
//! object form (`{"_seconds": .., "_nanoseconds": ..}`). Before a record is
//! written to disk it is rewritten into a tagged form
//! (`{"kind": "timestamp", "epochSeconds": ..}`), and the reverse happens on
//! load. Both directions go through [`SanitizedValue`], a closed tree of four
//! shapes, so new entity layouts need no bridging code of their own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Number, Value};
use std::collections::BTreeMap;

pub const TIMESTAMP_KIND: &str = "timestamp";

const KIND_FIELD: &str = "kind";
const EPOCH_FIELD: &str = "epochSeconds";
const BACKEND_SECONDS_FIELD: &str = "_seconds";
const BACKEND_NANOS_FIELD: &str = "_nanoseconds";

const NANOS_PER_SECOND: u32 = 1_000_000_000;

/// A moment in time as the backend represents it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
  #[serde(rename = "_seconds")]
  seconds: i64,
  #[serde(rename = "_nanoseconds")]
  nanos: u32,
}

impl Timestamp {
  /// Build a timestamp, carrying any whole seconds out of `nanos`.
  pub fn new(seconds: i64, nanos: u32) -> Self {
    Self {
      seconds: seconds + i64::from(nanos / NANOS_PER_SECOND),
      nanos: nanos % NANOS_PER_SECOND,
    }
  }

  pub fn now() -> Self {
    Utc::now().into()
  }

  pub fn seconds(&self) -> i64 {
    self.seconds
  }

  pub fn nanos(&self) -> u32 {
    self.nanos
  }

  /// Fractional seconds since the Unix epoch, the number stored on disk.
  pub fn epoch_seconds(&self) -> f64 {
    self.seconds as f64 + f64::from(self.nanos) / f64::from(NANOS_PER_SECOND)
  }

  pub fn from_epoch_seconds(epoch: f64) -> Self {
    let whole = epoch.floor();
    let nanos = ((epoch - whole) * f64::from(NANOS_PER_SECOND)).round() as u32;
    Self::new(whole as i64, nanos)
  }

  pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(self.seconds, self.nanos)
  }
}

impl From<DateTime<Utc>> for Timestamp {
  fn from(dt: DateTime<Utc>) -> Self {
    Self::new(dt.timestamp(), dt.timestamp_subsec_nanos())
  }
}

/// Scalar leaves of a sanitized record.
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
  Null,
  Bool(bool),
  Number(Number),
  String(String),
}

/// JSON-safe form of one entity (or any nested part of it).
#[derive(Debug, Clone, PartialEq)]
pub enum SanitizedValue {
  Primitive(Primitive),
  Map(BTreeMap<String, SanitizedValue>),
  Sequence(Vec<SanitizedValue>),
  Time { epoch_seconds: f64 },
}

/// How a moment in time is spelled inside a JSON object.
struct TimeEncoding {
  read: fn(&Map<String, Value>) -> Option<f64>,
  write: fn(f64) -> Value,
}

const BACKEND: TimeEncoding = TimeEncoding {
  read: read_backend_time,
  write: write_backend_time,
};

const TAGGED: TimeEncoding = TimeEncoding {
  read: read_tagged_time,
  write: write_tagged_time,
};

fn read_backend_time(map: &Map<String, Value>) -> Option<f64> {
  if map.len() != 2 {
    return None;
  }
  let seconds = map.get(BACKEND_SECONDS_FIELD)?.as_i64()?;
  let nanos = u32::try_from(map.get(BACKEND_NANOS_FIELD)?.as_u64()?).ok()?;
  if nanos >= NANOS_PER_SECOND {
    return None;
  }
  Some(Timestamp::new(seconds, nanos).epoch_seconds())
}

fn write_backend_time(epoch: f64) -> Value {
  let ts = Timestamp::from_epoch_seconds(epoch);
  json!({ BACKEND_SECONDS_FIELD: ts.seconds, BACKEND_NANOS_FIELD: ts.nanos })
}

fn read_tagged_time(map: &Map<String, Value>) -> Option<f64> {
  if map.len() != 2 || map.get(KIND_FIELD)?.as_str()? != TIMESTAMP_KIND {
    return None;
  }
  map.get(EPOCH_FIELD)?.as_f64()
}

fn write_tagged_time(epoch: f64) -> Value {
  json!({ KIND_FIELD: TIMESTAMP_KIND, EPOCH_FIELD: epoch })
}

impl SanitizedValue {
  /// Lift a backend-shaped value, recognizing backend timestamps.
  pub fn from_backend(value: Value) -> Self {
    Self::visit(value, &BACKEND)
  }

  /// Lift a value read back from disk, recognizing tagged timestamps.
  pub fn from_json(value: Value) -> Self {
    Self::visit(value, &TAGGED)
  }

  /// The on-disk JSON form.
  pub fn to_json(&self) -> Value {
    self.emit(&TAGGED)
  }

  /// The backend form entity types deserialize from.
  pub fn to_backend(&self) -> Value {
    self.emit(&BACKEND)
  }

  fn visit(value: Value, time: &TimeEncoding) -> Self {
    match value {
      Value::Null => Self::Primitive(Primitive::Null),
      Value::Bool(b) => Self::Primitive(Primitive::Bool(b)),
      Value::Number(n) => Self::Primitive(Primitive::Number(n)),
      Value::String(s) => Self::Primitive(Primitive::String(s)),
      Value::Array(items) => {
        Self::Sequence(items.into_iter().map(|v| Self::visit(v, time)).collect())
      }
      Value::Object(map) => match (time.read)(&map) {
        Some(epoch_seconds) => Self::Time { epoch_seconds },
        None => Self::Map(
          map
            .into_iter()
            .map(|(k, v)| (k, Self::visit(v, time)))
            .collect(),
        ),
      },
    }
  }

  fn emit(&self, time: &TimeEncoding) -> Value {
    match self {
      Self::Primitive(Primitive::Null) => Value::Null,
      Self::Primitive(Primitive::Bool(b)) => Value::Bool(*b),
      Self::Primitive(Primitive::Number(n)) => Value::Number(n.clone()),
      Self::Primitive(Primitive::String(s)) => Value::String(s.clone()),
      Self::Sequence(items) => Value::Array(items.iter().map(|v| v.emit(time)).collect()),
      Self::Map(map) => Value::Object(
        map
          .iter()
          .map(|(k, v)| (k.clone(), v.emit(time)))
          .collect(),
      ),
      Self::Time { epoch_seconds } => (time.write)(*epoch_seconds),
    }
  }
}

/// Rewrite backend timestamps anywhere in `value` into tagged records.
pub fn sanitize(value: Value) -> Value {
  SanitizedValue::from_backend(value).to_json()
}

/// Rewrite tagged records anywhere in `value` back into backend timestamps.
pub fn desanitize(value: Value) -> Value {
  SanitizedValue::from_json(value).to_backend()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> SanitizedValue {
    let mut nested = BTreeMap::new();
    nested.insert(
      "caption".to_string(),
      SanitizedValue::Primitive(Primitive::String("beach".into())),
    );
    nested.insert(
      "taken".to_string(),
      SanitizedValue::Time {
        epoch_seconds: 1_700_000_000.25,
      },
    );

    let mut root = BTreeMap::new();
    root.insert(
      "id".to_string(),
      SanitizedValue::Primitive(Primitive::Number(42.into())),
    );
    root.insert("meta".to_string(), SanitizedValue::Map(nested));
    root.insert(
      "tags".to_string(),
      SanitizedValue::Sequence(vec![
        SanitizedValue::Primitive(Primitive::Bool(true)),
        SanitizedValue::Primitive(Primitive::Null),
        SanitizedValue::Time {
          epoch_seconds: 12.5,
        },
      ]),
    );
    SanitizedValue::Map(root)
  }

  #[test]
  fn test_tagged_round_trip_is_identical() {
    let value = sample();
    let text = serde_json::to_string(&value.to_json()).unwrap();
    let back = SanitizedValue::from_json(serde_json::from_str(&text).unwrap());
    assert_eq!(back, value);
  }

  #[test]
  fn test_sanitize_rewrites_nested_backend_timestamps() {
    let raw = json!({
      "id": "a",
      "createdAt": { "_seconds": 1_700_000_000i64, "_nanoseconds": 500_000_000u32 },
      "history": [{ "at": { "_seconds": 10, "_nanoseconds": 0 } }],
    });

    let clean = sanitize(raw);
    assert_eq!(clean["createdAt"]["kind"], "timestamp");
    assert_eq!(clean["createdAt"]["epochSeconds"], 1_700_000_000.5);
    assert_eq!(clean["history"][0]["at"]["epochSeconds"], 10.0);
    assert_eq!(clean["id"], "a");
  }

  #[test]
  fn test_desanitize_restores_backend_form() {
    let ts = Timestamp::new(1_700_000_123, 456_789_000);
    let raw = json!({ "ts": ts, "n": 3 });

    let back = desanitize(sanitize(raw));
    let restored: Timestamp = serde_json::from_value(back["ts"].clone()).unwrap();
    assert_eq!(restored.seconds(), ts.seconds());
    assert!(restored.nanos().abs_diff(ts.nanos()) < 1_000);
    assert_eq!(back["n"], 3);
  }

  #[test]
  fn test_lookalike_objects_are_left_alone() {
    let raw = json!({
      "partial": { "_seconds": 5 },
      "extra": { "_seconds": 5, "_nanoseconds": 0, "zone": "utc" },
      "wrongKind": { "kind": "date", "epochSeconds": 3.0 },
    });

    assert_eq!(sanitize(raw.clone()), raw);
    assert_eq!(desanitize(raw.clone()), raw);
  }

  #[test]
  fn test_timestamp_epoch_and_chrono_conversions() {
    let ts = Timestamp::new(1, 1_500_000_000);
    assert_eq!(ts.seconds(), 2);
    assert_eq!(ts.nanos(), 500_000_000);
    assert_eq!(ts.epoch_seconds(), 2.5);
    assert_eq!(Timestamp::from_epoch_seconds(2.5), ts);

    let dt = ts.to_datetime().unwrap();
    assert_eq!(Timestamp::from(dt), ts);
  }

  #[test]
  fn test_negative_epoch_rounds_toward_earlier_second() {
    let ts = Timestamp::from_epoch_seconds(-1.25);
    assert_eq!(ts.seconds(), -2);
    assert_eq!(ts.nanos(), 750_000_000);
  }
}
