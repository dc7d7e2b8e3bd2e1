use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Key of the sentinel object that asks the store to stamp the write time.
pub const SENTINEL_KEY: &str = ".sv";
pub const SENTINEL_VALUE: &str = "timestamp";

/// A timestamp the store assigns when the write is committed.
///
/// Writers submit `Pending`; the store replaces it with the commit time.
/// Readers may still observe `Pending` from stores that echo local writes
/// before the server acknowledges them, so both phases must be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerTimestamp {
    Pending,
    Resolved(DateTime<Utc>),
}

impl ServerTimestamp {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn resolved(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Pending => None,
            Self::Resolved(at) => Some(*at),
        }
    }

    /// The JSON sentinel written in place of a pending timestamp.
    pub fn sentinel() -> Value {
        let mut map = Map::new();
        map.insert(SENTINEL_KEY.into(), Value::String(SENTINEL_VALUE.into()));
        Value::Object(map)
    }

    pub fn is_sentinel(value: &Value) -> bool {
        match value {
            Value::Object(map) => {
                map.len() == 1
                    && map.get(SENTINEL_KEY).and_then(Value::as_str) == Some(SENTINEL_VALUE)
            }
            _ => false,
        }
    }

    /// Fixed-width RFC 3339 so that text order matches time order.
    pub fn format(at: DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Replace every top-level sentinel in `fields` with `now`.
    /// Returns how many fields were resolved.
    pub fn resolve_sentinels(fields: &mut Map<String, Value>, now: DateTime<Utc>) -> usize {
        let stamp = Self::format(now);
        let mut resolved = 0;
        for value in fields.values_mut() {
            if Self::is_sentinel(value) {
                *value = Value::String(stamp.clone());
                resolved += 1;
            }
        }
        resolved
    }
}

impl Serialize for ServerTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Pending => Self::sentinel().serialize(serializer),
            Self::Resolved(at) => serializer.serialize_str(&Self::format(*at)),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Repr {
    Resolved(DateTime<Utc>),
    Sentinel {
        #[serde(rename = ".sv")]
        _sv: String,
    },
}

impl<'de> Deserialize<'de> for ServerTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Resolved(at) => Self::Resolved(at),
            Repr::Sentinel { .. } => Self::Pending,
        })
    }
}
