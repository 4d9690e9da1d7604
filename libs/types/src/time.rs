//! UTC millisecond timestamp conventions.
//!
//! Every timestamp the pipeline emits is UTC with millisecond precision and
//! crosses process boundaries as `YYYY-MM-DD HH:MM:SS.mmm`. The analytical
//! store ingests that format directly into `DateTime64(3, 'UTC')` columns.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Wire format for all persisted and published timestamps.
pub const MILLIS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Current wall clock, truncated to millisecond precision.
pub fn now_millis() -> DateTime<Utc> {
    truncate_millis(Utc::now())
}

/// Drop sub-millisecond precision so formatting round-trips losslessly.
pub fn truncate_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    let millis = ts.timestamp_millis();
    Utc.timestamp_millis_opt(millis).single().unwrap_or(ts)
}

/// Format as `YYYY-MM-DD HH:MM:SS.mmm`.
pub fn format_millis(ts: DateTime<Utc>) -> String {
    ts.format(MILLIS_FORMAT).to_string()
}

/// Parse the wire format back into a UTC timestamp.
pub fn parse_millis(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(s, MILLIS_FORMAT).map(|naive| naive.and_utc())
}

/// Interpret a venue-provided epoch-milliseconds value.
///
/// Returns `None` for values outside chrono's representable range, which in
/// practice means a corrupt frame.
pub fn from_epoch_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Serde adapter serializing `DateTime<Utc>` in the wire format.
///
/// Used as `#[serde(with = "types::time::serde_millis")]`.
pub mod serde_millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_millis(*ts))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_millis(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional timestamps in the wire format.
pub mod serde_millis_opt {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match ts {
            Some(ts) => serializer.serialize_some(&super::format_millis(*ts)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => super::parse_millis(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
