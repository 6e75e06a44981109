use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// Milliseconds since the Unix epoch, stored in the timestamp columns.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        Self(millis)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    pub fn from_i64(value: i64) -> Self {
        Self(value)
    }

    /// Renders as LDAP generalized time, `YYYYMMDDHHMMSSZ`.
    pub fn to_generalized(self) -> String {
        let nanos = i128::from(self.0) * 1_000_000;
        let format = format_description!("[year][month][day][hour][minute][second]Z");
        OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .ok()
            .and_then(|dt| dt.format(&format).ok())
            .unwrap_or_default()
    }

    /// Parses generalized time in UTC. Fractions and offsets are not accepted.
    pub fn parse_generalized(value: &str) -> Option<Self> {
        let format = format_description!("[year][month][day][hour][minute][second]Z");
        let parsed = PrimitiveDateTime::parse(value.trim(), &format).ok()?;
        let nanos = parsed.assume_utc().unix_timestamp_nanos();
        Some(Self((nanos / 1_000_000) as i64))
    }
}
