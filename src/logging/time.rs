use chrono::{DateTime, DurationRound, SecondsFormat, TimeDelta, Utc};

use crate::error::GatewayError;

/// 将 UTC 时间转换为 ISO-8601 / RFC3339（UTC, `Z`）
pub fn to_iso8601_utc_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 解析归档中的时间戳，接受任意偏移的 RFC3339
pub fn parse_datetime_string(s: &str) -> crate::error::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GatewayError::Config(format!("invalid timestamp '{}': {}", s, e)))
}

/// Truncate to the start of the containing UTC hour.
pub fn hour_start(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.duration_trunc(TimeDelta::hours(1)).unwrap_or(dt)
}
