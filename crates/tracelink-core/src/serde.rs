// Module name shadows the `serde` crate; use `::serde` for the external crate.
use ::serde::Serializer;
use chrono::{DateTime, SecondsFormat, Utc};

/// Format `DateTime<Utc>` as RFC 3339 with 3-digit fractional seconds and a
/// `Z` suffix. Used for API responses and stream entry fields alike.
pub fn format_rfc3339_ms(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Serialize `DateTime<Utc>` with [`format_rfc3339_ms`].
pub fn to_rfc3339_ms<S>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(&format_rfc3339_ms(dt))
}

/// Serialize `Option<DateTime<Utc>>` with [`format_rfc3339_ms`], `null` when absent.
pub fn to_rfc3339_ms_opt<S>(dt: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match dt {
        Some(dt) => s.serialize_str(&format_rfc3339_ms(dt)),
        None => s.serialize_none(),
    }
}
