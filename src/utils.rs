use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serializer;

/// RFC 3339 with millisecond precision and a `Z` suffix, the format the
/// reference client parses.
pub fn serialize_date<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let s = date.to_rfc3339_opts(SecondsFormat::Millis, true);
    serializer.serialize_str(&s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Stamped {
        #[serde(serialize_with = "serialize_date")]
        at: DateTime<Utc>,
    }

    #[test]
    fn dates_render_with_millis_and_zulu_suffix() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        let value = serde_json::to_value(Stamped { at }).unwrap();
        assert_eq!(value["at"], "2024-03-01T12:30:05.000Z");
    }
}
