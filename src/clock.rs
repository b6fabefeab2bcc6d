use chrono::{DateTime, NaiveDate, Offset, Utc};
use chrono_tz::Tz;

/// Calendar date of `ts` in `tz`.
pub fn local_date(ts: DateTime<Utc>, tz: Tz) -> NaiveDate {
    ts.with_timezone(&tz).date_naive()
}

/// `YYYY-MM-DD` in `tz`.
pub fn format_date(ts: DateTime<Utc>, tz: Tz) -> String {
    ts.with_timezone(&tz).format("%Y-%m-%d").to_string()
}

/// `HH:MM:SS` in `tz`.
pub fn format_time(ts: DateTime<Utc>, tz: Tz) -> String {
    ts.with_timezone(&tz).format("%H:%M:%S").to_string()
}

/// English weekday name, e.g. `Monday`.
pub fn weekday(ts: DateTime<Utc>, tz: Tz) -> String {
    ts.with_timezone(&tz).format("%A").to_string()
}

/// Offset of `tz` from UTC at `ts`, in minutes.
pub fn offset_minutes(ts: DateTime<Utc>, tz: Tz) -> i32 {
    ts.with_timezone(&tz).offset().fix().local_minus_utc() / 60
}
