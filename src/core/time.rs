use chrono::{DateTime, Utc};

/// Current time, overridable through `OSPREY_FIXED_TIME` (RFC 3339) so
/// replayed runs and tests are deterministic.
pub fn now_utc() -> DateTime<Utc> {
    if let Ok(value) = std::env::var("OSPREY_FIXED_TIME") {
        if let Ok(dt) = DateTime::parse_from_rfc3339(&value) {
            return dt.with_timezone(&Utc);
        }
    }
    Utc::now()
}
