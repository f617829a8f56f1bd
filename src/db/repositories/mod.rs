pub mod config_history_repository;
pub mod config_queue_repository;
pub mod config_snapshot_repository;
pub mod device_repository;
pub mod device_token_repository;
pub mod security_key_repository;
pub mod user_repository;

use chrono::{DateTime, SecondsFormat, Utc};

/// Timestamps are persisted as RFC3339 TEXT with millisecond precision and a
/// trailing `Z`, matching the schema defaults. Lexicographic comparison of
/// two such strings is chronological, which the expiry queries rely on.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn timestamp_order_matches_string_order() {
        let now = Utc::now();
        let earlier = format_timestamp(now - Duration::hours(1));
        let later = format_timestamp(now + Duration::hours(1));
        assert!(earlier < later);
        assert!(format_timestamp(now) > earlier);
    }
}
