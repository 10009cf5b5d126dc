use chrono::Utc;

/// Current wall-clock instant as unix milliseconds.
///
/// All protocol timestamps (operation origination, `_updated_at`, pull
/// cursors) are unix-millisecond integers.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
