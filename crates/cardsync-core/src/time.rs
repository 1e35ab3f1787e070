//! Wall-clock helpers used across the sync engines.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as i64
}

/// Acceptable clock skew between client and server, per the handshake
/// design: roughly five minutes in either direction.
pub const MAX_CLOCK_SKEW_MS: i64 = 5 * 60 * 1000;

/// Whether `client_ts` is close enough to `server_ts` to permit
/// incremental sync.
pub fn within_clock_skew(client_ts: i64, server_ts: i64) -> bool {
    (client_ts - server_ts).abs() <= MAX_CLOCK_SKEW_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_positive_and_increasing() {
        let a = now_ms();
        let b = now_ms();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn skew_within_bound_is_accepted() {
        let server = 1_000_000_000_000;
        assert!(within_clock_skew(server + 60_000, server));
        assert!(within_clock_skew(server - MAX_CLOCK_SKEW_MS, server));
    }

    #[test]
    fn skew_beyond_bound_is_rejected() {
        let server = 1_000_000_000_000;
        assert!(!within_clock_skew(server + MAX_CLOCK_SKEW_MS + 1, server));
    }
}
