//! Snowflake ids: 64-bit monotonic ids with an embedded creation timestamp.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};

/// Milliseconds between the Unix epoch and the Discord epoch
/// (2015-01-01T00:00:00Z), the reference point encoded in the high bits
/// of every snowflake.
const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;

/// A 64-bit monotonic id whose total order equals creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Snowflake(pub u64);

impl Snowflake {
    /// The smallest snowflake that could have been created at or after `ts`.
    ///
    /// Invertible with [`Snowflake::created_at`] up to millisecond
    /// resolution: `Snowflake::of_time(s.created_at()) <= s`.
    pub fn of_time(ts: DateTime<Utc>) -> Self {
        let ms = ts.timestamp_millis() - DISCORD_EPOCH_MS;
        Snowflake((ms.max(0) as u64) << 22)
    }

    /// The creation timestamp encoded in this snowflake's high bits.
    pub fn created_at(self) -> DateTime<Utc> {
        let ms = (self.0 >> 22) as i64 + DISCORD_EPOCH_MS;
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for Snowflake {
    fn from(v: u64) -> Self {
        Snowflake(v)
    }
}

impl From<Snowflake> for u64 {
    fn from(s: Snowflake) -> Self {
        s.0
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn of_time_is_monotonic_with_real_time() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::milliseconds(5);
        assert!(Snowflake::of_time(t0) < Snowflake::of_time(t1));
    }

    #[test]
    fn created_at_round_trips_to_the_millisecond() {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let sf = Snowflake::of_time(ts);
        assert_eq!(sf.created_at().timestamp_millis(), ts.timestamp_millis());
    }

    #[test]
    fn epoch_snowflake_is_zero() {
        let ts = Utc.timestamp_millis_opt(DISCORD_EPOCH_MS).unwrap();
        assert_eq!(Snowflake::of_time(ts), Snowflake(0));
    }
}
