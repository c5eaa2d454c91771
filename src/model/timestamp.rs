use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat};

/// Point in time with nanosecond precision.
///
/// Stamps the local write time of a mutation batch, the commit time the
/// server acknowledges and, wrapped in [`SnapshotVersion`](crate::model::SnapshotVersion),
/// every document version. `nanos` is always within `0..1_000_000_000`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let carry = nanos.div_euclid(1_000_000_000);
        Self {
            seconds: seconds + carry as i64,
            nanos: nanos.rem_euclid(1_000_000_000),
        }
    }

    /// Wall clock time. A clock set before the epoch reads as the epoch.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self::new(elapsed.as_secs() as i64, elapsed.subsec_nanos() as i32)
    }

    pub fn from_micros(micros: i64) -> Self {
        Self::new(
            micros.div_euclid(1_000_000),
            (micros.rem_euclid(1_000_000) * 1_000) as i32,
        )
    }

    pub fn canonical_id(&self) -> String {
        format!("time({},{})", self.seconds, self.nanos)
    }

    pub fn to_rfc3339(&self) -> String {
        match DateTime::from_timestamp(self.seconds, self.nanos as u32) {
            Some(datetime) => datetime.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            None => self.canonical_id(),
        }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.seconds, self.nanos).cmp(&(other.seconds, other.nanos))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_whole_seconds_out_of_nanos() {
        assert_eq!(Timestamp::new(1, 1_500_000_000), Timestamp::new(2, 500_000_000));
        assert_eq!(Timestamp::new(0, -1), Timestamp::new(-1, 999_999_999));
    }

    #[test]
    fn commit_times_order_after_earlier_writes() {
        let written = Timestamp::from_micros(1_000_001);
        let committed = Timestamp::new(1, 2_000);
        assert!(written < committed);
        assert!(Timestamp::new(1, 999_999_999) < Timestamp::new(2, 0));
    }

    #[test]
    fn renders_for_logs_and_canonical_ids() {
        let version = Timestamp::from_micros(1_500_000);
        assert_eq!(version.to_rfc3339(), "1970-01-01T00:00:01.500Z");
        assert_eq!(version.to_string(), "1970-01-01T00:00:01.500Z");
        assert_eq!(version.canonical_id(), "time(1,500000000)");
    }
}
