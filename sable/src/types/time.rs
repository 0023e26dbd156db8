use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(display(r#"cannot parse date/time from: "{repr}""#))]
pub struct InvalidTimestamp {
    pub repr: String,
    pub source: chrono::ParseError,
}

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";


/// A signed duration with microsecond resolution.
#[derive(Eq, Hash, PartialEq, Ord, PartialOrd, Debug, Copy, Clone, Default, Serialize, Deserialize)]
pub struct Microseconds(i64);

impl Microseconds {
    pub const fn new(count: i64) -> Self { Self(count) }
    pub const fn seconds(s: i64) -> Self { Self(s * 1_000_000) }
    pub const fn milliseconds(ms: i64) -> Self { Self(ms * 1000) }
    pub const fn days(d: i64) -> Self { Self::seconds(d * 24 * 3600) }
    pub const fn maximum() -> Self { Self(i64::MAX) }

    pub const fn count(&self) -> i64 { self.0 }
    pub const fn to_seconds(&self) -> i64 { self.0 / 1_000_000 }
}

impl Add for Microseconds {
    type Output = Self;
    fn add(self, rhs: Self) -> Self { Self(self.0 + rhs.0) }
}

impl AddAssign for Microseconds {
    fn add_assign(&mut self, rhs: Self) { self.0 += rhs.0; }
}

impl Sub for Microseconds {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self { Self(self.0 - rhs.0) }
}

impl SubAssign for Microseconds {
    fn sub_assign(&mut self, rhs: Self) { self.0 -= rhs.0; }
}

impl fmt::Display for Microseconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}


/// A point in time with microsecond resolution.
///
/// The JSON representation follows the usual on-chain convention, eg:
/// `2018-06-01T12:00:00.000` (UTC implied, millisecond precision).
#[derive(Eq, Hash, PartialEq, Ord, PartialOrd, Debug, Copy, Clone, Default)]
pub struct TimePoint {
    /// number of microseconds since the UNIX epoch
    micros: i64,
}

impl TimePoint {
    pub const fn new(micros: i64) -> Self { Self { micros } }
    pub const fn maximum() -> Self { Self { micros: i64::MAX } }

    pub const fn elapsed(&self) -> Microseconds { Microseconds::new(self.micros) }
    pub const fn time_since_epoch(&self) -> Microseconds { Microseconds::new(self.micros) }
    pub const fn as_micros(&self) -> i64 { self.micros }

    pub fn now() -> Self {
        Self { micros: Utc::now().timestamp_micros() }
    }

    fn to_datetime(self) -> DateTime<Utc> {
        // within chrono's representable range for all on-chain values
        Utc.timestamp_micros(self.micros).unwrap()
    }
}

impl Add<Microseconds> for TimePoint {
    type Output = Self;
    fn add(self, rhs: Microseconds) -> Self {
        Self { micros: self.micros.saturating_add(rhs.count()) }
    }
}

impl AddAssign<Microseconds> for TimePoint {
    fn add_assign(&mut self, rhs: Microseconds) {
        self.micros = self.micros.saturating_add(rhs.count());
    }
}

impl Sub<Microseconds> for TimePoint {
    type Output = Self;
    fn sub(self, rhs: Microseconds) -> Self {
        Self { micros: self.micros.saturating_sub(rhs.count()) }
    }
}

impl Sub for TimePoint {
    type Output = Microseconds;
    fn sub(self, rhs: Self) -> Microseconds {
        Microseconds::new(self.micros - rhs.micros)
    }
}

impl fmt::Display for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format(DATE_FORMAT))
    }
}

impl FromStr for TimePoint {
    type Err = InvalidTimestamp;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = NaiveDateTime::parse_from_str(s, DATE_FORMAT)
            .context(InvalidTimestampSnafu { repr: s.to_owned() })?;
        Ok(Self { micros: dt.and_utc().timestamp_micros() })
    }
}

impl Serialize for TimePoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TimePoint {
    fn deserialize<D>(deserializer: D) -> Result<TimePoint, D::Error>
    where
        D: Deserializer<'de>,
    {
        let repr: &str = <&str>::deserialize(deserializer)?;
        repr.parse().map_err(de::Error::custom)
    }
}


/// A point in time with second resolution.
#[derive(Eq, Hash, PartialEq, Ord, PartialOrd, Debug, Copy, Clone, Default, Serialize, Deserialize)]
pub struct TimePointSec {
    seconds: u32,
}

impl TimePointSec {
    pub const fn new(seconds: u32) -> Self { Self { seconds } }
    pub const fn as_secs(&self) -> u32 { self.seconds }
}

impl From<TimePoint> for TimePointSec {
    fn from(t: TimePoint) -> Self {
        Self { seconds: (t.as_micros() / 1_000_000) as u32 }
    }
}

impl From<TimePointSec> for TimePoint {
    fn from(t: TimePointSec) -> Self {
        TimePoint::new(t.seconds as i64 * 1_000_000)
    }
}


// =============================================================================
//
//     Unittests
//
// =============================================================================

#[cfg(test)]
mod tests {
    use color_eyre::eyre::Result;
    use super::*;

    #[test]
    fn time_point_str_round_trip() -> Result<()> {
        let repr = "2018-06-01T12:00:00.000";
        let t: TimePoint = repr.parse()?;
        assert_eq!(t.to_string(), repr);
        assert_eq!(t.as_micros(), 1_527_854_400_000_000);
        Ok(())
    }

    #[test]
    fn arithmetic() {
        let t0 = TimePoint::new(1_000_000);
        let t1 = t0 + Microseconds::milliseconds(500);
        assert_eq!(t1.as_micros(), 1_500_000);
        assert_eq!(t1 - t0, Microseconds::new(500_000));
        assert_eq!(t0 - Microseconds::seconds(1), TimePoint::new(0));
    }

    #[test]
    fn saturating_deadlines() {
        // "no deadline" must survive arithmetic without wrapping
        let never = TimePoint::maximum();
        assert_eq!(never + Microseconds::seconds(10), never);
    }

    #[test]
    fn second_resolution_conversion() {
        let t = TimePoint::new(1_527_854_400_123_456);
        let secs: TimePointSec = t.into();
        assert_eq!(secs.as_secs(), 1_527_854_400);
        assert_eq!(TimePoint::from(secs).as_micros(), 1_527_854_400_000_000);
    }
}
