//! Partition-boundary arithmetic.
//!
//! A partition is a half-open interval `[start, end)` named by a canonical
//! identifier derived from its start date and granularity:
//!
//! | Granularity | Interval              | Identifier   |
//! |-------------|-----------------------|--------------|
//! | Daily       | `<= 24h`              | `YYYY-MM-DD` |
//! | Weekly      | `24h < i <= 7 * 24h`  | `YYYY-Www`   |
//! | Monthly     | `> 7 * 24h`           | `YYYY-MM`    |
//!
//! Identifiers sort lexically in the same order as the instants that
//! produce them, and they parse back into their range without looking at
//! any file contents. Retention relies on both properties.

use std::fmt;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use time::{Date, Duration, Month, OffsetDateTime, UtcOffset, Weekday};

use crate::error::{Error, Result};

const DAY: StdDuration = StdDuration::from_secs(24 * 60 * 60);
const WEEK: StdDuration = StdDuration::from_secs(7 * 24 * 60 * 60);

/// Size of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Granularity {
    Daily,
    Weekly,
    Monthly,
}

impl Granularity {
    /// Pick the granularity for a configured partition interval.
    pub fn from_interval(interval: StdDuration) -> Self {
        if interval <= DAY {
            Granularity::Daily
        } else if interval <= WEEK {
            Granularity::Weekly
        } else {
            Granularity::Monthly
        }
    }
}

/// Canonical identifier of one partition.
///
/// Ordering follows the start date, which matches lexical ordering of the
/// rendered identifiers for partitions of the same granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId {
    start: Date,
    granularity: Granularity,
}

impl PartitionId {
    /// First calendar date covered by the partition.
    pub fn start_date(&self) -> Date {
        self.start
    }

    /// First calendar date after the partition.
    pub fn end_date(&self) -> Date {
        match self.granularity {
            Granularity::Daily => self.start + Duration::days(1),
            Granularity::Weekly => self.start + Duration::days(7),
            Granularity::Monthly => {
                let (year, month) = match self.start.month() {
                    Month::December => (self.start.year() + 1, Month::January),
                    month => (self.start.year(), month.next()),
                };
                Date::from_calendar_date(year, month, 1).unwrap_or(Date::MAX)
            }
        }
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// The partition that follows this one.
    pub fn next(&self) -> Self {
        Self {
            start: self.end_date(),
            granularity: self.granularity,
        }
    }

    /// Parse an identifier rendered by [`Display`](fmt::Display).
    ///
    /// The granularity is inferred from the shape of the string.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidPartition(s.to_string());
        let number = |part: &str| -> Result<i32> {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse().map_err(|_| invalid())
        };

        let parts: Vec<&str> = s.split('-').collect();
        match parts.as_slice() {
            [year, week] if week.starts_with('W') && year.len() == 4 && week.len() == 3 => {
                let year = number(year)?;
                let week = u8::try_from(number(&week[1..])?).map_err(|_| invalid())?;
                let start = Date::from_iso_week_date(year, week, Weekday::Monday)
                    .map_err(|_| invalid())?;
                Ok(Self {
                    start,
                    granularity: Granularity::Weekly,
                })
            }
            [year, month] if year.len() == 4 && month.len() == 2 => {
                let month = u8::try_from(number(month)?).map_err(|_| invalid())?;
                let month = Month::try_from(month).map_err(|_| invalid())?;
                let start =
                    Date::from_calendar_date(number(year)?, month, 1).map_err(|_| invalid())?;
                Ok(Self {
                    start,
                    granularity: Granularity::Monthly,
                })
            }
            [year, month, day] if year.len() == 4 && month.len() == 2 && day.len() == 2 => {
                let month = u8::try_from(number(month)?).map_err(|_| invalid())?;
                let month = Month::try_from(month).map_err(|_| invalid())?;
                let day = u8::try_from(number(day)?).map_err(|_| invalid())?;
                let start =
                    Date::from_calendar_date(number(year)?, month, day).map_err(|_| invalid())?;
                Ok(Self {
                    start,
                    granularity: Granularity::Daily,
                })
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self.start;
        match self.granularity {
            Granularity::Daily => write!(
                f,
                "{:04}-{:02}-{:02}",
                start.year(),
                u8::from(start.month()),
                start.day()
            ),
            Granularity::Weekly => {
                let (year, week, _) = start.to_iso_week_date();
                write!(f, "{year:04}-W{week:02}")
            }
            Granularity::Monthly => {
                write!(f, "{:04}-{:02}", start.year(), u8::from(start.month()))
            }
        }
    }
}

impl FromStr for PartitionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Maps timestamps to partitions for a configured interval and time zone.
///
/// This is a pure function of `(interval, offset, t)`.
///
/// ```
/// use std::time::Duration;
/// use hygro_store::PartitionResolver;
/// use time::macros::datetime;
///
/// let daily = PartitionResolver::new(Duration::from_secs(3600));
/// assert_eq!(daily.resolve(datetime!(2024-03-09 23:59 UTC)).to_string(), "2024-03-09");
///
/// let weekly = PartitionResolver::new(Duration::from_secs(3 * 86_400));
/// assert_eq!(weekly.resolve(datetime!(2024-03-09 12:00 UTC)).to_string(), "2024-W10");
///
/// let monthly = PartitionResolver::new(Duration::from_secs(30 * 86_400));
/// assert_eq!(monthly.resolve(datetime!(2024-03-09 12:00 UTC)).to_string(), "2024-03");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionResolver {
    granularity: Granularity,
    offset: UtcOffset,
}

impl PartitionResolver {
    /// Resolver for `interval` with partition boundaries in UTC.
    pub fn new(interval: StdDuration) -> Self {
        Self {
            granularity: Granularity::from_interval(interval),
            offset: UtcOffset::UTC,
        }
    }

    /// Place partition boundaries at midnight in `offset` instead of UTC.
    pub fn with_offset(mut self, offset: UtcOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }

    /// Partition that holds instant `t`.
    pub fn resolve(&self, t: OffsetDateTime) -> PartitionId {
        let date = t.to_offset(self.offset).date();
        let start = match self.granularity {
            Granularity::Daily => date,
            Granularity::Weekly => {
                date - Duration::days(i64::from(date.weekday().number_days_from_monday()))
            }
            Granularity::Monthly => date - Duration::days(i64::from(date.day()) - 1),
        };
        PartitionId {
            start,
            granularity: self.granularity,
        }
    }

    /// Instants `[start, end)` covered by a partition in this resolver's time zone.
    pub fn range(&self, id: &PartitionId) -> (OffsetDateTime, OffsetDateTime) {
        (
            id.start_date().midnight().assume_offset(self.offset),
            id.end_date().midnight().assume_offset(self.offset),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime, offset};

    fn daily() -> PartitionResolver {
        PartitionResolver::new(StdDuration::from_secs(24 * 3600))
    }

    fn weekly() -> PartitionResolver {
        PartitionResolver::new(StdDuration::from_secs(7 * 24 * 3600))
    }

    fn monthly() -> PartitionResolver {
        PartitionResolver::new(StdDuration::from_secs(31 * 24 * 3600))
    }

    #[test]
    fn test_granularity_thresholds() {
        assert_eq!(Granularity::from_interval(StdDuration::from_secs(1)), Granularity::Daily);
        assert_eq!(Granularity::from_interval(DAY), Granularity::Daily);
        assert_eq!(
            Granularity::from_interval(DAY + StdDuration::from_secs(1)),
            Granularity::Weekly
        );
        assert_eq!(Granularity::from_interval(WEEK), Granularity::Weekly);
        assert_eq!(
            Granularity::from_interval(WEEK + StdDuration::from_secs(1)),
            Granularity::Monthly
        );
    }

    #[test]
    fn test_daily_midnight_boundary() {
        let before = daily().resolve(datetime!(2024-02-29 23:59:59.999999999 UTC));
        let after = daily().resolve(datetime!(2024-03-01 00:00 UTC));
        assert_eq!(before.to_string(), "2024-02-29");
        assert_eq!(after.to_string(), "2024-03-01");
        assert!(after.to_string() > before.to_string());
    }

    #[test]
    fn test_weekly_uses_iso_weeks() {
        // 2021-01-03 is a Sunday that belongs to ISO week 53 of 2020.
        let id = weekly().resolve(datetime!(2021-01-03 10:00 UTC));
        assert_eq!(id.to_string(), "2020-W53");
        assert_eq!(id.start_date(), date!(2020-12-28));
        assert_eq!(id.end_date(), date!(2021-01-04));

        let next = weekly().resolve(datetime!(2021-01-04 00:00 UTC));
        assert_eq!(next.to_string(), "2021-W01");
        assert_eq!(id.next(), next);
    }

    #[test]
    fn test_monthly_december_rollover() {
        let id = monthly().resolve(datetime!(2023-12-31 23:00 UTC));
        assert_eq!(id.to_string(), "2023-12");
        assert_eq!(id.end_date(), date!(2024-01-01));
        assert_eq!(id.next().to_string(), "2024-01");
    }

    #[test]
    fn test_offset_moves_boundary() {
        let resolver = daily().with_offset(offset!(+2));
        // 23:30 UTC is already the next day at +02:00.
        let id = resolver.resolve(datetime!(2024-06-01 23:30 UTC));
        assert_eq!(id.to_string(), "2024-06-02");

        let (start, end) = resolver.range(&id);
        assert_eq!(start, datetime!(2024-06-01 22:00 UTC));
        assert_eq!(end, datetime!(2024-06-02 22:00 UTC));
    }

    #[test]
    fn test_range_contains_resolved_instant() {
        let t = datetime!(2024-07-17 13:45:12 UTC);
        for resolver in [daily(), weekly(), monthly()] {
            let id = resolver.resolve(t);
            let (start, end) = resolver.range(&id);
            assert!(start <= t && t < end, "{id} does not contain {t}");
        }
    }

    #[test]
    fn test_parse_round_trip() {
        for s in ["2024-01-31", "2024-W05", "2024-W52", "2024-12", "1999-01"] {
            assert_eq!(PartitionId::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_parse_infers_granularity() {
        assert_eq!(PartitionId::parse("2024-05-01").unwrap().granularity(), Granularity::Daily);
        assert_eq!(PartitionId::parse("2024-W18").unwrap().granularity(), Granularity::Weekly);
        assert_eq!(PartitionId::parse("2024-05").unwrap().granularity(), Granularity::Monthly);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for s in ["", "2024", "2024-13", "2024-02-30", "2024-W60", "24-01-01", "abcd-ef", "2024-+1"] {
            assert!(PartitionId::parse(s).is_err(), "{s} should not parse");
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn instant() -> impl Strategy<Value = OffsetDateTime> {
        // 2000-01-01 .. 2060-01-01
        (946_684_800i64..2_840_140_800i64)
            .prop_map(|secs| OffsetDateTime::from_unix_timestamp(secs).unwrap())
    }

    fn interval() -> impl Strategy<Value = StdDuration> {
        (1u64..90 * 86_400).prop_map(StdDuration::from_secs)
    }

    proptest! {
        /// Identifier ordering matches instant ordering.
        #[test]
        fn identifiers_are_monotonic(a in instant(), b in instant(), interval in interval()) {
            let resolver = PartitionResolver::new(interval);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let (id_lo, id_hi) = (resolver.resolve(lo), resolver.resolve(hi));
            prop_assert!(id_lo <= id_hi);
            prop_assert!(id_lo.to_string() <= id_hi.to_string());
        }

        /// Resolving is deterministic and the range contains the instant.
        #[test]
        fn resolve_is_pure(t in instant(), interval in interval()) {
            let resolver = PartitionResolver::new(interval);
            let id = resolver.resolve(t);
            prop_assert_eq!(id, resolver.resolve(t));
            let (start, end) = resolver.range(&id);
            prop_assert!(start <= t && t < end);
            prop_assert_eq!(PartitionId::parse(&id.to_string()).unwrap(), id);
        }

        /// Two instants on the same UTC calendar day share a daily partition.
        #[test]
        fn same_day_same_partition(day in 0i64..20_000, a in 0i64..86_400, b in 0i64..86_400) {
            let resolver = PartitionResolver::new(StdDuration::from_secs(3600));
            let base = 946_684_800 + day * 86_400;
            let ta = OffsetDateTime::from_unix_timestamp(base + a).unwrap();
            let tb = OffsetDateTime::from_unix_timestamp(base + b).unwrap();
            prop_assert_eq!(resolver.resolve(ta), resolver.resolve(tb));
        }
    }
}
