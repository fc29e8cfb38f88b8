//! Calendar-aware boundary generation for aggregation queries.
//!
//! Fixed-width aggregations (minute through week) floor onto a grid shifted
//! into the dashboard's timezone (UTC+8); months and years follow the
//! proleptic Gregorian calendar in that zone. The boundary list always has
//! one more entry than the number of result windows.

use chrono::{Datelike, FixedOffset, TimeZone};

/// Timezone the dashboard buckets its calendar in, as seconds east.
pub const TZ_OFFSET: u32 = 8 * 3600;

/// The Unix epoch fell on a Thursday; shifting by four days puts week
/// boundaries on midnight at the start of the local week.
const WEEK_OFFSET: u32 = 4 * 86400;

/// At most this many windows per aggregation query.
const MAX_RANGES: u32 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggr {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Aggr {
    /// Parses the wire keyword used by the query protocol.
    pub fn parse(s: &str) -> Option<Aggr> {
        match s {
            "min" => Some(Aggr::Minute),
            "hour" => Some(Aggr::Hour),
            "day" => Some(Aggr::Day),
            "week" => Some(Aggr::Week),
            "month" => Some(Aggr::Month),
            "year" => Some(Aggr::Year),
            _ => None,
        }
    }

    /// Window width in seconds; calendar aggregations use their longest
    /// possible month/year so the fit check never underestimates.
    pub fn nominal_step(self) -> u32 {
        match self {
            Aggr::Minute => 60,
            Aggr::Hour => 3600,
            Aggr::Day => 86400,
            Aggr::Week => 604800,
            Aggr::Month => 31 * 86400,
            Aggr::Year => 366 * 86400,
        }
    }

    fn coarser(self) -> Option<Aggr> {
        match self {
            Aggr::Minute => Some(Aggr::Hour),
            Aggr::Hour => Some(Aggr::Day),
            Aggr::Day => Some(Aggr::Week),
            Aggr::Week => Some(Aggr::Month),
            Aggr::Month => Some(Aggr::Year),
            Aggr::Year => None,
        }
    }
}

/// Produces the boundary times for aggregating `[start, end)`, coarsening
/// the aggregation and finally clamping `start` until the window count fits
/// [`MAX_RANGES`]. Returns the effective aggregation and the boundaries
/// (empty when the request is degenerate).
pub fn boundaries(aggr: Aggr, start: u32, end: u32) -> (Aggr, Vec<u32>) {
    if start >= end {
        return (aggr, Vec::new());
    }
    let mut aggr = aggr;
    let mut start = start;
    while (end - start) / aggr.nominal_step() > MAX_RANGES {
        match aggr.coarser() {
            Some(a) => aggr = a,
            None => {
                start = end.saturating_sub(aggr.nominal_step() * MAX_RANGES);
                break;
            }
        }
    }
    let bounds = match aggr {
        Aggr::Minute | Aggr::Hour | Aggr::Day | Aggr::Week => {
            let step = aggr.nominal_step();
            let phase = if aggr == Aggr::Week { TZ_OFFSET + WEEK_OFFSET } else { TZ_OFFSET };
            let mut next = start.saturating_sub((start + phase) % step);
            let mut bounds = vec![next];
            while next < end {
                next += step;
                bounds.push(next);
            }
            bounds
        }
        Aggr::Month => {
            let tz = FixedOffset::east_opt(TZ_OFFSET as i32).unwrap();
            let local = tz.timestamp_opt(start as i64, 0).unwrap();
            let (mut year, mut month) = (local.year(), local.month());
            let mut bounds = vec![month_start(tz, year, month)];
            while *bounds.last().unwrap() < end {
                month += 1;
                if month > 12 {
                    month = 1;
                    year += 1;
                }
                bounds.push(month_start(tz, year, month));
            }
            bounds
        }
        Aggr::Year => {
            let tz = FixedOffset::east_opt(TZ_OFFSET as i32).unwrap();
            let mut year = tz.timestamp_opt(start as i64, 0).unwrap().year();
            let mut bounds = vec![month_start(tz, year, 1)];
            while *bounds.last().unwrap() < end {
                year += 1;
                bounds.push(month_start(tz, year, 1));
            }
            bounds
        }
    };
    (aggr, bounds)
}

fn month_start(tz: FixedOffset, year: i32, month: u32) -> u32 {
    tz.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .unwrap()
        .timestamp() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 2024-01-01 00:00 UTC+8.
    const JAN_2024: u32 = 1_704_038_400;

    #[test]
    fn parse_keywords() {
        assert_eq!(Aggr::parse("min"), Some(Aggr::Minute));
        assert_eq!(Aggr::parse("year"), Some(Aggr::Year));
        assert_eq!(Aggr::parse("fortnight"), None);
    }

    #[test]
    fn day_boundaries_fall_on_local_midnight() {
        let (aggr, bounds) = boundaries(Aggr::Day, JAN_2024 + 3600, JAN_2024 + 2 * 86400);
        assert_eq!(aggr, Aggr::Day);
        assert_eq!(bounds, vec![JAN_2024, JAN_2024 + 86400, JAN_2024 + 2 * 86400]);
        for b in bounds {
            assert_eq!((b + TZ_OFFSET) % 86400, 0);
        }
    }

    #[test]
    fn week_boundaries_use_the_shifted_epoch() {
        let (_, bounds) = boundaries(Aggr::Week, JAN_2024, JAN_2024 + 604800);
        assert!(bounds.len() >= 2);
        for b in &bounds {
            assert_eq!((b + TZ_OFFSET + WEEK_OFFSET) % 604800, 0);
        }
        assert!(bounds[0] <= JAN_2024 && JAN_2024 < bounds[1]);
    }

    #[test]
    fn month_boundaries_respect_leap_years() {
        // Jan..Mar 2024 in UTC+8: January has 31 days, February 29
        let end = JAN_2024 + (31 + 29) * 86400;
        let (aggr, bounds) = boundaries(Aggr::Month, JAN_2024, end);
        assert_eq!(aggr, Aggr::Month);
        assert_eq!(bounds.len(), 3);
        assert_eq!(bounds[0], JAN_2024);
        assert_eq!(bounds[1] - bounds[0], 31 * 86400);
        assert_eq!(bounds[2] - bounds[1], 29 * 86400);
    }

    #[test]
    fn month_floor_starts_mid_month_queries_at_the_first() {
        let (_, bounds) = boundaries(Aggr::Month, JAN_2024 + 12 * 86400, JAN_2024 + 40 * 86400);
        assert_eq!(bounds[0], JAN_2024);
    }

    #[test]
    fn minute_aggregation_coarsens_to_fit() {
        // an hour of minutes fits as requested
        let (aggr, _) = boundaries(Aggr::Minute, JAN_2024, JAN_2024 + 3600);
        assert_eq!(aggr, Aggr::Minute);
        // ten days of minutes overflow, and so do hours; days fit
        let (aggr, bounds) = boundaries(Aggr::Minute, JAN_2024, JAN_2024 + 10 * 86400);
        assert_eq!(aggr, Aggr::Day);
        assert_eq!(bounds.len(), 11);
    }

    #[test]
    fn year_clamps_start_when_nothing_fits() {
        let (aggr, bounds) = boundaries(Aggr::Minute, 0, 4_000_000_000);
        assert_eq!(aggr, Aggr::Year);
        // 90 windows of a nominal year, plus the terminating boundary
        assert!(bounds.len() <= 92);
        assert!(*bounds.last().unwrap() >= 4_000_000_000);
    }

    #[test]
    fn degenerate_window_yields_no_boundaries() {
        let (_, bounds) = boundaries(Aggr::Hour, 1000, 1000);
        assert!(bounds.is_empty());
    }
}
